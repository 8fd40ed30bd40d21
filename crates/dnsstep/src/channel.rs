//! Callback-driven DNS query engine over UDP.

use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    os::unix::io::AsRawFd,
    time::{Duration, Instant},
};

use trust_dns_resolver::proto::{op::Message, rr::RecordType};

use crate::{
    engine::{Descriptor, Engine, EngineError, Notification, SocketInterest},
    query::{self, QueryError},
};

const MAX_DATAGRAM_SIZE: usize = 65_535;

type Callback = Box<dyn FnOnce(Result<Message, QueryError>)>;

enum QueryState {
    Unsent,
    Sent { deadline: Instant },
}

struct PendingQuery {
    id: u16,
    socket: UdpSocket,
    request: Vec<u8>,
    state: QueryState,
    attempts: u32,
    callback: Callback,
}

impl PendingQuery {
    fn descriptor(&self) -> Descriptor {
        self.socket.as_raw_fd()
    }
}

/// DNS query engine sending each query on its own non-blocking UDP socket.
///
/// The channel never blocks and never registers its sockets with a runtime.
/// Progress happens only through [`Engine::notify`], typically driven by
/// [`process_one`](crate::process::process_one).
///
/// Every submitted query's callback is called exactly once: with the
/// response, with an error, or with [`QueryError::Destroyed`] when the
/// channel is dropped.
pub struct UdpChannel {
    nameserver: SocketAddr,
    bind_address: Option<SocketAddr>,
    timeout: Duration,
    attempts: u32,
    queries: Vec<PendingQuery>,
    buffer: Vec<u8>,
}

impl UdpChannel {
    /// Return a builder for configuring a new instance.
    pub fn builder() -> UdpChannelBuilder {
        UdpChannelBuilder::new()
    }

    /// Address of the name server queries are sent to.
    pub fn nameserver(&self) -> SocketAddr {
        self.nameserver
    }

    /// Submits an encoded query.
    ///
    /// The query is sent once its socket becomes writable. If the query
    /// cannot be submitted, `callback` is called immediately with the error.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn send<F>(&mut self, request: Vec<u8>, callback: F)
    where
        F: FnOnce(Result<Message, QueryError>) + 'static,
    {
        let id = match query::message_id(&request) {
            Some(id) => id,
            None => {
                callback(Err(QueryError::BadQuery));
                return;
            }
        };

        let socket = match self.open_socket() {
            Ok(socket) => socket,
            Err(error) => {
                tracing::debug!(%error, "open socket failed");
                callback(Err(error.into()));
                return;
            }
        };

        tracing::debug!(id, descriptor = socket.as_raw_fd(), "submit");

        self.queries.push(PendingQuery {
            id,
            socket,
            request,
            state: QueryState::Unsent,
            attempts: 0,
            callback: Box::new(callback),
        });
    }

    /// Builds a recursive query for the hostname and submits it.
    pub fn query<F>(&mut self, hostname: &str, record_type: RecordType, callback: F)
    where
        F: FnOnce(Result<Message, QueryError>) + 'static,
    {
        match query::create_query(hostname, record_type, query::random_id(), true) {
            Ok(request) => self.send(request, callback),
            Err(error) => callback(Err(error)),
        }
    }

    /// Completes every pending query with [`QueryError::Cancelled`].
    pub fn cancel(&mut self) {
        tracing::debug!(count = self.queries.len(), "cancel");

        for query in self.queries.drain(..) {
            (query.callback)(Err(QueryError::Cancelled));
        }
    }

    fn open_socket(&self) -> std::io::Result<UdpSocket> {
        let bind_address = self.bind_address.unwrap_or_else(|| match self.nameserver {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        });
        let socket = UdpSocket::bind(bind_address)?;

        socket.connect(self.nameserver)?;
        socket.set_nonblocking(true)?;

        Ok(socket)
    }

    fn position(&self, descriptor: Descriptor) -> Option<usize> {
        self.queries
            .iter()
            .position(|query| query.descriptor() == descriptor)
    }

    fn complete(&mut self, index: usize, result: Result<Message, QueryError>) {
        let query = self.queries.remove(index);

        match &result {
            Ok(_) => tracing::debug!(id = query.id, "query ok"),
            Err(error) => tracing::debug!(id = query.id, %error, "query err"),
        }

        (query.callback)(result);
    }

    // Counts a failed attempt, scheduling a resend if attempts remain.
    fn retry_or_fail(&mut self, index: usize, error: QueryError) {
        let query = &mut self.queries[index];

        if query.attempts < self.attempts {
            tracing::debug!(id = query.id, attempts = query.attempts, %error, "retry");
            query.state = QueryState::Unsent;
        } else {
            self.complete(index, Err(error));
        }
    }

    fn process_write(&mut self, index: usize, now: Instant) {
        let query = &mut self.queries[index];

        match query.socket.send(&query.request) {
            Ok(_) => {
                query.attempts += 1;
                query.state = QueryState::Sent {
                    deadline: now + self.timeout,
                };
                tracing::trace!(id = query.id, attempts = query.attempts, "sent");
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => {}
            Err(error) if error.kind() == ErrorKind::ConnectionRefused => {
                self.retry_or_fail(index, error.into())
            }
            Err(error) => self.complete(index, Err(error.into())),
        }
    }

    fn process_read(&mut self, index: usize) {
        loop {
            let pending = &self.queries[index];

            match pending.socket.recv(&mut self.buffer) {
                Ok(length) => {
                    let datagram = &self.buffer[..length];

                    if query::message_id(datagram) != Some(pending.id) {
                        tracing::trace!(id = pending.id, length, "ignored datagram");
                        continue;
                    }

                    let result = query::classify_response(datagram);
                    self.complete(index, result);
                    return;
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == ErrorKind::ConnectionRefused => {
                    self.retry_or_fail(index, error.into());
                    return;
                }
                Err(error) => {
                    self.complete(index, Err(error.into()));
                    return;
                }
            }
        }
    }

    fn process_timeouts(&mut self, now: Instant) {
        let mut index = self.queries.len();

        while index > 0 {
            index -= 1;

            if let QueryState::Sent { deadline } = self.queries[index].state {
                if deadline <= now {
                    self.retry_or_fail(index, QueryError::Timeout);
                }
            }
        }
    }
}

impl Engine for UdpChannel {
    fn active_sockets(&self) -> Vec<SocketInterest> {
        self.queries
            .iter()
            .map(|query| match query.state {
                QueryState::Unsent => SocketInterest::write(query.descriptor()),
                QueryState::Sent { .. } => SocketInterest::read(query.descriptor()),
            })
            .collect()
    }

    fn timeout(&self) -> Option<Duration> {
        let now = Instant::now();

        self.queries
            .iter()
            .filter_map(|query| match query.state {
                QueryState::Sent { deadline } => Some(deadline.saturating_duration_since(now)),
                QueryState::Unsent => None,
            })
            .min()
    }

    fn notify(&mut self, notification: Notification) -> Result<(), EngineError> {
        let now = Instant::now();
        let mut result = Ok(());

        if let Notification::Socket {
            descriptor,
            readable,
            writable,
        } = notification
        {
            match self.position(descriptor) {
                Some(index) => {
                    if readable && matches!(self.queries[index].state, QueryState::Sent { .. }) {
                        self.process_read(index);
                    } else if writable && matches!(self.queries[index].state, QueryState::Unsent) {
                        self.process_write(index, now);
                    }
                }
                None => result = Err(EngineError::UnknownDescriptor(descriptor)),
            }
        }

        self.process_timeouts(now);

        result
    }

    fn outstanding(&self) -> usize {
        self.queries.len()
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        for query in self.queries.drain(..) {
            (query.callback)(Err(QueryError::Destroyed));
        }
    }
}

/// Configures and creates a [`UdpChannel`].
pub struct UdpChannelBuilder {
    nameserver: SocketAddr,
    bind_address: Option<SocketAddr>,
    timeout: Duration,
    attempts: u32,
}

impl Default for UdpChannelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpChannelBuilder {
    /// Creates a `UdpChannelBuilder` with the default configuration.
    pub fn new() -> Self {
        Self {
            nameserver: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            bind_address: None,
            timeout: Duration::from_secs(5),
            attempts: 3,
        }
    }

    /// Set the name server address.
    ///
    /// Default is 8.8.8.8:53.
    pub fn with_nameserver(mut self, address: SocketAddr) -> Self {
        self.nameserver = address;
        self
    }

    /// Set the outgoing network interface address.
    ///
    /// Default is None.
    pub fn with_bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    /// Set how long to wait for a response to each attempt.
    ///
    /// Default is 5 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of times a query is sent before giving up.
    ///
    /// Default is 3. Values below 1 are treated as 1.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Create a configured instance.
    pub fn build(&self) -> UdpChannel {
        UdpChannel {
            nameserver: self.nameserver,
            bind_address: self.bind_address,
            timeout: self.timeout,
            attempts: self.attempts,
            queries: Vec::new(),
            buffer: vec![0; MAX_DATAGRAM_SIZE],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use trust_dns_resolver::proto::{
        op::{MessageType, OpCode},
        rr::{RData, Record},
        serialize::binary::BinEncodable,
    };

    use super::*;

    type Results = Rc<RefCell<Vec<Result<Message, QueryError>>>>;

    fn recorder() -> (Results, impl FnOnce(Result<Message, QueryError>) + 'static) {
        let results = Results::default();
        let sink = results.clone();

        (results, move |result| sink.borrow_mut().push(result))
    }

    fn server() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket
    }

    fn channel(server: &UdpSocket) -> UdpChannelBuilder {
        UdpChannel::builder().with_nameserver(server.local_addr().unwrap())
    }

    fn reply(request: &[u8], id: u16) -> Vec<u8> {
        let request = Message::from_vec(request).unwrap();
        let mut message = Message::new();

        message
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .add_queries(request.queries().to_vec())
            .add_answer(Record::from_rdata(
                request.queries()[0].name().clone(),
                60,
                RData::A(Ipv4Addr::new(192, 0, 2, 1)),
            ));

        message.to_bytes().unwrap()
    }

    fn write_all(channel: &mut UdpChannel) {
        for interest in channel.active_sockets() {
            channel
                .notify(Notification::Socket {
                    descriptor: interest.descriptor,
                    readable: false,
                    writable: true,
                })
                .unwrap();
        }
    }

    #[test_log::test]
    fn test_send_wants_write_then_read() {
        let server = server();
        let mut channel = channel(&server).build();
        let (results, callback) = recorder();

        channel.query("example.com", RecordType::A, callback);

        assert_eq!(channel.outstanding(), 1);
        assert!(channel.active_sockets()[0].writable);
        assert_eq!(channel.timeout(), None);

        write_all(&mut channel);

        assert!(channel.active_sockets()[0].readable);
        assert!(channel.timeout().unwrap() <= Duration::from_secs(5));
        assert!(results.borrow().is_empty());
    }

    #[test_log::test]
    fn test_response_delivered() {
        let server = server();
        let mut channel = channel(&server).build();
        let (results, callback) = recorder();

        channel.query("example.com", RecordType::A, callback);
        write_all(&mut channel);

        let mut buf = [0u8; 512];
        let (length, peer) = server.recv_from(&mut buf).unwrap();
        let id = query::message_id(&buf[..length]).unwrap();

        server
            .send_to(&reply(&buf[..length], id.wrapping_add(1)), peer)
            .unwrap();
        server.send_to(&reply(&buf[..length], id), peer).unwrap();

        let descriptor = channel.active_sockets()[0].descriptor;

        for _ in 0..500 {
            if channel.is_drained() {
                break;
            }

            channel
                .notify(Notification::Socket {
                    descriptor,
                    readable: true,
                    writable: false,
                })
                .unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(channel.is_drained());
        let results = results.borrow();
        assert_eq!(results.len(), 1);
        let message = results[0].as_ref().unwrap();
        assert_eq!(message.id(), id);
        assert_eq!(message.answers().len(), 1);
    }

    #[test_log::test]
    fn test_timeout_retries_then_fails() {
        let server = server();
        let mut channel = channel(&server)
            .with_timeout(Duration::ZERO)
            .with_attempts(2)
            .build();
        let (results, callback) = recorder();

        channel.query("example.com", RecordType::A, callback);

        write_all(&mut channel);
        assert_eq!(channel.outstanding(), 1);
        assert!(channel.active_sockets()[0].writable);

        write_all(&mut channel);
        assert_eq!(channel.outstanding(), 0);

        let results = results.borrow();
        assert!(matches!(results[..], [Err(QueryError::Timeout)]));
    }

    #[test_log::test]
    fn test_refused_send_retries() {
        let closed = UdpSocket::bind("127.0.0.1:0").unwrap();
        let nameserver = closed.local_addr().unwrap();
        drop(closed);

        let mut channel = UdpChannel::builder()
            .with_nameserver(nameserver)
            .with_timeout(Duration::ZERO)
            .with_attempts(3)
            .build();
        let (results, callback) = recorder();

        channel.query("example.com", RecordType::A, callback);

        write_all(&mut channel);
        assert_eq!(channel.outstanding(), 1);

        std::thread::sleep(Duration::from_millis(100));
        write_all(&mut channel);

        assert_eq!(channel.outstanding(), 1);
        assert!(channel.active_sockets()[0].writable);
        assert!(results.borrow().is_empty());
    }

    #[test_log::test]
    fn test_timeout_notification() {
        let server = server();
        let mut channel = channel(&server)
            .with_timeout(Duration::from_millis(1))
            .with_attempts(1)
            .build();
        let (results, callback) = recorder();

        channel.query("example.com", RecordType::A, callback);
        write_all(&mut channel);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(channel.timeout(), Some(Duration::ZERO));
        channel.notify(Notification::Timeout).unwrap();

        assert!(channel.is_drained());
        assert!(matches!(results.borrow()[..], [Err(QueryError::Timeout)]));
    }

    #[test_log::test]
    fn test_unknown_descriptor() {
        let mut channel = UdpChannel::builder().build();

        let result = channel.notify(Notification::Socket {
            descriptor: -1,
            readable: true,
            writable: false,
        });

        assert!(matches!(result, Err(EngineError::UnknownDescriptor(-1))));
    }

    #[test_log::test]
    fn test_bad_requests() {
        let mut channel = UdpChannel::builder().build();
        let (results, callback) = recorder();
        channel.send(vec![0x01], callback);

        let (name_results, callback) = recorder();
        channel.query(&"a".repeat(64), RecordType::A, callback);

        assert!(channel.is_drained());
        assert!(matches!(results.borrow()[..], [Err(QueryError::BadQuery)]));
        assert!(matches!(name_results.borrow()[..], [Err(QueryError::BadName)]));
    }

    #[test_log::test]
    fn test_cancel() {
        let server = server();
        let mut channel = channel(&server).build();
        let (results, callback) = recorder();
        let (other_results, other_callback) = recorder();

        channel.query("example.com", RecordType::A, callback);
        channel.query("example.net", RecordType::AAAA, other_callback);
        assert_eq!(channel.outstanding(), 2);

        channel.cancel();

        assert!(channel.is_drained());
        assert!(matches!(results.borrow()[..], [Err(QueryError::Cancelled)]));
        assert!(matches!(other_results.borrow()[..], [Err(QueryError::Cancelled)]));
    }

    #[test_log::test]
    fn test_drop_notifies_callbacks() {
        let server = server();
        let mut channel = channel(&server).build();
        let (results, callback) = recorder();

        channel.query("example.com", RecordType::A, callback);
        drop(channel);

        assert!(matches!(results.borrow()[..], [Err(QueryError::Destroyed)]));
    }
}
