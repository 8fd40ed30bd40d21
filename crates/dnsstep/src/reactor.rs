//! Cancellable readiness and timer waits.

use std::{io::ErrorKind, os::unix::io::BorrowedFd, time::Duration};

use tokio::io::{unix::AsyncFd, Interest};
use tokio_util::sync::CancellationToken;

use crate::engine::SocketInterest;

/// Directions in which a socket was found ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Ready for reading.
    pub readable: bool,
    /// Ready for writing.
    pub writable: bool,
}

impl Readiness {
    /// Ready for reading only.
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };

    /// Ready for writing only.
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };
}

/// Scheduler primitives used by the step driver.
///
/// Every wait takes the cancellation token of the step that armed it. Once
/// the token is cancelled, the wait must resolve promptly, either with
/// `Ok` or with an abort-style error; the driver discards either outcome.
///
/// Note: This is a `async_trait` without a `Send` bound on the futures.
#[async_trait::async_trait(?Send)]
pub trait Reactor {
    /// Wait until the socket is ready in one of the requested directions.
    ///
    /// Equivalent to:
    ///
    /// ```ignore
    /// async fn ready(&self, interest: SocketInterest, cancel: &CancellationToken) -> std::io::Result<Readiness>;
    /// ```
    async fn ready(
        &self,
        interest: SocketInterest,
        cancel: &CancellationToken,
    ) -> std::io::Result<Readiness>;

    /// Wait until the duration elapses.
    ///
    /// Equivalent to:
    ///
    /// ```ignore
    /// async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> std::io::Result<()>;
    /// ```
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> std::io::Result<()>;
}

/// Reactor backed by the Tokio runtime of the current thread.
///
/// Sockets are registered with the runtime for the duration of a single
/// wait and deregistered afterwards. The engine must not register its own
/// sockets with the runtime, otherwise registration fails. Descriptors
/// passed to [`ready`](Reactor::ready) must stay open until the wait ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioReactor;

impl TokioReactor {
    /// Creates a `TokioReactor`.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait(?Send)]
impl Reactor for TokioReactor {
    async fn ready(
        &self,
        interest: SocketInterest,
        cancel: &CancellationToken,
    ) -> std::io::Result<Readiness> {
        let tokio_interest = match (interest.readable, interest.writable) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "empty socket interest",
                ))
            }
        };
        // SAFETY: the engine keeps the socket open while it is listed in its
        // active sockets, and the step holds the engine until every wait ends.
        let descriptor = unsafe { BorrowedFd::borrow_raw(interest.descriptor) };
        let fd = AsyncFd::with_interest(descriptor, tokio_interest)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(aborted()),
            readiness = wait_ready(&fd, interest) => readiness,
        }
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> std::io::Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(aborted()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

async fn wait_ready(
    fd: &AsyncFd<BorrowedFd<'_>>,
    interest: SocketInterest,
) -> std::io::Result<Readiness> {
    if interest.readable && interest.writable {
        tokio::select! {
            guard = fd.readable() => guard.map(|_| Readiness::READABLE),
            guard = fd.writable() => guard.map(|_| Readiness::WRITABLE),
        }
    } else if interest.readable {
        fd.readable().await.map(|_| Readiness::READABLE)
    } else {
        fd.writable().await.map(|_| Readiness::WRITABLE)
    }
}

fn aborted() -> std::io::Error {
    std::io::Error::new(ErrorKind::Interrupted, "wait cancelled")
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_sleep_elapses() {
        let reactor = TokioReactor::new();
        let token = CancellationToken::new();

        assert!(reactor.sleep(Duration::ZERO, &token).await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn test_sleep_cancelled() {
        let reactor = TokioReactor::new();
        let token = CancellationToken::new();
        token.cancel();

        let error = reactor
            .sleep(Duration::from_secs(3600), &token)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Interrupted);
    }

    #[test_log::test(tokio::test)]
    async fn test_ready_writable_udp() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let reactor = TokioReactor::new();
        let token = CancellationToken::new();

        let readiness = reactor
            .ready(SocketInterest::write(socket.as_raw_fd()), &token)
            .await
            .unwrap();

        assert_eq!(readiness, Readiness::WRITABLE);
    }

    #[test_log::test(tokio::test)]
    async fn test_ready_readable_udp() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"hello", socket.local_addr().unwrap()).unwrap();
        let reactor = TokioReactor::new();
        let token = CancellationToken::new();

        let readiness = reactor
            .ready(SocketInterest::read(socket.as_raw_fd()), &token)
            .await
            .unwrap();

        assert_eq!(readiness, Readiness::READABLE);
    }

    #[test_log::test(tokio::test)]
    async fn test_ready_cancelled() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let reactor = TokioReactor::new();
        let token = CancellationToken::new();
        token.cancel();

        let error = reactor
            .ready(SocketInterest::read(socket.as_raw_fd()), &token)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Interrupted);
    }

    #[test_log::test(tokio::test)]
    async fn test_ready_empty_interest() {
        let reactor = TokioReactor::new();
        let token = CancellationToken::new();
        let interest = SocketInterest {
            descriptor: 0,
            readable: false,
            writable: false,
        };

        let error = reactor.ready(interest, &token).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }
}
