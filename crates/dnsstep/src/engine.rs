//! Contract between the step driver and a DNS query engine.

use std::{os::unix::io::RawFd, time::Duration};

/// Socket descriptor exposed by an engine for one of its live query sockets.
pub type Descriptor = RawFd;

/// A live socket and the directions the engine is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketInterest {
    /// Socket descriptor owned by the engine.
    pub descriptor: Descriptor,
    /// The engine expects data to arrive.
    pub readable: bool,
    /// The engine has data to send.
    pub writable: bool,
}

impl SocketInterest {
    /// Creates an interest in reading only.
    pub fn read(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            readable: true,
            writable: false,
        }
    }

    /// Creates an interest in writing only.
    pub fn write(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            readable: false,
            writable: true,
        }
    }

    /// Returns whether any direction is requested.
    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Event forwarded to the engine at the end of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// A socket became ready in at least one of the given directions.
    Socket {
        /// The socket that fired.
        descriptor: Descriptor,
        /// Ready for reading.
        readable: bool,
        /// Ready for writing.
        writable: bool,
    },

    /// No socket became ready before the engine's timeout hint elapsed.
    Timeout,
}

/// Callback-driven DNS query state machine.
///
/// The engine owns its sockets and in-flight queries. It never blocks;
/// progress happens only when [`notify`](Engine::notify) is called with a
/// readiness event or a timeout.
pub trait Engine {
    /// Sockets the engine currently wants to be woken for.
    ///
    /// Entries with neither direction set are ignored by the driver.
    fn active_sockets(&self) -> Vec<SocketInterest>;

    /// Time remaining until the engine needs a timeout notification.
    ///
    /// `None` means the engine has no deadline. `Some(Duration::ZERO)` means
    /// a deadline has already passed.
    fn timeout(&self) -> Option<Duration>;

    /// Advances the state machines of queries matching the event.
    fn notify(&mut self, notification: Notification) -> Result<(), EngineError>;

    /// Number of queries that have not completed.
    fn outstanding(&self) -> usize;

    /// Returns whether no queries remain outstanding.
    fn is_drained(&self) -> bool {
        self.outstanding() == 0
    }
}

/// Errors reported by an engine while processing a notification.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The notification named a socket the engine does not own.
    #[error("unknown socket descriptor {0}")]
    UnknownDescriptor(Descriptor),

    /// The engine rejected protocol data.
    #[error("protocol error: {0}")]
    Protocol(String),
}
