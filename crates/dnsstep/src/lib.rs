//! Drive callback-based DNS queries one event-loop step at a time.
//!
//! An [`Engine`](engine::Engine) owns query sockets and advances its query
//! state machines when notified of socket readiness or timeouts.
//! [`process_one`](process::process_one) performs one such notification
//! using a [`Reactor`](reactor::Reactor), without blocking the thread.
//!
//! ```no_run
//! use dnsstep::{channel::UdpChannel, process, reactor::TokioReactor};
//! use trust_dns_resolver::proto::rr::RecordType;
//!
//! # async fn example() -> Result<(), dnsstep::error::StepError> {
//! let mut channel = UdpChannel::builder().build();
//! channel.query("example.com", RecordType::A, |result| {
//!     println!("{:?}", result.map(|message| message.answers().len()));
//! });
//!
//! process::process_until_drained(&mut channel, &TokioReactor::new()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
pub mod channel;
pub mod engine;
pub mod error;
pub mod process;
pub mod query;
pub mod reactor;
