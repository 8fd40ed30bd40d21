//! Incremental processing of in-flight queries.
//!
//! A step waits for the first of the engine's sockets to become ready, or
//! for the engine's timeout to elapse, and forwards exactly one
//! notification to the engine. Callers repeat steps until the engine is
//! drained:
//!
//! ```ignore
//! loop {
//!     let outcome = dnsstep::process::process_one(&mut channel, &reactor).await;
//!     if outcome.into_result()? {
//!         break;
//!     }
//! }
//! ```

use std::time::Duration;

use futures::{future::LocalBoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{Descriptor, Engine, Notification, SocketInterest},
    error::StepError,
    reactor::{Reactor, Readiness},
};

/// Result of a single step.
#[derive(Debug)]
pub struct StepOutcome {
    /// Error from the scheduler or the engine, if any.
    pub error: Option<StepError>,
    /// Whether the engine reported no outstanding queries at the end of the step.
    pub drained: bool,
}

impl StepOutcome {
    fn new(error: Option<StepError>, drained: bool) -> Self {
        Self { error, drained }
    }

    /// Converts the outcome into the drained flag, or the error if one was reported.
    pub fn into_result(self) -> Result<bool, StepError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.drained),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Socket(Descriptor, Readiness),
    Timeout,
}

impl From<Wake> for Notification {
    fn from(wake: Wake) -> Self {
        match wake {
            Wake::Socket(descriptor, readiness) => Notification::Socket {
                descriptor,
                readable: readiness.readable,
                writable: readiness.writable,
            },
            Wake::Timeout => Notification::Timeout,
        }
    }
}

struct WaitResult {
    result: std::io::Result<Wake>,
    cancelled: bool,
}

impl WaitResult {
    /// Whether the wait resolved only after the step had cancelled it.
    fn is_cancellation_artifact(&self) -> bool {
        self.cancelled
    }
}

/// Performs one step against the engine.
///
/// If the engine has no sockets and no outstanding queries, the returned
/// future completes on its first poll. Otherwise the step arms one wait per
/// active socket plus the engine's timeout, notifies the engine of the
/// first wait to complete, and reports whether the engine is drained.
///
/// Waits that resolve after the step cancelled them are discarded, even if
/// they resolve with an error.
#[tracing::instrument(skip_all, level = "debug")]
pub async fn process_one<E, R>(engine: &mut E, reactor: &R) -> StepOutcome
where
    E: Engine + ?Sized,
    R: Reactor + ?Sized,
{
    let timeout = engine.timeout();
    let wait_set = merge_interests(engine.active_sockets());

    tracing::debug!(sockets = wait_set.len(), ?timeout, "begin step");

    let (wake, error) = if wait_set.is_empty() && timeout.is_none() {
        if engine.is_drained() {
            tracing::debug!("nothing outstanding");
            return StepOutcome::new(None, true);
        }

        tracing::debug!("no sockets and no deadline, timing out immediately");
        (Some(Wake::Timeout), None)
    } else {
        let token = CancellationToken::new();
        wait_first(&wait_set, timeout, reactor, &token).await
    };

    let mut error = error.map(StepError::from);

    if let Some(wake) = wake {
        tracing::debug!(?wake, "notify");

        if let Err(engine_error) = engine.notify(wake.into()) {
            tracing::debug!(error = %engine_error, "engine error");
            error.get_or_insert(StepError::from(engine_error));
        }
    }

    let drained = engine.is_drained();

    tracing::debug!(drained, error = error.is_some(), "end step");

    StepOutcome::new(error, drained)
}

/// Performs one step and passes the outcome to `on_complete`.
///
/// `on_complete` is called exactly once with the error, if any, and the
/// drained flag.
pub async fn process_one_with<E, R, F>(engine: &mut E, reactor: &R, on_complete: F)
where
    E: Engine + ?Sized,
    R: Reactor + ?Sized,
    F: FnOnce(Option<StepError>, bool),
{
    let outcome = process_one(engine, reactor).await;

    on_complete(outcome.error, outcome.drained);
}

/// Repeats steps until the engine is drained.
///
/// Stops at the first error. Returns the number of steps performed.
#[tracing::instrument(skip_all, level = "debug")]
pub async fn process_until_drained<E, R>(engine: &mut E, reactor: &R) -> Result<usize, StepError>
where
    E: Engine + ?Sized,
    R: Reactor + ?Sized,
{
    let mut steps = 0;

    loop {
        let drained = process_one(engine, reactor).await.into_result()?;
        steps += 1;

        if drained {
            tracing::debug!(steps, "drained");
            return Ok(steps);
        }
    }
}

// One entry per descriptor, with the directions of duplicates combined.
fn merge_interests(sockets: Vec<SocketInterest>) -> Vec<SocketInterest> {
    let mut merged: Vec<SocketInterest> = Vec::with_capacity(sockets.len());

    for interest in sockets.into_iter().filter(|interest| !interest.is_empty()) {
        match merged
            .iter_mut()
            .find(|entry| entry.descriptor == interest.descriptor)
        {
            Some(entry) => {
                entry.readable |= interest.readable;
                entry.writable |= interest.writable;
            }
            None => merged.push(interest),
        }
    }

    merged
}

// Returns the winning wake, if the winner succeeded, and the first genuine
// I/O error among all waits.
async fn wait_first<R>(
    wait_set: &[SocketInterest],
    timeout: Option<Duration>,
    reactor: &R,
    token: &CancellationToken,
) -> (Option<Wake>, Option<std::io::Error>)
where
    R: Reactor + ?Sized,
{
    let mut waits: FuturesUnordered<LocalBoxFuture<'_, WaitResult>> = FuturesUnordered::new();

    for &interest in wait_set {
        waits.push(
            async move {
                let result = reactor
                    .ready(interest, token)
                    .await
                    .map(|readiness| Wake::Socket(interest.descriptor, readiness));

                WaitResult {
                    result,
                    cancelled: token.is_cancelled(),
                }
            }
            .boxed_local(),
        );
    }

    if let Some(duration) = timeout {
        waits.push(
            async move {
                let result = reactor.sleep(duration, token).await.map(|_| Wake::Timeout);

                WaitResult {
                    result,
                    cancelled: token.is_cancelled(),
                }
            }
            .boxed_local(),
        );
    }

    let first = waits.next().await;
    token.cancel();

    let (wake, mut error) = match first.map(|first| first.result) {
        Some(Ok(wake)) => (Some(wake), None),
        Some(Err(error)) => (None, Some(error)),
        None => (None, None),
    };

    while let Some(sibling) = waits.next().await {
        if sibling.is_cancellation_artifact() {
            if let Err(sibling_error) = &sibling.result {
                tracing::trace!(error = %sibling_error, "suppressed cancellation error");
            }
            continue;
        }

        match sibling.result {
            Ok(sibling_wake) => tracing::trace!(wake = ?sibling_wake, "discarded sibling wake"),
            Err(sibling_error) => {
                error.get_or_insert(sibling_error);
            }
        }
    }

    (wake, error)
}
