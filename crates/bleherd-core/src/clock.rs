//! Injectable time source.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

/// A source of time for timeouts, windows and backoff.
///
/// Everything that waits goes through a `Clock`. [`TokioClock`] defers to
/// `tokio::time`, so tests can drive the whole system with
/// `#[tokio::test(start_paused = true)]`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Resolve after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// The production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
