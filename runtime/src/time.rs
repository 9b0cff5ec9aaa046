use core::{fmt, future::Future, time::Duration};

use tokio::time::Instant;

/// A bounded wait exceeded its deadline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl std::error::Error for TimeoutError {}

/// absolute deadline on the loop clock, `delay` from now.
#[inline]
pub fn deadline(delay: Duration) -> Instant {
    Instant::now() + delay
}

/// bound `fut` by a relative timeout.
pub async fn timeout<F: Future>(dur: Duration, fut: F) -> Result<F::Output, TimeoutError> {
    tokio::time::timeout(dur, fut).await.map_err(|_| TimeoutError)
}

/// bound `fut` by an absolute deadline on the loop clock. the underlying
/// wait is dropped (cancelled) when the deadline fires first.
pub async fn timeout_at<F: Future>(deadline: Instant, fut: F) -> Result<F::Output, TimeoutError> {
    tokio::time::timeout_at(deadline, fut).await.map_err(|_| TimeoutError)
}
