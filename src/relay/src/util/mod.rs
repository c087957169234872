use std::future::Future;
use std::io;
use std::time::Duration;

const AUTO_DELAY_MIN: Duration = Duration::from_millis(5);
const AUTO_DELAY_MAX: Duration = Duration::from_secs(1);

/// Exponential back-off for retry loops: 5ms doubling up to the ceiling,
/// reset on success.
#[derive(Debug)]
pub struct AutoDelayer {
    current: Duration,
    max: Duration,
}

impl Default for AutoDelayer {
    fn default() -> Self {
        AutoDelayer::with_max(AUTO_DELAY_MAX)
    }
}

impl AutoDelayer {
    pub fn with_max(max: Duration) -> Self {
        AutoDelayer {
            current: Duration::ZERO,
            max,
        }
    }

    pub async fn delay(&mut self) {
        self.current = if self.current.is_zero() {
            AUTO_DELAY_MIN
        } else {
            std::cmp::min(self.current * 2, self.max)
        };
        tokio::time::sleep(self.current).await;
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Both errors of a failed task pair, first slot per task.
#[derive(Debug, thiserror::Error)]
#[error("dumper: {dumper:?}; writer: {writer:?}")]
pub struct PairError<E: std::fmt::Debug> {
    pub dumper: Option<E>,
    pub writer: Option<E>,
}

/// Run two cooperating futures to completion and surface both outcomes.
/// The pair is expected to share channels so that either side failing makes
/// the other observe closure and exit; neither future is abandoned.
pub async fn barrier<E, A, B>(a: A, b: B) -> Result<(), PairError<E>>
where
    E: std::fmt::Debug,
    A: Future<Output = Result<(), E>>,
    B: Future<Output = Result<(), E>>,
{
    let (ra, rb) = tokio::join!(a, b);
    if ra.is_ok() && rb.is_ok() {
        return Ok(());
    }
    Err(PairError {
        dumper: ra.err(),
        writer: rb.err(),
    })
}

/// Bound a single I/O operation with an absolute deadline, the async
/// rendering of a per-call socket deadline.
pub async fn deadline<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")),
    }
}
