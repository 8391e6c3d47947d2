use std::io;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::AssemblerError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt budget is
    /// spent. The closure receives the 1-based attempt number.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T, AssemblerError>
    where
        F: FnMut(u32) -> io::Result<T>,
    {
        let mut attempt = 1u32;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt < self.max_attempts && is_transient(&err) {
                        warn!(operation, attempt, error = %err, "transient I/O failure, retrying");
                        thread::sleep(self.backoff);
                        attempt += 1;
                        continue;
                    }
                    return Err(AssemblerError::IoFatal {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

/// Errors that describe the request rather than the state of the disk are not
/// worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::Unsupported
            | io::ErrorKind::AlreadyExists
    )
}
