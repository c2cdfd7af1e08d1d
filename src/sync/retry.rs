use std::future::Future;

use crate::error::Result;
use crate::remote::WriteOutcome;

/// Bounded refetch-and-retry around a remote write that may be rejected as
/// stale (409/412).
///
/// Each stale answer is followed by a refresh of the cached version token and
/// another attempt, until the budget is spent. The last stale outcome is then
/// returned to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetryPolicy {
    budget: u32,
}

impl ConflictRetryPolicy {
    /// Task and bucket writes.
    pub const WRITE: Self = Self { budget: 3 };
    /// Plan sharing details, which see more concurrent writers.
    pub const SHARING: Self = Self { budget: 4 };

    /// A budget of zero still makes one attempt.
    pub fn new(budget: u32) -> Self {
        Self {
            budget: budget.max(1),
        }
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Run `write`, calling `refresh` between stale attempts.
    ///
    /// `write` is re-invoked for every attempt, so it must read the current
    /// version token each time rather than capture it once.
    pub async fn run<T, W, WF, R, RF>(
        &self,
        label: &str,
        mut write: W,
        mut refresh: R,
    ) -> Result<WriteOutcome<T>>
    where
        W: FnMut() -> WF,
        WF: Future<Output = Result<WriteOutcome<T>>>,
        R: FnMut() -> RF,
        RF: Future<Output = Result<()>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = write().await?;
            match outcome {
                WriteOutcome::Stale { status } if attempt < self.budget => {
                    log::warn!(
                        "{label}: stale version ({status}), refreshing before retry {}/{}",
                        attempt + 1,
                        self.budget
                    );
                    refresh().await?;
                    attempt += 1;
                }
                WriteOutcome::Stale { status } => {
                    log::warn!(
                        "{label}: still stale ({status}) after {attempt} attempts, giving up"
                    );
                    return Ok(outcome);
                }
                other => return Ok(other),
            }
        }
    }
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self::WRITE
    }
}
