use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::{self, Duration, Instant};

use super::{Exit, Task};
use crate::shaper::Shaper;

/// Upper bound on a single idle wait, so that cancellation is noticed even
/// at low rates.
const MAX_PARK: Duration = Duration::from_millis(50);

/// Shaped per-connection worker.
///
/// This worker tries to maintain the required rate by polling the
/// [`Shaper`] and executing the given task once per tick while requests are
/// due. Cancellation, the deadline and the count limit are checked on every
/// tick.
#[derive(Debug)]
pub struct ShapedCoroWorker<T> {
    /// Per-connection job.
    task: T,
    /// Whether the run is still active.
    is_running: Arc<AtomicBool>,
    /// The shaper.
    shaper: Shaper,
    /// When the run ends.
    deadline: Instant,
    /// Maximum number of executions, if any.
    limit: Option<u64>,
}

impl<T> ShapedCoroWorker<T> {
    pub fn new(task: T, shaper: Shaper, is_running: Arc<AtomicBool>, deadline: Instant, limit: Option<u64>) -> Self {
        Self {
            task,
            is_running,
            shaper,
            deadline,
            limit,
        }
    }
}

impl<T> ShapedCoroWorker<T>
where
    T: Task,
{
    pub async fn run(mut self) -> Exit {
        loop {
            if !self.is_running.load(Ordering::Relaxed) {
                return Exit::Cancelled;
            }
            let now = Instant::now();
            if now >= self.deadline {
                return Exit::Elapsed;
            }
            if self.limit.is_some_and(|limit| self.shaper.consumed() >= limit) {
                return Exit::CountReached;
            }

            match self.shaper.tick(now) {
                0 => {
                    let until = self.shaper.next_due().min(self.deadline).min(now + MAX_PARK);
                    time::sleep_until(until).await;
                }
                _ => {
                    if let Err(err) = self.task.execute().await {
                        return Exit::Failed(err);
                    }
                    self.shaper.consume(1);
                }
            }
        }
    }
}
