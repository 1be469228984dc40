use core::future::Future;
use std::panic;

use tokio::task::JoinSet;

/// Set of concurrent tasks, one per connection.
#[derive(Debug)]
pub struct TaskPool<T> {
    set: JoinSet<T>,
}

impl<T, F> FromIterator<F> for TaskPool<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    /// Spawns every future of the iterator as a separate task.
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = F>,
    {
        let mut set = JoinSet::new();
        for future in iter {
            set.spawn(future);
        }

        Self { set }
    }
}

impl<T> TaskPool<T>
where
    T: Send + 'static,
{
    /// Waits for the next task to complete.
    ///
    /// Returns `None` when the pool is empty. Panics are propagated,
    /// aborted tasks are skipped.
    pub async fn join_next(&mut self) -> Option<T> {
        while let Some(rc) = self.set.join_next().await {
            match rc {
                Ok(v) => return Some(v),
                Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
                Err(err) => log::debug!("task cancelled: {err}"),
            }
        }

        None
    }

    /// Waits for all tasks to complete.
    pub async fn join_all(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.set.len());
        while let Some(v) = self.join_next().await {
            out.push(v);
        }

        out
    }

    #[inline]
    pub fn abort_all(&mut self) {
        self.set.abort_all();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}
