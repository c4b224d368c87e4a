//! Concurrency-bounded task scheduler.
//!
//! [`run_concurrent`] runs a batch of task factories with at most `max`
//! futures in flight. A task that fails with [`TaskFailure::Retry`] is put
//! at the back of a retry queue, which takes priority over unstarted work,
//! until it has been retried `retry_count` times. A gate predicate is
//! consulted before every admission; closing it lets in-flight work settle
//! and then halts the batch without error on any task.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Default number of tasks in flight.
pub const DEFAULT_MAX: usize = 5;

/// Default number of retries per task after its first attempt.
pub const DEFAULT_RETRY_COUNT: usize = 2;

/// How a single task attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure<E> {
    /// Ordinary failure, subject to retry.
    Retry(E),
    /// Failure that retrying cannot fix; rejects the whole batch.
    Fatal(E),
}

/// Limits for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentOptions {
    /// Maximum tasks in flight at once. Must be at least 1.
    pub max: usize,
    /// Retries allowed per task after its first attempt.
    pub retry_count: usize,
}

impl Default for ConcurrentOptions {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

/// Why a batch settled without every task succeeding.
#[derive(Debug, thiserror::Error)]
pub enum ConcurrentError<E> {
    #[error("task {index} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        index: usize,
        attempts: usize,
        source: E,
    },

    #[error("task {index} failed: {source}")]
    Fatal { index: usize, source: E },

    #[error("halted by gate after {completed} of {total} tasks")]
    Halted { completed: usize, total: usize },

    #[error("task {index} panicked")]
    Panicked { index: usize },

    #[error("task interrupted: {0}")]
    Interrupted(String),

    #[error("concurrency limit must be at least 1")]
    InvalidLimit,
}

/// Runs `tasks` with at most `options.max` in flight.
///
/// Each element of `tasks` is a factory invoked once per attempt, so a
/// retried task starts from a fresh future. Resolves once every task has
/// succeeded. Rejects on the first exhausted or fatal failure; tasks still
/// in flight at that point are detached, not aborted, and cancelling them
/// is left to the caller.
///
/// `gate` is checked before every admission. When it returns `false`,
/// no further task is started; once in-flight tasks have settled the
/// batch ends with [`ConcurrentError::Halted`].
pub async fn run_concurrent<T, E, F, Fut, G>(
    tasks: &[F],
    options: &ConcurrentOptions,
    mut gate: G,
) -> Result<(), ConcurrentError<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TaskFailure<E>>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    G: FnMut() -> bool,
{
    let total = tasks.len();
    if total == 0 {
        return Ok(());
    }
    if options.max == 0 {
        return Err(ConcurrentError::InvalidLimit);
    }

    let mut budget = options.max;
    let mut next = 0;
    let mut completed = 0;
    let mut retry_queue: VecDeque<usize> = VecDeque::new();
    let mut retries = vec![0usize; total];
    let mut in_flight: JoinSet<(usize, Option<Result<T, TaskFailure<E>>>)> = JoinSet::new();

    loop {
        while budget > 0 && (!retry_queue.is_empty() || next < total) && gate() {
            let index = match retry_queue.pop_front() {
                Some(index) => index,
                None => {
                    next += 1;
                    next - 1
                }
            };
            budget -= 1;
            trace!(index, attempt = retries[index] + 1, "admitting task");

            let attempt = AssertUnwindSafe((tasks[index])()).catch_unwind();
            in_flight.spawn(async move { (index, attempt.await.ok()) });
        }

        let Some(joined) = in_flight.join_next().await else {
            debug!(completed, total, "gate closed, batch halted");
            return Err(ConcurrentError::Halted { completed, total });
        };

        let (index, outcome) = match joined {
            Ok(settled) => settled,
            Err(e) => {
                // Panics are caught inside the task and nothing aborts it, so
                // only a shutting-down runtime gets here.
                warn!(error = %e, "scheduler task join failed");
                in_flight.detach_all();
                return Err(ConcurrentError::Interrupted(e.to_string()));
            }
        };
        budget += 1;

        match outcome {
            Some(Ok(_)) => {
                completed += 1;
                trace!(index, completed, total, "task succeeded");
                if completed == total {
                    return Ok(());
                }
            }
            Some(Err(TaskFailure::Retry(source))) => {
                if retries[index] >= options.retry_count {
                    let attempts = retries[index] + 1;
                    warn!(index, attempts, "task retries exhausted");
                    in_flight.detach_all();
                    return Err(ConcurrentError::RetryExhausted {
                        index,
                        attempts,
                        source,
                    });
                }
                retries[index] += 1;
                debug!(index, retry = retries[index], "task failed, queued for retry");
                retry_queue.push_back(index);
            }
            Some(Err(TaskFailure::Fatal(source))) => {
                warn!(index, "task failed fatally");
                in_flight.detach_all();
                return Err(ConcurrentError::Fatal { index, source });
            }
            None => {
                warn!(index, "task panicked");
                in_flight.detach_all();
                return Err(ConcurrentError::Panicked { index });
            }
        }
    }
}
