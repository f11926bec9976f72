use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use crate::error::FixtureError;

pub fn available_workers() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

/// Bounded worker pool running one independent task per item.
///
/// Every item is attempted: a failing or panicking task only yields an `Err` for its own item.
/// Outcomes arrive on a channel and are handed back to the caller in completion order, so the
/// caller is the only one mutating shared state.
#[derive(Debug, Clone, Copy)]
pub struct TaskGroup {
    workers: usize,
}

impl TaskGroup {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn run<T, R, F>(&self, items: Vec<T>, task: F) -> Vec<(T, Result<R, FixtureError>)>
    where
        T: Send,
        R: Send,
        F: Fn(&T) -> Result<R, FixtureError> + Sync,
    {
        if items.is_empty() {
            return Vec::new();
        }
        let total = items.len();
        let workers = self.workers.min(total);
        let queue = Mutex::new(items);
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let task = &task;
                scope.spawn(move || {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut guard) => guard.pop(),
                            Err(poisoned) => poisoned.into_inner().pop(),
                        };
                        let Some(item) = next else {
                            break;
                        };
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(&item)))
                            .unwrap_or_else(|payload| {
                                Err(FixtureError::TaskPanicked(panic_message(payload)))
                            });
                        if tx.send((item, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            let mut outcomes = Vec::with_capacity(total);
            for outcome in rx {
                outcomes.push(outcome);
            }
            outcomes
        })
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new(available_workers())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
