use std::sync::mpsc;

use tokio::runtime::Handle;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send>;

/// Runs stream listener callbacks away from the I/O path.
///
/// Callbacks are executed one at a time, in submission order, on a single
/// blocking task of a tokio runtime. Without an executor a listener is called
/// directly by whichever thread produced the event.
#[derive(Debug, Clone)]
pub struct ListenerExecutor {
    jobs: mpsc::Sender<Job>,
}

impl ListenerExecutor {
    /// Starts the worker on the blocking pool of `handle`.
    ///
    /// The worker ends once every clone of the executor has been dropped.
    pub fn new(handle: &Handle) -> Self {
        let (jobs, receiver) = mpsc::channel::<Job>();
        handle.spawn_blocking(move || {
            for job in receiver {
                job();
            }
        });
        Self { jobs }
    }

    /// Starts the worker on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(&Handle::current())
    }

    pub(crate) fn execute(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("listener executor has shut down, dropping callback");
        }
    }
}
