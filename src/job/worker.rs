//! Background execution of slice jobs.
//!
//! A slice job runs as one cancellable unit of work on a dedicated thread.
//! Inside the job, `JobContext::checkpoint` marks the cooperative yield
//! points: it gives other scheduled work a chance to run and reports
//! whether the job should keep going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::job::{JobError, SliceJob, SliceJobReport};

/// Shared cancellation flag for one job.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the job stops at its next checkpoint.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Execution context handed to a running job.
pub struct JobContext {
    token: CancellationToken,
}

impl JobContext {
    /// A context with a fresh cancellation token.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cooperative yield point. Returns false when the job should stop.
    pub fn checkpoint(&self) -> bool {
        thread::yield_now();
        !self.token.is_cancelled()
    }
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a job running on a worker thread.
pub struct JobHandle {
    token: CancellationToken,
    handle: JoinHandle<Result<SliceJobReport, JobError>>,
}

impl JobHandle {
    /// The job's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request best-effort cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the job completes and return its report.
    pub fn wait(self) -> Result<SliceJobReport, JobError> {
        self.handle.join().map_err(|_| JobError::WorkerPanicked)?
    }
}

/// Run a slice job on a dedicated worker thread.
pub fn spawn(job: SliceJob) -> Result<JobHandle, JobError> {
    let token = CancellationToken::new();
    let context = JobContext::with_token(token.clone());
    let handle = thread::Builder::new()
        .name("slice-job".to_string())
        .spawn(move || job.run(&context))
        .map_err(|e| JobError::WorkerSpawn(e.to_string()))?;

    Ok(JobHandle { token, handle })
}
