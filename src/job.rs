//! The background job contract and its monitoring handle.
//!
//! Work that should run off the caller's thread (calculations, HTTP
//! retrievals) is expressed as a [`Job`] and handed to an execution pool.
//! Every job gets a [`JobController`]: a cloneable handle over shared
//! atomics that outside observers use to poll state and progress and to
//! request cooperative cancellation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::errors::{Error, Result};
use crate::http::HttpConnection;
use crate::progress::{AtomicProgress, CheckIn, EncodedProgress, ProgressReporter};

/// General information about a job, for inspection surfaces.
#[derive(Clone, Debug)]
pub struct JobInfo {
    pub description: String,
}

/// Where a job is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Canceled = 4,
}

impl JobState {
    fn from_u8(raw: u8) -> JobState {
        match raw {
            0 => JobState::Queued,
            1 => JobState::Running,
            2 => JobState::Completed,
            3 => JobState::Failed,
            _ => JobState::Canceled,
        }
    }

    /// True once the job will make no further transitions.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }
}

/// Submission flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobFlags {
    /// Run on an on-demand thread instead of waiting for a pool worker.
    pub skip_queue: bool,
    /// Exclude the job from inspection surfaces.
    pub hide_from_ui: bool,
}

impl JobFlags {
    pub const NONE: JobFlags = JobFlags {
        skip_queue: false,
        hide_from_ui: false,
    };
    pub const SKIP_QUEUE: JobFlags = JobFlags {
        skip_queue: true,
        hide_from_ui: false,
    };
}

/// What a job sees while executing.
///
/// `connection` is populated for jobs running on an HTTP pool: each HTTP
/// worker owns one persistent connection and lends it to the job for the
/// duration of `execute`. Compute workers lend nothing.
pub struct JobContext<'a> {
    pub check_in: &'a dyn CheckIn,
    pub reporter: &'a dyn ProgressReporter,
    pub connection: Option<&'a mut dyn HttpConnection>,
}

/// A unit of background work.
///
/// `execute` must call `ctx.check_in` at every safe suspension point; a
/// check-in failing with `Canceled` should be propagated out unchanged.
pub trait Job: Send {
    /// Kicks off whatever asynchronous gathering the job's inputs need.
    /// Called once, before the first `inputs_ready` poll.
    fn gather_inputs(&mut self) {}

    /// Whether the job can execute right now. A job answering `false` is
    /// set aside and reconsidered when other work completes; it must not
    /// busy-spin.
    fn inputs_ready(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut JobContext<'_>) -> Result<()>;

    fn info(&self) -> JobInfo;
}

pub(crate) struct JobData {
    state: AtomicU8,
    progress: AtomicProgress,
    cancellation_requested: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl JobData {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(JobState::Queued as u8),
            progress: AtomicProgress::new(),
            cancellation_requested: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }
}

/// A cloneable handle for monitoring and controlling one job.
///
/// State and progress reads are lock-free polls; like every polled state in
/// this crate they are advisory and may lag the worker by an instant.
#[derive(Clone)]
pub struct JobController {
    data: Arc<JobData>,
}

impl JobController {
    pub(crate) fn new() -> Self {
        Self {
            data: Arc::new(JobData::new()),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.data.state.load(Ordering::Acquire))
    }

    /// The job's progress, if it has reported any. Meaningful while
    /// `Running`; reset on completion.
    pub fn progress(&self) -> Option<f32> {
        self.data.progress.load().decode()
    }

    /// Requests cooperative cancellation. The job keeps running until its
    /// next check-in.
    pub fn cancel(&self) {
        self.data.cancellation_requested.store(true, Ordering::Release);
    }

    /// The error a `Failed` job reported.
    pub fn error(&self) -> Option<Error> {
        self.data.error.lock().clone()
    }

    pub(crate) fn cancellation_requested(&self) -> bool {
        self.data.cancellation_requested.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.data.state.store(state as u8, Ordering::Release);
        if state.is_finished() {
            self.data.progress.reset();
        }
    }

    pub(crate) fn set_error(&self, error: Error) {
        *self.data.error.lock() = Some(error);
    }

    pub(crate) fn report_progress(&self, progress: f32) {
        self.data.progress.store(EncodedProgress::encode(progress));
    }
}

impl fmt::Debug for JobController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobController")
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}
