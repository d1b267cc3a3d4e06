//! Progress reporting and cooperative cancellation primitives.
//!
//! Progress is an advisory float in `[0, 1]` that observers poll without
//! locking, so it is packed into a single integer: a negative value means
//! "not reported", anything else is thousandths. Long-running jobs receive a
//! [`CheckIn`] they must call at safe suspension points; it fails with
//! `Canceled` once cancellation has been requested.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::errors::Result;

/// Granularity of the encoded form: thousandths.
pub const ENCODED_PROGRESS_MAX_VALUE: i32 = 1000;

/// An optional progress value encoded as one integer so it can live in an
/// atomic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodedProgress(i32);

impl EncodedProgress {
    /// The unreported state.
    pub const ABSENT: EncodedProgress = EncodedProgress(-1);

    /// Encodes a progress fraction in `[0, 1]`, to the nearest thousandth.
    pub fn encode(progress: f32) -> Self {
        EncodedProgress((progress * ENCODED_PROGRESS_MAX_VALUE as f32).round() as i32)
    }

    /// Decodes back to a fraction; `None` when progress was never reported.
    pub fn decode(self) -> Option<f32> {
        (self.0 >= 0).then(|| self.0 as f32 / ENCODED_PROGRESS_MAX_VALUE as f32)
    }

    pub fn from_raw(raw: i32) -> Self {
        EncodedProgress(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

impl Default for EncodedProgress {
    fn default() -> Self {
        EncodedProgress::ABSENT
    }
}

/// The atomic cell an [`EncodedProgress`] is polled through.
///
/// All accesses are `Relaxed`: progress is a best-effort hint and carries no
/// ordering obligations toward any other field.
#[derive(Debug)]
pub struct AtomicProgress(AtomicI32);

impl AtomicProgress {
    pub fn new() -> Self {
        AtomicProgress(AtomicI32::new(EncodedProgress::ABSENT.raw()))
    }

    pub fn store(&self, progress: EncodedProgress) {
        self.0.store(progress.raw(), Ordering::Relaxed);
    }

    pub fn load(&self) -> EncodedProgress {
        EncodedProgress::from_raw(self.0.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.store(EncodedProgress::ABSENT);
    }
}

impl Default for AtomicProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellation probe a job invokes at its suspension points.
pub trait CheckIn: Send + Sync {
    /// Fails with `Canceled` if cancellation has been requested.
    fn check_in(&self) -> Result<()>;
}

/// Receives progress fractions from a running job.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: f32);
}

/// A check-in that never reports cancellation.
pub struct NullCheckIn;

impl CheckIn for NullCheckIn {
    fn check_in(&self) -> Result<()> {
        Ok(())
    }
}

/// A reporter that discards progress.
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn report(&self, _progress: f32) {}
}
