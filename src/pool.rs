//! Bounded worker pools for background jobs.
//!
//! A pool owns a set of OS worker threads drawing from one priority-ordered
//! queue. Each worker carries an executor built by the pool's factory; the
//! basic executor is stateless, while HTTP executors own a persistent
//! connection that jobs borrow during execution. Scheduling rules:
//!
//! - Higher priority runs first; ties break first-in-first-out.
//! - A job whose inputs are not ready yet is set aside and reconsidered
//!   when other work completes or new work arrives; it never busy-spins.
//! - Cancellation is honored before dequeue and at every check-in.
//! - Workers drop their OS priority below interactive where the platform
//!   allows it.
//!
//! Shutting down drains the queue (queued jobs become `Canceled`), signals
//! running jobs to cancel at their next check-in, joins the workers, and
//! rejects later submissions.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, ErrorKind, Result};
use crate::job::{Job, JobContext, JobController, JobFlags, JobState};
use crate::progress::{CheckIn, ProgressReporter};

/// Runs one job on a worker, supplying whatever per-thread state the
/// worker owns.
pub trait Executor: Send {
    fn run(
        &mut self,
        job: &mut dyn Job,
        check_in: &dyn CheckIn,
        reporter: &dyn ProgressReporter,
    ) -> Result<()>;
}

/// The stateless executor used by compute pools.
pub struct BasicExecutor;

impl Executor for BasicExecutor {
    fn run(
        &mut self,
        job: &mut dyn Job,
        check_in: &dyn CheckIn,
        reporter: &dyn ProgressReporter,
    ) -> Result<()> {
        job.execute(&mut JobContext {
            check_in,
            reporter,
            connection: None,
        })
    }
}

/// The default worker count: available hardware parallelism, floored at 1.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct QueuedJob {
    job: Box<dyn Job>,
    controller: JobController,
    priority: i32,
    seq: u64,
    gathered: bool,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    ready: BinaryHeap<QueuedJob>,
    deferred: Vec<QueuedJob>,
    next_seq: u64,
}

struct PoolShared {
    state: Mutex<QueueState>,
    condvar: Condvar,
    shutting_down: AtomicBool,
    factory: Box<dyn Fn() -> Box<dyn Executor> + Send + Sync>,
}

struct PoolCheckIn {
    controller: JobController,
    shared: Arc<PoolShared>,
}

impl CheckIn for PoolCheckIn {
    fn check_in(&self) -> Result<()> {
        if self.controller.cancellation_requested()
            || self.shared.shutting_down.load(Ordering::Acquire)
        {
            Err(Error::canceled())
        } else {
            Ok(())
        }
    }
}

struct ControllerReporter {
    controller: JobController,
}

impl ProgressReporter for ControllerReporter {
    fn report(&self, progress: f32) {
        self.controller.report_progress(progress);
    }
}

/// A pool of worker threads executing [`Job`]s.
pub struct ExecutionPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionPool {
    /// Creates a pool with `worker_count` threads, each running an executor
    /// produced by `factory`. A count of zero is allowed; such a pool only
    /// runs `SKIP_QUEUE` jobs.
    pub fn new(
        worker_count: usize,
        factory: impl Fn() -> Box<dyn Executor> + Send + Sync + 'static,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(QueueState {
                ready: BinaryHeap::new(),
                deferred: Vec::new(),
                next_seq: 0,
            }),
            condvar: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            factory: Box::new(factory),
        });
        let workers = (0..worker_count)
            .map(|index| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("gantry-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawning a pool worker thread")
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Creates a pool sized to the hardware.
    pub fn with_default_workers(
        factory: impl Fn() -> Box<dyn Executor> + Send + Sync + 'static,
    ) -> Self {
        Self::new(default_worker_count(), factory)
    }

    /// Submits a job. Higher `priority` runs earlier; 0 is neutral and
    /// negative values are fine.
    ///
    /// After shutdown has begun the job is not queued and its controller
    /// reports `Canceled`.
    pub fn add_job(&self, job: Box<dyn Job>, flags: JobFlags, priority: i32) -> JobController {
        let controller = JobController::new();
        if self.shared.shutting_down.load(Ordering::Acquire) {
            controller.set_state(JobState::Canceled);
            return controller;
        }

        if flags.skip_queue {
            let shared = self.shared.clone();
            let mut queued = QueuedJob {
                job,
                controller: controller.clone(),
                priority,
                seq: 0,
                gathered: false,
            };
            std::thread::spawn(move || {
                lower_thread_priority();
                let mut executor = (shared.factory)();
                queued.job.gather_inputs();
                execute_job(&shared, executor.as_mut(), &mut queued);
            });
            return controller;
        }

        {
            let mut state = self.shared.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.ready.push(QueuedJob {
                job,
                controller: controller.clone(),
                priority,
                seq,
                gathered: false,
            });
        }
        self.shared.condvar.notify_all();
        controller
    }

    /// Drains the queue, cancels running jobs at their next check-in, and
    /// joins the worker threads.
    pub fn shut_down(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        let drained: Vec<QueuedJob> = {
            let mut state = self.shared.state.lock();
            let mut drained: Vec<QueuedJob> = state.ready.drain().collect();
            drained.append(&mut state.deferred);
            drained
        };
        // Job destructors run outside the queue lock; they may touch other
        // locks (for example cache records held by the job).
        for queued in drained {
            queued.controller.set_state(JobState::Canceled);
            drop(queued);
        }
        self.shared.condvar.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.shut_down();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    lower_thread_priority();
    let mut executor = (shared.factory)();
    while let Some(mut queued) = next_job(&shared) {
        execute_job(&shared, executor.as_mut(), &mut queued);
        drop(queued);
        // Completion may have made deferred jobs runnable.
        shared.condvar.notify_all();
    }
}

fn next_job(shared: &PoolShared) -> Option<QueuedJob> {
    // Declared before the guard so that, on return, canceled jobs are
    // dropped after the queue unlocks. Job destructors may take other
    // locks.
    let mut canceled: Vec<QueuedJob> = Vec::new();
    let mut state = shared.state.lock();
    loop {
        if shared.shutting_down.load(Ordering::Acquire) {
            return None;
        }

        // Every wake re-checks the jobs deferred on unready inputs.
        let deferred = std::mem::take(&mut state.deferred);
        for queued in deferred {
            state.ready.push(queued);
        }

        let mut set_aside = Vec::new();
        let mut found = None;
        while let Some(mut queued) = state.ready.pop() {
            if queued.controller.cancellation_requested() {
                queued.controller.set_state(JobState::Canceled);
                canceled.push(queued);
                continue;
            }
            if !queued.gathered {
                queued.job.gather_inputs();
                queued.gathered = true;
            }
            if queued.job.inputs_ready() {
                found = Some(queued);
                break;
            }
            set_aside.push(queued);
        }
        state.deferred.append(&mut set_aside);
        if found.is_some() {
            return found;
        }
        if !canceled.is_empty() {
            // Flush promptly, outside the lock, then re-examine the queue.
            parking_lot::MutexGuard::unlocked(&mut state, || canceled.clear());
            continue;
        }

        shared.condvar.wait(&mut state);
    }
}

fn execute_job(shared: &Arc<PoolShared>, executor: &mut dyn Executor, queued: &mut QueuedJob) {
    let controller = &queued.controller;
    if controller.cancellation_requested() || shared.shutting_down.load(Ordering::Acquire) {
        controller.set_state(JobState::Canceled);
        return;
    }
    controller.set_state(JobState::Running);

    let check_in = PoolCheckIn {
        controller: controller.clone(),
        shared: shared.clone(),
    };
    let reporter = ControllerReporter {
        controller: controller.clone(),
    };
    match executor.run(queued.job.as_mut(), &check_in, &reporter) {
        Ok(()) => controller.set_state(JobState::Completed),
        Err(error) if error.kind() == ErrorKind::Canceled => {
            controller.set_state(JobState::Canceled);
        }
        Err(error) => {
            tracing::warn!(
                job = %queued.job.info().description,
                %error,
                "background job failed"
            );
            controller.set_error(error);
            controller.set_state(JobState::Failed);
        }
    }
}

#[cfg(unix)]
fn lower_thread_priority() {
    // Best effort only.
    let _ = unsafe { libc::nice(1) };
}

#[cfg(not(unix))]
fn lower_thread_priority() {}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::job::JobInfo;

    struct FlagJob {
        executed: Arc<AtomicBool>,
    }

    impl Job for FlagJob {
        fn execute(&mut self, _ctx: &mut JobContext<'_>) -> Result<()> {
            self.executed.store(true, Ordering::Release);
            Ok(())
        }

        fn info(&self) -> JobInfo {
            JobInfo {
                description: "set a flag".to_owned(),
            }
        }
    }

    fn wait_for(controller: &JobController) -> JobState {
        for _ in 0..500 {
            if controller.state().is_finished() {
                return controller.state();
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        controller.state()
    }

    #[test]
    fn basic_pool_usage() {
        let pool = ExecutionPool::new(1, || Box::new(BasicExecutor));
        let executed = Arc::new(AtomicBool::new(false));
        let controller = pool.add_job(
            Box::new(FlagJob {
                executed: executed.clone(),
            }),
            JobFlags::NONE,
            0,
        );
        assert_eq!(wait_for(&controller), JobState::Completed);
        assert!(executed.load(Ordering::Acquire));
        pool.shut_down();
    }

    #[test]
    fn on_demand_threads_run_skip_queue_jobs() {
        // No workers at all; only the SKIP_QUEUE path can run anything.
        let pool = ExecutionPool::new(0, || Box::new(BasicExecutor));
        let executed = Arc::new(AtomicBool::new(false));
        let controller = pool.add_job(
            Box::new(FlagJob {
                executed: executed.clone(),
            }),
            JobFlags::SKIP_QUEUE,
            0,
        );
        assert_eq!(wait_for(&controller), JobState::Completed);
        assert!(executed.load(Ordering::Acquire));
        pool.shut_down();
    }

    struct OrderedJob {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        gate: Option<mpsc::Receiver<()>>,
    }

    impl Job for OrderedJob {
        fn execute(&mut self, _ctx: &mut JobContext<'_>) -> Result<()> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
            self.order.lock().push(self.tag);
            Ok(())
        }

        fn info(&self) -> JobInfo {
            JobInfo {
                description: format!("ordered job {}", self.tag),
            }
        }
    }

    #[test]
    fn priority_beats_fifo_and_fifo_breaks_ties() {
        let pool = ExecutionPool::new(1, || Box::new(BasicExecutor));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = mpsc::channel();

        // Occupy the single worker so the later submissions queue up.
        let blocker = pool.add_job(
            Box::new(OrderedJob {
                tag: "blocker",
                order: order.clone(),
                gate: Some(gate),
            }),
            JobFlags::NONE,
            0,
        );
        std::thread::sleep(Duration::from_millis(50));

        let low_a = pool.add_job(
            Box::new(OrderedJob {
                tag: "low-a",
                order: order.clone(),
                gate: None,
            }),
            JobFlags::NONE,
            0,
        );
        let low_b = pool.add_job(
            Box::new(OrderedJob {
                tag: "low-b",
                order: order.clone(),
                gate: None,
            }),
            JobFlags::NONE,
            0,
        );
        let high = pool.add_job(
            Box::new(OrderedJob {
                tag: "high",
                order: order.clone(),
                gate: None,
            }),
            JobFlags::NONE,
            5,
        );

        release.send(()).unwrap();
        for controller in [&blocker, &low_a, &low_b, &high] {
            assert_eq!(wait_for(controller), JobState::Completed);
        }
        assert_eq!(*order.lock(), ["blocker", "high", "low-a", "low-b"]);
        pool.shut_down();
    }

    struct DeferredJob {
        ready: Arc<AtomicBool>,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Job for DeferredJob {
        fn inputs_ready(&self) -> bool {
            self.ready.load(Ordering::Acquire)
        }

        fn execute(&mut self, _ctx: &mut JobContext<'_>) -> Result<()> {
            self.order.lock().push("deferred");
            Ok(())
        }

        fn info(&self) -> JobInfo {
            JobInfo {
                description: "deferred job".to_owned(),
            }
        }
    }

    struct EnablerJob {
        ready: Arc<AtomicBool>,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Job for EnablerJob {
        fn execute(&mut self, _ctx: &mut JobContext<'_>) -> Result<()> {
            self.order.lock().push("enabler");
            self.ready.store(true, Ordering::Release);
            Ok(())
        }

        fn info(&self) -> JobInfo {
            JobInfo {
                description: "enabler job".to_owned(),
            }
        }
    }

    #[test]
    fn unready_jobs_wait_for_other_work() {
        let pool = ExecutionPool::new(1, || Box::new(BasicExecutor));
        let ready = Arc::new(AtomicBool::new(false));
        let order = Arc::new(Mutex::new(Vec::new()));

        let deferred = pool.add_job(
            Box::new(DeferredJob {
                ready: ready.clone(),
                order: order.clone(),
            }),
            JobFlags::NONE,
            // Deferral wins over priority: this job cannot run first.
            10,
        );
        let enabler = pool.add_job(
            Box::new(EnablerJob {
                ready,
                order: order.clone(),
            }),
            JobFlags::NONE,
            0,
        );

        assert_eq!(wait_for(&deferred), JobState::Completed);
        assert_eq!(wait_for(&enabler), JobState::Completed);
        assert_eq!(*order.lock(), ["enabler", "deferred"]);
        pool.shut_down();
    }

    #[test]
    fn queued_jobs_canceled_before_dequeue_never_run() {
        let pool = ExecutionPool::new(1, || Box::new(BasicExecutor));
        let (release, gate) = mpsc::channel();
        let order = Arc::new(Mutex::new(Vec::new()));
        pool.add_job(
            Box::new(OrderedJob {
                tag: "blocker",
                order: order.clone(),
                gate: Some(gate),
            }),
            JobFlags::NONE,
            0,
        );
        std::thread::sleep(Duration::from_millis(50));

        let executed = Arc::new(AtomicBool::new(false));
        let victim = pool.add_job(
            Box::new(FlagJob {
                executed: executed.clone(),
            }),
            JobFlags::NONE,
            0,
        );
        victim.cancel();
        release.send(()).unwrap();

        assert_eq!(wait_for(&victim), JobState::Canceled);
        assert!(!executed.load(Ordering::Acquire));
        pool.shut_down();
    }

    #[test]
    fn shutdown_rejects_new_submissions() {
        let pool = ExecutionPool::new(1, || Box::new(BasicExecutor));
        pool.shut_down();
        let executed = Arc::new(AtomicBool::new(false));
        let controller = pool.add_job(
            Box::new(FlagJob {
                executed: executed.clone(),
            }),
            JobFlags::NONE,
            0,
        );
        assert_eq!(controller.state(), JobState::Canceled);
        assert!(!executed.load(Ordering::Acquire));
    }

    struct CheckInLoopJob {
        started: mpsc::Sender<()>,
    }

    impl Job for CheckInLoopJob {
        fn execute(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
            let _ = self.started.send(());
            loop {
                ctx.check_in.check_in()?;
                ctx.reporter.report(0.5);
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        fn info(&self) -> JobInfo {
            JobInfo {
                description: "spin until canceled".to_owned(),
            }
        }
    }

    #[test]
    fn running_jobs_stop_at_the_next_check_in() {
        let pool = ExecutionPool::new(1, || Box::new(BasicExecutor));
        let (started, has_started) = mpsc::channel();
        let controller = pool.add_job(Box::new(CheckInLoopJob { started }), JobFlags::NONE, 0);

        has_started.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(controller.state(), JobState::Running);
        for _ in 0..500 {
            if controller.progress().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(controller.progress(), Some(0.5));

        controller.cancel();
        assert_eq!(wait_for(&controller), JobState::Canceled);
        // Progress resets once the job stops.
        assert_eq!(controller.progress(), None);
        pool.shut_down();
    }

    struct FailingJob;

    impl Job for FailingJob {
        fn execute(&mut self, _ctx: &mut JobContext<'_>) -> Result<()> {
            Err(Error::new(ErrorKind::Transport))
        }

        fn info(&self) -> JobInfo {
            JobInfo {
                description: "failing job".to_owned(),
            }
        }
    }

    #[test]
    fn failures_surface_on_the_controller() {
        let pool = ExecutionPool::new(1, || Box::new(BasicExecutor));
        let controller = pool.add_job(Box::new(FailingJob), JobFlags::NONE, 0);
        assert_eq!(wait_for(&controller), JobState::Failed);
        assert_eq!(controller.error().unwrap().kind(), ErrorKind::Transport);
        pool.shut_down();
    }
}
