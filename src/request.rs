//! The request graph: lazy descriptions of values and their resolution.
//!
//! A [`Request`] describes a value without computing it. Three shapes
//! exist: plain values, function applications over sub-requests, and meta
//! requests whose producer evaluates to another request. Every request has
//! a structural fingerprint ([`Request::id`]) derived only from its shape
//! and the ids of its parts, so two independently built but structurally
//! equal requests share one cache record and one in-flight evaluation.
//!
//! Resolution is callback-driven: [`RequestResolutionSystem::post_request`]
//! probes the cache with the request's fingerprint, registers the caller as
//! a waiter, and evaluates only on the first probe. Plain values publish
//! immediately on the calling thread; applications resolve their arguments
//! concurrently and then run on the compute pool; meta requests evaluate
//! their producer and recurse into the request it yields.
//!
//! Functions are assumed pure: equal fingerprints must mean equal results,
//! and that is the caller's responsibility when registering function
//! bodies.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cache::ImmutableCache;
use crate::config::ImmutableCacheConfig;
use crate::errors::{labels, Error, ErrorKind, Result};
use crate::identity::{Id, Sha256IdHasher};
use crate::job::{Job, JobContext, JobFlags, JobInfo};
use crate::pool::{BasicExecutor, ExecutionPool};
use crate::value::Value;

/// What a function application produces: either a finished value or a
/// further request (the latter is what meta-request producers return).
pub enum Outcome {
    Value(Value),
    Request(Request),
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

type FunctionBody = dyn Fn(Vec<Value>) -> Result<Outcome> + Send + Sync;

/// A named, pure callable usable in apply requests.
///
/// The tag is the function's identity for fingerprinting purposes: two
/// functions with the same tag are assumed interchangeable.
#[derive(Clone)]
pub struct Function {
    tag: Arc<str>,
    body: Arc<FunctionBody>,
}

impl Function {
    pub fn new(
        tag: impl Into<String>,
        body: impl Fn(Vec<Value>) -> Result<Outcome> + Send + Sync + 'static,
    ) -> Self {
        Self {
            tag: tag.into().into(),
            body: Arc::new(body),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn invoke(&self, args: Vec<Value>) -> Result<Outcome> {
        (self.body)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.tag)
    }
}

/// A function applied to argument sub-requests.
#[derive(Clone, Debug)]
pub struct ApplyRequest {
    function: Function,
    args: Vec<Request>,
}

/// A request producing another request.
#[derive(Clone, Debug)]
pub struct MetaRequest {
    producer: Box<Request>,
}

/// A lazy description of a value.
#[derive(Clone, Debug)]
pub enum Request {
    Value(Value),
    Apply(ApplyRequest),
    Meta(MetaRequest),
}

impl Request {
    /// The request's structural fingerprint.
    ///
    /// Depends only on the variant and the ids of sub-requests, so
    /// argument order matters and syntactically distinct but structurally
    /// equal requests collide (which is the point).
    pub fn id(&self) -> Id {
        let mut hasher = Sha256IdHasher::new();
        match self {
            Request::Value(value) => {
                hasher.fold_str("value");
                hasher.fold_value(value);
            }
            Request::Apply(apply) => {
                hasher.fold_str("apply");
                hasher.fold_str(apply.function.tag());
                for arg in &apply.args {
                    hasher.fold_id(&arg.id());
                }
            }
            Request::Meta(meta) => {
                hasher.fold_str("meta");
                hasher.fold_id(&meta.producer.id());
            }
        }
        hasher.into_id()
    }

    /// Whether the request already carries its value.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Request::Value(_))
    }
}

/// Request constructors.
pub mod rq {
    use super::{ApplyRequest, Function, MetaRequest, Request};
    use crate::value::Value;

    pub fn value(value: impl Into<Value>) -> Request {
        Request::Value(value.into())
    }

    pub fn apply(function: Function, args: Vec<Request>) -> Request {
        Request::Apply(ApplyRequest { function, args })
    }

    pub fn meta(producer: Request) -> Request {
        Request::Meta(MetaRequest {
            producer: Box::new(producer),
        })
    }
}

struct SystemInner {
    cache: ImmutableCache,
    pool: ExecutionPool,
}

/// The engine resolving requests against a shared cache and compute pool.
///
/// Cloning shares the engine.
#[derive(Clone)]
pub struct RequestResolutionSystem {
    inner: Arc<SystemInner>,
}

type Deliver = Box<dyn FnOnce(Result<Outcome>) + Send>;

impl RequestResolutionSystem {
    /// A self-contained system: hardware-sized compute pool, default cache
    /// sizing.
    pub fn new() -> Self {
        Self::with_parts(
            ImmutableCache::new(ImmutableCacheConfig::default()),
            ExecutionPool::with_default_workers(|| Box::new(BasicExecutor)),
        )
    }

    /// Builds a system over an existing cache and compute pool.
    pub fn with_parts(cache: ImmutableCache, pool: ExecutionPool) -> Self {
        Self {
            inner: Arc::new(SystemInner { cache, pool }),
        }
    }

    pub fn cache(&self) -> &ImmutableCache {
        &self.inner.cache
    }

    /// Resolves `request`, invoking `callback` exactly once with the value
    /// or the failure.
    ///
    /// If the value is already cached (or the request is a plain value) the
    /// callback runs synchronously on this thread; otherwise it runs on
    /// whichever thread completes the record.
    pub fn post_request(
        &self,
        request: &Request,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) {
        let id = request.id();
        let (pointer, created) = self.inner.cache.probe(&id);
        // The waiter holds a pointer so the record stays live (and thus
        // publishable) for the whole resolution.
        let interest = pointer.clone();
        pointer.add_waiter(move |result| {
            let _interest = interest;
            callback(result);
        });
        if created {
            self.evaluate_into(&id, request.clone());
        }
    }

    /// First-probe evaluation of `request`, publishing into its record.
    fn evaluate_into(&self, id: &Id, request: Request) {
        match request {
            Request::Value(value) => {
                // No pool round-trip for data that is already here.
                self.inner.cache.publish(id, value);
            }
            Request::Apply(apply) => {
                let system = self.clone();
                let id = id.clone();
                self.resolve_apply(
                    apply,
                    Some(id.clone()),
                    Box::new(move |outcome| match outcome {
                        Ok(Outcome::Value(value)) => system.inner.cache.publish(&id, value),
                        Ok(Outcome::Request(_)) => system.inner.cache.fail(
                            &id,
                            Error::new(ErrorKind::TypeMismatch)
                                .with_info(labels::EXPECTED_TYPE, "value")
                                .with_info(labels::ACTUAL_TYPE, "request")
                                .with_info(labels::OFFENDING_ID, &id),
                        ),
                        Err(error) => system.inner.cache.fail(&id, error),
                    }),
                );
            }
            Request::Meta(meta) => self.resolve_meta(*meta.producer, id.clone()),
        }
    }

    /// Resolves an application's arguments concurrently and, once all are
    /// ready, submits the function to the compute pool. `record` is the
    /// cache record this application is filling, if any; the submitted job
    /// is associated with it.
    fn resolve_apply(&self, apply: ApplyRequest, record: Option<Id>, deliver: Deliver) {
        let ApplyRequest { function, args } = apply;
        if args.is_empty() {
            self.submit_apply(function, Vec::new(), record, deliver);
            return;
        }

        let count = args.len();
        let gather = Arc::new(ArgumentGather {
            system: self.clone(),
            function,
            record,
            slots: Mutex::new(vec![None; count]),
            remaining: AtomicUsize::new(count),
            deliver: Mutex::new(Some(deliver)),
        });
        for (index, arg) in args.into_iter().enumerate() {
            let gather = gather.clone();
            self.post_request(&arg, move |result| gather.complete(index, result));
        }
    }

    fn submit_apply(
        &self,
        function: Function,
        values: Vec<Value>,
        record: Option<Id>,
        deliver: Deliver,
    ) {
        let controller = self.inner.pool.add_job(
            Box::new(ApplyJob {
                function,
                values: Some(values),
                deliver: Some(deliver),
            }),
            JobFlags::NONE,
            0,
        );
        if let Some(key) = record {
            self.inner.cache.set_job(&key, controller);
        }
    }

    /// Evaluates a meta request's producer, then resolves the request it
    /// yields into the meta record.
    fn resolve_meta(&self, producer: Request, meta_id: Id) {
        match producer {
            Request::Apply(apply) => {
                let system = self.clone();
                let record = meta_id.clone();
                self.resolve_apply(
                    apply,
                    Some(meta_id.clone()),
                    Box::new(move |outcome| match outcome {
                        Ok(Outcome::Request(produced)) => {
                            let publish_into = system.clone();
                            let meta_id = record;
                            system.post_request(&produced, move |result| match result {
                                Ok(value) => publish_into.inner.cache.publish(&meta_id, value),
                                Err(error) => publish_into.inner.cache.fail(&meta_id, error),
                            });
                        }
                        Ok(Outcome::Value(_)) => system.inner.cache.fail(
                            &record,
                            Error::new(ErrorKind::TypeMismatch)
                                .with_info(labels::EXPECTED_TYPE, "request")
                                .with_info(labels::ACTUAL_TYPE, "value")
                                .with_info(labels::OFFENDING_ID, &record),
                        ),
                        Err(error) => system.inner.cache.fail(&record, error),
                    }),
                );
            }
            other => {
                // Only applications can yield requests.
                self.inner.cache.fail(
                    &meta_id,
                    Error::new(ErrorKind::TypeMismatch)
                        .with_info(labels::EXPECTED_TYPE, "request-producing application")
                        .with_info(
                            labels::ACTUAL_TYPE,
                            match other {
                                Request::Value(_) => "value",
                                _ => "meta",
                            },
                        )
                        .with_info(labels::OFFENDING_ID, &meta_id),
                );
            }
        }
    }
}

impl Default for RequestResolutionSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects an application's argument values as their resolutions land.
struct ArgumentGather {
    system: RequestResolutionSystem,
    function: Function,
    record: Option<Id>,
    slots: Mutex<Vec<Option<Value>>>,
    remaining: AtomicUsize,
    deliver: Mutex<Option<Deliver>>,
}

impl ArgumentGather {
    fn complete(&self, index: usize, result: Result<Value>) {
        match result {
            Err(error) => {
                // First failure wins; later completions are ignored.
                if let Some(deliver) = self.deliver.lock().take() {
                    deliver(Err(error));
                }
            }
            Ok(value) => {
                self.slots.lock()[index] = Some(value);
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let Some(deliver) = self.deliver.lock().take() else {
                        return;
                    };
                    let values = self
                        .slots
                        .lock()
                        .iter_mut()
                        .map(|slot| slot.take().unwrap_or_default())
                        .collect();
                    self.system.submit_apply(
                        self.function.clone(),
                        values,
                        self.record.clone(),
                        deliver,
                    );
                }
            }
        }
    }
}

/// The pool job that runs a gathered application.
struct ApplyJob {
    function: Function,
    values: Option<Vec<Value>>,
    deliver: Option<Deliver>,
}

impl Drop for ApplyJob {
    fn drop(&mut self) {
        // A job discarded before execution (canceled, or drained by pool
        // shutdown) still owes its record an answer; otherwise waiters
        // sleep forever.
        if let Some(deliver) = self.deliver.take() {
            deliver(Err(Error::canceled()));
        }
    }
}

impl Job for ApplyJob {
    fn execute(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        ctx.check_in.check_in()?;
        let values = self.values.take().unwrap_or_default();
        let result = self.function.invoke(values);
        let failure = result.as_ref().err().cloned();
        if let Some(deliver) = self.deliver.take() {
            deliver(result);
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            description: format!("apply {}", self.function.tag()),
        }
    }
}
