//! The service core: the crate's public runtime.
//!
//! [`ServiceCore`] bundles the immutable cache, a compute pool, an HTTP
//! pool whose workers each own a persistent connection, and the request
//! resolution engine, behind a small async surface. Callers await tasks;
//! they never see pools or cache internals. HTTP can be switched to a
//! scripted mock session for tests, which every subsequent HTTP job then
//! runs against.
//!
//! # Examples
//!
//! ```rust,no_run
//! use gantry::config::ServiceConfig;
//! use gantry::request::rq;
//! use gantry::service::ServiceCore;
//!
//! # async fn example() -> Result<(), gantry::errors::Error> {
//! let core = ServiceCore::new(ServiceConfig::default());
//! let value = core.resolve_request(&rq::value(4i64)).await?;
//! assert_eq!(value.as_integer()?, 4);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::{CacheSnapshot, ImmutableCache};
use crate::config::ServiceConfig;
use crate::errors::{Error, Result};
use crate::http::{
    HttpConnection, HttpRequest, HttpResponse, MockHttpConnection, MockHttpSession,
    PersistentHttpConnection,
};
use crate::job::{Job, JobContext, JobFlags, JobInfo};
use crate::pool::{BasicExecutor, ExecutionPool, Executor};
use crate::progress::{CheckIn, ProgressReporter};
use crate::request::{Request, RequestResolutionSystem};
use crate::value::Value;

/// Decides, per job, whether HTTP workers talk to the network or to a
/// mock session.
struct ConnectionSource {
    mock: Mutex<Option<Arc<MockHttpSession>>>,
}

/// The executor run by the service's HTTP pool workers.
///
/// The real connection is established lazily so that a mock installed
/// before the first HTTP job takes effect without rebuilding the pool.
struct ServiceHttpExecutor {
    source: Arc<ConnectionSource>,
    real: Option<PersistentHttpConnection>,
}

impl Executor for ServiceHttpExecutor {
    fn run(
        &mut self,
        job: &mut dyn Job,
        check_in: &dyn CheckIn,
        reporter: &dyn ProgressReporter,
    ) -> Result<()> {
        let mock = self.source.mock.lock().clone();
        match mock {
            Some(session) => {
                let mut connection = MockHttpConnection::new(session);
                job.execute(&mut JobContext {
                    check_in,
                    reporter,
                    connection: Some(&mut connection),
                })
            }
            None => {
                if self.real.is_none() {
                    self.real = Some(PersistentHttpConnection::new()?);
                }
                job.execute(&mut JobContext {
                    check_in,
                    reporter,
                    connection: self.real.as_mut().map(|c| c as &mut dyn HttpConnection),
                })
            }
        }
    }
}

/// The job behind [`ServiceCore::async_http_request`].
struct HttpRequestJob {
    request: HttpRequest,
    result: Option<tokio::sync::oneshot::Sender<Result<HttpResponse>>>,
}

impl Job for HttpRequestJob {
    fn execute(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        let connection = ctx
            .connection
            .as_deref_mut()
            .ok_or_else(|| Error::internal("HTTP job scheduled on a pool without connections"))?;
        let result = connection.perform_request(ctx.check_in, ctx.reporter, &self.request);
        let failure = result.as_ref().err().cloned();
        if let Some(sender) = self.result.take() {
            let _ = sender.send(result);
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            description: format!("HTTP {} {}", self.request.method, self.request.url),
        }
    }
}

/// The assembled service runtime.
pub struct ServiceCore {
    cache: ImmutableCache,
    resolution: RequestResolutionSystem,
    http_pool: ExecutionPool,
    connection_source: Arc<ConnectionSource>,
}

impl ServiceCore {
    pub fn new(config: ServiceConfig) -> Self {
        let cache = ImmutableCache::new(config.immutable_cache.unwrap_or_default());
        let resolution = RequestResolutionSystem::with_parts(
            cache.clone(),
            ExecutionPool::with_default_workers(|| Box::new(BasicExecutor)),
        );
        let connection_source = Arc::new(ConnectionSource {
            mock: Mutex::new(None),
        });
        let http_pool = ExecutionPool::with_default_workers({
            let source = connection_source.clone();
            move || {
                Box::new(ServiceHttpExecutor {
                    source: source.clone(),
                    real: None,
                })
            }
        });
        Self {
            cache,
            resolution,
            http_pool,
            connection_source,
        }
    }

    pub fn cache(&self) -> &ImmutableCache {
        &self.cache
    }

    pub fn resolution(&self) -> &RequestResolutionSystem {
        &self.resolution
    }

    /// Routes all subsequent HTTP jobs to a fresh scripted mock session
    /// and returns it for scripting and inspection.
    pub fn enable_http_mocking(&self) -> Arc<MockHttpSession> {
        let session = Arc::new(MockHttpSession::new());
        *self.connection_source.mock.lock() = Some(session.clone());
        session
    }

    /// Performs one HTTP exchange on the HTTP pool.
    pub async fn async_http_request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        self.http_pool.add_job(
            Box::new(HttpRequestJob {
                request,
                result: Some(sender),
            }),
            JobFlags::NONE,
            0,
        );
        // A dropped sender means the job was discarded by pool shutdown.
        receiver.await.map_err(|_| Error::canceled())?
    }

    /// Resolves a request to its value.
    pub async fn resolve_request(&self, request: &Request) -> Result<Value> {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        self.resolution.post_request(request, move |result| {
            let _ = sender.send(result);
        });
        receiver.await.map_err(|_| Error::canceled())?
    }

    /// Runs `task` through the disk cache.
    ///
    /// The on-disk cache is an external collaborator; without one wired in,
    /// this is a pass-through that just awaits the task.
    pub async fn disk_cached<F>(&self, key: String, task: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>>,
    {
        tracing::debug!(%key, "disk cache pass-through");
        task.await
    }

    /// Evicts every unused cache entry.
    pub fn clear_unused_cache_entries(&self) {
        self.cache.clear_all_unused();
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    /// Spawns a background task applying the cache's configured size cap
    /// every `period`. Must be called within a tokio runtime; aborting the
    /// returned handle stops the sweeps.
    pub fn spawn_cache_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryState;
    use crate::errors::{labels, ErrorKind};
    use crate::http::MockHttpExchange;
    use crate::identity::Id;
    use crate::request::rq;
    use crate::value::Blob;

    fn mocked_core() -> (ServiceCore, Arc<MockHttpSession>) {
        let core = ServiceCore::new(ServiceConfig::default());
        let session = core.enable_http_mocking();
        (core, session)
    }

    #[tokio::test]
    async fn http_requests_run_on_the_http_pool() {
        let (core, session) = mocked_core();
        session.set_script(vec![MockHttpExchange {
            request: HttpRequest::get("http://example.test/api/v1/thing"),
            response: HttpResponse::ok(Blob::from(br#"{"id": "abc123"}"#.to_vec())),
        }]);

        let response = core
            .async_http_request(HttpRequest::get("http://example.test/api/v1/thing"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let body = response.parse_json_body().unwrap();
        assert_eq!(
            body.as_map().unwrap().get_str("id"),
            Some(&Value::from("abc123"))
        );
        assert!(session.is_complete());
        assert!(session.is_in_order());
    }

    #[tokio::test]
    async fn protocol_errors_surface_unchanged() {
        let (core, session) = mocked_core();
        // The mock connection does not apply status policy, so script the
        // failure through a job-level exchange with an error body and let
        // the caller interpret it.
        session.set_script(vec![MockHttpExchange {
            request: HttpRequest::get("http://example.test/missing"),
            response: HttpResponse::with_status(404, Blob::from(b"not found".to_vec())),
        }]);
        let response = core
            .async_http_request(HttpRequest::get("http://example.test/missing"))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn resolve_request_awaits_values() {
        let core = ServiceCore::new(ServiceConfig::default());
        let value = core.resolve_request(&rq::value(4i64)).await.unwrap();
        assert_eq!(value, Value::from(4i64));

        let snapshot = core.cache_snapshot();
        assert_eq!(
            snapshot.in_use.len() + snapshot.pending_eviction.len(),
            1
        );
    }

    #[tokio::test]
    async fn disk_cached_passes_through() {
        let core = ServiceCore::new(ServiceConfig::default());
        let value = core
            .disk_cached("some-key".to_owned(), async { Ok(Value::from("payload")) })
            .await
            .unwrap();
        assert_eq!(value, Value::from("payload"));

        let failure: Result<Value> = core
            .disk_cached("other-key".to_owned(), async {
                Err(Error::new(ErrorKind::Transport).with_info(labels::SYSTEM_ERROR, "down"))
            })
            .await;
        assert_eq!(failure.unwrap_err().kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn cleared_entries_leave_live_data_alone() {
        let core = ServiceCore::new(ServiceConfig::default());
        core.resolve_request(&rq::value(1i64)).await.unwrap();

        let key = rq::value(1i64).id();
        let held = core.cache().lookup(&key).unwrap();
        assert_eq!(held.state(), EntryState::Ready);

        core.clear_unused_cache_entries();
        assert_eq!(held.data(), Some(Value::from(1i64)));

        drop(held);
        core.clear_unused_cache_entries();
        assert!(core.cache().lookup(&Id::from("gone")).is_none());
        assert_eq!(core.cache_snapshot().pending_eviction.len(), 0);
    }
}
