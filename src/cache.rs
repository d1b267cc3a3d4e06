//! The in-memory cache for immutable data.
//!
//! The cache maps content-addressed ids to records holding immutable
//! values. It is built for data that is large, slow to produce, and wanted
//! by several consumers at once:
//!
//! - Concurrent probes for the same key create exactly one record; everyone
//!   else shares it, along with whatever job is filling it.
//! - Consumers express interest by holding a [`Pointer`]; while any pointer
//!   to a record exists, the record cannot be evicted.
//! - Records whose last pointer is dropped move to the tail of an LRU
//!   eviction list and are reclaimed oldest-first once the list's total
//!   size exceeds the configured cap.
//! - Producing data may fail; the record then carries the failure to its
//!   waiters and to later probes. A failed record is terminal (callers may
//!   evict and re-probe to retry).
//!
//! One coarse mutex guards the record map, the eviction list, and every
//! mutable record field except `state` and `progress`, which are atomics so
//! that observers can poll them without contending with the engine. Polled
//! values are advisory: any decision based on one must re-acquire the mutex
//! and re-check before touching other fields. Publication stores `state`
//! with release ordering, so a reader that observes `Ready` also observes
//! the published data.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::config::ImmutableCacheConfig;
use crate::errors::{Error, Result};
use crate::identity::{CapturedId, Id};
use crate::job::JobController;
use crate::progress::{AtomicProgress, EncodedProgress, ProgressReporter};
use crate::value::Value;

/// The state of one cache record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    /// The record exists but its data is still being produced.
    Loading = 0,
    /// The data is present and immutable from here on.
    Ready = 1,
    /// Production failed; terminal for this record.
    Failed = 2,
}

impl EntryState {
    fn from_u8(raw: u8) -> EntryState {
        match raw {
            0 => EntryState::Loading,
            1 => EntryState::Ready,
            _ => EntryState::Failed,
        }
    }
}

type Waiter = Box<dyn FnOnce(Result<Value>) + Send>;

/// The lock-free face of a record: what pointers poll.
struct RecordCell {
    key: CapturedId,
    state: AtomicU8,
    progress: AtomicProgress,
}

struct EvictionLinks {
    prev: Option<CapturedId>,
    next: Option<CapturedId>,
}

/// Everything else about a record. Lives under the cache mutex.
struct RecordBody {
    cell: Arc<RecordCell>,
    /// Count of live pointers. Zero exactly when `links` is `Some`.
    ref_count: u32,
    /// Present iff the state is `Ready`.
    data: Option<Value>,
    /// Deep size of `data`; zero while not `Ready`.
    size: usize,
    /// The job producing the data, while `Loading`.
    job: Option<JobController>,
    /// The terminal failure, while `Failed`.
    error: Option<Error>,
    waiters: Vec<Waiter>,
    /// Present iff the record is on the eviction list.
    links: Option<EvictionLinks>,
}

struct EvictionList {
    head: Option<CapturedId>,
    tail: Option<CapturedId>,
    total_size: usize,
}

struct CacheInner {
    records: HashMap<CapturedId, RecordBody>,
    eviction: EvictionList,
}

impl CacheInner {
    /// Removes a record from the eviction list in O(1), fixing neighbors.
    fn unlink(&mut self, key: &Id) {
        let (links, size) = {
            let Some(body) = self.records.get_mut(key) else {
                return;
            };
            let Some(links) = body.links.take() else {
                return;
            };
            (links, body.size)
        };
        match &links.prev {
            Some(prev) => {
                if let Some(neighbor) = self.records.get_mut(prev.id()) {
                    if let Some(neighbor_links) = neighbor.links.as_mut() {
                        neighbor_links.next = links.next.clone();
                    }
                }
            }
            None => self.eviction.head = links.next.clone(),
        }
        match &links.next {
            Some(next) => {
                if let Some(neighbor) = self.records.get_mut(next.id()) {
                    if let Some(neighbor_links) = neighbor.links.as_mut() {
                        neighbor_links.prev = links.prev.clone();
                    }
                }
            }
            None => self.eviction.tail = links.prev.clone(),
        }
        self.eviction.total_size -= size;
    }

    /// Appends a record to the eviction list tail in O(1).
    fn push_tail(&mut self, key: CapturedId) {
        let old_tail = self.eviction.tail.replace(key.clone());
        match &old_tail {
            Some(tail) => {
                if let Some(neighbor) = self.records.get_mut(tail.id()) {
                    if let Some(neighbor_links) = neighbor.links.as_mut() {
                        neighbor_links.next = Some(key.clone());
                    }
                }
            }
            None => self.eviction.head = Some(key.clone()),
        }
        let body = self
            .records
            .get_mut(key.id())
            .expect("eviction list entries always have records");
        body.links = Some(EvictionLinks {
            prev: old_tail,
            next: None,
        });
        self.eviction.total_size += body.size;
    }
}

struct CacheShared {
    inner: Mutex<CacheInner>,
    config: ImmutableCacheConfig,
}

/// A snapshot of one record, for inspection surfaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntrySnapshot {
    pub key: String,
    pub is_ready: bool,
    pub size: usize,
}

/// A snapshot of the whole cache, split by whether entries are in use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub in_use: Vec<CacheEntrySnapshot>,
    /// In eviction order: the front is next to be reclaimed.
    pub pending_eviction: Vec<CacheEntrySnapshot>,
}

/// The immutable cache. Cloning shares the same cache.
#[derive(Clone)]
pub struct ImmutableCache {
    shared: Arc<CacheShared>,
}

impl ImmutableCache {
    pub fn new(config: ImmutableCacheConfig) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                inner: Mutex::new(CacheInner {
                    records: HashMap::new(),
                    eviction: EvictionList {
                        head: None,
                        tail: None,
                        total_size: 0,
                    },
                }),
                config,
            }),
        }
    }

    /// Returns a pointer to the record for `key`, plus whether this call
    /// created it. Creation leaves the record `Loading`; the creator is
    /// expected to arrange for data to be produced and published.
    ///
    /// Under concurrent probes for one key, exactly one caller sees
    /// `true`; all others share the record it created.
    pub fn probe(&self, key: &Id) -> (Pointer, bool) {
        let mut inner = self.shared.inner.lock();
        if inner.records.contains_key(key) {
            let (cell, revived) = {
                let body = inner.records.get_mut(key).expect("checked above");
                body.ref_count += 1;
                (body.cell.clone(), body.ref_count == 1)
            };
            if revived {
                inner.unlink(key);
            }
            (
                Pointer {
                    shared: self.shared.clone(),
                    cell,
                },
                false,
            )
        } else {
            let captured = key.clone().capture();
            let cell = Arc::new(RecordCell {
                key: captured.clone(),
                state: AtomicU8::new(EntryState::Loading as u8),
                progress: AtomicProgress::new(),
            });
            inner.records.insert(
                captured,
                RecordBody {
                    cell: cell.clone(),
                    ref_count: 1,
                    data: None,
                    size: 0,
                    job: None,
                    error: None,
                    waiters: Vec::new(),
                    links: None,
                },
            );
            (
                Pointer {
                    shared: self.shared.clone(),
                    cell,
                },
                true,
            )
        }
    }

    /// Returns a pointer to the record for `key` only if one exists,
    /// without creating anything.
    pub fn lookup(&self, key: &Id) -> Option<Pointer> {
        let mut inner = self.shared.inner.lock();
        if !inner.records.contains_key(key) {
            return None;
        }
        let (cell, revived) = {
            let body = inner.records.get_mut(key).expect("checked above");
            body.ref_count += 1;
            (body.cell.clone(), body.ref_count == 1)
        };
        if revived {
            inner.unlink(key);
        }
        Some(Pointer {
            shared: self.shared.clone(),
            cell,
        })
    }

    /// Associates the job producing a `Loading` record's data, so that
    /// inspection surfaces can reach it and eviction can release it.
    pub fn set_job(&self, key: &Id, job: JobController) {
        let mut inner = self.shared.inner.lock();
        if let Some(body) = inner.records.get_mut(key) {
            // A completed record has no use for the handle; the job may
            // have finished before its submitter got here.
            if EntryState::from_u8(body.cell.state.load(Ordering::Acquire)) == EntryState::Loading
            {
                body.job = Some(job);
            }
        }
    }

    /// Publishes data for `key`, transitioning `Loading` to `Ready` and
    /// waking every waiter. A publish for an already-evicted record is a
    /// no-op, as is one for a record that already completed: published
    /// data is immutable and failures are terminal.
    pub fn publish(&self, key: &Id, data: Value) {
        let job;
        let waiters;
        {
            let mut inner = self.shared.inner.lock();
            let Some(body) = inner.records.get_mut(key) else {
                return;
            };
            if EntryState::from_u8(body.cell.state.load(Ordering::Acquire)) != EntryState::Loading
            {
                return;
            }
            let new_size = data.deep_size();
            body.data = Some(data.clone());
            body.size = new_size;
            body.error = None;
            job = body.job.take();
            waiters = std::mem::take(&mut body.waiters);
            body.cell.progress.reset();
            body.cell.state.store(EntryState::Ready as u8, Ordering::Release);
            if body.links.is_some() {
                // Published while idle on the eviction list: keep the
                // list's size accounting in step.
                inner.eviction.total_size += new_size;
            }
        }
        // Waiters and the job handle run their course outside the mutex;
        // either may re-enter the cache.
        drop(job);
        for waiter in waiters {
            waiter(Ok(data.clone()));
        }
    }

    /// Records a production failure for `key`, transitioning `Loading` to
    /// `Failed` and waking every waiter with the error. Terminal.
    pub fn fail(&self, key: &Id, error: Error) {
        let job;
        let waiters;
        {
            let mut inner = self.shared.inner.lock();
            let Some(body) = inner.records.get_mut(key) else {
                return;
            };
            if EntryState::from_u8(body.cell.state.load(Ordering::Acquire)) != EntryState::Loading
            {
                return;
            }
            body.error = Some(error.clone());
            job = body.job.take();
            waiters = std::mem::take(&mut body.waiters);
            body.cell.progress.reset();
            body.cell.state.store(EntryState::Failed as u8, Ordering::Release);
        }
        drop(job);
        for waiter in waiters {
            waiter(Err(error.clone()));
        }
    }

    /// Re-arms a record to `Loading`, discarding any data it held.
    pub fn reset_data(&self, key: &Id) {
        let mut inner = self.shared.inner.lock();
        let Some(body) = inner.records.get_mut(key) else {
            return;
        };
        let old_size = body.size;
        body.data = None;
        body.size = 0;
        body.error = None;
        body.cell.progress.reset();
        body.cell.state.store(EntryState::Loading as u8, Ordering::Release);
        let listed = body.links.is_some();
        if listed {
            inner.eviction.total_size -= old_size;
        }
    }

    /// Stores loading progress for `key`. The store itself is a relaxed
    /// atomic write; observers may poll it without the mutex.
    pub fn report_progress(&self, key: &Id, progress: f32) {
        let inner = self.shared.inner.lock();
        if let Some(body) = inner.records.get(key) {
            body.cell.progress.store(EncodedProgress::encode(progress));
        }
    }

    /// Evicts unused records, oldest first, until their total size is at
    /// most `max_bytes`. Live records are never touched.
    pub fn clear_unused(&self, max_bytes: usize) {
        let mut reclaimed = Vec::new();
        {
            let mut inner = self.shared.inner.lock();
            while inner.eviction.total_size > max_bytes {
                let Some(key) = inner.eviction.head.clone() else {
                    break;
                };
                inner.unlink(key.id());
                if let Some(body) = inner.records.remove(key.id()) {
                    reclaimed.push(body);
                }
            }
        }
        // Dropped after the mutex is released: a reclaimed job handle may
        // release other records and re-enter the cache.
        drop(reclaimed);
    }

    /// Evicts every unused record.
    pub fn clear_all_unused(&self) {
        self.clear_unused(0);
    }

    /// Applies the configured size cap to the unused set.
    pub fn sweep(&self) {
        self.clear_unused(self.shared.config.size_limit_bytes());
    }

    /// Total size of the records pending eviction.
    pub fn pending_eviction_size(&self) -> usize {
        self.shared.inner.lock().eviction.total_size
    }

    pub fn config(&self) -> &ImmutableCacheConfig {
        &self.shared.config
    }

    /// Snapshots every record for inspection.
    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = self.shared.inner.lock();
        let mut snapshot = CacheSnapshot::default();
        for (key, body) in &inner.records {
            if body.links.is_none() {
                snapshot.in_use.push(CacheEntrySnapshot {
                    key: key.to_string(),
                    is_ready: EntryState::from_u8(body.cell.state.load(Ordering::Acquire))
                        == EntryState::Ready,
                    size: body.size,
                });
            }
        }
        let mut cursor = inner.eviction.head.clone();
        while let Some(key) = cursor {
            let body = &inner.records[key.id()];
            snapshot.pending_eviction.push(CacheEntrySnapshot {
                key: key.to_string(),
                is_ready: EntryState::from_u8(body.cell.state.load(Ordering::Acquire))
                    == EntryState::Ready,
                size: body.size,
            });
            cursor = body.links.as_ref().and_then(|links| links.next.clone());
        }
        snapshot
    }
}

/// A reference-counted handle expressing interest in one record.
///
/// `state` and `progress` are lock-free advisory polls. Everything else
/// goes through the cache mutex and is authoritative.
pub struct Pointer {
    shared: Arc<CacheShared>,
    cell: Arc<RecordCell>,
}

impl Pointer {
    pub fn key(&self) -> &Id {
        self.cell.key.id()
    }

    /// Advisory state poll.
    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.cell.state.load(Ordering::Acquire))
    }

    /// Advisory progress poll.
    pub fn progress(&self) -> Option<f32> {
        self.cell.progress.load().decode()
    }

    /// The record's data, if it is `Ready`.
    pub fn data(&self) -> Option<Value> {
        let inner = self.shared.inner.lock();
        inner
            .records
            .get(self.key())
            .and_then(|body| body.data.clone())
    }

    /// The record's terminal error, if it is `Failed`.
    pub fn error(&self) -> Option<Error> {
        let inner = self.shared.inner.lock();
        inner
            .records
            .get(self.key())
            .and_then(|body| body.error.clone())
    }

    /// Registers a completion callback.
    ///
    /// While the record is `Loading` the callback is stored and invoked
    /// (outside the cache mutex) by the publish or fail transition. If the
    /// record has already completed, the callback is invoked here, on the
    /// calling thread, before this returns.
    pub fn add_waiter(&self, callback: impl FnOnce(Result<Value>) + Send + 'static) {
        let completed: Result<Value>;
        {
            let mut inner = self.shared.inner.lock();
            let Some(body) = inner.records.get_mut(self.key()) else {
                completed = Err(Error::internal(
                    "cache record missing while a pointer to it is live",
                ));
                drop(inner);
                callback(completed);
                return;
            };
            match EntryState::from_u8(body.cell.state.load(Ordering::Acquire)) {
                EntryState::Loading => {
                    body.waiters.push(Box::new(callback));
                    return;
                }
                EntryState::Ready => {
                    completed = match body.data.clone() {
                        Some(data) => Ok(data),
                        None => Err(Error::internal("ready record without data")),
                    };
                }
                EntryState::Failed => {
                    completed = Err(body
                        .error
                        .clone()
                        .unwrap_or_else(|| Error::internal("failed record without an error")));
                }
            }
        }
        callback(completed);
    }

    /// A reporter that writes straight to this record's progress atomic,
    /// with no locking at all.
    pub fn progress_reporter(&self) -> RecordProgressReporter {
        RecordProgressReporter {
            cell: self.cell.clone(),
        }
    }
}

impl Clone for Pointer {
    fn clone(&self) -> Self {
        let mut inner = self.shared.inner.lock();
        if let Some(body) = inner.records.get_mut(self.key()) {
            body.ref_count += 1;
        }
        drop(inner);
        Pointer {
            shared: self.shared.clone(),
            cell: self.cell.clone(),
        }
    }
}

impl Drop for Pointer {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        let newly_idle = {
            let Some(body) = inner.records.get_mut(self.key()) else {
                return;
            };
            body.ref_count -= 1;
            body.ref_count == 0
        };
        if newly_idle {
            let key = self.cell.key.clone();
            inner.push_tail(key);
        }
    }
}

/// Writes job progress into a record's atomic progress field.
pub struct RecordProgressReporter {
    cell: Arc<RecordCell>,
}

impl ProgressReporter for RecordProgressReporter {
    fn report(&self, progress: f32) {
        self.cell.progress.store(EncodedProgress::encode(progress));
    }
}
