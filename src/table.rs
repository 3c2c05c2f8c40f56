use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::builder::FlowTableBuilder;
use crate::expiry::{ExpirationHandle, SweepReport};
use crate::flow::{Flow, SharedFlow};
use crate::listener::{EvictionListener, ExpiredFlow, FnListener};
use crate::metrics::stats::{StatsCounter, TableStats};
use crate::error::FlowTableError;

pub(crate) type FlowMap = AHashMap<String, SharedFlow>;

thread_local! {
    /// Address of the table whose sweep is running on this thread, 0 if none.
    static SWEEPING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as sweeping a table until dropped.
struct SweepMark {
    prev: usize,
}

impl SweepMark {
    fn enter(table: usize) -> Self {
        SweepMark {
            prev: SWEEPING.with(|s| s.replace(table)),
        }
    }
}

impl Drop for SweepMark {
    fn drop(&mut self) {
        SWEEPING.with(|s| s.set(self.prev));
    }
}

/// Converts a duration to whole epoch seconds, saturating.
#[inline]
pub(crate) fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Table interior
// ---------------------------------------------------------------------------

/// Shared interior of a [`FlowTable`].
pub(crate) struct Inner {
    /// The single readers-writer lock guarding every resident flow.
    pub(crate) flows: RwLock<FlowMap>,
    pub(crate) expire_every: Duration,
    /// Records applied per exclusive acquisition in `update`; 0 = unbounded.
    pub(crate) max_batch: usize,
    /// Listener used by `sweep` and `start_expiration`.  `None` if the user
    /// didn't register one.
    pub(crate) listener: Option<Arc<dyn EvictionListener>>,
    pub(crate) metrics: StatsCounter,
}

// ---------------------------------------------------------------------------
// Table handle
// ---------------------------------------------------------------------------

/// A concurrent, time-bounded cache of network flows keyed by flow UUID.
///
/// Writers (`update`, `get_or_create`, `remove`) and the expiration sweep
/// take the exclusive lock; readers (`contains`, `filter_last`, the
/// conversation graph) share it.
///
/// # Example
/// ```
/// use flowtable::{Flow, FlowTable};
///
/// let table = FlowTable::new();
/// table.update(vec![Flow::new("f1").with_times(90, 100)]);
/// assert!(table.contains("f1"));
/// assert_eq!(table.describe(), "1 flows");
///
/// let report = table.sweep(200);
/// assert_eq!(report.expired, 0); // default period is 300s
/// ```
pub struct FlowTable {
    inner: Arc<Inner>,
}

impl Clone for FlowTable {
    fn clone(&self) -> Self {
        FlowTable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        FlowTableBuilder::new().build()
    }
}

impl FlowTable {
    pub(crate) fn from_parts(
        initial_capacity: usize,
        expire_every: Duration,
        max_batch: usize,
        listener: Option<Arc<dyn EvictionListener>>,
    ) -> Self {
        FlowTable {
            inner: Arc::new(Inner {
                flows: RwLock::new(AHashMap::with_capacity(initial_capacity)),
                expire_every,
                max_batch,
                listener,
                metrics: StatsCounter::new(),
            }),
        }
    }

    /// An empty table with the default configuration and no listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a [`FlowTableBuilder`] for constructing a new table.
    pub fn builder() -> FlowTableBuilder {
        FlowTableBuilder::new()
    }

    /// A new default table pre-populated with `flows` (first write wins).
    pub fn from_flows<I>(flows: I) -> Self
    where
        I: IntoIterator<Item = Flow>,
    {
        let table = FlowTable::new();
        table.update(flows);
        table
    }

    /// The configured sweep period.
    pub fn expire_every(&self) -> Duration {
        self.inner.expire_every
    }

    #[inline]
    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// `true` while this thread runs an eviction listener of this table,
    /// i.e. while it already holds the exclusive lock.
    #[inline]
    fn in_own_sweep(&self) -> bool {
        SWEEPING.with(|s| s.get()) == self.id()
    }

    /// Taking the table lock again from inside a listener would deadlock.
    /// Panic instead; the sweep catches it and moves on.
    #[track_caller]
    fn forbid_reentry(&self, op: &str) {
        if self.in_own_sweep() {
            panic!("FlowTable::{op} called from an eviction listener of the same table; use ExpiredFlow instead");
        }
    }

    // -----------------------------------------------------------------------
    // Writers
    // -----------------------------------------------------------------------

    /// Admits `flows`, keyed by their UUID.
    ///
    /// A key that is already resident keeps its record; the inbound one is
    /// dropped.  If the resident record's own UUID disagrees with its key the
    /// entry is reported as a collision and left untouched.
    ///
    /// By default the exclusive lock is held for the whole batch; callers
    /// should bound batch size.  With a non-zero `max_batch` the lock is
    /// released between chunks of that many records.
    pub fn update<I>(&self, flows: I)
    where
        I: IntoIterator<Item = Flow>,
    {
        self.forbid_reentry("update");
        let limit = self.inner.max_batch;
        let mut flows = flows.into_iter().peekable();
        while flows.peek().is_some() {
            let mut map = self.inner.flows.write();
            let mut applied = 0usize;
            for flow in flows.by_ref() {
                self.admit(&mut map, flow);
                applied += 1;
                if limit != 0 && applied >= limit {
                    break;
                }
            }
        }
    }

    fn admit(&self, map: &mut FlowMap, flow: Flow) {
        if let Some(resident) = map.get(&flow.uuid) {
            let resident = resident.read();
            if resident.uuid != flow.uuid {
                error!(
                    key = %flow.uuid,
                    resident = %resident.uuid,
                    "flow table collision"
                );
                self.inner.metrics.record_collision();
            } else {
                trace!(key = %flow.uuid, "flow already resident, inbound record dropped");
                self.inner.metrics.record_duplicate();
            }
            return;
        }
        map.insert(flow.uuid.clone(), flow.into_shared());
        self.inner.metrics.record_insert();
    }

    /// Returns the flow for `key`, creating an empty one if absent.
    ///
    /// The boolean is `true` when this call created the flow.  Lookup and
    /// insertion happen under a single exclusive acquisition, so concurrent
    /// callers racing on a new key observe exactly one creation.
    pub fn get_or_create(&self, key: &str) -> (SharedFlow, bool) {
        self.get_or_create_with(key, &(), |key, _| Flow::new(key))
    }

    /// Like [`get_or_create`](Self::get_or_create), building the new flow
    /// with `factory` from the caller's packet context.
    ///
    /// `ctx` is only handed to `factory`.  The created flow's UUID is always
    /// set to `key`.  `factory` runs under the exclusive lock and must not
    /// touch the table.
    pub fn get_or_create_with<C, F>(&self, key: &str, ctx: &C, factory: F) -> (SharedFlow, bool)
    where
        C: ?Sized,
        F: FnOnce(&str, &C) -> Flow,
    {
        self.forbid_reentry("get_or_create");
        let mut map = self.inner.flows.write();
        if let Some(flow) = map.get(key) {
            return (Arc::clone(flow), false);
        }
        let mut flow = factory(key, ctx);
        flow.uuid = key.to_owned();
        let flow = flow.into_shared();
        map.insert(key.to_owned(), Arc::clone(&flow));
        self.inner.metrics.record_create();
        (flow, true)
    }

    /// Removes the flow for `key`.
    ///
    /// Removing an absent key is reported and otherwise ignored: it is the
    /// expected outcome of racing with a sweep.
    ///
    /// Must not be called from an eviction listener; use
    /// [`ExpiredFlow::remove`] or [`LockedFlows::remove`] there instead.
    /// Such a call is logged and ignored rather than deadlocking.
    pub fn remove(&self, key: &str) -> Option<SharedFlow> {
        if self.in_own_sweep() {
            error!(
                key = %key,
                "FlowTable::remove called from an eviction listener, ignored; use ExpiredFlow::remove"
            );
            return None;
        }
        let mut map = self.inner.flows.write();
        LockedFlows::new(&mut *map, &self.inner.metrics).remove(key)
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    /// Returns the handle for `key`, if resident.
    pub fn get(&self, key: &str) -> Option<SharedFlow> {
        self.forbid_reentry("get");
        self.inner.flows.read().get(key).cloned()
    }

    /// Returns `true` if a flow is resident under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.forbid_reentry("contains");
        self.inner.flows.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.forbid_reentry("len");
        self.inner.flows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.forbid_reentry("is_empty");
        self.inner.flows.read().is_empty()
    }

    /// Human-readable summary, e.g. `"12 flows"`.
    pub fn describe(&self) -> String {
        format!("{} flows", self.len())
    }

    /// Flows seen within the trailing `window`, relative to the wall clock.
    pub fn filter_last(&self, window: Duration) -> Vec<SharedFlow> {
        self.filter_last_at(window, Utc::now().timestamp())
    }

    /// Flows with `last >= now - window`.
    ///
    /// The returned vector is freshly allocated.  Its flows may be evicted
    /// right after the call returns.
    pub fn filter_last_at(&self, window: Duration, now: i64) -> Vec<SharedFlow> {
        self.forbid_reentry("filter_last");
        let selected = now.saturating_sub(secs(window));
        self.inner
            .flows
            .read()
            .values()
            .filter(|flow| flow.read().last() >= selected)
            .cloned()
            .collect()
    }

    /// Copies of every resident flow.
    pub fn snapshot(&self) -> Vec<Flow> {
        self.forbid_reentry("snapshot");
        self.inner
            .flows
            .read()
            .values()
            .map(|flow| flow.read().clone())
            .collect()
    }

    pub(crate) fn with_flows<R>(&self, f: impl FnOnce(&FlowMap) -> R) -> R {
        self.forbid_reentry("conversation_graph");
        f(&self.inner.flows.read())
    }

    pub fn stats(&self) -> TableStats {
        self.inner.metrics.snapshot()
    }

    // -----------------------------------------------------------------------
    // Expiration
    // -----------------------------------------------------------------------

    /// Runs one sweep at `now` with the configured period and listener.
    pub fn sweep(&self, now: i64) -> SweepReport {
        self.sweep_with(now, self.inner.expire_every, self.inner.listener.as_deref())
    }

    /// Evicts every flow with `last < now - every`, notifying `listener`
    /// before each removal.
    ///
    /// The exclusive lock is held for the whole scan.  A panicking listener
    /// is logged and the sweep moves on to the next flow.
    pub fn sweep_with(
        &self,
        now: i64,
        every: Duration,
        listener: Option<&dyn EvictionListener>,
    ) -> SweepReport {
        self.forbid_reentry("sweep");
        let threshold = now.saturating_sub(secs(every));
        let metrics = &self.inner.metrics;

        let mut map = self.inner.flows.write();
        let _mark = SweepMark::enter(self.id());
        let before = map.len();

        let stale: Vec<String> = map
            .iter()
            .filter(|(_, flow)| flow.read().last() < threshold)
            .map(|(key, _)| key.clone())
            .collect();

        let mut expired = 0usize;
        for key in &stale {
            // An earlier listener may already have removed this one.
            let Some(flow) = map.get(key).cloned() else { continue };
            {
                let f = flow.read();
                debug!(now, key = %key, duration = f.duration(), "expire flow");
            }

            if let Some(listener) = listener {
                let locked = LockedFlows::new(&mut *map, metrics);
                let mut notice = ExpiredFlow::new(key.as_str(), flow, now, locked);
                if catch_unwind(AssertUnwindSafe(|| listener.on_expire(&mut notice))).is_err() {
                    warn!(key = %key, "eviction listener panicked");
                    metrics.record_listener_panic();
                }
            }

            map.remove(key);
            expired += 1;
        }

        let after = map.len();
        drop(map);

        metrics.record_expired(expired as u64);
        metrics.record_sweep();
        debug!(now, removed = before - after, size = after, "expire flows");

        SweepReport {
            threshold,
            before,
            expired,
            after,
        }
    }

    /// Starts the background sweeper with the configured period and listener.
    pub fn start_expiration(&self) -> Result<ExpirationHandle, FlowTableError> {
        ExpirationHandle::spawn(self.clone(), self.inner.expire_every, self.inner.listener.clone())
    }

    /// Starts the background sweeper with an explicit period and listener
    /// closure, overriding the configured ones.
    pub fn start_expiration_with<F>(
        &self,
        every: Duration,
        f: F,
    ) -> Result<ExpirationHandle, FlowTableError>
    where
        F: Fn(&mut ExpiredFlow<'_>) + Send + Sync + 'static,
    {
        ExpirationHandle::spawn(self.clone(), every, Some(Arc::new(FnListener(f))))
    }
}

impl fmt::Display for FlowTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} flows", self.len())
    }
}

impl fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTable")
            .field("len", &self.len())
            .field("expire_every", &self.inner.expire_every)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LockedFlows
// ---------------------------------------------------------------------------

/// View of the flow map while the exclusive lock is already held.
///
/// Only handed out to eviction listeners during a sweep; nothing on it takes
/// the table lock.
pub struct LockedFlows<'a> {
    map: &'a mut FlowMap,
    metrics: &'a StatsCounter,
}

impl<'a> LockedFlows<'a> {
    pub(crate) fn new(map: &'a mut FlowMap, metrics: &'a StatsCounter) -> Self {
        LockedFlows { map, metrics }
    }

    /// Removes the flow for `key`, reporting a stale removal if absent.
    pub fn remove(&mut self, key: &str) -> Option<SharedFlow> {
        match self.map.remove(key) {
            Some(flow) => {
                debug!(key = %key, "flow table remove flow");
                self.metrics.record_remove();
                Some(flow)
            }
            None => {
                error!(key = %key, "flow table flow did not exist");
                self.metrics.record_stale_removal();
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&SharedFlow> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
