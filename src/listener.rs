//! Eviction listener, invoked once per flow evicted by a sweep.
//!
//! The listener runs while the sweep holds the table's exclusive lock, so it
//! must not call any [`FlowTable`](crate::FlowTable) method (that would
//! deadlock).  Everything it may do to the table goes through the
//! [`ExpiredFlow`] it is handed, whose [`LockedFlows`] view removes entries
//! without locking again.
//!
//! # Example
//! ```
//! use flowtable::{Flow, FlowTable};
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
//! let log2 = Arc::clone(&log);
//!
//! let table = FlowTable::builder()
//!     .expire_every(Duration::from_secs(60))
//!     .eviction_listener(move |expired| {
//!         log2.lock().unwrap().push(expired.key().to_string());
//!         expired.remove(); // safe: already-locked removal path
//!     })
//!     .build();
//!
//! table.update(vec![Flow::new("f1").with_times(90, 100)]);
//! table.sweep(200);
//! assert_eq!(*log.lock().unwrap(), vec!["f1".to_string()]);
//! assert!(table.is_empty());
//! ```

use crate::flow::SharedFlow;
use crate::table::LockedFlows;

// ---------------------------------------------------------------------------
// ExpiredFlow
// ---------------------------------------------------------------------------

/// The single argument passed to an [`EvictionListener`].
pub struct ExpiredFlow<'a> {
    key: &'a str,
    flow: SharedFlow,
    now: i64,
    flows: LockedFlows<'a>,
}

impl<'a> ExpiredFlow<'a> {
    pub(crate) fn new(key: &'a str, flow: SharedFlow, now: i64, flows: LockedFlows<'a>) -> Self {
        ExpiredFlow {
            key,
            flow,
            now,
            flows,
        }
    }

    /// Key the flow is stored under.
    pub fn key(&self) -> &str {
        self.key
    }

    /// The evicted flow.  Read it with `flow().read()`.
    pub fn flow(&self) -> &SharedFlow {
        &self.flow
    }

    /// Wall time of the sweep, in epoch seconds.
    pub fn now(&self) -> i64 {
        self.now
    }

    /// The already-locked flow map.
    pub fn flows(&mut self) -> &mut LockedFlows<'a> {
        &mut self.flows
    }

    /// Removes this flow now instead of after the listener returns.
    pub fn remove(&mut self) -> Option<SharedFlow> {
        let key = self.key;
        self.flows.remove(key)
    }
}

// ---------------------------------------------------------------------------
// EvictionListener trait
// ---------------------------------------------------------------------------

/// A callback invoked for each flow a sweep evicts, before it is removed.
///
/// Implementations must be `Send + Sync + 'static` so the listener can be
/// moved onto the expiration thread.  A panic inside `on_expire` is caught
/// and logged; the sweep continues with the next flow.
pub trait EvictionListener: Send + Sync + 'static {
    fn on_expire(&self, expired: &mut ExpiredFlow<'_>);
}

/// An [`EvictionListener`] backed by a closure.
///
/// Created via [`FlowTableBuilder::eviction_listener`](crate::FlowTableBuilder::eviction_listener).
pub struct FnListener<F>(pub F);

impl<F> EvictionListener for FnListener<F>
where
    F: Fn(&mut ExpiredFlow<'_>) + Send + Sync + 'static,
{
    fn on_expire(&self, expired: &mut ExpiredFlow<'_>) {
        (self.0)(expired)
    }
}
