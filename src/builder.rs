use std::sync::Arc;
use std::time::Duration;

use crate::config::FlowTableConfig;
use crate::error::FlowTableError;
use crate::expiry::ExpirationHandle;
use crate::listener::{EvictionListener, ExpiredFlow, FnListener};
use crate::table::FlowTable;

/// Builder for configuring and constructing a [`FlowTable`].
///
/// # Example
/// ```
/// use flowtable::FlowTableBuilder;
/// use std::time::Duration;
///
/// let table = FlowTableBuilder::new()
///     .expire_every(Duration::from_secs(60))
///     .max_batch(256)
///     .build();
/// assert_eq!(table.expire_every(), Duration::from_secs(60));
/// ```
pub struct FlowTableBuilder {
    initial_capacity: usize,
    expire_every: Duration,
    max_batch: usize,
    listener: Option<Arc<dyn EvictionListener>>,
}

impl Default for FlowTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTableBuilder {
    pub fn new() -> Self {
        Self::from_config_unchecked(&FlowTableConfig::default())
    }

    /// Starts from a deserialized configuration.
    pub fn from_config(config: &FlowTableConfig) -> Result<Self, FlowTableError> {
        config.validate()?;
        Ok(Self::from_config_unchecked(config))
    }

    fn from_config_unchecked(config: &FlowTableConfig) -> Self {
        FlowTableBuilder {
            initial_capacity: config.initial_capacity,
            expire_every: config.expire_every(),
            max_batch: config.max_batch,
            listener: None,
        }
    }

    /// Pre-allocate room for `n` flows (default: 4096).
    pub fn initial_capacity(mut self, n: usize) -> Self {
        self.initial_capacity = n;
        self
    }

    /// Sweep period; a flow idle for longer than `every` is evicted on the
    /// next sweep (default: 300 s).
    pub fn expire_every(mut self, every: Duration) -> Self {
        assert!(!every.is_zero(), "expire_every must be greater than 0");
        self.expire_every = every;
        self
    }

    /// Records applied per exclusive-lock acquisition in `update`.
    ///
    /// The default, `0`, applies each batch under one acquisition.  A
    /// non-zero limit lets readers in between chunks, at the cost of them
    /// seeing a partially applied batch.
    pub fn max_batch(mut self, n: usize) -> Self {
        self.max_batch = n;
        self
    }

    /// Register an eviction listener closure.
    ///
    /// The closure runs on the sweeping thread while the table is locked.
    /// Do **not** call this table's methods from within it; use the
    /// [`ExpiredFlow`] argument instead.  A stray `FlowTable::remove` is
    /// ignored and any other call panics inside the listener.
    pub fn eviction_listener<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ExpiredFlow<'_>) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(FnListener(f)));
        self
    }

    /// Register an eviction listener via the [`EvictionListener`] trait.
    pub fn eviction_listener_impl<L: EvictionListener>(mut self, l: L) -> Self {
        self.listener = Some(Arc::new(l));
        self
    }

    pub fn build(self) -> FlowTable {
        FlowTable::from_parts(
            self.initial_capacity,
            self.expire_every,
            self.max_batch,
            self.listener,
        )
    }

    /// Builds the table and starts its background sweeper.
    pub fn start(self) -> Result<(FlowTable, ExpirationHandle), FlowTableError> {
        let table = self.build();
        let handle = table.start_expiration()?;
        Ok((table, handle))
    }
}
