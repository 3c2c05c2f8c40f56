//! Configuration for a flow table and its expiration engine.
//!
//! # Example
//!
//! ```
//! use flowtable::FlowTableConfig;
//! use std::time::Duration;
//!
//! let config = FlowTableConfig::default();
//! assert_eq!(config.expire_every(), Duration::from_secs(300));
//!
//! let config: FlowTableConfig = serde_json::from_str(r#"{"expire_every_secs": 30}"#).unwrap();
//! assert_eq!(config.max_batch, 0);
//! config.validate().unwrap();
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::FlowTableError;

/// Tunables for [`FlowTable`](crate::FlowTable).
///
/// All fields have defaults, so an empty document deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FlowTableConfig {
    /// Sweep period in seconds.  A flow idle for longer than one period is
    /// evicted on the next sweep (default: 300).
    #[serde(default = "default_expire_every_secs")]
    pub expire_every_secs: u64,

    /// Pre-allocated map capacity (default: 4096).
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,

    /// Records applied per exclusive-lock acquisition in `update`.
    /// `0` applies the whole batch under one acquisition, so readers never
    /// observe a partially applied batch (default: 0).
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

fn default_expire_every_secs() -> u64 {
    300
}

fn default_initial_capacity() -> usize {
    4096
}

fn default_max_batch() -> usize {
    0
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            expire_every_secs: default_expire_every_secs(),
            initial_capacity: default_initial_capacity(),
            max_batch: default_max_batch(),
        }
    }
}

impl FlowTableConfig {
    /// The sweep period as a [`Duration`].
    pub fn expire_every(&self) -> Duration {
        Duration::from_secs(self.expire_every_secs)
    }

    pub fn validate(&self) -> Result<(), FlowTableError> {
        if self.expire_every_secs == 0 {
            return Err(FlowTableError::InvalidConfig(
                "expire_every_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
