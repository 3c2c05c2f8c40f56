use thiserror::Error;

/// Errors surfaced by the few fallible entry points of the crate.
///
/// Table operations themselves never fail: collisions and stale removals are
/// reported through `tracing` and [`TableStats`](crate::TableStats).
#[derive(Debug, Error)]
pub enum FlowTableError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn expiration thread: {0}")]
    Spawn(#[from] std::io::Error),
}
