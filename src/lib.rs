//! A live, time-bounded cache of network flow records.
//!
//! [`FlowTable`] holds every resident flow behind a single readers-writer
//! lock.  Ingestion admits decoded flows with [`FlowTable::update`] or
//! [`FlowTable::get_or_create`]; a background sweeper started with
//! [`FlowTable::start_expiration`] evicts flows idle for longer than one
//! period and notifies an [`EvictionListener`] before each removal; readers
//! take point-in-time views with [`FlowTable::filter_last`] and
//! [`FlowTable::conversation_graph`].

mod builder;
mod config;
mod error;
mod graph;
mod metrics;
mod table;
pub mod expiry;
pub mod flow;
pub mod listener;

pub use builder::FlowTableBuilder;
pub use config::FlowTableConfig;
pub use error::FlowTableError;
pub use expiry::{ExpirationHandle, SweepReport};
pub use flow::{Flow, FlowEndpointStatistics, FlowEndpointType, FlowEndpointsStatistics, FlowStatistics, SharedFlow};
pub use graph::{ConversationGraph, GraphLink, GraphNode};
pub use listener::{EvictionListener, ExpiredFlow, FnListener};
pub use metrics::stats::TableStats;
pub use table::{FlowTable, LockedFlows};
