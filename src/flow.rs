//! Flow records as produced by the ingestion pipeline.
//!
//! The table only reads `uuid` and `statistics.last` for its own bookkeeping;
//! every other field is carried for consumers (queries, the conversation
//! graph, eviction listeners).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Handle to a resident flow.
///
/// The table owns the canonical handle; ingestion mutates the record in place
/// through the inner lock.  Always take the table lock before a flow's lock,
/// never the other way round.
pub type SharedFlow = Arc<RwLock<Flow>>;

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Protocol layer an endpoint pair is observed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEndpointType {
    Ethernet,
    Ipv4,
    Ipv6,
    TcpPort,
    UdpPort,
    SctpPort,
}

/// Traffic seen in one direction of a conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEndpointStatistics {
    /// Endpoint identifier (MAC, IP address, port number...).
    pub value: String,
    /// Cumulative bytes sent by this side.
    pub bytes: u64,
    /// Cumulative packets sent by this side.
    pub packets: u64,
}

impl FlowEndpointStatistics {
    pub fn new(value: impl Into<String>) -> Self {
        FlowEndpointStatistics {
            value: value.into(),
            bytes: 0,
            packets: 0,
        }
    }
}

/// Directed endpoint pair: `ab` is the side that opened the conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEndpointsStatistics {
    pub ab: FlowEndpointStatistics,
    pub ba: FlowEndpointStatistics,
}

impl FlowEndpointsStatistics {
    pub fn new(ab: FlowEndpointStatistics, ba: FlowEndpointStatistics) -> Self {
        FlowEndpointsStatistics { ab, ba }
    }

    /// Bytes exchanged in both directions.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.ab.bytes.saturating_add(self.ba.bytes)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Live counters of a flow.  Times are epoch seconds; `last >= start`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatistics {
    pub start: i64,
    pub last: i64,
    #[serde(default)]
    pub endpoints: BTreeMap<FlowEndpointType, FlowEndpointsStatistics>,
}

impl FlowStatistics {
    pub fn endpoint(&self, ty: FlowEndpointType) -> Option<&FlowEndpointsStatistics> {
        self.endpoints.get(&ty)
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// One observed conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    /// Stable identity, also the table key.
    pub uuid: String,
    /// Encapsulation path, e.g. `Ethernet/IPv4/TCP`.
    #[serde(default)]
    pub layers_path: String,
    #[serde(default)]
    pub statistics: FlowStatistics,
}

impl Flow {
    /// An empty flow for `uuid`, as created by `get_or_create`.
    pub fn new(uuid: impl Into<String>) -> Self {
        Flow {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    /// Builder-style: set the encapsulation path.
    pub fn with_layers_path(mut self, path: impl Into<String>) -> Self {
        self.layers_path = path.into();
        self
    }

    /// Builder-style: set first/last seen times.  `last` is clamped to `start`.
    pub fn with_times(mut self, start: i64, last: i64) -> Self {
        self.statistics.start = start;
        self.statistics.last = last.max(start);
        self
    }

    /// Builder-style: attach an endpoint pair.
    pub fn with_endpoints(mut self, ty: FlowEndpointType, eps: FlowEndpointsStatistics) -> Self {
        self.statistics.endpoints.insert(ty, eps);
        self
    }

    /// Records activity at `now`.  The first touch of an empty flow also sets
    /// `start`.
    pub fn touch(&mut self, now: i64) {
        let stats = &mut self.statistics;
        if stats.start == 0 && stats.last == 0 {
            stats.start = now;
        }
        stats.last = now.max(stats.start);
    }

    #[inline]
    pub fn last(&self) -> i64 {
        self.statistics.last
    }

    /// How long the flow has been active, in seconds.
    #[inline]
    pub fn duration(&self) -> i64 {
        self.statistics.last - self.statistics.start
    }

    /// Wraps the flow into a table handle.
    pub fn into_shared(self) -> SharedFlow {
        Arc::new(RwLock::new(self))
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}..{}",
            self.uuid, self.layers_path, self.statistics.start, self.statistics.last
        )
    }
}
