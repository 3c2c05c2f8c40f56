//! Node-link projection of ethernet-level conversations.
//!
//! Each distinct ethernet endpoint becomes a node; each flow becomes a link
//! weighted by the bytes exchanged in both directions.  The output follows
//! the usual force-directed graph layout input:
//!
//! ```json
//! {"nodes":[{"name":"aa","group":0}],"links":[{"source":0,"target":1,"value":30}]}
//! ```
//!
//! Flows are visited in key order, so indices and groups are stable across
//! runs for the same table contents.

use ahash::AHashMap;
use serde::Serialize;
use tracing::trace;

use crate::flow::{Flow, FlowEndpointType};
use crate::table::FlowTable;

const EMPTY_GRAPH: &str = r#"{"nodes":[],"links":[]}"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    /// Endpoint identifier (MAC address).
    pub name: String,
    /// Index of the layers path of the flow the endpoint was first seen in.
    pub group: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphLink {
    pub source: usize,
    pub target: usize,
    /// `AB.bytes + BA.bytes`.
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationGraph {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

impl ConversationGraph {
    /// Projects `flows` in iteration order.  Flows without an ethernet
    /// endpoint pair are skipped.
    pub fn from_flows<'a, I>(flows: I) -> Self
    where
        I: IntoIterator<Item = &'a Flow>,
    {
        let mut graph = ConversationGraph::default();
        let mut paths: AHashMap<&'a str, usize> = AHashMap::new();
        let mut endpoints: AHashMap<&'a str, usize> = AHashMap::new();

        for flow in flows {
            let Some(eth) = flow.statistics.endpoint(FlowEndpointType::Ethernet) else {
                trace!(key = %flow.uuid, "no ethernet endpoints, skipped");
                continue;
            };

            let next_path = paths.len();
            let group = *paths.entry(flow.layers_path.as_str()).or_insert(next_path);

            let mut index_of = |value: &'a str| -> usize {
                let next = endpoints.len();
                *endpoints.entry(value).or_insert_with(|| {
                    graph.nodes.push(GraphNode {
                        name: value.to_owned(),
                        group,
                    });
                    next
                })
            };
            let source = index_of(eth.ab.value.as_str());
            let target = index_of(eth.ba.value.as_str());

            graph.links.push(GraphLink {
                source,
                target,
                value: eth.total_bytes(),
            });
        }
        graph
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.links.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| EMPTY_GRAPH.to_owned())
    }
}

impl FlowTable {
    /// Projects every resident flow, in key order, under the shared lock.
    pub fn conversation_graph(&self) -> ConversationGraph {
        self.with_flows(|map| {
            let mut keyed: Vec<_> = map.iter().collect();
            keyed.sort_unstable_by(|a, b| a.0.cmp(b.0));
            let guards: Vec<_> = keyed.iter().map(|(_, flow)| flow.read()).collect();
            ConversationGraph::from_flows(guards.iter().map(|g| &**g))
        })
    }

    /// [`conversation_graph`](Self::conversation_graph) rendered as JSON.
    pub fn ethernet_conversation_json(&self) -> String {
        self.conversation_graph().to_json()
    }
}
