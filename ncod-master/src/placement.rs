use crate::models::NodeStatus;
use crate::registry::NodeRegistry;
use ncod_protocol::{LoadReport, NodeId};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub node_id: NodeId,
    pub hostname: String,
    pub address: String,
    /// Mean of cpu, memory and disk percent
    pub score: f32,
    pub load: LoadReport,
}

/// Online nodes with a load sample, least loaded first
pub fn rank_nodes(registry: &NodeRegistry) -> Vec<Placement> {
    let mut ranked: Vec<Placement> = registry
        .nodes()
        .into_iter()
        .filter(|record| record.node.status == NodeStatus::Online)
        .filter_map(|record| {
            let load = record.load?;
            Some(Placement {
                node_id: record.node.node_id,
                hostname: record.node.hostname,
                address: record.node.address,
                score: load.score(),
                load,
            })
        })
        .collect();

    ranked.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.node_id.cmp(&b.node_id)));
    ranked
}

pub fn least_loaded(registry: &NodeRegistry) -> Option<Placement> {
    rank_nodes(registry).into_iter().next()
}
