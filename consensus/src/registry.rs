//! Election node registry
//!
//! Tracks the confirming nodes of each election, their liveness and
//! health metrics. Heartbeat updates are independent of any vote and run
//! fully in parallel.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use ballot_core::types::{ElectionId, NodeId};
use ballot_core::{BallotError, BallotResult, ElectionNode, NodeStatus};

/// Read-only node view for the dashboard query interface.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub node_id: NodeId,
    pub address: String,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub avg_response_ms: f64,
    pub uptime_percentage: f64,
}

pub struct NodeRegistry {
    nodes: DashMap<NodeId, ElectionNode>,
    /// Expected heartbeat cadence; beats inside it count as on-time for
    /// the uptime window.
    expected_interval: Duration,
}

impl NodeRegistry {
    pub fn new(expected_interval: Duration) -> Self {
        NodeRegistry {
            nodes: DashMap::new(),
            expected_interval,
        }
    }

    /// Seed the node set for a new election. Addresses are assigned
    /// sequentially; real deployments would register actual endpoints.
    pub fn register_for_election(
        &self,
        election_id: &str,
        replication_factor: usize,
    ) -> Vec<ElectionNode> {
        let mut seeded = Vec::with_capacity(replication_factor);
        for i in 0..replication_factor {
            let address = format!("192.168.1.{}:{}", 100 + i, 8000 + i);
            let node = ElectionNode::new(election_id.to_string(), address);
            self.nodes.insert(node.id.clone(), node.clone());
            seeded.push(node);
        }
        log::info!(
            "seeded {} nodes for election {}",
            replication_factor,
            election_id
        );
        seeded
    }

    /// Register an externally managed node.
    pub fn add_node(&self, node: ElectionNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn get(&self, node_id: &str) -> Option<ElectionNode> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    /// Record a heartbeat: the node becomes active and its rolling
    /// response-time average and uptime window are updated.
    pub fn record_heartbeat(&self, node_id: &str, response_ms: f64) -> BallotResult<()> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| BallotError::NodeNotFound(node_id.to_string()))?;

        let on_time = match node.last_heartbeat {
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(last);
                elapsed.num_milliseconds() <= self.expected_interval.as_millis() as i64
            }
            // First heartbeat has no cadence to miss
            None => true,
        };
        node.record_heartbeat(response_ms, on_time);
        Ok(())
    }

    /// Up to `count` active nodes for the election, best responders
    /// first: response time ascending, then most recent heartbeat, then
    /// lowest id for determinism. Returns fewer when fewer are active;
    /// the caller decides whether that is fatal.
    pub fn select_active_nodes(&self, election_id: &str, count: usize) -> Vec<ElectionNode> {
        let mut active: Vec<ElectionNode> = self
            .nodes
            .iter()
            .filter(|n| n.election_id == election_id && n.is_active())
            .map(|n| n.clone())
            .collect();

        active.sort_by(|a, b| {
            a.avg_response_ms
                .partial_cmp(&b.avg_response_ms)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
                .then_with(|| a.id.cmp(&b.id))
        });

        active.truncate(count);
        active
    }

    /// Mark nodes silent for longer than `timeout` as unreachable.
    /// Returns the ids that transitioned.
    pub fn sweep_unreachable(&self, timeout: Duration) -> Vec<NodeId> {
        let now = Utc::now();
        let mut transitioned = Vec::new();

        for mut node in self.nodes.iter_mut() {
            if node.status != NodeStatus::Active {
                continue;
            }
            let reference = node.last_heartbeat.unwrap_or(node.registered_at);
            let silent_ms = now.signed_duration_since(reference).num_milliseconds();
            if silent_ms > timeout.as_millis() as i64 {
                node.mark_unreachable();
                transitioned.push(node.id.clone());
            }
        }

        if !transitioned.is_empty() {
            log::warn!("marked {} nodes unreachable: {:?}", transitioned.len(), transitioned);
        }
        transitioned
    }

    pub fn deactivate(&self, node_id: &str) -> BallotResult<()> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| BallotError::NodeNotFound(node_id.to_string()))?;
        node.deactivate();
        Ok(())
    }

    pub fn node_statuses(&self, election_id: &str) -> Vec<NodeSummary> {
        let mut summaries: Vec<NodeSummary> = self
            .nodes
            .iter()
            .filter(|n| n.election_id == election_id)
            .map(|n| NodeSummary {
                node_id: n.id.clone(),
                address: n.address.clone(),
                status: n.status,
                last_heartbeat: n.last_heartbeat,
                avg_response_ms: n.avg_response_ms,
                uptime_percentage: n.uptime_percentage(),
            })
            .collect();
        summaries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        summaries
    }

    pub fn active_count(&self, election_id: &str) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.election_id == election_id && n.is_active())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Duration::from_secs(30))
    }

    #[test]
    fn test_seed_nodes_for_election() {
        let registry = registry();
        let nodes = registry.register_for_election("election1", 3);

        assert_eq!(nodes.len(), 3);
        assert_eq!(registry.active_count("election1"), 3);
        assert_eq!(nodes[0].address, "192.168.1.100:8000");
        assert_eq!(nodes[2].address, "192.168.1.102:8002");
    }

    #[test]
    fn test_selection_ordered_by_response_time() {
        let registry = registry();
        let nodes = registry.register_for_election("election1", 3);

        registry.record_heartbeat(&nodes[0].id, 300.0).unwrap();
        registry.record_heartbeat(&nodes[1].id, 50.0).unwrap();
        registry.record_heartbeat(&nodes[2].id, 120.0).unwrap();

        let selected = registry.select_active_nodes("election1", 3);
        assert_eq!(selected[0].id, nodes[1].id);
        assert_eq!(selected[1].id, nodes[2].id);
        assert_eq!(selected[2].id, nodes[0].id);
    }

    #[test]
    fn test_selection_returns_fewer_when_short() {
        let registry = registry();
        let nodes = registry.register_for_election("election1", 5);
        registry.record_heartbeat(&nodes[0].id, 80.0).unwrap();
        registry.record_heartbeat(&nodes[1].id, 40.0).unwrap();

        registry.deactivate(&nodes[2].id).unwrap();
        registry.deactivate(&nodes[3].id).unwrap();
        registry.deactivate(&nodes[4].id).unwrap();

        let selected = registry.select_active_nodes("election1", 3);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].id, nodes[1].id);
        assert_eq!(selected[1].id, nodes[0].id);
    }

    #[test]
    fn test_selection_tie_breaks_on_lowest_id() {
        let registry = registry();
        let nodes = registry.register_for_election("election1", 3);
        // No heartbeats recorded: identical response times and timestamps
        let selected = registry.select_active_nodes("election1", 3);

        let mut ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        ids.sort();
        let selected_ids: Vec<NodeId> = selected.iter().map(|n| n.id.clone()).collect();
        assert_eq!(selected_ids, ids);
    }

    #[test]
    fn test_selection_scoped_to_election() {
        let registry = registry();
        registry.register_for_election("election1", 2);
        registry.register_for_election("election2", 3);

        assert_eq!(registry.select_active_nodes("election1", 10).len(), 2);
        assert_eq!(registry.select_active_nodes("election2", 10).len(), 3);
    }

    #[test]
    fn test_sweep_marks_silent_nodes_unreachable() {
        let registry = registry();
        let nodes = registry.register_for_election("election1", 2);

        // nodes[0] beats right before the sweep; nodes[1] never does and
        // its silence is measured from registration.
        std::thread::sleep(std::time::Duration::from_millis(100));
        registry.record_heartbeat(&nodes[0].id, 50.0).unwrap();
        let swept = registry.sweep_unreachable(Duration::from_millis(50));

        assert_eq!(swept, vec![nodes[1].id.clone()]);
        assert_eq!(
            registry.get(&nodes[1].id).unwrap().status,
            NodeStatus::Unreachable
        );
        // Unreachable nodes are no longer selectable
        assert!(registry
            .select_active_nodes("election1", 5)
            .iter()
            .all(|n| n.id != nodes[1].id));
    }

    #[test]
    fn test_heartbeat_revives_unreachable_node() {
        let registry = registry();
        let nodes = registry.register_for_election("election1", 1);

        std::thread::sleep(std::time::Duration::from_millis(50));
        registry.sweep_unreachable(Duration::from_millis(10));
        assert_eq!(registry.active_count("election1"), 0);

        registry.record_heartbeat(&nodes[0].id, 60.0).unwrap();
        assert_eq!(registry.active_count("election1"), 1);
    }

    #[test]
    fn test_unknown_node_heartbeat() {
        let registry = registry();
        let err = registry.record_heartbeat("missing", 10.0).unwrap_err();
        assert!(matches!(err, BallotError::NodeNotFound(_)));
    }
}
