//! Task graph of one pipeline run.
//!
//! ```text
//!                 ┌─> full_load ─────────┐
//! select_mode ────┤                      ├─> compute_features ─> downstream_consumer_hook
//!                 └─> incremental_sync ──┘
//! ```
//!
//! `select_mode` is a branch: it activates one loader and skips the other.
//! Joins are declarative predicates over the upstream node states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Nodes of the pipeline graph, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    SelectMode,
    FullLoad,
    IncrementalSync,
    ComputeFeatures,
    DownstreamConsumerHook,
}

impl NodeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::SelectMode => "select_mode",
            NodeId::FullLoad => "full_load",
            NodeId::IncrementalSync => "incremental_sync",
            NodeId::ComputeFeatures => "compute_features",
            NodeId::DownstreamConsumerHook => "downstream_consumer_hook",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Skipped),
            Self::Running => matches!(target, Self::Success | Self::Failed),
            Self::Success | Self::Failed | Self::Skipped => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a node may run, given its resolved upstream nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Every upstream node succeeded.
    AllSuccess,
    /// No upstream node failed and at least one succeeded; skipped
    /// branches do not block.
    NoneFailedMinOneSuccess,
}

impl JoinPolicy {
    pub fn admits(&self, upstream: &[NodeState]) -> bool {
        match self {
            JoinPolicy::AllSuccess => upstream.iter().all(|s| *s == NodeState::Success),
            JoinPolicy::NoneFailedMinOneSuccess => {
                !upstream.contains(&NodeState::Failed) && upstream.contains(&NodeState::Success)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node {node} cannot move from {from} to {to}")]
    InvalidTransition {
        node: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error("{chosen} is not a successor of branch {branch}")]
    NotASuccessor { branch: NodeId, chosen: NodeId },
}

#[derive(Debug, Clone)]
struct Node {
    id: NodeId,
    upstream: Vec<NodeId>,
    join: JoinPolicy,
    state: NodeState,
    error: Option<String>,
}

/// Finite-state task graph driven by a single coordinator.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Topological order.
    nodes: Vec<Node>,
}

impl TaskGraph {
    /// The ingestion pipeline graph.
    pub fn pipeline() -> Self {
        let node = |id: NodeId, upstream: &[NodeId], join: JoinPolicy| Node {
            id,
            upstream: upstream.to_vec(),
            join,
            state: NodeState::Pending,
            error: None,
        };
        Self {
            nodes: vec![
                node(NodeId::SelectMode, &[], JoinPolicy::AllSuccess),
                node(NodeId::FullLoad, &[NodeId::SelectMode], JoinPolicy::AllSuccess),
                node(NodeId::IncrementalSync, &[NodeId::SelectMode], JoinPolicy::AllSuccess),
                node(
                    NodeId::ComputeFeatures,
                    &[NodeId::FullLoad, NodeId::IncrementalSync],
                    JoinPolicy::NoneFailedMinOneSuccess,
                ),
                node(
                    NodeId::DownstreamConsumerHook,
                    &[NodeId::ComputeFeatures],
                    JoinPolicy::NoneFailedMinOneSuccess,
                ),
            ],
        }
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .map_or(NodeState::Pending, |n| n.state)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    fn transition(&mut self, id: NodeId, to: NodeState) -> Result<(), GraphError> {
        let from = self.state(id);
        match self.node_mut(id) {
            Some(node) if from.can_transition_to(to) => {
                node.state = to;
                Ok(())
            }
            _ => Err(GraphError::InvalidTransition { node: id, from, to }),
        }
    }

    /// Next node to dispatch.
    ///
    /// Pending nodes whose upstream is resolved but whose join predicate is
    /// false are marked skipped on the way.
    pub fn next_ready(&mut self) -> Option<NodeId> {
        for i in 0..self.nodes.len() {
            if self.nodes[i].state != NodeState::Pending {
                continue;
            }
            let upstream: Vec<NodeState> = self.nodes[i]
                .upstream
                .iter()
                .map(|id| self.state(*id))
                .collect();
            if !upstream.iter().all(NodeState::is_terminal) {
                continue;
            }
            if self.nodes[i].join.admits(&upstream) {
                return Some(self.nodes[i].id);
            }
            self.nodes[i].state = NodeState::Skipped;
        }
        None
    }

    pub fn start(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.transition(id, NodeState::Running)
    }

    pub fn succeed(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.transition(id, NodeState::Success)
    }

    pub fn fail(&mut self, id: NodeId, error: impl Into<String>) -> Result<(), GraphError> {
        self.transition(id, NodeState::Failed)?;
        if let Some(node) = self.node_mut(id) {
            node.error = Some(error.into());
        }
        Ok(())
    }

    /// Complete a branch node, activating `chosen` and skipping its other
    /// direct successors.
    pub fn branch(&mut self, id: NodeId, chosen: NodeId) -> Result<(), GraphError> {
        let successors: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.upstream.contains(&id))
            .map(|n| n.id)
            .collect();
        if !successors.contains(&chosen) {
            return Err(GraphError::NotASuccessor { branch: id, chosen });
        }

        self.succeed(id)?;
        for successor in successors.into_iter().filter(|s| *s != chosen) {
            self.transition(successor, NodeState::Skipped)?;
        }
        Ok(())
    }

    /// Skip every node that has not started; used on cancellation.
    pub fn skip_pending(&mut self) {
        for node in &mut self.nodes {
            if node.state == NodeState::Pending {
                node.state = NodeState::Skipped;
            }
        }
    }

    pub fn any_failed(&self) -> bool {
        self.nodes.iter().any(|n| n.state == NodeState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.nodes.iter().all(|n| n.state.is_terminal())
    }

    /// (node, state, error) in dispatch order.
    pub fn outcomes(&self) -> Vec<(NodeId, NodeState, Option<String>)> {
        self.nodes
            .iter()
            .map(|n| (n.id, n.state, n.error.clone()))
            .collect()
    }
}
