use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::types::{EdgeKind, EdgeView, WorkflowView};

/// A malformed graph aborts a run as an infrastructure fault; it is never
/// a normal node outcome.
#[derive(Debug, Error)]
pub enum GraphFault {
    #[error("workflow '{workflow}' has no start service")]
    MissingStart { workflow: String },
    #[error("workflow '{workflow}' start service {node} is not a member")]
    ForeignStart { workflow: String, node: u64 },
    #[error("edge '{edge}' endpoint {node} is outside workflow '{workflow}'")]
    ForeignEndpoint {
        workflow: String,
        edge: String,
        node: u64,
    },
}

/// Pure, side-effect-free graph queries over already-fetched objects:
/// the workflow's services as nodes, outcome-labelled edges between them.
pub struct WorkflowGraph {
    graph: DiGraph<u64, EdgeKind>,
    indices: HashMap<u64, NodeIndex>,
    start: u64,
}

impl WorkflowGraph {
    /// Build and validate: both endpoints of every edge must belong to the
    /// workflow's node set, and the start node must be a member.
    pub fn build(workflow: &WorkflowView, edges: &[EdgeView]) -> Result<Self, GraphFault> {
        let start = workflow.start_service.ok_or_else(|| GraphFault::MissingStart {
            workflow: workflow.name.clone(),
        })?;

        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for &service in &workflow.services {
            let index = graph.add_node(service);
            indices.insert(service, index);
        }

        if !indices.contains_key(&start) {
            return Err(GraphFault::ForeignStart {
                workflow: workflow.name.clone(),
                node: start,
            });
        }

        for edge in edges {
            if edge.workflow != workflow.id {
                continue;
            }
            for endpoint in [edge.source, edge.destination] {
                if !indices.contains_key(&endpoint) {
                    return Err(GraphFault::ForeignEndpoint {
                        workflow: workflow.name.clone(),
                        edge: edge.name.clone(),
                        node: endpoint,
                    });
                }
            }
            graph.add_edge(indices[&edge.source], indices[&edge.destination], edge.outcome);
        }

        Ok(Self {
            graph,
            indices,
            start,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, node: u64) -> bool {
        self.indices.contains_key(&node)
    }

    /// Successors over edges labelled exactly `outcome`.
    pub fn neighbors(&self, node: u64, outcome: EdgeKind) -> HashSet<u64> {
        let Some(&index) = self.indices.get(&node) else {
            return HashSet::new();
        };
        self.graph
            .edges(index)
            .filter(|edge| *edge.weight() == outcome)
            .map(|edge| self.graph[edge.target()])
            .collect()
    }

    /// Edge selection for a finished node: the outcome edges plus the
    /// `always` edges.
    pub fn successors(&self, node: u64, success: bool) -> HashSet<u64> {
        let outcome = if success {
            EdgeKind::Success
        } else {
            EdgeKind::Failure
        };
        let mut next = self.neighbors(node, outcome);
        next.extend(self.neighbors(node, EdgeKind::Always));
        next
    }

    /// A node with no outgoing edges at all; run classification keys off
    /// whether every executed terminal succeeded.
    pub fn is_terminal(&self, node: u64) -> bool {
        match self.indices.get(&node) {
            Some(&index) => self.graph.edges(index).next().is_none(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(services: &[u64], start: u64) -> WorkflowView {
        WorkflowView {
            id: 100,
            name: "provisioning".into(),
            services: services.to_vec(),
            start_service: Some(start),
        }
    }

    fn edge(id: u64, source: u64, destination: u64, outcome: EdgeKind) -> EdgeView {
        EdgeView {
            id,
            name: format!("{source} -> {destination}"),
            source,
            destination,
            workflow: 100,
            outcome,
        }
    }

    #[test]
    fn successors_take_outcome_and_always_edges() {
        let wf = workflow(&[1, 2, 3, 4], 1);
        let edges = vec![
            edge(10, 1, 2, EdgeKind::Success),
            edge(11, 1, 3, EdgeKind::Failure),
            edge(12, 1, 4, EdgeKind::Always),
        ];
        let graph = WorkflowGraph::build(&wf, &edges).unwrap();

        assert_eq!(graph.successors(1, true), HashSet::from([2, 4]));
        assert_eq!(graph.successors(1, false), HashSet::from([3, 4]));
        assert_eq!(graph.neighbors(1, EdgeKind::Success), HashSet::from([2]));
    }

    #[test]
    fn foreign_endpoint_is_a_fault() {
        let wf = workflow(&[1, 2], 1);
        let edges = vec![edge(10, 1, 99, EdgeKind::Success)];
        assert!(matches!(
            WorkflowGraph::build(&wf, &edges),
            Err(GraphFault::ForeignEndpoint { node: 99, .. })
        ));
    }

    #[test]
    fn missing_or_foreign_start_is_a_fault() {
        let mut wf = workflow(&[1, 2], 1);
        wf.start_service = None;
        assert!(matches!(
            WorkflowGraph::build(&wf, &[]),
            Err(GraphFault::MissingStart { .. })
        ));

        let wf = workflow(&[1, 2], 7);
        assert!(matches!(
            WorkflowGraph::build(&wf, &[]),
            Err(GraphFault::ForeignStart { node: 7, .. })
        ));
    }

    #[test]
    fn edges_of_other_workflows_are_ignored() {
        let wf = workflow(&[1, 2], 1);
        let mut foreign = edge(10, 1, 2, EdgeKind::Success);
        foreign.workflow = 999;
        let graph = WorkflowGraph::build(&wf, &[foreign]).unwrap();
        assert!(graph.successors(1, true).is_empty());
        assert!(graph.is_terminal(1));
    }

    #[test]
    fn terminal_nodes_have_no_outgoing_edges() {
        let wf = workflow(&[1, 2], 1);
        let edges = vec![edge(10, 1, 2, EdgeKind::Success)];
        let graph = WorkflowGraph::build(&wf, &edges).unwrap();
        assert!(!graph.is_terminal(1));
        assert!(graph.is_terminal(2));
    }
}
