//! DAG resolution for job `needs`.

use gitci_core::pipeline::Job;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in job dependencies at '{0}'")]
    CycleDetected(String),
}

/// A node in the job DAG.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub name: String,
    /// Position in declaration order.
    pub position: usize,
}

/// Directed acyclic graph of job dependencies. Edges point from a job to
/// the jobs that need it.
#[derive(Debug)]
pub struct JobDag {
    graph: DiGraph<DagNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl JobDag {
    /// Get the jobs with no dependencies inside the DAG.
    pub fn roots(&self) -> Vec<&DagNode> {
        let mut roots: Vec<&DagNode> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
                    == 0
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect();
        roots.sort_by_key(|n| n.position);
        roots
    }

    /// Get jobs that must complete before a given job can run.
    pub fn predecessors(&self, name: &str) -> Vec<&DagNode> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get jobs that need a given job.
    pub fn successors(&self, name: &str) -> Vec<&DagNode> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get topologically sorted jobs.
    pub fn topological_order(&self) -> Result<Vec<&DagNode>, DagError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .collect()
            })
            .map_err(|cycle| {
                let name = self
                    .graph
                    .node_weight(cycle.node_id())
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                DagError::CycleDetected(name)
            })
    }

    /// Group jobs into layers. Every job's dependencies sit in earlier
    /// layers; jobs within a layer keep declaration order.
    pub fn layers(&self) -> Vec<Vec<&DagNode>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        // Built acyclic, so the sort cannot fail.
        let order = toposort(&self.graph, None).unwrap_or_default();

        for idx in order {
            let level = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|p| depth.get(&p))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(idx, level);
        }

        let count = depth.values().max().map(|d| d + 1).unwrap_or(0);
        let mut layers: Vec<Vec<&DagNode>> = vec![Vec::new(); count];
        for (idx, level) in depth {
            if let Some(node) = self.graph.node_weight(idx) {
                layers[level].push(node);
            }
        }
        for layer in &mut layers {
            layer.sort_by_key(|n| n.position);
        }
        layers
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Builder for constructing job DAGs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a DAG over a selection of jobs.
    ///
    /// `needs` entries naming jobs outside the selection are treated as
    /// satisfied.
    pub fn build<'a>(&self, jobs: impl IntoIterator<Item = &'a Job>) -> Result<JobDag, DagError> {
        let jobs: Vec<&Job> = jobs.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        // Add all jobs as nodes
        for (position, job) in jobs.iter().enumerate() {
            let idx = graph.add_node(DagNode {
                name: job.name.clone(),
                position,
            });
            name_to_index.insert(job.name.clone(), idx);
        }

        // Add edges for dependencies
        for job in &jobs {
            let job_idx = name_to_index[&job.name];
            for need in &job.needs {
                if let Some(&dep_idx) = name_to_index.get(need) {
                    graph.update_edge(dep_idx, job_idx, ());
                }
            }
        }

        let dag = JobDag {
            graph,
            name_to_index,
        };

        // Verify no cycles
        dag.topological_order()?;

        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}
