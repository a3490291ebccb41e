use crate::error::{EngineError, EngineResult};
use crate::types::{StepId, Workflow, WorkflowId};
use crate::workflow::inputs;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Compile a workflow definition into an execution plan
pub fn compile(workflow: &Workflow) -> EngineResult<ExecutionPlan> {
    ExecutionPlan::compile(workflow)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Validated DAG of a workflow plus its stable topological order.
///
/// Nodes are added in declaration order, so a node's index doubles as its declaration rank.
/// Edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    workflow_id: WorkflowId,
    version: u32,
    entry: StepId,
    graph: DiGraph<StepId, ()>,
    step_indices: HashMap<StepId, NodeIndex>,
    order: Vec<StepId>,
}

impl ExecutionPlan {
    /// Validate a workflow and compute its execution order
    pub fn compile(workflow: &Workflow) -> EngineResult<Self> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in &workflow.steps {
            if step_indices.contains_key(&step.id) {
                return Err(EngineError::DuplicateStep {
                    workflow: workflow.id.clone(),
                    step: step.id.clone(),
                });
            }
            let node = graph.add_node(step.id.clone());
            step_indices.insert(step.id.clone(), node);
        }

        if !step_indices.contains_key(&workflow.entry) {
            return Err(EngineError::UnreachableEntry {
                workflow: workflow.id.clone(),
                entry: workflow.entry.clone(),
            });
        }

        for step in &workflow.steps {
            let step_idx = step_indices[&step.id];
            for dep_id in &step.depends_on {
                let dep_idx =
                    step_indices
                        .get(dep_id)
                        .ok_or_else(|| EngineError::UnresolvedDependency {
                            step: step.id.clone(),
                            dependency: dep_id.clone(),
                        })?;
                graph.add_edge(*dep_idx, step_idx, ());
            }
        }

        let mut plan = Self {
            workflow_id: workflow.id.clone(),
            version: workflow.version,
            entry: workflow.entry.clone(),
            graph,
            step_indices,
            order: Vec::new(),
        };

        if let Some(cycle) = plan.find_cycle() {
            return Err(EngineError::CyclicDependency { cycle });
        }

        for step in &workflow.steps {
            inputs::validate_references(step)?;
        }

        plan.order = plan.stable_order();

        tracing::debug!(
            "Compiled workflow {} v{} into {} steps",
            plan.workflow_id,
            plan.version,
            plan.order.len()
        );

        Ok(plan)
    }

    /// Three-color depth-first search along dependency edges.
    ///
    /// Returns the cycle as a path of step ids that starts and ends on the same step.
    fn find_cycle(&self) -> Option<Vec<StepId>> {
        let mut marks = vec![Mark::White; self.graph.node_count()];

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::White {
                continue;
            }

            marks[start.index()] = Mark::Gray;
            let mut path = vec![start];
            let mut frontier = vec![self.dependency_nodes(start)];

            while let Some(pending) = frontier.last_mut() {
                match pending.pop() {
                    Some(dep) => match marks[dep.index()] {
                        Mark::White => {
                            marks[dep.index()] = Mark::Gray;
                            path.push(dep);
                            frontier.push(self.dependency_nodes(dep));
                        }
                        Mark::Gray => {
                            let from = path.iter().position(|n| *n == dep).unwrap_or(0);
                            let mut cycle: Vec<StepId> =
                                path[from..].iter().map(|n| self.graph[*n].clone()).collect();
                            cycle.push(self.graph[dep].clone());
                            return Some(cycle);
                        }
                        Mark::Black => {}
                    },
                    None => {
                        frontier.pop();
                        if let Some(done) = path.pop() {
                            marks[done.index()] = Mark::Black;
                        }
                    }
                }
            }
        }

        None
    }

    /// Dependencies of a node, highest declaration rank first so `pop` visits in declaration order
    fn dependency_nodes(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        deps.sort_by(|a, b| b.cmp(a));
        deps
    }

    /// Kahn's algorithm picking the earliest-declared ready step first
    fn stable_order(&self) -> Vec<StepId> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(self.graph[node].clone());
            for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[dependent.index()] -= 1;
                if in_degree[dependent.index()] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        order
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entry(&self) -> &StepId {
        &self.entry
    }

    /// Step ids in execution order (dependencies first)
    pub fn order(&self) -> &[StepId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of a step in the execution order
    pub fn position(&self, step_id: &StepId) -> Option<usize> {
        self.order.iter().position(|s| s == step_id)
    }

    fn node(&self, step_id: &StepId) -> EngineResult<NodeIndex> {
        self.step_indices
            .get(step_id)
            .copied()
            .ok_or_else(|| EngineError::NotFound {
                entity: "step",
                id: step_id.to_string(),
            })
    }

    /// Direct dependencies of a step
    pub fn dependencies(&self, step_id: &StepId) -> EngineResult<Vec<StepId>> {
        let node = self.node(step_id)?;
        let mut deps: Vec<NodeIndex> = self.dependency_nodes(node);
        deps.reverse();
        Ok(deps.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// Steps that depend directly on the given step
    pub fn dependents(&self, step_id: &StepId) -> EngineResult<Vec<StepId>> {
        let node = self.node(step_id)?;
        let mut dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        dependents.sort();
        Ok(dependents.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// Every step reachable from the given step along dependent edges, excluding the step itself
    pub fn transitive_dependents(&self, step_id: &StepId) -> EngineResult<Vec<StepId>> {
        let node = self.node(step_id)?;
        let mut bfs = Bfs::new(&self.graph, node);
        let mut reached = Vec::new();
        while let Some(n) = bfs.next(&self.graph) {
            if n != node {
                reached.push(n);
            }
        }
        reached.sort();
        Ok(reached.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// Steps with no dependencies, in declaration order
    pub fn root_steps(&self) -> Vec<StepId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }
}
