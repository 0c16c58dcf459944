//! Task graph.
//!
//! Every unit of work in a merge is a [`Task`]: it has a stable identity,
//! declares the tasks whose values it consumes, and produces exactly one
//! [`TaskValue`]. Tasks are collected in a [`TaskGraphBuilder`] and frozen into
//! a [`TaskGraph`], which rejects unknown dependencies and cycles up front.

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::{
    Device, GatheredTensors, LoaderCache, MergeError, Result, ShardManifest, ShardWriter, Tensor,
    TokenizerInfo,
};

/// Stable task identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    /// Identity made of a task kind and a key unique within that kind.
    pub fn new(kind: &str, key: impl fmt::Display) -> Self {
        Self(format!("{}:{}", kind, key))
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Task kind.
    pub fn kind(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(kind, _)| kind)
    }

    /// Key within the kind.
    pub fn key(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, key)| key)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a consumer receives a dependency's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPolicy {
    /// Ownership moves to the last consumer; earlier consumers get copies.
    #[default]
    Move,
    /// Always a copy. The producer's value is still dropped after its last consumer.
    Clone,
}

/// One declared input of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Producing task.
    pub task: TaskId,
    /// Ownership policy on this edge.
    pub policy: BufferPolicy,
}

impl Dependency {
    /// Consume by ownership transfer.
    pub fn moved(task: TaskId) -> Self {
        Self {
            task,
            policy: BufferPolicy::Move,
        }
    }

    /// Consume a copy and keep the original resident.
    pub fn cloned(task: TaskId) -> Self {
        Self {
            task,
            policy: BufferPolicy::Clone,
        }
    }
}

/// Which executor resource a task occupies while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// Merge arithmetic, bounded by the compute device.
    Compute,
    /// Loading, writing and bookkeeping.
    Storage,
}

/// The single value a task produces.
#[derive(Debug, Clone)]
pub enum TaskValue {
    /// A merged weight.
    Tensor(Tensor),
    /// Input weights for one output weight, in source order.
    Gathered(GatheredTensors),
    /// The shared shard writer.
    Writer(Arc<ShardWriter>),
    /// Built tokenizer, or `None` when neither building nor the donor fallback worked.
    Tokenizer(Option<Arc<TokenizerInfo>>),
    /// Manifest of the finished artifact.
    Artifact(ShardManifest),
    /// Completion signal.
    Done,
}

impl TaskValue {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Gathered(_) => "gathered tensors",
            Self::Writer(_) => "writer",
            Self::Tokenizer(_) => "tokenizer",
            Self::Artifact(_) => "artifact",
            Self::Done => "signal",
        }
    }

    /// Place any buffers on `device`.
    pub fn to_device(self, device: Device) -> Self {
        match self {
            Self::Tensor(t) => Self::Tensor(t.to_device(device)),
            Self::Gathered(g) => Self::Gathered(g.to_device(device)),
            other => other,
        }
    }
}

/// Values handed to a running task, keyed by producer.
#[derive(Debug)]
pub struct TaskInputs {
    task: TaskId,
    values: HashMap<TaskId, TaskValue>,
}

impl TaskInputs {
    /// Wrap the inputs of `task`.
    pub fn new(task: TaskId, values: HashMap<TaskId, TaskValue>) -> Self {
        Self { task, values }
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no inputs.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Take the value produced by `dependency`.
    pub fn take(&mut self, dependency: &TaskId) -> Result<TaskValue> {
        self.values
            .remove(dependency)
            .ok_or_else(|| MergeError::UnknownDependency {
                task: self.task.to_string(),
                dependency: dependency.to_string(),
            })
    }

    /// Take a tensor value.
    pub fn take_tensor(&mut self, dependency: &TaskId) -> Result<Tensor> {
        match self.take(dependency)? {
            TaskValue::Tensor(t) => Ok(t),
            _ => Err(self.unexpected(dependency, "tensor")),
        }
    }

    /// Take gathered inputs.
    pub fn take_gathered(&mut self, dependency: &TaskId) -> Result<GatheredTensors> {
        match self.take(dependency)? {
            TaskValue::Gathered(g) => Ok(g),
            _ => Err(self.unexpected(dependency, "gathered tensors")),
        }
    }

    /// Take the shard writer handle.
    pub fn take_writer(&mut self, dependency: &TaskId) -> Result<Arc<ShardWriter>> {
        match self.take(dependency)? {
            TaskValue::Writer(w) => Ok(w),
            _ => Err(self.unexpected(dependency, "writer")),
        }
    }

    /// Take the tokenizer result.
    pub fn take_tokenizer(&mut self, dependency: &TaskId) -> Result<Option<Arc<TokenizerInfo>>> {
        match self.take(dependency)? {
            TaskValue::Tokenizer(t) => Ok(t),
            _ => Err(self.unexpected(dependency, "tokenizer")),
        }
    }

    /// Place every buffer on `device`.
    pub fn to_device(self, device: Device) -> Self {
        Self {
            task: self.task,
            values: self
                .values
                .into_iter()
                .map(|(k, v)| (k, v.to_device(device)))
                .collect(),
        }
    }

    fn unexpected(&self, dependency: &TaskId, expected: &'static str) -> MergeError {
        MergeError::UnexpectedInput {
            task: self.task.to_string(),
            dependency: dependency.to_string(),
            expected,
        }
    }
}

/// Shared state available to every running task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Opened source models.
    pub loaders: Arc<LoaderCache>,
    /// Where merge arithmetic runs.
    pub compute_device: Device,
    /// Where values wait between tasks.
    pub storage_device: Device,
}

impl TaskContext {
    /// Context with both resources on the CPU.
    pub fn cpu(loaders: Arc<LoaderCache>) -> Self {
        Self {
            loaders,
            compute_device: Device::Cpu,
            storage_device: Device::Cpu,
        }
    }
}

/// A node of the merge plan.
pub trait Task: Send + Sync + fmt::Debug {
    /// Stable identity. Two tasks with the same identity are the same work.
    fn id(&self) -> &TaskId;

    /// Tasks whose values this task consumes.
    fn dependencies(&self) -> Vec<Dependency>;

    /// Resource occupied while running.
    fn resource(&self) -> ResourceClass {
        ResourceClass::Storage
    }

    /// Run the task.
    fn execute(&self, inputs: TaskInputs, ctx: &TaskContext) -> Result<TaskValue>;
}

/// Collects tasks in insertion order.
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    tasks: Vec<Arc<dyn Task>>,
    index: HashMap<TaskId, usize>,
    targets: Vec<TaskId>,
}

impl TaskGraphBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. A task whose identity is already present is not added twice.
    pub fn add(&mut self, task: Arc<dyn Task>) -> TaskId {
        let id = task.id().clone();
        if !self.index.contains_key(&id) {
            self.index.insert(id.clone(), self.tasks.len());
            self.tasks.push(task);
        }
        id
    }

    /// Add a task whose value is reported to the caller.
    pub fn add_target(&mut self, task: Arc<dyn Task>) -> TaskId {
        let id = self.add(task);
        self.mark_target(id.clone());
        id
    }

    /// Report an already added task's value to the caller.
    pub fn mark_target(&mut self, id: TaskId) {
        if !self.targets.contains(&id) {
            self.targets.push(id);
        }
    }

    /// Whether a task with this identity exists.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Number of distinct tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task was added.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolve dependencies and verify the graph is acyclic.
    pub fn build(self) -> Result<TaskGraph> {
        let mut graph: StableDiGraph<Arc<dyn Task>, BufferPolicy> = StableDiGraph::new();
        let mut nodes = HashMap::with_capacity(self.tasks.len());
        let mut order = Vec::with_capacity(self.tasks.len());

        for task in &self.tasks {
            let idx = graph.add_node(Arc::clone(task));
            nodes.insert(task.id().clone(), idx);
            order.push(idx);
        }

        for task in &self.tasks {
            let consumer = nodes[task.id()];
            let mut seen = HashSet::new();
            for dep in task.dependencies() {
                if !seen.insert(dep.task.clone()) {
                    continue;
                }
                let producer =
                    *nodes
                        .get(&dep.task)
                        .ok_or_else(|| MergeError::UnknownDependency {
                            task: task.id().to_string(),
                            dependency: dep.task.to_string(),
                        })?;
                graph.add_edge(producer, consumer, dep.policy);
            }
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            let task = graph[cycle.node_id()].id().to_string();
            return Err(MergeError::CycleDetected(task));
        }

        for target in &self.targets {
            if !nodes.contains_key(target) {
                return Err(MergeError::UnknownDependency {
                    task: "<targets>".to_string(),
                    dependency: target.to_string(),
                });
            }
        }

        Ok(TaskGraph {
            graph,
            nodes,
            order,
            targets: self.targets.into_iter().collect(),
        })
    }
}

/// An acyclic, immutable set of tasks.
pub struct TaskGraph {
    pub(crate) graph: StableDiGraph<Arc<dyn Task>, BufferPolicy>,
    pub(crate) nodes: HashMap<TaskId, NodeIndex>,
    pub(crate) order: Vec<NodeIndex>,
    pub(crate) targets: HashSet<TaskId>,
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.order.len())
            .field("edges", &self.graph.edge_count())
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl TaskGraph {
    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Look up a task.
    pub fn task(&self, id: &TaskId) -> Option<&Arc<dyn Task>> {
        self.nodes.get(id).map(|&idx| &self.graph[idx])
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<dyn Task>> + '_ {
        self.order.iter().map(move |&idx| &self.graph[idx])
    }

    /// Whether the task's value is reported to the caller.
    pub fn is_target(&self, id: &TaskId) -> bool {
        self.targets.contains(id)
    }

    /// Number of reported tasks.
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Identities of the tasks consuming `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&idx) = self.nodes.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].id().clone())
            .collect()
    }

    /// A dependency-respecting order.
    pub fn topological_order(&self) -> Vec<TaskId> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n].id().clone()).collect())
            .unwrap_or_default()
    }
}
