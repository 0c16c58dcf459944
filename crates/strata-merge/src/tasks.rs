//! Concrete merge tasks.
//!
//! A typical output weight is produced by four tasks: a gather that loads
//! the input weights, a merge that combines them, a save that hands the
//! result to the shard writer, and the shared writer itself. One finalize
//! task waits for every save.

use safetensors::Dtype;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::graph::{Dependency, ResourceClass, Task, TaskContext, TaskId, TaskInputs, TaskValue};
use crate::methods::{MergeContext, MergeMethod};
use crate::tokenizer::PermutedEmbeddingTask;
use crate::{
    dtype_name, Device, MergeError, ModelReference, ParameterBag, ParameterDef, ParameterValue,
    Result, ShardWriter, Tensor,
};

/// One loaded input weight.
#[derive(Debug, Clone, PartialEq)]
pub struct GatheredTensor {
    /// Source model.
    pub model: ModelReference,
    /// Name in the source model.
    pub name: String,
    /// Weight data.
    pub tensor: Tensor,
}

/// Input weights for one output weight, in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatheredTensors {
    /// Entries in source order. Duplicated models keep separate entries.
    pub entries: Vec<GatheredTensor>,
}

impl GatheredTensors {
    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was gathered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Place every weight on `device`.
    pub fn to_device(self, device: Device) -> Self {
        Self {
            entries: self
                .entries
                .into_iter()
                .map(|e| GatheredTensor {
                    tensor: e.tensor.to_device(device),
                    ..e
                })
                .collect(),
        }
    }
}

/// Loads the input weights of one output weight.
#[derive(Debug)]
pub struct GatherTensors {
    id: TaskId,
    sources: Vec<(ModelReference, String)>,
    dtype: Option<Dtype>,
}

impl GatherTensors {
    /// Gather `sources`, casting each weight to `dtype` when given.
    pub fn new(sources: Vec<(ModelReference, String)>, dtype: Option<Dtype>) -> Self {
        let key = sources
            .iter()
            .map(|(m, n)| format!("{}={}", m, n))
            .collect::<Vec<_>>()
            .join("|");
        let id = TaskId::new("gather", format!("{}@{}", key, dtype.map_or("native", dtype_name)));
        Self { id, sources, dtype }
    }
}

impl Task for GatherTensors {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn execute(&self, _inputs: TaskInputs, ctx: &TaskContext) -> Result<TaskValue> {
        let mut entries = Vec::with_capacity(self.sources.len());
        for (model, name) in &self.sources {
            let mut tensor = ctx.loaders.load_tensor(model, name)?;
            if let Some(dtype) = self.dtype {
                tensor = tensor.cast(dtype).map_err(|e| match e {
                    MergeError::UnsupportedDtype { dtype, .. } => MergeError::UnsupportedDtype {
                        name: name.clone(),
                        dtype,
                    },
                    other => other,
                })?;
            }
            entries.push(GatheredTensor {
                model: model.clone(),
                name: name.clone(),
                tensor: tensor.to_device(ctx.storage_device),
            });
        }
        Ok(TaskValue::Gathered(GatheredTensors { entries }))
    }
}

/// Everything the planner resolved for one output weight.
#[derive(Debug, Clone)]
pub struct TensorTaskSpec {
    /// Output weight name.
    pub output_name: String,
    /// Gather task feeding the merge.
    pub gather: TaskId,
    /// Source models, aligned with the gathered entries.
    pub models: Vec<ModelReference>,
    /// Global parameters.
    pub global: ParameterBag,
    /// Per-model parameters, aligned with `models`.
    pub per_model: Vec<ParameterBag>,
    /// Base model, if configured.
    pub base_model: Option<ModelReference>,
    /// Seed for stochastic methods.
    pub seed: Option<u64>,
}

/// How an output weight is merged.
#[derive(Debug, Clone)]
pub enum TensorMerge {
    /// Apply the configured method.
    Method(Arc<dyn MergeMethod>),
    /// Re-index embedding rows through the built tokenizer, then combine.
    PermutedEmbedding {
        /// Method used when no permutation is available.
        method: Arc<dyn MergeMethod>,
        /// Tokenizer build task.
        tokenizer_task: TaskId,
    },
}

impl TensorMerge {
    fn method(&self) -> &Arc<dyn MergeMethod> {
        match self {
            Self::Method(method) | Self::PermutedEmbedding { method, .. } => method,
        }
    }

    /// Global parameters to resolve.
    pub fn parameters(&self) -> Vec<ParameterDef> {
        let mut defs = self.method().parameters();
        if matches!(self, Self::PermutedEmbedding { .. }) && !defs.iter().any(|d| d.name == "t") {
            defs.push(ParameterDef::optional("t", None));
        }
        defs
    }

    /// Per-model parameters to resolve.
    pub fn per_model_parameters(&self) -> Vec<ParameterDef> {
        let mut defs = self.method().per_model_parameters();
        if matches!(self, Self::PermutedEmbedding { .. })
            && !defs.iter().any(|d| d.name == "weight")
        {
            defs.push(ParameterDef::optional(
                "weight",
                Some(ParameterValue::Number(1.0)),
            ));
        }
        defs
    }

    /// Build the merge task for one output weight.
    pub fn build_task(&self, spec: TensorTaskSpec) -> Arc<dyn Task> {
        match self {
            Self::Method(method) => Arc::new(MergeTensorTask::new(Arc::clone(method), spec)),
            Self::PermutedEmbedding {
                method,
                tokenizer_task,
            } => Arc::new(PermutedEmbeddingTask::new(
                MergeTensorTask::new(Arc::clone(method), spec),
                tokenizer_task.clone(),
            )),
        }
    }
}

/// Combines gathered weights with a merge method.
#[derive(Debug)]
pub struct MergeTensorTask {
    id: TaskId,
    method: Arc<dyn MergeMethod>,
    pub(crate) spec: TensorTaskSpec,
}

impl MergeTensorTask {
    /// Merge task producing `spec.output_name`.
    pub fn new(method: Arc<dyn MergeMethod>, spec: TensorTaskSpec) -> Self {
        Self {
            id: TaskId::new("merge", &spec.output_name),
            method,
            spec,
        }
    }

    /// Merge already gathered inputs.
    pub(crate) fn merge_gathered(&self, gathered: GatheredTensors) -> Result<Tensor> {
        let name = self.spec.output_name.as_str();
        if gathered.len() != self.spec.per_model.len() {
            return Err(MergeError::InvalidConfig(format!(
                "'{}' gathered {} inputs for {} parameter sets",
                name,
                gathered.len(),
                self.spec.per_model.len()
            )));
        }

        let ctx = MergeContext {
            tensor_name: name,
            seed: self.spec.seed,
        };

        if !self.method.requires_base_model() {
            let tensors = gathered.entries.into_iter().map(|e| e.tensor).collect();
            return self
                .method
                .merge(tensors, None, &self.spec.per_model, &self.spec.global, &ctx);
        }

        let base_model = self.spec.base_model.as_ref();
        let base_idx = base_model
            .and_then(|b| gathered.entries.iter().position(|e| &e.model == b))
            .ok_or_else(|| MergeError::BaseModelRequired {
                method: format!("{} (tensor '{}')", self.method.name(), name),
            })?;

        let mut base = None;
        let mut tensors = Vec::with_capacity(gathered.len() - 1);
        let mut params = Vec::with_capacity(gathered.len() - 1);
        for (idx, (entry, bag)) in gathered
            .entries
            .into_iter()
            .zip(&self.spec.per_model)
            .enumerate()
        {
            if idx == base_idx {
                base = Some(entry.tensor);
            } else {
                tensors.push(entry.tensor);
                params.push(bag.clone());
            }
        }

        self.method
            .merge(tensors, base, &params, &self.spec.global, &ctx)
    }
}

impl Task for MergeTensorTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::moved(self.spec.gather.clone())]
    }

    fn resource(&self) -> ResourceClass {
        ResourceClass::Compute
    }

    fn execute(&self, mut inputs: TaskInputs, _ctx: &TaskContext) -> Result<TaskValue> {
        let gathered = inputs.take_gathered(&self.spec.gather)?;
        debug!(
            "Merging {} with {} ({} inputs)",
            self.spec.output_name,
            self.method.name(),
            gathered.len()
        );
        Ok(TaskValue::Tensor(self.merge_gathered(gathered)?))
    }
}

/// Creates the shared shard writer.
#[derive(Debug)]
pub struct WriterTask {
    id: TaskId,
    out_path: PathBuf,
    max_shard_size: u64,
}

impl WriterTask {
    /// Writer for `out_path`.
    pub fn new(out_path: impl Into<PathBuf>, max_shard_size: u64) -> Self {
        let out_path = out_path.into();
        Self {
            id: TaskId::new("writer", out_path.display()),
            out_path,
            max_shard_size,
        }
    }
}

impl Task for WriterTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn execute(&self, _inputs: TaskInputs, _ctx: &TaskContext) -> Result<TaskValue> {
        Ok(TaskValue::Writer(Arc::new(ShardWriter::new(
            &self.out_path,
            self.max_shard_size,
        )?)))
    }
}

/// Hands one merged weight to the writer.
#[derive(Debug)]
pub struct SaveTensor {
    id: TaskId,
    name: String,
    position: usize,
    tensor_task: TaskId,
    writer_task: TaskId,
    clone_input: bool,
}

impl SaveTensor {
    /// Save the value of `tensor_task` as `name`, the `position`-th weight
    /// of the output.
    ///
    /// With `clone_input` the merged tensor is copied instead of moved.
    pub fn new(
        name: impl Into<String>,
        position: usize,
        tensor_task: TaskId,
        writer_task: TaskId,
        clone_input: bool,
    ) -> Self {
        let name = name.into();
        Self {
            id: TaskId::new("save", &name),
            name,
            position,
            tensor_task,
            writer_task,
            clone_input,
        }
    }

    /// Output weight name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Task for SaveTensor {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let tensor = if self.clone_input {
            Dependency::cloned(self.tensor_task.clone())
        } else {
            Dependency::moved(self.tensor_task.clone())
        };
        vec![tensor, Dependency::cloned(self.writer_task.clone())]
    }

    fn execute(&self, mut inputs: TaskInputs, _ctx: &TaskContext) -> Result<TaskValue> {
        let tensor = inputs.take_tensor(&self.tensor_task)?;
        let writer = inputs.take_writer(&self.writer_task)?;
        writer.save_at(self.position, &self.name, tensor)?;
        Ok(TaskValue::Done)
    }
}

/// Waits for every save, then finalizes the writer.
#[derive(Debug)]
pub struct FinalizeModel {
    id: TaskId,
    save_tasks: Vec<TaskId>,
    writer_task: TaskId,
}

impl FinalizeModel {
    /// Finalize after `save_tasks`.
    pub fn new(save_tasks: Vec<TaskId>, writer_task: TaskId) -> Self {
        Self {
            id: TaskId::new("finalize", &writer_task),
            save_tasks,
            writer_task,
        }
    }
}

impl Task for FinalizeModel {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        self.save_tasks
            .iter()
            .cloned()
            .map(Dependency::moved)
            .chain(std::iter::once(Dependency::cloned(self.writer_task.clone())))
            .collect()
    }

    fn execute(&self, mut inputs: TaskInputs, _ctx: &TaskContext) -> Result<TaskValue> {
        let writer = inputs.take_writer(&self.writer_task)?;
        Ok(TaskValue::Artifact(writer.finalize()?))
    }
}
