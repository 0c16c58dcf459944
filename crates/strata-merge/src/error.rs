//! Error types for model merging operations.

use thiserror::Error;

/// Errors that can occur while planning or executing a merge.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Neither a model list nor a slice list was given.
    #[error("No output requested: configuration needs `models` or `slices`")]
    NoOutputRequested,

    /// Model loading error.
    #[error("Failed to load model {model}: {reason}")]
    ModelLoad {
        /// The model reference that failed to open.
        model: String,
        /// Why it failed.
        reason: String,
    },

    /// Tensor not found in model.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// Shape mismatch between tensors.
    #[error("Shape mismatch for tensor '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor name.
        name: String,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Architecture mismatch between models.
    #[error("Architecture mismatch: {0}")]
    ArchitectureMismatch(String),

    /// Sources of one output slice cover different layer counts.
    #[error("All inputs to a slice must contain the same number of layers (got {lengths:?})")]
    SliceLengthMismatch {
        /// Layer count of every source, in declaration order.
        lengths: Vec<usize>,
    },

    /// A required parameter had no value at any scope.
    #[error("Missing required parameter '{parameter}' for tensor '{tensor}' (model: {model})")]
    MissingParameter {
        /// Parameter name.
        parameter: String,
        /// Tensor being planned.
        tensor: String,
        /// Model context, or `global`.
        model: String,
    },

    /// Invalid merge configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unsupported or mismatched tensor data type.
    #[error("Unsupported dtype {dtype} for tensor '{name}'")]
    UnsupportedDtype {
        /// Tensor name.
        name: String,
        /// Offending dtype.
        dtype: String,
    },

    /// The task graph contains a cycle.
    #[error("Cycle detected in task graph at task '{0}'")]
    CycleDetected(String),

    /// A task depends on an identity that was never added to the graph.
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        /// Dependent task.
        task: String,
        /// Missing dependency.
        dependency: String,
    },

    /// A task received an input of the wrong kind.
    #[error("Task '{task}' expected a {expected} input from '{dependency}'")]
    UnexpectedInput {
        /// Consuming task.
        task: String,
        /// Producing task.
        dependency: String,
        /// Expected value kind.
        expected: &'static str,
    },

    /// The same weight name was saved twice.
    #[error("Weight '{0}' was already written")]
    DuplicateWeight(String),

    /// The shard writer was used after finalization.
    #[error("Shard writer already finalized")]
    WriterFinalized,

    /// Tokenizer construction error.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Background task could not be joined.
    #[error("Executor error: {0}")]
    Executor(String),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HuggingFace Hub error.
    #[error("Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    /// Method requires base model but none provided.
    #[error("Base model required for {method} merge but not provided")]
    BaseModelRequired {
        /// The merge method that requires a base model.
        method: String,
    },

    /// Not enough models for merge operation.
    #[error("Expected at least {expected} models, got {actual}")]
    NotEnoughModels {
        /// Expected number of models.
        expected: usize,
        /// Actual number of models.
        actual: usize,
    },
}

impl MergeError {
    pub(crate) fn model_load(model: impl ToString, reason: impl ToString) -> Self {
        Self::ModelLoad {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is a configuration problem detected before execution.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::NoOutputRequested
                | Self::ArchitectureMismatch(_)
                | Self::SliceLengthMismatch { .. }
                | Self::MissingParameter { .. }
                | Self::InvalidConfig(_)
                | Self::BaseModelRequired { .. }
                | Self::NotEnoughModels { .. }
                | Self::CycleDetected(_)
                | Self::UnknownDependency { .. }
        )
    }
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
