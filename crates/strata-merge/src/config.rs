//! Configuration types for model merging.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{Device, MergeError, ModelReference, Result};

/// Complete merge configuration, typically loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// The merge method to use.
    pub merge_method: MergeMethodConfig,

    /// Models to merge whole.
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Explicit output slices. Takes precedence over `models`.
    #[serde(default)]
    pub slices: Option<Vec<OutputSliceDefinition>>,

    /// Base model for base-relative methods (SLERP, task arithmetic, TIES, DARE).
    #[serde(default)]
    pub base_model: Option<ModelReference>,

    /// Top-level parameters.
    #[serde(default)]
    pub parameters: ParameterMap,

    /// Output dtype (float32, float16, bfloat16). Source dtype is kept when absent.
    #[serde(default)]
    pub dtype: Option<String>,

    /// Tokenizer construction. No tokenizer is built when absent.
    #[serde(default)]
    pub tokenizer: Option<TokenizerConfig>,
}

/// Configuration for a single model in the merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model reference (local path or HuggingFace repo ID).
    pub model: ModelReference,

    /// Per-model parameters (override global).
    #[serde(default)]
    pub parameters: ParameterMap,
}

/// One contiguous range of output layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSliceDefinition {
    /// Input layer ranges combined into this slice.
    pub sources: Vec<InputSliceDefinition>,

    /// Slice-wide parameters.
    #[serde(default)]
    pub parameters: ParameterMap,
}

/// A layer range of one source model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSliceDefinition {
    /// Source model.
    pub model: ModelReference,

    /// Half-open `[start, end)` layer range.
    pub layer_range: [usize; 2],

    /// Parameters for this model within the slice.
    #[serde(default)]
    pub parameters: ParameterMap,
}

impl InputSliceDefinition {
    /// Number of layers covered by this source.
    pub fn num_layers(&self) -> usize {
        self.layer_range[1].saturating_sub(self.layer_range[0])
    }
}

/// Merge method configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethodConfig {
    /// Simple weighted averaging.
    Linear,

    /// Spherical linear interpolation from the base model.
    Slerp,

    /// Task Arithmetic merging (Ilharco et al., 2022).
    TaskArithmetic,

    /// TIES-Merging (Yadav et al., 2023)
    Ties,

    /// Random pruning with TIES sign consensus.
    DareTies,

    /// Random pruning with linear combination.
    DareLinear,

    /// No-op passthrough (for frankenmerging).
    Passthrough,
}

/// Named parameter settings at one scope.
pub type ParameterMap = BTreeMap<String, ParameterSetting>;

/// A parameter as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSetting {
    /// A value that applies to every tensor.
    Value(SettingValue),
    /// Values selected by tensor name.
    Conditional(Vec<ConditionalParameter>),
}

/// A literal parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Boolean flag.
    Bool(bool),
    /// Scalar.
    Number(f64),
    /// Piecewise-linear gradient over the slice depth.
    Gradient(Vec<f64>),
}

/// A value restricted to tensors whose name contains `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalParameter {
    /// Substring of the tensor name. `None` matches every tensor.
    #[serde(default)]
    pub filter: Option<String>,
    /// The value.
    pub value: SettingValue,
}

impl ParameterSetting {
    /// Value from a conditional entry whose filter matches `tensor`.
    pub fn for_tensor(&self, tensor: &str) -> Option<&SettingValue> {
        match self {
            Self::Value(_) => None,
            Self::Conditional(entries) => entries.iter().find_map(|e| match &e.filter {
                Some(filter) if tensor.contains(filter.as_str()) => Some(&e.value),
                _ => None,
            }),
        }
    }

    /// Value that is not tied to any tensor.
    pub fn unfiltered(&self) -> Option<&SettingValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Conditional(entries) => entries
                .iter()
                .find(|e| e.filter.is_none())
                .map(|e| &e.value),
        }
    }
}

impl From<f64> for ParameterSetting {
    fn from(v: f64) -> Self {
        Self::Value(SettingValue::Number(v))
    }
}

impl From<bool> for ParameterSetting {
    fn from(v: bool) -> Self {
        Self::Value(SettingValue::Bool(v))
    }
}

impl From<Vec<f64>> for ParameterSetting {
    fn from(v: Vec<f64>) -> Self {
        Self::Value(SettingValue::Gradient(v))
    }
}

/// Tokenizer configuration for merged model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Source for tokenizer: "union", "base", or a model reference.
    #[serde(default = "default_tokenizer_source")]
    pub source: String,
}

fn default_tokenizer_source() -> String {
    "base".to_string()
}

impl MergeConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Whether any output was requested at all.
    pub fn requests_output(&self) -> bool {
        !self.models.is_empty() || self.slices.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.requests_output() {
            return Err(MergeError::NoOutputRequested);
        }

        if self.merge_method.requires_base_model() && self.base_model.is_none() {
            return Err(MergeError::BaseModelRequired {
                method: format!("{:?}", self.merge_method),
            });
        }

        if let Some(slices) = &self.slices {
            for (idx, slice) in slices.iter().enumerate() {
                if slice.sources.is_empty() {
                    return Err(MergeError::InvalidConfig(format!(
                        "slice {} has no sources",
                        idx
                    )));
                }
                for source in &slice.sources {
                    if source.layer_range[1] < source.layer_range[0] {
                        return Err(MergeError::InvalidConfig(format!(
                            "layer range {:?} of {} is reversed",
                            source.layer_range, source.model
                        )));
                    }
                }
            }
        }

        self.output_dtype()?;
        Ok(())
    }

    /// Every model the merge reads, base first, without duplicates.
    pub fn referenced_models(&self) -> Vec<ModelReference> {
        let mut out: Vec<ModelReference> = Vec::new();
        let mut push = |m: &ModelReference| {
            if !out.contains(m) {
                out.push(m.clone());
            }
        };

        if let Some(base) = &self.base_model {
            push(base);
        }
        for m in &self.models {
            push(&m.model);
        }
        for slice in self.slices.iter().flatten() {
            for source in &slice.sources {
                push(&source.model);
            }
        }
        out
    }

    /// Parsed output dtype.
    pub fn output_dtype(&self) -> Result<Option<safetensors::Dtype>> {
        self.dtype.as_deref().map(parse_dtype).transpose()
    }
}

impl MergeMethodConfig {
    /// Whether this method needs a base model in the configuration.
    pub fn requires_base_model(&self) -> bool {
        matches!(
            self,
            Self::Slerp | Self::TaskArithmetic | Self::Ties | Self::DareTies | Self::DareLinear
        )
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_method: MergeMethodConfig::Linear,
            models: Vec::new(),
            slices: None,
            base_model: None,
            parameters: ParameterMap::new(),
            dtype: None,
            tokenizer: None,
        }
    }
}

/// Parse a dtype name.
pub fn parse_dtype(name: &str) -> Result<safetensors::Dtype> {
    match name.to_ascii_lowercase().as_str() {
        "float32" | "fp32" | "f32" => Ok(safetensors::Dtype::F32),
        "float16" | "fp16" | "f16" | "half" => Ok(safetensors::Dtype::F16),
        "bfloat16" | "bf16" => Ok(safetensors::Dtype::BF16),
        other => Err(MergeError::InvalidConfig(format!("unknown dtype '{}'", other))),
    }
}

/// Name written to `torch_dtype` in the output model config.
pub fn dtype_name(dtype: safetensors::Dtype) -> &'static str {
    match dtype {
        safetensors::Dtype::F32 => "float32",
        safetensors::Dtype::F16 => "float16",
        safetensors::Dtype::BF16 => "bfloat16",
        _ => "float32",
    }
}

/// Parse sizes like `5B`, `500M`, `64K` or plain byte counts.
pub fn parse_kmb(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, scale) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 1_000),
        Some('M') => (&s[..s.len() - 1], 1_000_000),
        Some('B') | Some('G') => (&s[..s.len() - 1], 1_000_000_000),
        _ => (s, 1),
    };
    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| MergeError::InvalidConfig(format!("invalid size '{}'", s)))?;
    if value < 0.0 {
        return Err(MergeError::InvalidConfig(format!("invalid size '{}'", s)));
    }
    Ok((value * scale as f64) as u64)
}

/// Run options for a merge.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Skip the architecture-equality check across models.
    pub allow_architecture_mixing: bool,
    /// Where merge arithmetic runs.
    pub compute_device: Device,
    /// Where intermediate values are kept.
    pub storage_device: Device,
    /// Maximum bytes of tensor data per output shard.
    pub max_shard_size: u64,
    /// Copy a donor tokenizer when none was built.
    pub copy_tokenizer: bool,
    /// Retain merged buffers by copying them into the writer.
    pub clone_buffers: bool,
    /// Accept models that declare custom modelling code.
    pub trust_remote_code: bool,
    /// Seed for stochastic merge methods.
    pub random_seed: Option<u64>,
    /// Memory-map weights instead of reading them eagerly.
    pub lazy_loading: bool,
    /// Cache directory for hub downloads.
    pub hub_cache_dir: Option<PathBuf>,
    /// Cache directory for adapter-merged models.
    pub adapter_cache_dir: Option<PathBuf>,
    /// Worker width for CPU compute. Defaults to the available parallelism.
    pub cpu_workers: Option<usize>,
    /// Concurrent load/save tasks.
    pub io_workers: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            allow_architecture_mixing: false,
            compute_device: Device::Cpu,
            storage_device: Device::Cpu,
            max_shard_size: 5_000_000_000,
            copy_tokenizer: true,
            clone_buffers: false,
            trust_remote_code: false,
            random_seed: None,
            lazy_loading: false,
            hub_cache_dir: None,
            adapter_cache_dir: None,
            cpu_workers: None,
            io_workers: 2,
        }
    }
}
