//! Model merging orchestration.
//!
//! This module provides the high-level API for running model merges. It
//! plans the task graph, opens every source model, executes the graph and
//! then writes the output model config and tokenizer next to the shards.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::executor::{Executor, ExecutorOptions, TaskOutput};
use crate::graph::{TaskContext, TaskValue};
use crate::loader::{LoaderCache, LoaderOptions};
use crate::plan::MergePlanner;
use crate::tokenizer::{TokenizerInfo, TOKENIZER_FILE};
use crate::{
    dtype_name, ArchitectureInfo, MergeConfig, MergeError, MergeMethodConfig, MergeOptions,
    ModelConfig, ModelReference, ParameterMap, ParameterSetting, Result, ShardManifest,
    TokenizerConfig,
};

/// Tokenizer files copied from a donor model.
const TOKENIZER_FILES: &[&str] = &[
    TOKENIZER_FILE,
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
    "added_tokens.json",
];

/// Files that describe special tokens and stay valid next to a rebuilt tokenizer.
const TOKENIZER_SIDE_FILES: &[&str] = &["tokenizer_config.json", "special_tokens_map.json"];

/// Progress reported while a merge runs.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeProgress {
    /// The plan was built.
    Planned {
        /// Output weights to write.
        weights: usize,
        /// Tasks in the graph.
        tasks: usize,
    },
    /// Source models are open.
    ModelsReady {
        /// Number of opened models.
        models: usize,
    },
    /// One output weight reached the writer.
    Saved {
        /// Output weight name.
        name: String,
        /// Weights saved so far.
        done: usize,
        /// Weights in the plan.
        total: usize,
    },
    /// The tokenizer task finished.
    TokenizerBuilt {
        /// Output vocabulary size, when a tokenizer is available.
        vocab_size: Option<usize>,
    },
    /// Shards and index are on disk.
    Finalized {
        /// Shard files written.
        shards: usize,
    },
}

/// Summary of a finished merge.
#[derive(Debug, Clone)]
pub struct MergeReport {
    /// Output directory.
    pub out_path: PathBuf,
    /// Written shards and weight locations.
    pub manifest: ShardManifest,
    /// Decoder layers in the output model.
    pub output_layers: usize,
    /// Vocabulary size written to the output config.
    pub vocab_size: Option<usize>,
    /// Whether tokenizer files were written.
    pub tokenizer_written: bool,
}

/// Main entry point for running a model merge.
///
/// # Arguments
/// * `config` - Merge configuration specifying models, method, and parameters
/// * `out_path` - Output directory
/// * `options` - Run options
pub async fn run_merge(
    config: &MergeConfig,
    out_path: impl AsRef<Path>,
    options: &MergeOptions,
) -> Result<MergeReport> {
    run_merge_with_progress(config, out_path, options, |_| {}).await
}

/// [`run_merge`] reporting progress to `on_progress`.
pub async fn run_merge_with_progress<F>(
    config: &MergeConfig,
    out_path: impl AsRef<Path>,
    options: &MergeOptions,
    mut on_progress: F,
) -> Result<MergeReport>
where
    F: FnMut(MergeProgress),
{
    let out_path = out_path.as_ref().to_path_buf();
    info!("Starting merge with method: {:?}", config.merge_method);
    config.validate()?;

    let loaders = Arc::new(LoaderCache::new(LoaderOptions::from(options)));
    let plan = MergePlanner::new(config, options, &out_path).plan(loaders.as_ref())?;
    let total = plan.save_tasks.len();
    on_progress(MergeProgress::Planned {
        weights: total,
        tasks: plan.graph.len(),
    });

    let models = config.referenced_models();
    let warm = Arc::clone(&loaders);
    let warm_models = models.clone();
    tokio::task::spawn_blocking(move || warm.warm_up(&warm_models))
        .await
        .map_err(|e| MergeError::Executor(e.to_string()))??;
    on_progress(MergeProgress::ModelsReady {
        models: models.len(),
    });

    let executor = Executor::new(
        plan.graph,
        TaskContext::cpu(Arc::clone(&loaders)),
        ExecutorOptions::from(options),
    );
    let (tx, mut rx) = mpsc::unbounded_channel::<TaskOutput>();

    let mut tokenizer: Option<Arc<TokenizerInfo>> = None;
    let mut manifest: Option<ShardManifest> = None;
    let collect = async {
        let mut done = 0;
        while let Some(output) = rx.recv().await {
            match output.value {
                TaskValue::Tokenizer(info) => {
                    on_progress(MergeProgress::TokenizerBuilt {
                        vocab_size: info.as_deref().map(TokenizerInfo::vocab_size),
                    });
                    tokenizer = info;
                }
                TaskValue::Artifact(m) => {
                    on_progress(MergeProgress::Finalized {
                        shards: m.shard_count(),
                    });
                    manifest = Some(m);
                }
                _ if output.task.kind() == "save" => {
                    done += 1;
                    on_progress(MergeProgress::Saved {
                        name: output.task.key().to_string(),
                        done,
                        total,
                    });
                }
                _ => {}
            }
        }
    };
    let (result, ()) = tokio::join!(executor.run(tx), collect);
    result?;

    let manifest = manifest
        .ok_or_else(|| MergeError::Executor("finalizer reported no manifest".to_string()))?;

    let vocab_size = tokenizer.as_deref().map(TokenizerInfo::vocab_size);
    write_output_config(
        &loaders,
        config,
        plan.arch.as_ref(),
        plan.output_layers,
        vocab_size,
        &out_path,
    )?;

    let tokenizer_written = match &tokenizer {
        Some(info) => {
            info.save(&out_path)?;
            copy_tokenizer_files(&loaders, &info.donor, &out_path, TOKENIZER_SIDE_FILES);
            true
        }
        None if options.copy_tokenizer => {
            let donor = donor_model(config)?;
            copy_tokenizer_files(&loaders, &donor, &out_path, TOKENIZER_FILES);
            // Side files alone do not make a usable tokenizer.
            let vocabulary = TOKENIZER_FILES
                .iter()
                .filter(|f| !TOKENIZER_SIDE_FILES.contains(f))
                .any(|f| out_path.join(f).is_file());
            if !vocabulary {
                error!(
                    "Failed to copy tokenizer from {}. The merge was still successful; copy it manually.",
                    donor
                );
            }
            vocabulary
        }
        None => false,
    };

    info!(
        "Merge complete! {} weights in {} shards at {:?}",
        manifest.weight_count(),
        manifest.shard_count(),
        out_path
    );
    Ok(MergeReport {
        out_path,
        manifest,
        output_layers: plan.output_layers,
        vocab_size,
        tokenizer_written,
    })
}

/// Model whose config and tokenizer seed the output.
fn donor_model(config: &MergeConfig) -> Result<ModelReference> {
    config
        .base_model
        .clone()
        .or_else(|| config.referenced_models().into_iter().next())
        .ok_or(MergeError::NoOutputRequested)
}

fn write_output_config(
    loaders: &LoaderCache,
    config: &MergeConfig,
    arch: &dyn ArchitectureInfo,
    output_layers: usize,
    vocab_size: Option<usize>,
    out_path: &Path,
) -> Result<()> {
    let mut cfg = loaders.model_config(&donor_model(config)?)?;
    match cfg.as_object_mut() {
        Some(fields) => {
            if let Some(dtype) = config.output_dtype()? {
                fields.insert("torch_dtype".to_string(), Value::from(dtype_name(dtype)));
            }
            if let Some(vocab_size) = vocab_size {
                fields.insert("vocab_size".to_string(), Value::from(vocab_size));
            }
            fields.insert(
                arch.num_layers_config_key().to_string(),
                Value::from(output_layers),
            );
        }
        None => warn!(
            "Unable to set vocabulary size and layer count in output config; you may need to correct them manually"
        ),
    }
    std::fs::write(
        out_path.join("config.json"),
        serde_json::to_string_pretty(&cfg)?,
    )?;
    Ok(())
}

/// Copy whichever of `files` the donor has. Returns how many were copied.
fn copy_tokenizer_files(
    loaders: &LoaderCache,
    donor: &ModelReference,
    out_path: &Path,
    files: &[&str],
) -> usize {
    let dir = match loaders.model_dir(donor) {
        Ok(dir) => dir,
        Err(e) => {
            warn!("Cannot locate tokenizer files of {}: {}", donor, e);
            return 0;
        }
    };

    let mut copied = 0;
    for file in files {
        let src = dir.join(file);
        if !src.is_file() {
            continue;
        }
        match std::fs::copy(&src, out_path.join(file)) {
            Ok(_) => copied += 1,
            Err(e) => warn!("Failed to copy {:?}: {}", src, e),
        }
    }
    copied
}

/// Builder for simple merge configurations.
#[derive(Debug, Default)]
pub struct MergeBuilder {
    method: Option<MergeMethodConfig>,
    models: Vec<ModelConfig>,
    base_model: Option<ModelReference>,
    parameters: ParameterMap,
    dtype: Option<String>,
    tokenizer: Option<TokenizerConfig>,
}

impl MergeBuilder {
    /// Create a new merge builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the merge method.
    pub fn method(mut self, method: MergeMethodConfig) -> Self {
        self.method = Some(method);
        self
    }

    /// Add a model to merge.
    pub fn add_model(self, model: impl Into<ModelReference>) -> Self {
        self.add_model_with_params(model, ParameterMap::new())
    }

    /// Add a model with its own parameters.
    pub fn add_model_with_params(
        mut self,
        model: impl Into<ModelReference>,
        parameters: ParameterMap,
    ) -> Self {
        self.models.push(ModelConfig {
            model: model.into(),
            parameters,
        });
        self
    }

    /// Add a model with a merge weight.
    pub fn add_weighted_model(self, model: impl Into<ModelReference>, weight: f64) -> Self {
        self.add_model_with_params(
            model,
            ParameterMap::from([("weight".to_string(), ParameterSetting::from(weight))]),
        )
    }

    /// Set the base model for base-relative methods.
    pub fn base_model(mut self, model: impl Into<ModelReference>) -> Self {
        self.base_model = Some(model.into());
        self
    }

    /// Set a top-level parameter.
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<ParameterSetting>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Set t parameter for SLERP.
    pub fn t(self, t: f64) -> Self {
        self.parameter("t", t)
    }

    /// Set lambda scaling factor.
    pub fn lambda(self, lambda: f64) -> Self {
        self.parameter("lambda", lambda)
    }

    /// Set global density for sparsification.
    pub fn density(self, density: f64) -> Self {
        self.parameter("density", density)
    }

    /// Set the output dtype.
    pub fn dtype(mut self, dtype: impl Into<String>) -> Self {
        self.dtype = Some(dtype.into());
        self
    }

    /// Build a tokenizer from `source` (`base`, `union` or a model).
    pub fn tokenizer(mut self, source: impl Into<String>) -> Self {
        self.tokenizer = Some(TokenizerConfig {
            source: source.into(),
        });
        self
    }

    /// Build the merge configuration.
    pub fn build(self) -> Result<MergeConfig> {
        let method = self
            .method
            .ok_or_else(|| MergeError::InvalidConfig("Merge method is required".to_string()))?;

        let config = MergeConfig {
            merge_method: method,
            models: self.models,
            slices: None,
            base_model: self.base_model,
            parameters: self.parameters,
            dtype: self.dtype,
            tokenizer: self.tokenizer,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build and run the merge.
    pub async fn run(self, out_path: impl AsRef<Path>, options: &MergeOptions) -> Result<MergeReport> {
        let config = self.build()?;
        run_merge(&config, out_path, options).await
    }
}
