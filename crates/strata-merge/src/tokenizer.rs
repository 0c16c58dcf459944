//! Tokenizer construction and vocabulary-aligned embedding merges.
//!
//! The build task produces one output tokenizer plus, per source model, a map
//! from output token id to that model's token id. Embedding-class weights use
//! the map to line rows up by token before combining them.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info, warn};

use crate::graph::{Dependency, ResourceClass, Task, TaskContext, TaskId, TaskInputs, TaskValue};
use crate::tasks::{GatheredTensors, MergeTensorTask};
use crate::{MergeError, ModelReference, Result, Tensor};

/// File the built tokenizer is saved as.
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Where the output vocabulary comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerSource {
    /// The base model's vocabulary, unchanged.
    Base,
    /// The base vocabulary extended with every token any model adds.
    Union,
    /// One specific model's vocabulary.
    Model(ModelReference),
}

impl TokenizerSource {
    /// Parse `base`, `union`, or a model reference.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "base" => Self::Base,
            "union" => Self::Union,
            other => Self::Model(ModelReference::parse(other)),
        }
    }
}

/// Output token id to source token id, `None` where the model lacks the token.
pub type Permutation = Vec<Option<usize>>;

/// A built tokenizer and how each model's vocabulary maps onto it.
#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    /// Output tokenizer.
    pub tokenizer: Tokenizer,
    /// Per-model alignment. `None` when the donor tokenizer was copied as-is.
    pub permutations: Option<BTreeMap<ModelReference, Permutation>>,
    /// Model whose tokenizer files seeded the output.
    pub donor: ModelReference,
}

impl TokenizerInfo {
    /// Number of rows an aligned embedding has.
    pub fn vocab_size(&self) -> usize {
        vocab_rows(&self.tokenizer.get_vocab(true))
    }

    /// Write `tokenizer.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.tokenizer
            .save(dir.join(TOKENIZER_FILE), true)
            .map_err(|e| MergeError::Tokenizer(e.to_string()))
    }
}

fn vocab_rows(vocab: &HashMap<String, u32>) -> usize {
    vocab.values().max().map_or(0, |&id| id as usize + 1)
}

fn load_tokenizer(ctx: &TaskContext, model: &ModelReference) -> Result<Tokenizer> {
    let path = ctx.loaders.model_dir(model)?.join(TOKENIZER_FILE);
    Tokenizer::from_file(&path)
        .map_err(|e| MergeError::Tokenizer(format!("{} ({}): {}", model, path.display(), e)))
}

/// Align `source` onto the output vocabulary.
pub fn permutation(output: &HashMap<String, u32>, source: &HashMap<String, u32>) -> Permutation {
    let mut perm = vec![None; vocab_rows(output)];
    for (token, &id) in output {
        perm[id as usize] = source.get(token).map(|&i| i as usize);
    }
    perm
}

/// Builds the output tokenizer.
#[derive(Debug)]
pub struct BuildTokenizer {
    id: TaskId,
    source: TokenizerSource,
    base_model: Option<ModelReference>,
    models: Vec<ModelReference>,
}

impl BuildTokenizer {
    /// Tokenizer task over `models` (every referenced model, base included).
    pub fn new(
        source: TokenizerSource,
        base_model: Option<ModelReference>,
        models: Vec<ModelReference>,
    ) -> Self {
        let key = match &source {
            TokenizerSource::Base => "base".to_string(),
            TokenizerSource::Union => "union".to_string(),
            TokenizerSource::Model(m) => m.to_string(),
        };
        Self {
            id: TaskId::new("tokenizer", key),
            source,
            base_model,
            models,
        }
    }

    fn donor(&self) -> Result<&ModelReference> {
        self.base_model
            .as_ref()
            .or_else(|| self.models.first())
            .ok_or(MergeError::NotEnoughModels {
                expected: 1,
                actual: 0,
            })
    }

    fn build(&self, ctx: &TaskContext) -> Result<TokenizerInfo> {
        let donor = self.donor()?.clone();
        let (tokenizer, donor) = match &self.source {
            TokenizerSource::Base => (load_tokenizer(ctx, &donor)?, donor),
            TokenizerSource::Model(model) => (load_tokenizer(ctx, model)?, model.clone()),
            TokenizerSource::Union => (self.union(ctx, &donor)?, donor),
        };

        let output = tokenizer.get_vocab(true);
        let mut permutations = BTreeMap::new();
        for model in &self.models {
            let source = load_tokenizer(ctx, model)?.get_vocab(true);
            permutations.insert(model.clone(), permutation(&output, &source));
        }

        info!(
            "Built tokenizer from {} with {} tokens",
            donor,
            vocab_rows(&output)
        );
        Ok(TokenizerInfo {
            tokenizer,
            permutations: Some(permutations),
            donor,
        })
    }

    fn union(&self, ctx: &TaskContext, donor: &ModelReference) -> Result<Tokenizer> {
        let mut tokenizer = load_tokenizer(ctx, donor)?;
        for model in self.models.iter().filter(|m| *m != donor) {
            let known = tokenizer.get_vocab(true);
            let mut extra: Vec<(String, u32)> = load_tokenizer(ctx, model)?
                .get_vocab(true)
                .into_iter()
                .filter(|(token, _)| !known.contains_key(token))
                .collect();
            extra.sort_by_key(|(_, id)| *id);
            if extra.is_empty() {
                continue;
            }
            debug!("Adding {} tokens from {}", extra.len(), model);
            let added: Vec<AddedToken> = extra
                .into_iter()
                .map(|(token, _)| AddedToken::from(token, false))
                .collect();
            tokenizer.add_tokens(&added);
        }
        Ok(tokenizer)
    }
}

impl Task for BuildTokenizer {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn execute(&self, _inputs: TaskInputs, ctx: &TaskContext) -> Result<TaskValue> {
        let err = match self.build(ctx) {
            Ok(info) => return Ok(TaskValue::Tokenizer(Some(Arc::new(info)))),
            Err(e) => e,
        };

        let donor = self.donor()?.clone();
        warn!(
            "Tokenizer alignment failed ({}); copying tokenizer of {}",
            err, donor
        );
        match load_tokenizer(ctx, &donor) {
            Ok(tokenizer) => Ok(TaskValue::Tokenizer(Some(Arc::new(TokenizerInfo {
                tokenizer,
                permutations: None,
                donor,
            })))),
            Err(e) => {
                warn!("Donor tokenizer unavailable: {}", e);
                Ok(TaskValue::Tokenizer(None))
            }
        }
    }
}

/// Merges an embedding-class weight after aligning rows to the output vocabulary.
///
/// Falls back to the wrapped merge when no alignment is available.
#[derive(Debug)]
pub struct PermutedEmbeddingTask {
    id: TaskId,
    inner: MergeTensorTask,
    tokenizer_task: TaskId,
}

impl PermutedEmbeddingTask {
    /// Wrap `inner`, reading alignment from `tokenizer_task`.
    pub fn new(inner: MergeTensorTask, tokenizer_task: TaskId) -> Self {
        Self {
            id: TaskId::new("merge", &inner.spec.output_name),
            inner,
            tokenizer_task,
        }
    }

    fn weights(&self) -> Vec<f32> {
        let spec = &self.inner.spec;
        let mut weights: Vec<f32> = spec
            .per_model
            .iter()
            .map(|p| p.f32("weight").unwrap_or(1.0))
            .collect();

        if let (Some(t), Some(base), 2) = (spec.global.f32("t"), &spec.base_model, spec.models.len())
        {
            for (w, model) in weights.iter_mut().zip(&spec.models) {
                *w = if model == base { 1.0 - t } else { t };
            }
        }
        weights
    }

    fn merge_aligned(
        &self,
        gathered: GatheredTensors,
        permutations: &BTreeMap<ModelReference, Permutation>,
        rows: usize,
    ) -> Result<Tensor> {
        let name = &self.inner.spec.output_name;
        let first = gathered
            .entries
            .first()
            .map(|e| e.tensor.clone())
            .ok_or(MergeError::NotEnoughModels {
                expected: 1,
                actual: 0,
            })?;
        if first.shape().len() != 2 {
            return Err(MergeError::InvalidConfig(format!(
                "embedding '{}' is not two-dimensional: {:?}",
                name,
                first.shape()
            )));
        }
        let hidden = first.shape()[1];

        let mut sum = vec![0.0f32; rows * hidden];
        let mut total = vec![0.0f32; rows];
        for (entry, weight) in gathered.entries.iter().zip(self.weights()) {
            let shape = entry.tensor.shape();
            if shape.len() != 2 || shape[1] != hidden {
                return Err(MergeError::ShapeMismatch {
                    name: name.clone(),
                    expected: vec![shape.first().copied().unwrap_or(0), hidden],
                    actual: shape.to_vec(),
                });
            }
            let perm = permutations.get(&entry.model).ok_or_else(|| {
                MergeError::Tokenizer(format!("no alignment for {}", entry.model))
            })?;
            let source_rows = shape[0];
            let values = entry.tensor.to_f32_vec()?;

            for (row, src) in perm.iter().enumerate().take(rows) {
                let Some(src) = src.filter(|&s| s < source_rows) else {
                    continue;
                };
                let from = &values[src * hidden..(src + 1) * hidden];
                let to = &mut sum[row * hidden..(row + 1) * hidden];
                for (o, v) in to.iter_mut().zip(from) {
                    *o += weight * v;
                }
                total[row] += weight;
            }
        }

        for (row, w) in total.iter().enumerate() {
            if *w != 0.0 {
                for v in &mut sum[row * hidden..(row + 1) * hidden] {
                    *v /= w;
                }
            }
        }
        first.with_rows(&sum, rows)
    }
}

impl Task for PermutedEmbeddingTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = self.inner.dependencies();
        deps.push(Dependency::cloned(self.tokenizer_task.clone()));
        deps
    }

    fn resource(&self) -> ResourceClass {
        ResourceClass::Compute
    }

    fn execute(&self, mut inputs: TaskInputs, _ctx: &TaskContext) -> Result<TaskValue> {
        let gathered = inputs.take_gathered(&self.inner.spec.gather)?;
        let tokenizer = inputs.take_tokenizer(&self.tokenizer_task)?;

        let tensor = match tokenizer.as_deref() {
            Some(TokenizerInfo {
                permutations: Some(permutations),
                ..
            }) => {
                let rows = tokenizer.as_deref().map_or(0, TokenizerInfo::vocab_size);
                debug!(
                    "Aligning {} to {} rows",
                    self.inner.spec.output_name, rows
                );
                self.merge_aligned(gathered, permutations, rows)?
            }
            _ => self.inner.merge_gathered(gathered)?,
        };
        Ok(TaskValue::Tensor(tensor))
    }
}
