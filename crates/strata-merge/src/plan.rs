//! Merge planning.
//!
//! Turns a [`MergeConfig`] into a [`TaskGraph`]. Planning reads model
//! configurations only; no weights are loaded until the graph executes.
//!
//! Output weights are planned in file order: the architecture's pre weights
//! from the first slice's sources, every layer of every slice, then the post
//! weights from the last slice's sources.

use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::arch::{format_layer_name, get_architecture_info, same_architecture, ArchitectureInfo};
use crate::graph::{TaskGraph, TaskGraphBuilder, TaskId};
use crate::methods::{create_merge_method, MergeMethod};
use crate::tasks::{FinalizeModel, GatherTensors, SaveTensor, TensorMerge, TensorTaskSpec, WriterTask};
use crate::tokenizer::{BuildTokenizer, TokenizerSource};
use crate::{
    InputSliceDefinition, MergeConfig, MergeError, MergeOptions, ModelReference,
    OutputSliceDefinition, ParameterDef, ParameterMap, ParameterResolver, Result,
};

/// Read access to model configurations during planning.
pub trait ModelCatalog {
    /// Parsed `config.json` of a model.
    fn model_config(&self, model: &ModelReference) -> Result<Value>;

    /// Architecture a model declares.
    fn architecture(&self, model: &ModelReference) -> Result<Arc<dyn ArchitectureInfo>> {
        get_architecture_info(&self.model_config(model)?)
    }

    /// Decoder layer count of a model.
    fn num_layers(&self, model: &ModelReference) -> Result<usize> {
        let config = self.model_config(model)?;
        get_architecture_info(&config)?.num_layers(&config)
    }
}

/// A planned merge, ready to execute.
#[derive(Debug)]
pub struct MergePlan {
    /// Every task of the merge.
    pub graph: TaskGraph,
    /// Architecture of the output model.
    pub arch: Arc<dyn ArchitectureInfo>,
    /// Output slices, explicit or derived from the model list.
    pub slices: Vec<OutputSliceDefinition>,
    /// Shared shard writer.
    pub writer_task: TaskId,
    /// Finalizer; its value is the artifact manifest.
    pub finalize_task: TaskId,
    /// Tokenizer build, when requested.
    pub tokenizer_task: Option<TaskId>,
    /// One save per output weight, in file order.
    pub save_tasks: Vec<TaskId>,
    /// Decoder layers in the output model.
    pub output_layers: usize,
}

/// Builds the task graph of a merge.
#[derive(Debug)]
pub struct MergePlanner<'a> {
    config: &'a MergeConfig,
    options: &'a MergeOptions,
    out_path: PathBuf,
}

impl<'a> MergePlanner<'a> {
    /// Planner writing into `out_path`.
    pub fn new(config: &'a MergeConfig, options: &'a MergeOptions, out_path: impl AsRef<Path>) -> Self {
        Self {
            config,
            options,
            out_path: out_path.as_ref().to_path_buf(),
        }
    }

    /// Plan the merge. Configuration errors are reported before any task exists.
    pub fn plan(&self, catalog: &dyn ModelCatalog) -> Result<MergePlan> {
        self.config.validate()?;
        let arch = self.check_architectures(catalog)?;

        let slices = match &self.config.slices {
            Some(slices) if !slices.is_empty() => slices.clone(),
            _ => self.whole_model_slices(catalog)?,
        };
        for slice in &slices {
            let lengths: Vec<usize> = slice.sources.iter().map(|s| s.num_layers()).collect();
            if lengths.windows(2).any(|w| w[0] != w[1]) {
                return Err(MergeError::SliceLengthMismatch { lengths });
            }
        }

        let method = create_merge_method(self.config.merge_method);
        let mut builder = TaskGraphBuilder::new();
        let writer_task = builder.add(Arc::new(WriterTask::new(
            &self.out_path,
            self.options.max_shard_size,
        )));

        let tokenizer_task = self.config.tokenizer.as_ref().map(|tok| {
            builder.add_target(Arc::new(BuildTokenizer::new(
                TokenizerSource::parse(&tok.source),
                self.config.base_model.clone(),
                self.config.referenced_models(),
            )))
        });

        let mut state = PlanState {
            config: self.config,
            options: self.options,
            arch: Arc::clone(&arch),
            method,
            tokenizer_task: tokenizer_task.clone(),
            writer_task: writer_task.clone(),
            dtype: self.config.output_dtype()?,
            builder,
            save_tasks: Vec::new(),
            planned: HashSet::new(),
            current_layer: 0,
        };

        let (first, last) = match (slices.first(), slices.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(MergeError::NoOutputRequested),
        };

        let pre = ParameterResolver::new(self.config, 0.0);
        for name in arch.pre_weights() {
            state.plan_whole_weight(&name, &first.sources, pre)?;
        }
        for slice in &slices {
            state.plan_slice(slice)?;
        }
        let post = ParameterResolver::new(self.config, 1.0);
        for name in arch.post_weights() {
            state.plan_whole_weight(&name, &last.sources, post)?;
        }

        let output_layers = state.current_layer;
        let save_tasks = state.save_tasks;
        let mut builder = state.builder;
        let finalize_task = builder.add_target(Arc::new(FinalizeModel::new(
            save_tasks.clone(),
            writer_task.clone(),
        )));
        for save in &save_tasks {
            builder.mark_target(save.clone());
        }

        let graph = builder.build()?;
        info!(
            "Planned {} output weights over {} layers ({} tasks)",
            save_tasks.len(),
            output_layers,
            graph.len()
        );

        Ok(MergePlan {
            graph,
            arch,
            slices,
            writer_task,
            finalize_task,
            tokenizer_task,
            save_tasks,
            output_layers,
        })
    }

    fn check_architectures(&self, catalog: &dyn ModelCatalog) -> Result<Arc<dyn ArchitectureInfo>> {
        let models = self.config.referenced_models();
        let mut archs = Vec::with_capacity(models.len());
        for model in &models {
            archs.push(catalog.architecture(model)?);
        }

        let (first_model, first) = match (models.first(), archs.first()) {
            (Some(m), Some(a)) => (m, Arc::clone(a)),
            _ => return Err(MergeError::NoOutputRequested),
        };
        if !self.options.allow_architecture_mixing {
            for (model, arch) in models.iter().zip(&archs).skip(1) {
                if !same_architecture(first.as_ref(), arch.as_ref()) {
                    return Err(MergeError::ArchitectureMismatch(format!(
                        "{} is {} but {} is {}; enable architecture mixing to merge them anyway",
                        first_model,
                        first.name(),
                        model,
                        arch.name()
                    )));
                }
            }
        }
        Ok(first)
    }

    fn whole_model_slices(&self, catalog: &dyn ModelCatalog) -> Result<Vec<OutputSliceDefinition>> {
        let mut sources: Vec<InputSliceDefinition> = Vec::new();
        let models = self.config.models.iter().map(|m| &m.model);
        for model in models.chain(self.config.base_model.as_ref()) {
            if sources.iter().any(|s| &s.model == model) {
                continue;
            }
            sources.push(InputSliceDefinition {
                model: model.clone(),
                layer_range: [0, catalog.num_layers(model)?],
                parameters: ParameterMap::new(),
            });
        }
        debug!("Merging {} whole models", sources.len());
        Ok(vec![OutputSliceDefinition {
            sources,
            parameters: ParameterMap::new(),
        }])
    }
}

struct PlanState<'a> {
    config: &'a MergeConfig,
    options: &'a MergeOptions,
    arch: Arc<dyn ArchitectureInfo>,
    method: Arc<dyn MergeMethod>,
    tokenizer_task: Option<TaskId>,
    writer_task: TaskId,
    dtype: Option<safetensors::Dtype>,
    builder: TaskGraphBuilder,
    save_tasks: Vec<TaskId>,
    planned: HashSet<String>,
    current_layer: usize,
}

impl PlanState<'_> {
    fn plan_whole_weight(
        &mut self,
        name: &str,
        sources: &[InputSliceDefinition],
        resolver: ParameterResolver<'_>,
    ) -> Result<()> {
        let names_in = vec![name.to_string(); sources.len()];
        let models: Vec<ModelReference> = sources.iter().map(|s| s.model.clone()).collect();
        self.plan_tensor(name, names_in, models, resolver)
    }

    fn plan_slice(&mut self, slice: &OutputSliceDefinition) -> Result<()> {
        let num_layers = slice.sources.first().map_or(0, |s| s.num_layers());
        let resolver = ParameterResolver::for_slice(self.config, slice, 0.0);
        let models: Vec<ModelReference> = slice.sources.iter().map(|s| s.model.clone()).collect();

        for idx in 0..num_layers {
            let t = if num_layers > 1 {
                idx as f64 / (num_layers - 1) as f64
            } else {
                1.0
            };
            for template in self.arch.layer_weight_formats() {
                let name_out = format_layer_name(&template, self.current_layer);
                let names_in = slice
                    .sources
                    .iter()
                    .map(|s| format_layer_name(&template, s.layer_range[0] + idx))
                    .collect();
                self.plan_tensor(&name_out, names_in, models.clone(), resolver.with_t(t))?;
            }
            self.current_layer += 1;
        }
        Ok(())
    }

    fn plan_tensor(
        &mut self,
        name: &str,
        names_in: Vec<String>,
        models: Vec<ModelReference>,
        resolver: ParameterResolver<'_>,
    ) -> Result<()> {
        if !self.planned.insert(name.to_string()) {
            return Err(MergeError::InvalidConfig(format!(
                "output weight '{}' is planned twice",
                name
            )));
        }

        let base_model = self.config.base_model.clone();
        if self.method.requires_base_model()
            && !base_model.as_ref().is_some_and(|b| models.contains(b))
        {
            return Err(MergeError::BaseModelRequired {
                method: format!("{} (base model is not a source of '{}')", self.method.name(), name),
            });
        }

        let strategy = match &self.tokenizer_task {
            Some(tokenizer_task) if self.arch.embed_weights().iter().any(|w| w == name) => {
                TensorMerge::PermutedEmbedding {
                    method: Arc::clone(&self.method),
                    tokenizer_task: tokenizer_task.clone(),
                }
            }
            _ => TensorMerge::Method(Arc::clone(&self.method)),
        };

        let global = resolver.resolve_all(&strategy.parameters(), name, None)?;

        let per_model_defs = strategy.per_model_parameters();
        // The base is the reference point of base-relative methods and needs no weight of its own.
        let base_defs: Vec<ParameterDef> = per_model_defs
            .iter()
            .map(|d| ParameterDef {
                required: d.required && !self.method.requires_base_model(),
                ..d.clone()
            })
            .collect();
        let mut per_model = Vec::with_capacity(models.len());
        for (model, name_in) in models.iter().zip(&names_in) {
            let defs = if Some(model) == base_model.as_ref() {
                &base_defs
            } else {
                &per_model_defs
            };
            per_model.push(resolver.resolve_all(defs, name_in, Some(model))?);
        }

        let sources = models.iter().cloned().zip(names_in).collect();
        let gather = self
            .builder
            .add(Arc::new(GatherTensors::new(sources, self.dtype)));

        let merge = self.builder.add(strategy.build_task(TensorTaskSpec {
            output_name: name.to_string(),
            gather,
            models,
            global,
            per_model,
            base_model,
            seed: self.options.random_seed.map(|seed| seed ^ name_hash(name)),
        }));

        let save = self.builder.add(Arc::new(SaveTensor::new(
            name,
            self.save_tasks.len(),
            merge,
            self.writer_task.clone(),
            self.options.clone_buffers,
        )));
        self.save_tasks.push(save);
        Ok(())
    }
}

/// FNV-1a hash of a weight name.
fn name_hash(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Task;
    use crate::{ModelConfig, ParameterSetting, TokenizerConfig};
    use serde_json::json;
    use std::collections::HashMap;

    struct StaticCatalog(HashMap<ModelReference, Value>);

    impl StaticCatalog {
        fn llama(models: &[(&str, usize)]) -> Self {
            Self(
                models
                    .iter()
                    .map(|(m, layers)| {
                        (
                            ModelReference::new(*m),
                            json!({"architectures": ["LlamaForCausalLM"], "num_hidden_layers": layers}),
                        )
                    })
                    .collect(),
            )
        }
    }

    impl ModelCatalog for StaticCatalog {
        fn model_config(&self, model: &ModelReference) -> Result<Value> {
            self.0
                .get(model)
                .cloned()
                .ok_or_else(|| MergeError::model_load(model, "not in catalog"))
        }
    }

    fn plan(config: &MergeConfig, catalog: &StaticCatalog) -> Result<MergePlan> {
        let options = MergeOptions::default();
        MergePlanner::new(config, &options, "/tmp/strata-plan-test").plan(catalog)
    }

    fn task<'p>(plan: &'p MergePlan, kind: &str, key: &str) -> &'p Arc<dyn Task> {
        plan.graph
            .task(&TaskId::new(kind, key))
            .unwrap_or_else(|| panic!("no task {}:{}", kind, key))
    }

    fn stacking_config() -> MergeConfig {
        MergeConfig::from_yaml(
            r#"
merge_method: passthrough
slices:
  - sources:
      - model: a
        layer_range: [0, 2]
  - sources:
      - model: b
        layer_range: [1, 3]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_stacked_slices_renumber_layers() {
        let catalog = StaticCatalog::llama(&[("a", 4), ("b", 4)]);
        let plan = plan(&stacking_config(), &catalog).unwrap();

        assert_eq!(plan.output_layers, 4);
        // 1 pre + 4 layers * 9 + 2 post
        assert_eq!(plan.save_tasks.len(), 39);
        assert_eq!(
            plan.save_tasks[0],
            TaskId::new("save", "model.embed_tokens.weight")
        );

        // Output layer 3 comes from layer 2 of b.
        let merge = task(&plan, "merge", "model.layers.3.mlp.up_proj.weight");
        let gather = &merge.dependencies()[0].task;
        assert!(gather.as_str().contains("b=model.layers.2.mlp.up_proj.weight"));

        // Post weights come from the last slice.
        let merge = task(&plan, "merge", "lm_head.weight");
        assert!(merge.dependencies()[0].task.as_str().contains("b=lm_head.weight"));
    }

    #[test]
    fn test_finalize_waits_for_every_save() {
        let catalog = StaticCatalog::llama(&[("a", 4), ("b", 4)]);
        let plan = plan(&stacking_config(), &catalog).unwrap();
        let finalize = plan.graph.task(&plan.finalize_task).unwrap();
        assert_eq!(finalize.dependencies().len(), plan.save_tasks.len() + 1);
        assert!(plan.graph.is_target(&plan.finalize_task));
        assert!(plan.tokenizer_task.is_none());
    }

    #[test]
    fn test_slice_length_mismatch() {
        let config = MergeConfig::from_yaml(
            r#"
merge_method: linear
slices:
  - sources:
      - model: a
        layer_range: [0, 2]
        parameters: {weight: 1.0}
      - model: b
        layer_range: [0, 3]
        parameters: {weight: 1.0}
"#,
        )
        .unwrap();
        let catalog = StaticCatalog::llama(&[("a", 4), ("b", 4)]);
        match plan(&config, &catalog) {
            Err(MergeError::SliceLengthMismatch { lengths }) => assert_eq!(lengths, vec![2, 3]),
            other => panic!("unexpected {:?}", other.map(|p| p.save_tasks.len())),
        }
    }

    #[test]
    fn test_architecture_mismatch_needs_override() {
        let mut catalog = StaticCatalog::llama(&[("a", 2)]);
        catalog.0.insert(
            ModelReference::new("b"),
            json!({"architectures": ["MistralForCausalLM"], "num_hidden_layers": 2}),
        );
        let config = MergeConfig {
            models: vec![
                ModelConfig {
                    model: "a".into(),
                    parameters: [("weight".to_string(), ParameterSetting::from(1.0))].into(),
                },
                ModelConfig {
                    model: "b".into(),
                    parameters: [("weight".to_string(), ParameterSetting::from(1.0))].into(),
                },
            ],
            ..Default::default()
        };

        assert!(matches!(
            plan(&config, &catalog),
            Err(MergeError::ArchitectureMismatch(_))
        ));

        let options = MergeOptions {
            allow_architecture_mixing: true,
            ..Default::default()
        };
        let plan = MergePlanner::new(&config, &options, "/tmp/out")
            .plan(&catalog)
            .unwrap();
        assert_eq!(plan.arch.name(), "LlamaForCausalLM");
    }

    #[test]
    fn test_whole_models_include_base() {
        let config = MergeConfig::from_yaml(
            r#"
merge_method: task_arithmetic
base_model: base
models:
  - model: ft
    parameters: {weight: 0.5}
"#,
        )
        .unwrap();
        let catalog = StaticCatalog::llama(&[("base", 2), ("ft", 2)]);
        let plan = plan(&config, &catalog).unwrap();
        assert_eq!(plan.slices[0].sources.len(), 2);
        assert_eq!(plan.slices[0].sources[1].model, ModelReference::new("base"));
        assert_eq!(plan.output_layers, 2);
    }

    #[test]
    fn test_missing_required_parameter() {
        let config = MergeConfig::from_yaml(
            r#"
merge_method: linear
models:
  - model: a
  - model: b
"#,
        )
        .unwrap();
        let catalog = StaticCatalog::llama(&[("a", 1), ("b", 1)]);
        match plan(&config, &catalog) {
            Err(MergeError::MissingParameter {
                parameter, tensor, ..
            }) => {
                assert_eq!(parameter, "weight");
                assert_eq!(tensor, "model.embed_tokens.weight");
            }
            other => panic!("unexpected {:?}", other.map(|p| p.save_tasks.len())),
        }
    }

    #[test]
    fn test_embeddings_use_tokenizer_alignment() {
        let mut config = stacking_config();
        config.tokenizer = Some(TokenizerConfig {
            source: "union".to_string(),
        });
        let catalog = StaticCatalog::llama(&[("a", 4), ("b", 4)]);
        let plan = plan(&config, &catalog).unwrap();

        let tokenizer = plan.tokenizer_task.clone().unwrap();
        let embed = task(&plan, "merge", "model.embed_tokens.weight");
        assert!(embed.dependencies().iter().any(|d| d.task == tokenizer));
        let norm = task(&plan, "merge", "model.norm.weight");
        assert!(norm.dependencies().iter().all(|d| d.task != tokenizer));
        assert!(plan.graph.is_target(&tokenizer));
    }

    #[test]
    fn test_gather_shared_between_identical_sources() {
        let config = MergeConfig::from_yaml(
            r#"
merge_method: passthrough
slices:
  - sources:
      - model: a
        layer_range: [0, 1]
  - sources:
      - model: a
        layer_range: [0, 1]
"#,
        )
        .unwrap();
        let catalog = StaticCatalog::llama(&[("a", 2)]);
        let plan = plan(&config, &catalog).unwrap();
        let first = task(&plan, "merge", "model.layers.0.mlp.up_proj.weight").dependencies();
        let second = task(&plan, "merge", "model.layers.1.mlp.up_proj.weight").dependencies();
        assert_eq!(first[0].task, second[0].task);
    }

    #[test]
    fn test_base_must_be_a_source() {
        let config = MergeConfig::from_yaml(
            r#"
merge_method: slerp
base_model: a
parameters: {t: 0.5}
slices:
  - sources:
      - model: b
        layer_range: [0, 1]
"#,
        )
        .unwrap();
        let catalog = StaticCatalog::llama(&[("a", 1), ("b", 1)]);
        assert!(matches!(
            plan(&config, &catalog),
            Err(MergeError::BaseModelRequired { .. })
        ));
    }

    #[test]
    fn test_seeds_differ_per_weight() {
        assert_ne!(name_hash("lm_head.weight"), name_hash("model.norm.weight"));
        assert_eq!(name_hash(""), 0xcbf2_9ce4_8422_2325);
    }
}
