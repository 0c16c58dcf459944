//! Architecture metadata.
//!
//! Describes a model family's weight naming: which weights come before the
//! decoder stack ("pre"), which repeat per layer, and which follow it
//! ("post"). Layer templates use `{idx}` for the layer number.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::{MergeError, Result};

/// Static naming scheme of one model family.
pub trait ArchitectureInfo: Send + Sync + fmt::Debug {
    /// Architecture name as found in `config.json` `architectures`.
    fn name(&self) -> &str;

    /// Weights before the first layer.
    fn pre_weights(&self) -> Vec<String>;

    /// Weights after the last layer.
    fn post_weights(&self) -> Vec<String>;

    /// Per-layer weight templates containing `{idx}`.
    fn layer_weight_formats(&self) -> Vec<String>;

    /// Weights whose rows are indexed by token id.
    fn embed_weights(&self) -> Vec<String>;

    /// Key in `config.json` holding the layer count.
    fn num_layers_config_key(&self) -> &str;

    /// Layer count declared by a model config.
    fn num_layers(&self, config: &Value) -> Result<usize> {
        config
            .get(self.num_layers_config_key())
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| {
                MergeError::InvalidConfig(format!(
                    "config has no integer '{}'",
                    self.num_layers_config_key()
                ))
            })
    }
}

/// Substitute a layer index into a template.
pub fn format_layer_name(template: &str, idx: usize) -> String {
    template.replace("{idx}", &idx.to_string())
}

/// Architecture described by string tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticArchitecture {
    /// Architecture name.
    pub name: &'static str,
    /// Pre weights.
    pub pre: &'static [&'static str],
    /// Post weights.
    pub post: &'static [&'static str],
    /// Layer templates.
    pub layer: &'static [&'static str],
    /// Embedding-class weights.
    pub embed: &'static [&'static str],
    /// Layer count key.
    pub num_layers_key: &'static str,
}

impl ArchitectureInfo for StaticArchitecture {
    fn name(&self) -> &str {
        self.name
    }

    fn pre_weights(&self) -> Vec<String> {
        self.pre.iter().map(|s| s.to_string()).collect()
    }

    fn post_weights(&self) -> Vec<String> {
        self.post.iter().map(|s| s.to_string()).collect()
    }

    fn layer_weight_formats(&self) -> Vec<String> {
        self.layer.iter().map(|s| s.to_string()).collect()
    }

    fn embed_weights(&self) -> Vec<String> {
        self.embed.iter().map(|s| s.to_string()).collect()
    }

    fn num_layers_config_key(&self) -> &str {
        self.num_layers_key
    }
}

const LLAMA_LAYER: &[&str] = &[
    "model.layers.{idx}.input_layernorm.weight",
    "model.layers.{idx}.self_attn.q_proj.weight",
    "model.layers.{idx}.self_attn.k_proj.weight",
    "model.layers.{idx}.self_attn.v_proj.weight",
    "model.layers.{idx}.self_attn.o_proj.weight",
    "model.layers.{idx}.post_attention_layernorm.weight",
    "model.layers.{idx}.mlp.gate_proj.weight",
    "model.layers.{idx}.mlp.up_proj.weight",
    "model.layers.{idx}.mlp.down_proj.weight",
];

/// Llama.
pub const LLAMA: StaticArchitecture = StaticArchitecture {
    name: "LlamaForCausalLM",
    pre: &["model.embed_tokens.weight"],
    post: &["model.norm.weight", "lm_head.weight"],
    layer: LLAMA_LAYER,
    embed: &["model.embed_tokens.weight", "lm_head.weight"],
    num_layers_key: "num_hidden_layers",
};

/// Mistral shares Llama's naming.
pub const MISTRAL: StaticArchitecture = StaticArchitecture {
    name: "MistralForCausalLM",
    ..LLAMA
};

/// Qwen2 adds attention biases.
pub const QWEN2: StaticArchitecture = StaticArchitecture {
    name: "Qwen2ForCausalLM",
    pre: &["model.embed_tokens.weight"],
    post: &["model.norm.weight", "lm_head.weight"],
    layer: &[
        "model.layers.{idx}.input_layernorm.weight",
        "model.layers.{idx}.self_attn.q_proj.weight",
        "model.layers.{idx}.self_attn.q_proj.bias",
        "model.layers.{idx}.self_attn.k_proj.weight",
        "model.layers.{idx}.self_attn.k_proj.bias",
        "model.layers.{idx}.self_attn.v_proj.weight",
        "model.layers.{idx}.self_attn.v_proj.bias",
        "model.layers.{idx}.self_attn.o_proj.weight",
        "model.layers.{idx}.post_attention_layernorm.weight",
        "model.layers.{idx}.mlp.gate_proj.weight",
        "model.layers.{idx}.mlp.up_proj.weight",
        "model.layers.{idx}.mlp.down_proj.weight",
    ],
    embed: &["model.embed_tokens.weight", "lm_head.weight"],
    num_layers_key: "num_hidden_layers",
};

/// GPT-2.
pub const GPT2: StaticArchitecture = StaticArchitecture {
    name: "GPT2LMHeadModel",
    pre: &["wte.weight", "wpe.weight"],
    post: &["ln_f.weight", "ln_f.bias"],
    layer: &[
        "h.{idx}.ln_1.weight",
        "h.{idx}.ln_1.bias",
        "h.{idx}.attn.c_attn.weight",
        "h.{idx}.attn.c_attn.bias",
        "h.{idx}.attn.c_proj.weight",
        "h.{idx}.attn.c_proj.bias",
        "h.{idx}.ln_2.weight",
        "h.{idx}.ln_2.bias",
        "h.{idx}.mlp.c_fc.weight",
        "h.{idx}.mlp.c_fc.bias",
        "h.{idx}.mlp.c_proj.weight",
        "h.{idx}.mlp.c_proj.bias",
    ],
    embed: &["wte.weight"],
    num_layers_key: "n_layer",
};

const KNOWN: &[&StaticArchitecture] = &[&LLAMA, &MISTRAL, &QWEN2, &GPT2];

/// Look up the architecture declared by a model's `config.json`.
pub fn get_architecture_info(config: &Value) -> Result<Arc<dyn ArchitectureInfo>> {
    let declared = config
        .get("architectures")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(Value::as_str)
        .ok_or_else(|| {
            MergeError::ArchitectureMismatch("config.json declares no architectures".to_string())
        })?;

    KNOWN
        .iter()
        .find(|a| a.name == declared)
        .map(|a| Arc::new((*a).clone()) as Arc<dyn ArchitectureInfo>)
        .ok_or_else(|| {
            MergeError::ArchitectureMismatch(format!("unsupported architecture {}", declared))
        })
}

/// Whether two architectures share a naming scheme.
pub fn same_architecture(a: &dyn ArchitectureInfo, b: &dyn ArchitectureInfo) -> bool {
    a.name() == b.name()
}
