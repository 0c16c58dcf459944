//! Tiny Llama-shaped checkpoints for end-to-end merge tests.

#![allow(dead_code)]

use std::path::Path;

use safetensors::tensor::TensorView;
use safetensors::Dtype;
use strata_merge::{format_layer_name, ArchitectureInfo, SafetensorsLoader, Tensor, WeightStore, LLAMA};

pub const HIDDEN: usize = 2;

pub const VOCAB: &[&str] = &["<unk>", "a", "b"];

/// Every weight name of a Llama model with `layers` layers.
pub fn weight_names(layers: usize) -> Vec<String> {
    let mut names = LLAMA.pre_weights();
    for idx in 0..layers {
        for template in LLAMA.layer_weight_formats() {
            names.push(format_layer_name(&template, idx));
        }
    }
    names.extend(LLAMA.post_weights());
    names
}

fn shape_of(name: &str, vocab: usize) -> Vec<usize> {
    if LLAMA.embed_weights().iter().any(|e| e == name) {
        vec![vocab, HIDDEN]
    } else if name.ends_with("norm.weight") {
        vec![HIDDEN]
    } else {
        vec![HIDDEN, HIDDEN]
    }
}

fn tokenizer_json(vocab: &[&str]) -> serde_json::Value {
    let ids: serde_json::Map<String, serde_json::Value> = vocab
        .iter()
        .enumerate()
        .map(|(i, tok)| (tok.to_string(), serde_json::Value::from(i)))
        .collect();
    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": ids, "unk_token": "<unk>" }
    })
}

/// Write a model whose element `i` of weight `name` is `value(name, i)`.
pub fn write_llama(
    dir: &Path,
    layers: usize,
    vocab: &[&str],
    dtype: Dtype,
    value: impl Fn(&str, usize) -> f32,
) {
    std::fs::create_dir_all(dir).unwrap();

    let config = serde_json::json!({
        "architectures": ["LlamaForCausalLM"],
        "model_type": "llama",
        "hidden_size": HIDDEN,
        "num_hidden_layers": layers,
        "vocab_size": vocab.len(),
        "torch_dtype": "float32",
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
    std::fs::write(dir.join("tokenizer.json"), tokenizer_json(vocab).to_string()).unwrap();
    std::fs::write(dir.join("tokenizer_config.json"), "{}").unwrap();

    let tensors: Vec<(String, Vec<usize>, Vec<u8>)> = weight_names(layers)
        .into_iter()
        .map(|name| {
            let shape = shape_of(&name, vocab.len());
            let values: Vec<f32> = (0..shape.iter().product::<usize>()).map(|i| value(&name, i)).collect();
            let data = Tensor::from_f32(&values, shape.clone(), dtype).unwrap().into_data();
            (name, shape, data)
        })
        .collect();
    let views: Vec<_> = tensors
        .iter()
        .map(|(name, shape, data)| {
            (name.as_str(), TensorView::new(dtype, shape.clone(), data).unwrap())
        })
        .collect();
    safetensors::serialize_to_file(views, &None, &dir.join("model.safetensors")).unwrap();
}

/// A float32 model with every element set to `value`.
pub fn constant_llama(dir: &Path, layers: usize, value: f32) {
    write_llama(dir, layers, VOCAB, Dtype::F32, |_, _| value);
}

/// Values of one output weight.
pub fn read_values(dir: &Path, name: &str) -> Vec<f32> {
    SafetensorsLoader::new(dir)
        .unwrap()
        .load_tensor(name)
        .unwrap()
        .to_f32_vec()
        .unwrap()
}

pub fn read_config(dir: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(dir.join("config.json")).unwrap()).unwrap()
}

pub fn assert_all_close(values: &[f32], expected: f32) {
    for v in values {
        assert!((v - expected).abs() < 1e-4, "expected {}, got {:?}", expected, values);
    }
}
