//! Folding LoRA adapters into base weights.
//!
//! An adapter stores a low-rank pair per target module: `lora_A` with shape
//! `[r, in]` and `lora_B` with shape `[out, r]`. Folding replaces the base
//! weight `W` with `W + (alpha / r) * B @ A`.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::loader::{SafetensorsLoader, WeightStore};
use crate::{MergeError, Result, ShardWriter};

/// Adapter weight file name.
pub const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";

/// Adapter config file name.
pub const ADAPTER_CONFIG: &str = "adapter_config.json";

/// Files copied from the base model next to the folded weights.
const CARRIED_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
];

#[derive(Debug, Clone, Deserialize)]
struct AdapterConfig {
    r: usize,
    #[serde(default)]
    lora_alpha: Option<f64>,
}

impl AdapterConfig {
    fn scale(&self) -> f32 {
        (self.lora_alpha.unwrap_or(self.r as f64) / self.r as f64) as f32
    }
}

#[derive(Debug, Default)]
struct LoraPair {
    a: Option<String>,
    b: Option<String>,
}

/// Map an adapter tensor name to (base weight name, is_a).
fn lora_target(name: &str) -> Option<(String, bool)> {
    let name = name.strip_prefix("base_model.model.").unwrap_or(name);
    let name = name.replace(".default.", ".");
    if let Some(module) = name.strip_suffix(".lora_A.weight") {
        Some((format!("{}.weight", module), true))
    } else {
        name.strip_suffix(".lora_B.weight")
            .map(|module| (format!("{}.weight", module), false))
    }
}

/// `w += scale * b @ a` with `w: [out, in]`, `b: [out, r]`, `a: [r, in]`.
fn add_low_rank(w: &mut [f32], b: &[f32], a: &[f32], out: usize, rank: usize, scale: f32) {
    let cols = a.len() / rank.max(1);
    for o in 0..out {
        let row = &mut w[o * cols..(o + 1) * cols];
        for k in 0..rank {
            let coeff = scale * b[o * rank + k];
            if coeff == 0.0 {
                continue;
            }
            let a_row = &a[k * cols..(k + 1) * cols];
            for (dst, &src) in row.iter_mut().zip(a_row) {
                *dst += coeff * src;
            }
        }
    }
}

/// Write `base` with the adapter in `adapter_dir` folded in to `out_dir`.
pub fn merge_adapter(
    base: &dyn WeightStore,
    base_dir: &Path,
    adapter_dir: &Path,
    out_dir: &Path,
) -> Result<()> {
    let config: AdapterConfig =
        serde_json::from_str(&std::fs::read_to_string(adapter_dir.join(ADAPTER_CONFIG))?)?;
    if config.r == 0 {
        return Err(MergeError::InvalidConfig("adapter rank is zero".to_string()));
    }
    let adapter = SafetensorsLoader::new(adapter_dir.join(ADAPTER_WEIGHTS))?;

    let mut pairs: HashMap<String, LoraPair> = HashMap::new();
    for name in adapter.tensor_names() {
        if let Some((target, is_a)) = lora_target(&name) {
            let pair = pairs.entry(target).or_default();
            if is_a {
                pair.a = Some(name);
            } else {
                pair.b = Some(name);
            }
        }
    }

    let writer = ShardWriter::new(out_dir, 5_000_000_000)?;
    let mut names = base.tensor_names();
    names.sort();
    let mut folded = 0;
    for name in &names {
        let tensor = base.load_tensor(name)?;
        let tensor = match pairs.get(name) {
            Some(LoraPair {
                a: Some(a_name),
                b: Some(b_name),
            }) => {
                let a = adapter.load_tensor(a_name)?;
                let b = adapter.load_tensor(b_name)?;
                let (out, cols) = match tensor.shape() {
                    [out, cols] => (*out, *cols),
                    other => {
                        return Err(MergeError::ShapeMismatch {
                            name: name.clone(),
                            expected: vec![config.r],
                            actual: other.to_vec(),
                        })
                    }
                };
                if a.shape() != [config.r, cols].as_slice()
                    || b.shape() != [out, config.r].as_slice()
                {
                    return Err(MergeError::ShapeMismatch {
                        name: name.clone(),
                        expected: vec![out, config.r, cols],
                        actual: [b.shape(), a.shape()].concat(),
                    });
                }
                let mut w = tensor.to_f32_vec()?;
                add_low_rank(
                    &mut w,
                    &b.to_f32_vec()?,
                    &a.to_f32_vec()?,
                    out,
                    config.r,
                    config.scale(),
                );
                debug!("Folded adapter into {}", name);
                folded += 1;
                tensor.with_values(&w)?
            }
            _ => tensor,
        };
        writer.save(name, tensor)?;
    }
    writer.finalize()?;

    for file in CARRIED_FILES {
        let src = base_dir.join(file);
        if src.exists() {
            std::fs::copy(&src, out_dir.join(file))?;
        }
    }

    info!("Folded adapter into {} of {} weights", folded, names.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::write_safetensors;

    #[test]
    fn test_lora_target_names() {
        assert_eq!(
            lora_target("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"),
            Some(("model.layers.0.self_attn.q_proj.weight".to_string(), true))
        );
        assert_eq!(
            lora_target("model.layers.1.mlp.up_proj.lora_B.default.weight"),
            Some(("model.layers.1.mlp.up_proj.weight".to_string(), false))
        );
        assert_eq!(lora_target("model.norm.weight"), None);
    }

    #[test]
    fn test_add_low_rank() {
        // w = 0 (2x2), b = [[1],[2]], a = [[3, 4]], scale 0.5
        let mut w = vec![0.0; 4];
        add_low_rank(&mut w, &[1.0, 2.0], &[3.0, 4.0], 2, 1, 0.5);
        assert_eq!(w, vec![1.5, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_merge_adapter_end_to_end() {
        let base_dir = tempfile::tempdir().unwrap();
        let adapter_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let out_dir = out.path().join("merged");

        write_safetensors(
            &base_dir.path().join("model.safetensors"),
            &[
                ("proj.weight", vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]),
                ("norm.weight", vec![2], vec![1.0, 1.0]),
            ],
        );
        std::fs::write(base_dir.path().join("config.json"), "{}").unwrap();
        write_safetensors(
            &adapter_dir.path().join(ADAPTER_WEIGHTS),
            &[
                ("base_model.model.proj.lora_A.weight", vec![1, 2], vec![1.0, 1.0]),
                ("base_model.model.proj.lora_B.weight", vec![2, 1], vec![1.0, 0.0]),
            ],
        );
        std::fs::write(
            adapter_dir.path().join(ADAPTER_CONFIG),
            r#"{"r": 1, "lora_alpha": 2}"#,
        )
        .unwrap();

        let base = SafetensorsLoader::new(base_dir.path()).unwrap();
        merge_adapter(&base, base_dir.path(), adapter_dir.path(), &out_dir).unwrap();

        let merged = SafetensorsLoader::new(&out_dir).unwrap();
        let w = merged.load_tensor("proj.weight").unwrap().to_f32_vec().unwrap();
        assert_eq!(w, vec![3.0, 2.0, 0.0, 1.0]);
        assert_eq!(
            merged.load_tensor("norm.weight").unwrap(),
            base.load_tensor("norm.weight").unwrap()
        );
        assert!(out_dir.join("config.json").exists());
    }
}
