//! End-to-end merges over tiny on-disk checkpoints.

mod common;

use std::path::Path;

use common::*;
use safetensors::Dtype;
use strata_merge::{
    run_merge, MergeBuilder, MergeConfig, MergeError, MergeMethodConfig, MergeOptions,
    MergeProgress, SafetensorsLoader, WeightStore, INDEX_FILE_NAME,
};
use tempfile::TempDir;

fn model_dir(root: &TempDir, name: &str) -> String {
    root.path().join(name).to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_passthrough_copies_weights_unchanged() {
    let root = tempfile::tempdir().unwrap();
    let src = model_dir(&root, "src");
    write_llama(Path::new(&src), 2, VOCAB, Dtype::F16, |name, i| {
        name.len() as f32 * 0.25 + i as f32
    });
    let out = root.path().join("out");

    let report = MergeBuilder::new()
        .method(MergeMethodConfig::Passthrough)
        .add_model(src.as_str())
        .run(&out, &MergeOptions::default())
        .await
        .unwrap();

    assert_eq!(report.output_layers, 2);
    assert_eq!(report.manifest.weight_count(), weight_names(2).len());

    let source = SafetensorsLoader::new(&src).unwrap();
    let merged = SafetensorsLoader::new(&out).unwrap();
    for name in weight_names(2) {
        let a = source.load_tensor(&name).unwrap();
        let b = merged.load_tensor(&name).unwrap();
        assert_eq!(b.dtype(), Dtype::F16, "{}", name);
        assert_eq!(a.shape(), b.shape(), "{}", name);
        assert_eq!(a.data(), b.data(), "{}", name);
    }
}

#[tokio::test]
async fn test_slices_stack_into_deeper_model() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    let b = model_dir(&root, "b");
    constant_llama(Path::new(&a), 2, 1.0);
    constant_llama(Path::new(&b), 2, 2.0);
    let out = root.path().join("out");

    let yaml = format!(
        r#"
merge_method: passthrough
slices:
  - sources:
      - model: "{a}"
        layer_range: [0, 2]
  - sources:
      - model: "{b}"
        layer_range: [0, 2]
"#
    );
    let config = MergeConfig::from_yaml(&yaml).unwrap();
    let report = run_merge(&config, &out, &MergeOptions::default()).await.unwrap();

    assert_eq!(report.output_layers, 4);
    assert_eq!(report.manifest.weight_count(), weight_names(4).len());
    assert_all_close(&read_values(&out, "model.embed_tokens.weight"), 1.0);
    assert_all_close(&read_values(&out, "model.layers.1.self_attn.q_proj.weight"), 1.0);
    assert_all_close(&read_values(&out, "model.layers.2.self_attn.q_proj.weight"), 2.0);
    assert_all_close(&read_values(&out, "model.layers.3.mlp.down_proj.weight"), 2.0);
    assert_all_close(&read_values(&out, "lm_head.weight"), 2.0);
    assert_eq!(read_config(&out)["num_hidden_layers"], 4);
}

#[tokio::test]
async fn test_same_model_stacked_twice_repeats_layers() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    write_llama(Path::new(&a), 2, VOCAB, Dtype::F32, |name, i| {
        name.len() as f32 + 0.5 * i as f32
    });
    let out = root.path().join("out");

    let yaml = format!(
        r#"
merge_method: passthrough
slices:
  - sources:
      - model: "{a}"
        layer_range: [0, 2]
  - sources:
      - model: "{a}"
        layer_range: [0, 2]
"#
    );
    let config = MergeConfig::from_yaml(&yaml).unwrap();
    let report = run_merge(&config, &out, &MergeOptions::default()).await.unwrap();
    assert_eq!(report.output_layers, 4);

    for idx in 0..2 {
        for template in ["model.layers.{}.self_attn.o_proj.weight", "model.layers.{}.input_layernorm.weight"] {
            let lower = read_values(&out, &template.replace("{}", &idx.to_string()));
            let upper = read_values(&out, &template.replace("{}", &(idx + 2).to_string()));
            assert_eq!(lower, upper);
        }
    }
}

#[tokio::test]
async fn test_linear_weighted_average() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    let b = model_dir(&root, "b");
    constant_llama(Path::new(&a), 1, 1.0);
    constant_llama(Path::new(&b), 1, 2.0);
    let out = root.path().join("out");

    let mut events = Vec::new();
    let config = MergeBuilder::new()
        .method(MergeMethodConfig::Linear)
        .add_weighted_model(a.as_str(), 0.6)
        .add_weighted_model(b.as_str(), 0.4)
        .build()
        .unwrap();
    let report = strata_merge::run_merge_with_progress(
        &config,
        &out,
        &MergeOptions::default(),
        |event| events.push(event),
    )
    .await
    .unwrap();

    for name in weight_names(1) {
        assert_all_close(&read_values(&out, &name), 1.4);
    }

    let saved = events
        .iter()
        .filter(|e| matches!(e, MergeProgress::Saved { .. }))
        .count();
    assert_eq!(saved, report.manifest.weight_count());
    assert!(matches!(events.first(), Some(MergeProgress::Planned { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, MergeProgress::Finalized { shards: 1 })));
}

#[tokio::test]
async fn test_slerp_endpoints() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    let b = model_dir(&root, "b");
    constant_llama(Path::new(&a), 1, 1.0);
    constant_llama(Path::new(&b), 1, 3.0);

    for (t, expected) in [(0.0, 1.0), (1.0, 3.0)] {
        let out = root.path().join(format!("out-{}", t));
        MergeBuilder::new()
            .method(MergeMethodConfig::Slerp)
            .base_model(a.as_str())
            .add_model(a.as_str())
            .add_model(b.as_str())
            .t(t)
            .run(&out, &MergeOptions::default())
            .await
            .unwrap();

        assert_all_close(&read_values(&out, "model.layers.0.self_attn.k_proj.weight"), expected);
        assert_all_close(&read_values(&out, "model.norm.weight"), expected);
    }
}

#[tokio::test]
async fn test_slice_length_mismatch_fails_before_writing() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    let b = model_dir(&root, "b");
    constant_llama(Path::new(&a), 2, 1.0);
    constant_llama(Path::new(&b), 3, 2.0);
    let out = root.path().join("out");

    let yaml = format!(
        r#"
merge_method: linear
slices:
  - sources:
      - model: "{a}"
        layer_range: [0, 2]
        parameters:
          weight: 1.0
      - model: "{b}"
        layer_range: [0, 3]
        parameters:
          weight: 1.0
"#
    );
    let config = MergeConfig::from_yaml(&yaml).unwrap();
    let err = run_merge(&config, &out, &MergeOptions::default())
        .await
        .unwrap_err();

    match err {
        MergeError::SliceLengthMismatch { lengths } => assert_eq!(lengths, vec![2, 3]),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!out.exists());
}

#[tokio::test]
async fn test_small_shard_limit_writes_index() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    constant_llama(Path::new(&a), 2, 0.5);
    let out = root.path().join("out");

    let options = MergeOptions {
        max_shard_size: 64,
        ..Default::default()
    };
    let report = MergeBuilder::new()
        .method(MergeMethodConfig::Passthrough)
        .add_model(a.as_str())
        .run(&out, &options)
        .await
        .unwrap();

    assert!(report.manifest.shard_count() > 1);
    for shard in &report.manifest.shards {
        assert!(out.join(&shard.file_name).is_file());
        assert!(shard.bytes <= 64 || shard.weights.len() == 1);
    }

    let index: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join(INDEX_FILE_NAME)).unwrap())
            .unwrap();
    let weight_map = index["weight_map"].as_object().unwrap();
    assert_eq!(weight_map.len(), weight_names(2).len());
    assert_eq!(
        index["metadata"]["total_size"].as_u64(),
        Some(report.manifest.total_size)
    );

    assert_all_close(&read_values(&out, "model.layers.1.mlp.up_proj.weight"), 0.5);
}

#[tokio::test]
async fn test_missing_model_is_a_load_error() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    constant_llama(Path::new(&a), 1, 1.0);
    let missing = model_dir(&root, "missing");

    let err = MergeBuilder::new()
        .method(MergeMethodConfig::Linear)
        .add_weighted_model(a.as_str(), 1.0)
        .add_weighted_model(missing.as_str(), 1.0)
        .run(root.path().join("out"), &MergeOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MergeError::ModelLoad { .. }), "{}", err);
}

#[tokio::test]
async fn test_union_tokenizer_aligns_embeddings() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    let b = model_dir(&root, "b");
    // Embedding rows hold `scale * (token id + 1)`.
    write_llama(Path::new(&a), 1, &["<unk>", "a", "b"], Dtype::F32, |_, i| {
        (i / HIDDEN + 1) as f32
    });
    write_llama(Path::new(&b), 1, &["<unk>", "a", "c"], Dtype::F32, |_, i| {
        10.0 * (i / HIDDEN + 1) as f32
    });
    let out = root.path().join("out");

    let report = MergeBuilder::new()
        .method(MergeMethodConfig::Linear)
        .add_weighted_model(a.as_str(), 1.0)
        .add_weighted_model(b.as_str(), 1.0)
        .tokenizer("union")
        .run(&out, &MergeOptions::default())
        .await
        .unwrap();

    assert_eq!(report.vocab_size, Some(4));
    assert!(report.tokenizer_written);
    assert_eq!(read_config(&out)["vocab_size"], 4);

    let tokenizer = tokenizers::Tokenizer::from_file(out.join("tokenizer.json")).unwrap();
    assert_eq!(tokenizer.token_to_id("c"), Some(3));

    let embed = read_values(&out, "model.embed_tokens.weight");
    assert_eq!(embed.len(), 4 * HIDDEN);
    // <unk> and "a" come from both models, "b" only from a, "c" only from b.
    assert_all_close(&embed[0..2], 5.5);
    assert_all_close(&embed[2..4], 11.0);
    assert_all_close(&embed[4..6], 3.0);
    assert_all_close(&embed[6..8], 30.0);
}

/// Two linearly merged models whose embedding rows hold `scale * (token id + 1)`.
fn embedding_pair(root: &TempDir) -> (String, String) {
    let a = model_dir(root, "a");
    let b = model_dir(root, "b");
    write_llama(Path::new(&a), 1, VOCAB, Dtype::F32, |_, i| (i / HIDDEN + 1) as f32);
    write_llama(Path::new(&b), 1, VOCAB, Dtype::F32, |_, i| {
        10.0 * (i / HIDDEN + 1) as f32
    });
    (a, b)
}

async fn union_merge(a: &str, b: &str, out: &Path) -> strata_merge::MergeReport {
    MergeBuilder::new()
        .method(MergeMethodConfig::Linear)
        .add_weighted_model(a, 1.0)
        .add_weighted_model(b, 1.0)
        .tokenizer("union")
        .run(out, &MergeOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_union_falls_back_to_donor_tokenizer() {
    let root = tempfile::tempdir().unwrap();
    let (a, b) = embedding_pair(&root);
    std::fs::remove_file(Path::new(&b).join("tokenizer.json")).unwrap();
    let out = root.path().join("out");

    let report = union_merge(&a, &b, &out).await;

    assert!(report.tokenizer_written);
    assert_eq!(report.vocab_size, Some(VOCAB.len()));
    let tokenizer = tokenizers::Tokenizer::from_file(out.join("tokenizer.json")).unwrap();
    let donor = tokenizers::Tokenizer::from_file(Path::new(&a).join("tokenizer.json")).unwrap();
    assert_eq!(tokenizer.get_vocab(true), donor.get_vocab(true));

    // Rows are merged by position, as without a tokenizer setting.
    let embed = read_values(&out, "model.embed_tokens.weight");
    assert_eq!(embed.len(), VOCAB.len() * HIDDEN);
    assert_all_close(&embed[0..2], 5.5);
    assert_all_close(&embed[2..4], 11.0);
    assert_all_close(&embed[4..6], 16.5);
}

#[tokio::test]
async fn test_union_without_any_tokenizer_writes_none() {
    let root = tempfile::tempdir().unwrap();
    let (a, b) = embedding_pair(&root);
    for dir in [&a, &b] {
        std::fs::remove_file(Path::new(dir).join("tokenizer.json")).unwrap();
    }
    let out = root.path().join("out");

    let report = union_merge(&a, &b, &out).await;

    assert!(!report.tokenizer_written);
    assert_eq!(report.vocab_size, None);
    assert!(!out.join("tokenizer.json").exists());
    assert_eq!(read_config(&out)["vocab_size"], VOCAB.len());
    assert_all_close(&read_values(&out, "model.norm.weight"), 5.5);
}

#[tokio::test]
async fn test_donor_tokenizer_copied_without_tokenizer_config() {
    let root = tempfile::tempdir().unwrap();
    let a = model_dir(&root, "a");
    let b = model_dir(&root, "b");
    constant_llama(Path::new(&a), 1, 1.0);
    constant_llama(Path::new(&b), 1, 2.0);
    let out = root.path().join("out");

    let report = MergeBuilder::new()
        .method(MergeMethodConfig::TaskArithmetic)
        .base_model(b.as_str())
        .add_weighted_model(a.as_str(), 1.0)
        .run(&out, &MergeOptions::default())
        .await
        .unwrap();

    assert!(report.tokenizer_written);
    assert_eq!(report.vocab_size, None);
    assert_eq!(
        std::fs::read(out.join("tokenizer.json")).unwrap(),
        std::fs::read(Path::new(&b).join("tokenizer.json")).unwrap()
    );
    assert!(out.join("tokenizer_config.json").is_file());

    let skipped = root.path().join("no-tokenizer");
    let options = MergeOptions {
        copy_tokenizer: false,
        ..Default::default()
    };
    let report = MergeBuilder::new()
        .method(MergeMethodConfig::Passthrough)
        .add_model(a.as_str())
        .run(&skipped, &options)
        .await
        .unwrap();
    assert!(!report.tokenizer_written);
    assert!(!skipped.join("tokenizer.json").exists());
}

#[tokio::test]
async fn test_seeded_dare_is_reproducible() {
    let root = tempfile::tempdir().unwrap();
    let base = model_dir(&root, "base");
    let tuned = model_dir(&root, "tuned");
    constant_llama(Path::new(&base), 1, 0.0);
    write_llama(Path::new(&tuned), 1, VOCAB, Dtype::F32, |_, i| 1.0 + i as f32);

    let options = MergeOptions {
        random_seed: Some(42),
        ..Default::default()
    };
    let mut outputs = Vec::new();
    for run in 0..2 {
        let out = root.path().join(format!("out-{}", run));
        MergeBuilder::new()
            .method(MergeMethodConfig::DareTies)
            .base_model(base.as_str())
            .add_weighted_model(tuned.as_str(), 1.0)
            .density(0.5)
            .run(&out, &options)
            .await
            .unwrap();
        outputs.push(out);
    }

    for name in weight_names(1) {
        assert_eq!(
            read_values(&outputs[0], &name),
            read_values(&outputs[1], &name),
            "{}",
            name
        );
    }
}
