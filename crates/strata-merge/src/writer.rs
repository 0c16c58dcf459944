//! Sharded safetensors output.
//!
//! Weights are buffered into the current shard until the next write would
//! push it past the size limit, at which point the shard is flushed to disk.
//! A weight larger than the limit gets a shard to itself. Finalization names
//! the shard files and writes `model.safetensors.index.json`.
//!
//! Weights saved with a plan position are appended in position order, so the
//! shard layout does not depend on which save finished first.

use parking_lot::Mutex;
use safetensors::tensor::TensorView;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{MergeError, Result, Tensor};

/// Name of the weight index written next to the shards.
pub const INDEX_FILE_NAME: &str = "model.safetensors.index.json";

/// One flushed shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    /// Final file name inside the output directory.
    pub file_name: String,
    /// Payload bytes of all weights in the shard.
    pub bytes: u64,
    /// Weight names stored in the shard.
    pub weights: Vec<String>,
}

/// Description of a finalized artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardManifest {
    /// Shards in write order.
    pub shards: Vec<ShardInfo>,
    /// Weight name to shard file name.
    pub weight_map: BTreeMap<String, String>,
    /// Sum of all payload bytes.
    pub total_size: u64,
}

impl ShardManifest {
    /// Number of weights written.
    pub fn weight_count(&self) -> usize {
        self.weight_map.len()
    }

    /// Number of shard files.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[derive(Serialize)]
struct IndexMetadata {
    total_size: u64,
}

#[derive(Serialize)]
struct IndexFile<'a> {
    metadata: IndexMetadata,
    weight_map: &'a BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct ShardState {
    pending: Vec<(String, Tensor)>,
    pending_bytes: u64,
    flushed: Vec<ShardInfo>,
    names: HashSet<String>,
    next_position: usize,
    early: BTreeMap<usize, (String, Tensor)>,
    finalized: bool,
}

/// Accumulates weights into size-bounded shards.
///
/// Safe to share between concurrent save tasks. Writes serialize on an
/// internal lock.
#[derive(Debug)]
pub struct ShardWriter {
    out_path: PathBuf,
    max_shard_size: u64,
    state: Mutex<ShardState>,
}

impl ShardWriter {
    /// Create a writer targeting `out_path`, creating the directory.
    pub fn new(out_path: impl AsRef<Path>, max_shard_size: u64) -> Result<Self> {
        let out_path = out_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&out_path)?;
        if max_shard_size == 0 {
            return Err(MergeError::InvalidConfig(
                "max shard size must be positive".to_string(),
            ));
        }

        Ok(Self {
            out_path,
            max_shard_size,
            state: Mutex::new(ShardState::default()),
        })
    }

    /// Output directory.
    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    /// Size limit per shard in bytes.
    pub fn max_shard_size(&self) -> u64 {
        self.max_shard_size
    }

    /// Add a weight to the current shard.
    pub fn save(&self, name: &str, tensor: Tensor) -> Result<()> {
        let mut state = self.state.lock();
        Self::claim(&mut state, name)?;
        self.append(&mut state, name.to_string(), tensor)
    }

    /// Add the weight at plan `position`.
    ///
    /// A weight arriving before all lower positions is held back until they
    /// have been written. Positions never saved are skipped at finalization.
    pub fn save_at(&self, position: usize, name: &str, tensor: Tensor) -> Result<()> {
        let mut state = self.state.lock();
        if position < state.next_position || state.early.contains_key(&position) {
            return Err(MergeError::DuplicateWeight(format!(
                "{} (position {})",
                name, position
            )));
        }
        Self::claim(&mut state, name)?;

        if position > state.next_position {
            debug!("Holding {} until position {} is written", name, state.next_position);
            state.early.insert(position, (name.to_string(), tensor));
            return Ok(());
        }

        self.append(&mut state, name.to_string(), tensor)?;
        state.next_position += 1;
        while let Some((name, tensor)) = {
            let next = state.next_position;
            state.early.remove(&next)
        } {
            self.append(&mut state, name, tensor)?;
            state.next_position += 1;
        }
        Ok(())
    }

    fn claim(state: &mut ShardState, name: &str) -> Result<()> {
        if state.finalized {
            return Err(MergeError::WriterFinalized);
        }
        if !state.names.insert(name.to_string()) {
            return Err(MergeError::DuplicateWeight(name.to_string()));
        }
        Ok(())
    }

    fn append(&self, state: &mut ShardState, name: String, tensor: Tensor) -> Result<()> {
        let size = tensor.nbytes() as u64;
        if !state.pending.is_empty() && state.pending_bytes + size > self.max_shard_size {
            self.flush(state)?;
        }

        debug!("Buffering {} ({} bytes)", name, size);
        state.pending.push((name, tensor));
        state.pending_bytes += size;
        Ok(())
    }

    /// Flush the remaining shard, name all shard files and write the index.
    ///
    /// Can be called once.
    pub fn finalize(&self) -> Result<ShardManifest> {
        let mut state = self.state.lock();
        if state.finalized {
            return Err(MergeError::WriterFinalized);
        }
        for (_, (name, tensor)) in std::mem::take(&mut state.early) {
            self.append(&mut state, name, tensor)?;
        }
        self.flush(&mut state)?;
        state.finalized = true;

        let total = state.flushed.len();
        let mut shards = Vec::with_capacity(total);
        let mut weight_map = BTreeMap::new();
        let mut total_size = 0;

        for (idx, shard) in state.flushed.drain(..).enumerate() {
            let file_name = if total == 1 {
                "model.safetensors".to_string()
            } else {
                format!("model-{:05}-of-{:05}.safetensors", idx + 1, total)
            };
            std::fs::rename(
                self.out_path.join(&shard.file_name),
                self.out_path.join(&file_name),
            )?;
            for weight in &shard.weights {
                weight_map.insert(weight.clone(), file_name.clone());
            }
            total_size += shard.bytes;
            shards.push(ShardInfo { file_name, ..shard });
        }

        let index = IndexFile {
            metadata: IndexMetadata { total_size },
            weight_map: &weight_map,
        };
        std::fs::write(
            self.out_path.join(INDEX_FILE_NAME),
            serde_json::to_string_pretty(&index)?,
        )?;

        info!(
            "Wrote {} weights in {} shard(s), {} bytes",
            weight_map.len(),
            shards.len(),
            total_size
        );

        Ok(ShardManifest {
            shards,
            weight_map,
            total_size,
        })
    }

    fn flush(&self, state: &mut ShardState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }

        let file_name = format!("model-{:05}.safetensors", state.flushed.len() + 1);
        let path = self.out_path.join(&file_name);
        info!("Writing shard {:?} ({} bytes)", path, state.pending_bytes);

        let pending = std::mem::take(&mut state.pending);
        let views = pending
            .iter()
            .map(|(name, t)| {
                TensorView::new(t.dtype(), t.shape().to_vec(), t.data())
                    .map(|view| (name.as_str(), view))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
        safetensors::serialize_to_file(views, &Some(metadata), &path)?;

        state.flushed.push(ShardInfo {
            file_name,
            bytes: state.pending_bytes,
            weights: pending.into_iter().map(|(name, _)| name).collect(),
        });
        state.pending_bytes = 0;
        Ok(())
    }
}
