//! Weight loading.
//!
//! Source models are opened through a [`LoaderCache`], which resolves each
//! [`ModelReference`] to a directory once (downloading from the Hub or
//! merging an adapter as needed) and keeps one [`WeightStore`] per model.
//!
//! Two store flavours exist: [`SafetensorsLoader`] reads every file into
//! memory up front, [`MmapLoader`] maps the files and copies a weight out
//! only when it is requested.

use parking_lot::Mutex;
use safetensors::SafeTensors;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapter;
use crate::plan::ModelCatalog;
use crate::{MergeError, MergeOptions, ModelReference, ModelSource, Result, Tensor, INDEX_FILE_NAME};

/// Read access to the weights of one model.
pub trait WeightStore: Send + Sync {
    /// Get the names of all tensors in the model.
    fn tensor_names(&self) -> Vec<String>;

    /// Load a tensor by name.
    fn load_tensor(&self, name: &str) -> Result<Tensor>;

    /// Get the shape of a tensor without loading it.
    fn tensor_shape(&self, name: &str) -> Result<Vec<usize>>;

    /// Get the dtype of a tensor.
    fn tensor_dtype(&self, name: &str) -> Result<safetensors::Dtype>;

    /// Whether the model has this tensor.
    fn contains(&self, name: &str) -> bool {
        self.tensor_shape(name).is_ok()
    }
}

fn safetensor_files(path: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if path.is_file() && path.extension().is_some_and(|e| e == "safetensors") {
        files.push(path.to_path_buf());
    } else if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let file_path = entry?.path();
            let is_weights = file_path.extension().is_some_and(|e| e == "safetensors");
            let is_adapter = file_path
                .file_name()
                .is_some_and(|n| n == adapter::ADAPTER_WEIGHTS);
            if is_weights && !is_adapter {
                files.push(file_path);
            }
        }
    }

    if files.is_empty() {
        return Err(MergeError::model_load(
            path.display(),
            "No safetensors files found",
        ));
    }
    files.sort();
    Ok(files)
}

/// Loader that keeps every safetensors file in memory.
pub struct SafetensorsLoader {
    path: PathBuf,
    files: Vec<(PathBuf, Vec<u8>)>,
    tensor_to_file: HashMap<String, usize>,
}

impl fmt::Debug for SafetensorsLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetensorsLoader")
            .field("path", &self.path)
            .field("files", &self.files.len())
            .field("tensors", &self.tensor_to_file.len())
            .finish()
    }
}

impl SafetensorsLoader {
    /// Read a model directory or a single safetensors file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let paths = safetensor_files(&path)?;
        info!("Loading {} safetensors files from {:?}", paths.len(), path);

        let mut files = Vec::with_capacity(paths.len());
        let mut tensor_to_file = HashMap::new();
        for (idx, file_path) in paths.into_iter().enumerate() {
            debug!("Indexing {:?}", file_path);
            let data = std::fs::read(&file_path)?;
            let tensors = SafeTensors::deserialize(&data)?;
            for name in tensors.names() {
                tensor_to_file.insert(name.to_string(), idx);
            }
            files.push((file_path, data));
        }

        info!("Indexed {} tensors", tensor_to_file.len());
        Ok(Self {
            path,
            files,
            tensor_to_file,
        })
    }

    /// Get the model path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn view(&self, name: &str) -> Result<safetensors::tensor::TensorView<'_>> {
        let file_idx = self
            .tensor_to_file
            .get(name)
            .ok_or_else(|| MergeError::TensorNotFound(name.to_string()))?;
        let (_, data) = &self.files[*file_idx];
        Ok(SafeTensors::deserialize(data)?.tensor(name)?)
    }
}

impl WeightStore for SafetensorsLoader {
    fn tensor_names(&self) -> Vec<String> {
        self.tensor_to_file.keys().cloned().collect()
    }

    fn load_tensor(&self, name: &str) -> Result<Tensor> {
        let view = self.view(name)?;
        Tensor::from_bytes(view.dtype(), view.shape().to_vec(), view.data().to_vec())
    }

    fn tensor_shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.view(name)?.shape().to_vec())
    }

    fn tensor_dtype(&self, name: &str) -> Result<safetensors::Dtype> {
        Ok(self.view(name)?.dtype())
    }

    fn contains(&self, name: &str) -> bool {
        self.tensor_to_file.contains_key(name)
    }
}

#[derive(Debug, Clone)]
struct TensorLocation {
    file_idx: usize,
    offset: usize,
    len: usize,
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
}

/// Memory-mapped loader. Weights are copied out of the mapping on request.
#[derive(Debug)]
pub struct MmapLoader {
    path: PathBuf,
    mmaps: Vec<(PathBuf, memmap2::Mmap)>,
    tensor_info: HashMap<String, TensorLocation>,
}

impl MmapLoader {
    /// Map a model directory or a single safetensors file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let paths = safetensor_files(&path)?;
        info!("Memory-mapping {} safetensors files from {:?}", paths.len(), path);

        let mut mmaps = Vec::with_capacity(paths.len());
        let mut tensor_info = HashMap::new();
        for (idx, file_path) in paths.into_iter().enumerate() {
            debug!("Memory-mapping {:?}", file_path);
            let file = std::fs::File::open(&file_path)?;
            // SAFETY: The file is opened read-only and the mapping lives as
            // long as this loader.
            #[allow(unsafe_code)]
            let mmap = unsafe { memmap2::Mmap::map(&file)? };

            let tensors = SafeTensors::deserialize(&mmap)?;
            let base_ptr = mmap.as_ptr() as usize;
            for name in tensors.names() {
                let tensor = tensors.tensor(name)?;
                let data = tensor.data();
                tensor_info.insert(
                    name.to_string(),
                    TensorLocation {
                        file_idx: idx,
                        offset: data.as_ptr() as usize - base_ptr,
                        len: data.len(),
                        dtype: tensor.dtype(),
                        shape: tensor.shape().to_vec(),
                    },
                );
            }
            mmaps.push((file_path, mmap));
        }

        info!("Indexed {} tensors", tensor_info.len());
        Ok(Self {
            path,
            mmaps,
            tensor_info,
        })
    }

    /// Get the model path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn location(&self, name: &str) -> Result<&TensorLocation> {
        self.tensor_info
            .get(name)
            .ok_or_else(|| MergeError::TensorNotFound(name.to_string()))
    }
}

impl WeightStore for MmapLoader {
    fn tensor_names(&self) -> Vec<String> {
        self.tensor_info.keys().cloned().collect()
    }

    fn load_tensor(&self, name: &str) -> Result<Tensor> {
        let loc = self.location(name)?;
        let (_, mmap) = &self.mmaps[loc.file_idx];
        let data = mmap[loc.offset..loc.offset + loc.len].to_vec();
        Tensor::from_bytes(loc.dtype, loc.shape.clone(), data)
    }

    fn tensor_shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.location(name)?.shape.clone())
    }

    fn tensor_dtype(&self, name: &str) -> Result<safetensors::Dtype> {
        Ok(self.location(name)?.dtype)
    }

    fn contains(&self, name: &str) -> bool {
        self.tensor_info.contains_key(name)
    }
}

/// Non-weight files fetched alongside a hub model.
const AUX_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
];

fn hub_repo(
    repo_id: &str,
    revision: Option<&str>,
    cache_dir: Option<&Path>,
) -> Result<hf_hub::api::sync::ApiRepo> {
    let mut builder = hf_hub::api::sync::ApiBuilder::new();
    if let Some(dir) = cache_dir {
        builder = builder.with_cache_dir(dir.to_path_buf());
    }
    let api = builder.build()?;
    Ok(match revision {
        Some(rev) => api.repo(hf_hub::Repo::with_revision(
            repo_id.to_string(),
            hf_hub::RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(repo_id.to_string()),
    })
}

fn parent_dir(file: &Path) -> Result<PathBuf> {
    file.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| MergeError::model_load(file.display(), "downloaded file has no parent"))
}

/// Resolve a source to a local directory, downloading hub models.
pub fn resolve_source(source: &ModelSource, cache_dir: Option<&Path>) -> Result<PathBuf> {
    match source {
        ModelSource::Local(path) => {
            if !path.exists() {
                return Err(MergeError::model_load(path.display(), "path does not exist"));
            }
            Ok(path.clone())
        }
        ModelSource::Hub { repo_id, revision } => {
            info!("Downloading model from Hub: {}", repo_id);
            let repo = hub_repo(repo_id, revision.as_deref(), cache_dir)?;
            let siblings = repo.info()?.siblings;

            let weights: Vec<_> = siblings
                .iter()
                .filter(|f| f.rfilename.ends_with(".safetensors"))
                .collect();
            if weights.is_empty() {
                return Err(MergeError::model_load(
                    repo_id,
                    "No safetensors files found in repo",
                ));
            }

            let mut model_dir = None;
            for file in &weights {
                let path = repo.get(&file.rfilename)?;
                if model_dir.is_none() {
                    model_dir = Some(parent_dir(&path)?);
                }
            }
            for aux in AUX_FILES {
                if siblings.iter().any(|f| f.rfilename == *aux) {
                    repo.get(aux)?;
                }
            }

            model_dir.ok_or_else(|| MergeError::model_load(repo_id, "nothing downloaded"))
        }
    }
}

/// Resolve an adapter location, downloading hub adapters.
pub fn resolve_adapter(location: &str, cache_dir: Option<&Path>) -> Result<PathBuf> {
    match ModelSource::parse(location, None) {
        ModelSource::Local(path) => {
            if !path.join(adapter::ADAPTER_WEIGHTS).exists() {
                return Err(MergeError::model_load(
                    location,
                    format!("missing {}", adapter::ADAPTER_WEIGHTS),
                ));
            }
            Ok(path)
        }
        ModelSource::Hub { repo_id, revision } => {
            info!("Downloading adapter from Hub: {}", repo_id);
            let repo = hub_repo(&repo_id, revision.as_deref(), cache_dir)?;
            repo.get(adapter::ADAPTER_CONFIG)?;
            parent_dir(&repo.get(adapter::ADAPTER_WEIGHTS)?)
        }
    }
}

/// How the cache opens models.
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Memory-map weights instead of reading them up front.
    pub lazy: bool,
    /// Accept models whose config references custom code.
    pub trust_remote_code: bool,
    /// Hub download cache.
    pub hub_cache_dir: Option<PathBuf>,
    /// Where adapter-merged models are materialized.
    pub adapter_cache_dir: Option<PathBuf>,
}

impl From<&MergeOptions> for LoaderOptions {
    fn from(options: &MergeOptions) -> Self {
        Self {
            lazy: options.lazy_loading,
            trust_remote_code: options.trust_remote_code,
            hub_cache_dir: options.hub_cache_dir.clone(),
            adapter_cache_dir: options.adapter_cache_dir.clone(),
        }
    }
}

#[derive(Default)]
struct CacheEntry {
    dir: Mutex<Option<PathBuf>>,
    store: Mutex<Option<Arc<dyn WeightStore>>>,
    config: Mutex<Option<Value>>,
}

/// One open store per model, shared by all tasks of a run.
///
/// Concurrent requests for the same model wait on a per-model lock, so each
/// model is resolved and opened once.
pub struct LoaderCache {
    options: LoaderOptions,
    entries: Mutex<HashMap<ModelReference, Arc<CacheEntry>>>,
    opened: AtomicUsize,
}

impl fmt::Debug for LoaderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderCache")
            .field("options", &self.options)
            .field("models", &self.entries.lock().len())
            .field("opened", &self.open_count())
            .finish()
    }
}

impl LoaderCache {
    /// Empty cache.
    pub fn new(options: LoaderOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
            opened: AtomicUsize::new(0),
        }
    }

    /// Options in effect.
    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Number of stores opened so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn entry(&self, model: &ModelReference) -> Arc<CacheEntry> {
        Arc::clone(self.entries.lock().entry(model.clone()).or_default())
    }

    /// Register an already open store, bypassing resolution.
    pub fn insert(
        &self,
        model: ModelReference,
        dir: Option<PathBuf>,
        store: Arc<dyn WeightStore>,
    ) {
        let entry = self.entry(&model);
        *entry.dir.lock() = dir;
        *entry.store.lock() = Some(store);
    }

    /// Local directory holding the model, resolving it on first use.
    pub fn model_dir(&self, model: &ModelReference) -> Result<PathBuf> {
        let entry = self.entry(model);
        let mut dir = entry.dir.lock();
        if let Some(dir) = dir.as_ref() {
            return Ok(dir.clone());
        }

        let resolved = match &model.adapter {
            Some(location) => self.materialize_adapter(model, location),
            None => resolve_source(&model.source(), self.options.hub_cache_dir.as_deref()),
        }
        .map_err(|e| match e {
            e @ MergeError::ModelLoad { .. } => e,
            other => MergeError::model_load(model, other),
        })?;

        *dir = Some(resolved.clone());
        Ok(resolved)
    }

    /// Open store for a model.
    pub fn get(&self, model: &ModelReference) -> Result<Arc<dyn WeightStore>> {
        let entry = self.entry(model);
        let mut store = entry.store.lock();
        if let Some(store) = store.as_ref() {
            return Ok(Arc::clone(store));
        }

        let dir = self.model_dir(model)?;
        let opened: Arc<dyn WeightStore> = if self.options.lazy {
            Arc::new(MmapLoader::new(&dir).map_err(|e| MergeError::model_load(model, e))?)
        } else {
            Arc::new(SafetensorsLoader::new(&dir).map_err(|e| MergeError::model_load(model, e))?)
        };
        self.opened.fetch_add(1, Ordering::SeqCst);
        *store = Some(Arc::clone(&opened));
        Ok(opened)
    }

    /// Load one weight of a model.
    pub fn load_tensor(&self, model: &ModelReference, name: &str) -> Result<Tensor> {
        self.get(model)?.load_tensor(name).map_err(|e| match e {
            MergeError::TensorNotFound(name) => {
                MergeError::TensorNotFound(format!("{} in {}", name, model))
            }
            other => other,
        })
    }

    /// Parsed `config.json` of a model.
    pub fn model_config(&self, model: &ModelReference) -> Result<Value> {
        let entry = self.entry(model);
        let mut config = entry.config.lock();
        if let Some(config) = config.as_ref() {
            return Ok(config.clone());
        }

        let path = self.model_dir(model)?.join("config.json");
        let text = std::fs::read_to_string(&path)
            .map_err(|e| MergeError::model_load(model, format!("{}: {}", path.display(), e)))?;
        let value: Value = serde_json::from_str(&text)?;
        if value.get("auto_map").is_some() && !self.options.trust_remote_code {
            return Err(MergeError::model_load(
                model,
                "config requires custom code; enable trust_remote_code to load it",
            ));
        }

        *config = Some(value.clone());
        Ok(value)
    }

    /// Open every model, reporting the first one that fails.
    pub fn warm_up(&self, models: &[ModelReference]) -> Result<()> {
        for model in models {
            info!("Opening {}", model);
            self.get(model)?;
        }
        Ok(())
    }

    fn materialize_adapter(&self, model: &ModelReference, location: &str) -> Result<PathBuf> {
        let root = self
            .options
            .adapter_cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join("strata").join("adapters")))
            .ok_or_else(|| {
                MergeError::InvalidConfig("no adapter cache directory available".to_string())
            })?;
        let out = root.join(model.cache_key());
        if out.join(INDEX_FILE_NAME).exists() {
            info!("Reusing merged adapter at {:?}", out);
            return Ok(out);
        }

        let base_model = model.base();
        let base_dir = self.model_dir(&base_model)?;
        let base = self.get(&base_model)?;
        let adapter_dir = resolve_adapter(location, self.options.hub_cache_dir.as_deref())?;

        info!("Merging adapter {} into {}", location, base_model);
        let staging = root.join(format!("{}.partial", model.cache_key()));
        if staging.exists() {
            warn!("Removing stale adapter staging directory {:?}", staging);
            std::fs::remove_dir_all(&staging)?;
        }
        adapter::merge_adapter(base.as_ref(), &base_dir, &adapter_dir, &staging)?;
        std::fs::rename(&staging, &out)?;
        Ok(out)
    }
}

impl ModelCatalog for LoaderCache {
    fn model_config(&self, model: &ModelReference) -> Result<Value> {
        LoaderCache::model_config(self, model)
    }
}
