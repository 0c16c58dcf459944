//! Model references.
//!
//! A reference names a source model by location, with an optional revision
//! and an optional adapter to fold into it before merging. The textual form
//! is `location[@revision][+adapter]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Immutable identity of one source model.
///
/// Equality is structural, so two references that spell the same location,
/// revision and adapter share one loader cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ModelReference {
    /// Local path or hub repository id.
    pub path: String,
    /// Branch, tag or commit for hub models.
    pub revision: Option<String>,
    /// Adapter (local path or hub id) to merge into the weights first.
    pub adapter: Option<String>,
}

impl ModelReference {
    /// Reference a model by location only.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            revision: None,
            adapter: None,
        }
    }

    /// Parse `location[@revision][+adapter]`.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let (base, adapter) = match s.split_once('+') {
            Some((base, adapter)) if !adapter.is_empty() => (base, Some(adapter.to_string())),
            _ => (s, None),
        };

        // An existing local path never carries a revision, even if it contains '@'.
        let (path, revision) = if Path::new(base).exists() {
            (base.to_string(), None)
        } else {
            match base.rsplit_once('@') {
                Some((path, rev)) if !path.is_empty() && !rev.is_empty() => {
                    (path.to_string(), Some(rev.to_string()))
                }
                _ => (base.to_string(), None),
            }
        };

        Self {
            path,
            revision,
            adapter,
        }
    }

    /// Attach an adapter to this reference.
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Pin a revision.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// The same model without its adapter.
    pub fn base(&self) -> ModelReference {
        Self {
            path: self.path.clone(),
            revision: self.revision.clone(),
            adapter: None,
        }
    }

    /// Where the base weights come from.
    pub fn source(&self) -> ModelSource {
        ModelSource::parse(&self.path, self.revision.clone())
    }

    /// File-system safe name, used for adapter merge cache directories.
    pub fn cache_key(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        if let Some(rev) = &self.revision {
            write!(f, "@{}", rev)?;
        }
        if let Some(adapter) = &self.adapter {
            write!(f, "+{}", adapter)?;
        }
        Ok(())
    }
}

impl From<String> for ModelReference {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&str> for ModelReference {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<ModelReference> for String {
    fn from(r: ModelReference) -> Self {
        r.to_string()
    }
}

/// A location that can be resolved to a directory of weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Local path to model directory or file.
    Local(PathBuf),
    /// HuggingFace Hub repository ID.
    Hub {
        /// Repository ID (e.g., "meta-llama/Llama-2-7b").
        repo_id: String,
        /// Optional revision (branch, tag, or commit).
        revision: Option<String>,
    },
}

impl ModelSource {
    /// Classify a location string.
    /// If it looks like a path, treat as local. Otherwise, treat as Hub repo.
    pub fn parse(s: &str, revision: Option<String>) -> Self {
        let path = Path::new(s);
        if path.exists() {
            return Self::Local(path.to_path_buf());
        }

        // "org/repo" is a hub id, "/abs" and "./rel" are paths
        if s.starts_with('/') || s.starts_with('.') {
            return Self::Local(path.to_path_buf());
        }

        #[cfg(windows)]
        if s.contains('\\') {
            return Self::Local(path.to_path_buf());
        }

        Self::Hub {
            repo_id: s.to_string(),
            revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let r = ModelReference::parse("org/model");
        assert_eq!(r.path, "org/model");
        assert_eq!(r.revision, None);
        assert_eq!(r.adapter, None);
    }

    #[test]
    fn test_parse_revision_and_adapter() {
        let r = ModelReference::parse("org/model@v2+org/lora");
        assert_eq!(r.path, "org/model");
        assert_eq!(r.revision.as_deref(), Some("v2"));
        assert_eq!(r.adapter.as_deref(), Some("org/lora"));
        assert_eq!(r.to_string(), "org/model@v2+org/lora");
        assert_eq!(r.base().to_string(), "org/model@v2");
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(ModelReference::parse("a/b"), ModelReference::new("a/b"));
        assert_ne!(
            ModelReference::parse("a/b"),
            ModelReference::new("a/b").with_revision("main")
        );
    }

    #[test]
    fn test_model_source_parse() {
        assert!(matches!(
            ModelSource::parse("/path/to/model", None),
            ModelSource::Local(_)
        ));
        assert!(matches!(
            ModelSource::parse("./model", None),
            ModelSource::Local(_)
        ));
        assert!(matches!(
            ModelSource::parse("meta-llama/Llama-2-7b", None),
            ModelSource::Hub { .. }
        ));
    }

    #[test]
    fn test_cache_key_is_path_safe() {
        let key = ModelReference::parse("org/model+org/lora").cache_key();
        assert!(!key.contains('/'));
        assert!(!key.contains('+'));
    }

    #[test]
    fn test_serde_as_string() {
        let r: ModelReference = serde_yaml::from_str("\"org/m@main\"").unwrap();
        assert_eq!(r.revision.as_deref(), Some("main"));
        let s = serde_json::to_string(&r).unwrap();
        assert_eq!(s, "\"org/m@main\"");
    }
}
