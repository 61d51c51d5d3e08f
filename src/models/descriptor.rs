//! Model identity: roles, keys, descriptors and the configured catalog

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// What a model is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// Text generation
    Language,
    /// Vector embeddings
    Embeddings,
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Language => write!(f, "language"),
            Self::Embeddings => write!(f, "embeddings"),
        }
    }
}

impl FromStr for ModelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "language" => Ok(Self::Language),
            "embeddings" => Ok(Self::Embeddings),
            other => Err(format!("unknown model role '{}'", other)),
        }
    }
}

/// Registry and cache key, rendered as `<role>-<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelKey {
    role: ModelRole,
    name: String,
}

impl ModelKey {
    pub fn new(role: ModelRole, name: impl Into<String>) -> Self {
        Self {
            role,
            name: name.into(),
        }
    }

    pub fn role(&self) -> ModelRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.role, self.name)
    }
}

impl FromStr for ModelKey {
    type Err = String;

    /// Parse `language-gpt2-medium` into role `language`, name `gpt2-medium`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, name) = s
            .split_once('-')
            .ok_or_else(|| format!("model key '{}' must look like <role>-<name>", s))?;
        if name.is_empty() {
            return Err(format!("model key '{}' has an empty name", s));
        }
        Ok(Self::new(role.parse()?, name))
    }
}

impl TryFrom<String> for ModelKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelKey> for String {
    fn from(key: ModelKey) -> Self {
        key.to_string()
    }
}

/// Everything needed to locate, fetch and load one model
///
/// Built once from configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub role: ModelRole,
    /// Base URL; each artifact is fetched from `<source_url>/<file>`
    pub source_url: String,
    pub weights_file: String,
    pub config_file: String,
    pub tokenizer_file: String,
    /// Directory that holds one subdirectory per model
    pub storage_root: PathBuf,
}

impl ModelDescriptor {
    /// Descriptor with the conventional artifact file names
    pub fn new(
        role: ModelRole,
        name: impl Into<String>,
        source_url: impl Into<String>,
        storage_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            source_url: source_url.into(),
            weights_file: "model.safetensors".to_string(),
            config_file: "config.json".to_string(),
            tokenizer_file: "tokenizer.json".to_string(),
            storage_root: storage_root.into(),
        }
    }

    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.role, self.name.clone())
    }

    /// `<storage_root>/<name>`
    pub fn model_dir(&self) -> PathBuf {
        self.storage_root.join(&self.name)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.model_dir().join(&self.weights_file)
    }

    /// All files that must be present, weights first
    pub fn required_files(&self) -> [&str; 3] {
        [
            self.weights_file.as_str(),
            self.config_file.as_str(),
            self.tokenizer_file.as_str(),
        ]
    }

    pub fn is_weights(&self, file: &str) -> bool {
        file == self.weights_file
    }

    /// Remote location of one artifact
    pub fn file_url(&self, file: &str) -> String {
        format!("{}/{}", self.source_url.trim_end_matches('/'), file)
    }

    /// Final on-disk location of one artifact
    pub fn file_path(&self, file: &str) -> PathBuf {
        self.model_dir().join(file)
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }
}

/// Configured models, indexed by key
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<ModelKey, ModelDescriptor>,
}

impl ModelCatalog {
    pub fn new(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        Self {
            models: descriptors.into_iter().map(|d| (d.key(), d)).collect(),
        }
    }

    pub fn get(&self, key: &ModelKey) -> Option<&ModelDescriptor> {
        self.models.get(key)
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.models.contains_key(key)
    }

    /// Keys sorted by their rendered form
    pub fn keys(&self) -> Vec<ModelKey> {
        let mut keys: Vec<_> = self.models.keys().cloned().collect();
        keys.sort_by_key(|k| k.to_string());
        keys
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
