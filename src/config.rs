//! Configuration structures and loading logic

use crate::models::download::{Acquirer, HttpFetcher, RetryPolicy};
use crate::models::loader::{EngineOptions, ProcessEngine, ProcessEngineConfig};
use crate::models::quantize::{
    BlockQuantizer, CommandConverter, Converter, PrecisionLevel, PrecisionReducer, codec,
};
use crate::models::registry::{ModelRegistry, RegistryOptions};
use crate::models::store::{ArtifactStore, DEFAULT_MIN_PLAUSIBLE_SIZE};
use crate::models::{ModelCatalog, ModelDescriptor, ModelRole};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Root of the artifact store; one subdirectory per model
    pub base_dir: PathBuf,
    /// Weights at or below this many bytes are treated as corrupt
    pub min_file_size: u64,
    /// Seconds a caller waits on another caller's load
    pub load_wait_timeout_secs: u64,
    /// Precision models are loaded at
    pub precision: PrecisionLevel,
    pub download: DownloadConfig,
    pub smoke_test: SmokeTestConfig,
    pub converter: ConverterConfig,
    pub engine: EngineConfig,
    pub models: Vec<ModelConfig>,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            min_file_size: DEFAULT_MIN_PLAUSIBLE_SIZE,
            load_wait_timeout_secs: default_load_wait_timeout(),
            precision: PrecisionLevel::Fp32,
            download: DownloadConfig::default(),
            smoke_test: SmokeTestConfig::default(),
            converter: ConverterConfig::default(),
            engine: EngineConfig::default(),
            models: Vec::new(),
        }
    }
}

/// Retry and timeout settings for artifact downloads
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_attempts: u32,
    pub initial_backoff_secs: f64,
    pub backoff_multiplier: f64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 5.0,
            backoff_multiplier: 2.0,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SmokeTestConfig {
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for SmokeTestConfig {
    fn default() -> Self {
        Self {
            prompt: "Hello".to_string(),
            max_tokens: 5,
            timeout_secs: 60,
        }
    }
}

/// Which converter derives reduced-precision variants
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConverterConfig {
    Builtin {
        #[serde(default = "default_block_size")]
        block_size: usize,
    },
    Command {
        program: String,
        #[serde(default = "default_converter_args")]
        args: Vec<String>,
        #[serde(default = "default_converter_timeout")]
        timeout_secs: u64,
    },
}

impl Default for ConverterConfig {
    fn default() -> Self {
        ConverterConfig::Builtin {
            block_size: default_block_size(),
        }
    }
}

/// Local inference server settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub binary_path: String,
    /// Empty means the engine's built-in argument template
    pub args: Vec<String>,
    pub ready_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub options: EngineOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: default_engine_binary(),
            args: Vec::new(),
            ready_timeout_secs: 300,
            request_timeout_secs: 120,
            stop_grace_secs: 10,
            options: EngineOptions::default(),
        }
    }
}

/// One `[[models]]` entry
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig {
    pub name: String,
    pub role: ModelRole,
    pub source_url: String,

    #[serde(default = "default_weights_file")]
    pub weights_file: String,

    #[serde(default = "default_config_file")]
    pub config_file: String,

    #[serde(default = "default_tokenizer_file")]
    pub tokenizer_file: String,
}

impl KeeperConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(base_dir) = std::env::var("MODEL_KEEPER_BASE_DIR") {
            config.base_dir = PathBuf::from(base_dir);
        }
        if let Ok(precision) = std::env::var("MODEL_KEEPER_PRECISION") {
            config.precision = precision
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid MODEL_KEEPER_PRECISION value")?;
        }
        if let Ok(binary_path) = std::env::var("MODEL_KEEPER_ENGINE_BINARY") {
            config.engine.binary_path = binary_path;
        }
        if let Ok(size) = std::env::var("MODEL_KEEPER_MIN_FILE_SIZE") {
            config.min_file_size = size
                .parse()
                .context("Invalid MODEL_KEEPER_MIN_FILE_SIZE value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.download.max_attempts == 0 {
            anyhow::bail!("download.max_attempts must be at least 1");
        }
        if self.download.initial_backoff_secs < 0.0 || self.download.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "download backoff must be non-negative with a multiplier >= 1 (got {}s x{})",
                self.download.initial_backoff_secs,
                self.download.backoff_multiplier
            );
        }
        if self.load_wait_timeout_secs == 0 {
            anyhow::bail!("load_wait_timeout_secs must be greater than 0");
        }
        if self.smoke_test.max_tokens == 0 {
            anyhow::bail!("smoke_test.max_tokens must be greater than 0");
        }

        match &self.converter {
            ConverterConfig::Builtin { block_size } if *block_size < codec::MIN_BLOCK_SIZE => {
                anyhow::bail!(
                    "converter block_size must be at least {} (got {})",
                    codec::MIN_BLOCK_SIZE,
                    block_size
                );
            }
            ConverterConfig::Command { program, .. } if program.trim().is_empty() => {
                anyhow::bail!("converter program cannot be empty");
            }
            _ => {}
        }

        // Models share a directory per name, whatever their role
        let mut names = HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                anyhow::bail!("Model name cannot be empty");
            }
            if model.name.contains('/') || model.name.contains('\\') || model.name.starts_with('.') {
                anyhow::bail!(
                    "Model name '{}' cannot contain path separators or start with '.'",
                    model.name
                );
            }
            if !model.source_url.starts_with("http://") && !model.source_url.starts_with("https://") {
                anyhow::bail!(
                    "Model '{}' source_url must be http(s) (got '{}')",
                    model.name,
                    model.source_url
                );
            }
            if !names.insert(model.name.as_str()) {
                anyhow::bail!(
                    "Duplicate model name '{}': names must be unique across roles",
                    model.name
                );
            }
        }

        Ok(())
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.models
            .iter()
            .map(|m| ModelDescriptor {
                name: m.name.clone(),
                role: m.role,
                source_url: m.source_url.clone(),
                weights_file: m.weights_file.clone(),
                config_file: m.config_file.clone(),
                tokenizer_file: m.tokenizer_file.clone(),
                storage_root: self.base_dir.clone(),
            })
            .collect()
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::new(self.descriptors())
    }

    pub fn store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.base_dir, self.min_file_size)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.download.max_attempts,
            initial_backoff: Duration::from_secs_f64(self.download.initial_backoff_secs),
            backoff_multiplier: self.download.backoff_multiplier,
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            wait_timeout: Duration::from_secs(self.load_wait_timeout_secs),
            smoke_prompt: self.smoke_test.prompt.clone(),
            smoke_max_tokens: self.smoke_test.max_tokens,
            smoke_timeout: Duration::from_secs(self.smoke_test.timeout_secs),
            precision: self.precision,
            engine_options: self.engine.options.clone(),
        }
    }

    pub fn engine_config(&self) -> ProcessEngineConfig {
        let defaults = ProcessEngineConfig::default();
        ProcessEngineConfig {
            binary_path: self.engine.binary_path.clone(),
            args: if self.engine.args.is_empty() {
                defaults.args
            } else {
                self.engine.args.clone()
            },
            ready_timeout: Duration::from_secs(self.engine.ready_timeout_secs),
            request_timeout: Duration::from_secs(self.engine.request_timeout_secs),
            stop_grace: Duration::from_secs(self.engine.stop_grace_secs),
            ready_markers: defaults.ready_markers,
        }
    }

    pub fn converter(&self) -> Arc<dyn Converter> {
        match &self.converter {
            ConverterConfig::Builtin { block_size } => Arc::new(BlockQuantizer::new(*block_size)),
            ConverterConfig::Command {
                program,
                args,
                timeout_secs,
            } => Arc::new(CommandConverter::new(
                program.clone(),
                args.clone(),
                Duration::from_secs(*timeout_secs),
            )),
        }
    }

    /// Acquirer backed by the HTTP fetcher
    pub fn acquirer(&self) -> Result<Acquirer> {
        let fetcher = HttpFetcher::new(
            Duration::from_secs(self.download.connect_timeout_secs),
            Duration::from_secs(self.download.read_timeout_secs),
        )?;
        Ok(Acquirer::new(self.store(), Arc::new(fetcher), self.retry_policy()))
    }

    /// Wire the production registry: HTTP downloads, configured converter,
    /// process engine
    pub fn build_registry(&self) -> Result<ModelRegistry> {
        let catalog = Arc::new(self.catalog());
        let acquirer = Arc::new(self.acquirer()?);
        let reducer = Arc::new(PrecisionReducer::new(
            catalog.clone(),
            acquirer.clone(),
            self.converter(),
        ));
        let engine = Arc::new(ProcessEngine::new(self.engine_config())?);

        Ok(ModelRegistry::new(
            catalog,
            acquirer,
            Some(reducer),
            engine,
            self.registry_options(),
        ))
    }
}

// Default functions
fn default_base_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("model-keeper")
        .join("models")
}
fn default_load_wait_timeout() -> u64 {
    30
}
fn default_block_size() -> usize {
    codec::DEFAULT_BLOCK_SIZE
}
fn default_converter_args() -> Vec<String> {
    vec![
        "{input}".to_string(),
        "{output}".to_string(),
        "{precision}".to_string(),
    ]
}
fn default_converter_timeout() -> u64 {
    3600
}
fn default_engine_binary() -> String {
    "llama-server".to_string()
}
fn default_weights_file() -> String {
    "model.safetensors".to_string()
}
fn default_config_file() -> String {
    "config.json".to_string()
}
fn default_tokenizer_file() -> String {
    "tokenizer.json".to_string()
}
