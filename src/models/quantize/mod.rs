//! Precision reduction of acquired model weights
//!
//! Variants are derived lazily, written next to the source weights as
//! `<weights>.<precision>.bin`, and cached in-process by
//! `(ModelKey, PrecisionLevel)`. The numeric conversion itself sits behind the
//! [`Converter`] trait so it can be swapped for an external toolchain.
//!
//! INT4 is always derived from the INT8 variant, never straight from FP32.

pub mod codec;
pub mod command;

pub use codec::{BlockQuantizer, CodecError};
pub use command::CommandConverter;

use super::descriptor::{ModelCatalog, ModelDescriptor, ModelKey};
use super::download::Acquirer;
use crate::error::{ModelError, ModelResult};
use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Numeric width of stored weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionLevel {
    Fp32,
    Fp16,
    Int8,
    Int4,
}

impl PrecisionLevel {
    pub const ALL: [PrecisionLevel; 4] = [
        PrecisionLevel::Fp32,
        PrecisionLevel::Fp16,
        PrecisionLevel::Int8,
        PrecisionLevel::Int4,
    ];

    /// Bits per stored weight
    pub fn bits(&self) -> u32 {
        match self {
            Self::Fp32 => 32,
            Self::Fp16 => 16,
            Self::Int8 => 8,
            Self::Int4 => 4,
        }
    }

    /// Level this one is derived from
    pub fn source_level(&self) -> Option<PrecisionLevel> {
        match self {
            Self::Fp32 => None,
            Self::Fp16 | Self::Int8 => Some(Self::Fp32),
            Self::Int4 => Some(Self::Int8),
        }
    }

    /// Levels that must exist before this one can be derived
    pub fn intermediates(&self) -> Vec<PrecisionLevel> {
        match self {
            Self::Int4 => vec![Self::Int8],
            _ => Vec::new(),
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            Self::Fp32 => 0,
            Self::Fp16 => 1,
            Self::Int8 => 2,
            Self::Int4 => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.code() == code)
    }
}

impl std::fmt::Display for PrecisionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp16 => write!(f, "fp16"),
            Self::Int8 => write!(f, "int8"),
            Self::Int4 => write!(f, "int4"),
        }
    }
}

impl FromStr for PrecisionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" => Ok(Self::Fp32),
            "fp16" => Ok(Self::Fp16),
            "int8" => Ok(Self::Int8),
            "int4" => Ok(Self::Int4),
            other => Err(format!("unknown precision level '{}'", other)),
        }
    }
}

/// A derived weights file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedVariant {
    pub source: ModelKey,
    pub precision: PrecisionLevel,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Size of the FP32 source the variant was derived from
    pub source_size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl QuantizedVariant {
    /// Variant size as a fraction of the source size
    pub fn size_ratio(&self) -> f64 {
        if self.source_size_bytes == 0 {
            return 1.0;
        }
        self.size_bytes as f64 / self.source_size_bytes as f64
    }
}

/// Numeric conversion boundary
#[async_trait]
pub trait Converter: Send + Sync {
    /// Write a `to`-precision rendering of `input` (stored at `from`) to `output`
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        from: PrecisionLevel,
        to: PrecisionLevel,
    ) -> anyhow::Result<()>;

    /// Name used in logs
    fn name(&self) -> &str;
}

type VariantKey = (ModelKey, PrecisionLevel);

/// Derives and caches reduced-precision variants
pub struct PrecisionReducer {
    catalog: Arc<ModelCatalog>,
    acquirer: Arc<Acquirer>,
    converter: Arc<dyn Converter>,
    variants: DashMap<VariantKey, QuantizedVariant>,
    locks: DashMap<VariantKey, Arc<Mutex<()>>>,
}

impl PrecisionReducer {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        acquirer: Arc<Acquirer>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            catalog,
            acquirer,
            converter,
            variants: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Variant of `key` at `level`, converting only when nothing usable exists
    pub async fn reduce(&self, key: &ModelKey, level: PrecisionLevel) -> ModelResult<QuantizedVariant> {
        let desc = self
            .catalog
            .get(key)
            .ok_or_else(|| ModelError::NotConfigured(key.clone()))?;

        if let Some(variant) = self.lookup(desc, level) {
            return Ok(variant);
        }

        let mut input = None;
        for step in level.intermediates() {
            input = Some(self.reduce_step(desc, step, input.as_ref()).await?);
        }
        self.reduce_step(desc, level, input.as_ref()).await
    }

    /// Cached variants, in no particular order
    pub fn variants(&self) -> Vec<QuantizedVariant> {
        self.variants.iter().map(|v| v.value().clone()).collect()
    }

    pub fn converter_name(&self) -> &str {
        self.converter.name()
    }

    /// One derivation, serialized per (key, level)
    async fn reduce_step(
        &self,
        desc: &ModelDescriptor,
        level: PrecisionLevel,
        input: Option<&QuantizedVariant>,
    ) -> ModelResult<QuantizedVariant> {
        let variant_key = (desc.key(), level);
        let lock = self.locks.entry(variant_key.clone()).or_default().clone();
        let _guard = lock.lock().await;

        if let Some(variant) = self.lookup(desc, level) {
            return Ok(variant);
        }

        let variant = self.derive(desc, level, input).await?;
        self.variants.insert(variant_key, variant.clone());
        Ok(variant)
    }

    /// In-process cache first, then a variant file left by an earlier process
    fn lookup(&self, desc: &ModelDescriptor, level: PrecisionLevel) -> Option<QuantizedVariant> {
        let variant_key = (desc.key(), level);

        let cached = self.variants.get(&variant_key).map(|v| v.value().clone());
        if let Some(variant) = cached {
            if variant.path.is_file() {
                return Some(variant);
            }
            tracing::info!(
                model = %variant.source,
                precision = %variant.precision,
                path = ?variant.path,
                "Variant file removed, invalidating cache entry"
            );
            self.variants.remove(&variant_key);
        }

        if level == PrecisionLevel::Fp32 {
            return None;
        }

        let store = self.acquirer.store();
        let path = store.variant_path(desc, level);
        let size = store.file_size(&path)?;
        tracing::debug!(model = %variant_key.0, precision = %level, path = ?path, "Reusing variant on disk");

        let source_size = store.file_size(&desc.weights_path()).unwrap_or(0);
        let variant = self.variant(&variant_key.0, level, path, size, source_size);
        self.variants.insert(variant_key, variant.clone());
        Some(variant)
    }

    async fn derive(
        &self,
        desc: &ModelDescriptor,
        level: PrecisionLevel,
        input: Option<&QuantizedVariant>,
    ) -> ModelResult<QuantizedVariant> {
        let key = desc.key();
        let store = self.acquirer.store();

        self.acquirer
            .acquire(desc)
            .await
            .map_err(|e| ModelError::from_acquisition(key.clone(), e))?;

        let source_path = desc.weights_path();
        let source_size = store.file_size(&source_path).unwrap_or(0);

        let Some(from) = level.source_level() else {
            return Ok(self.variant(&key, level, source_path, source_size, source_size));
        };

        let quantization_error = |source: anyhow::Error| ModelError::Quantization {
            key: key.clone(),
            level,
            source,
        };

        let input_path = match input {
            _ if from == PrecisionLevel::Fp32 => source_path,
            Some(variant) if variant.precision == from => variant.path.clone(),
            _ => {
                return Err(quantization_error(anyhow::anyhow!(
                    "{} variant must exist before deriving {}",
                    from,
                    level
                )));
            }
        };

        let target = store.variant_path(desc, level);
        let partial = target.with_file_name(format!(
            "{}.partial",
            target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        ));

        tracing::info!(
            model = %key,
            from = %from,
            to = %level,
            converter = self.converter.name(),
            "Starting precision reduction"
        );
        let started = std::time::Instant::now();

        if let Err(e) = self.converter.convert(&input_path, &partial, from, level).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(quantization_error(e));
        }

        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(quantization_error(
                anyhow::Error::new(e).context(format!("failed to move variant into {:?}", target)),
            ));
        }

        let size = store.file_size(&target).unwrap_or(0);
        let variant = self.variant(&key, level, target, size, source_size);

        tracing::info!(
            model = %key,
            precision = %level,
            source_bytes = source_size,
            variant_bytes = size,
            ratio = %format!("{:.3}", variant.size_ratio()),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Precision reduction complete"
        );
        metrics::record_quantization(&key.to_string(), &level.to_string(), source_size, size);

        Ok(variant)
    }

    fn variant(
        &self,
        key: &ModelKey,
        level: PrecisionLevel,
        path: PathBuf,
        size_bytes: u64,
        source_size_bytes: u64,
    ) -> QuantizedVariant {
        QuantizedVariant {
            source: key.clone(),
            precision: level,
            path,
            size_bytes,
            source_size_bytes,
            created_at: Utc::now(),
        }
    }
}
