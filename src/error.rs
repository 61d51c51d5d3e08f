//! Error types for model acquisition and lifecycle

use crate::models::descriptor::ModelKey;
use crate::models::download::AcquisitionError;
use crate::models::quantize::PrecisionLevel;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

/// Errors surfaced by the registry and its pipelines
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model '{0}' is not configured")]
    NotConfigured(ModelKey),

    #[error("failed to acquire model '{key}': {source}")]
    Acquisition {
        key: ModelKey,
        #[source]
        source: AcquisitionError,
    },

    #[error("integrity check failed for {path:?}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("inference engine failed to load '{key}': {source:#}")]
    Load {
        key: ModelKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("smoke test failed for '{key}': {reason}")]
    SmokeTest { key: ModelKey, reason: String },

    #[error("reducing '{key}' to {level} failed: {source:#}")]
    Quantization {
        key: ModelKey,
        level: PrecisionLevel,
        #[source]
        source: anyhow::Error,
    },

    #[error("timed out after {waited:?} waiting for '{key}' to finish loading")]
    LoadTimeout { key: ModelKey, waited: Duration },

    #[error("loading '{key}' failed: {reason}")]
    Failed { key: ModelKey, reason: String },

    #[error("handle for '{0}' has already been released")]
    HandleReleased(ModelKey),

    #[error("model registry has been shut down")]
    ShutDown,

    #[error("inference on '{key}' failed: {source:#}")]
    Inference {
        key: ModelKey,
        #[source]
        source: anyhow::Error,
    },
}

/// Why a model could not be used, from a caller's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// No such model in configuration
    NotConfigured,
    /// Another load is still running; waiting longer may succeed
    Initializing,
    /// The load attempt failed or the registry is gone
    Failed,
}

impl ModelError {
    /// Lift a pipeline error, keeping integrity failures distinct
    pub fn from_acquisition(key: ModelKey, err: AcquisitionError) -> Self {
        match err {
            AcquisitionError::Integrity { path, size, min } => ModelError::Integrity {
                path,
                reason: format!("{} bytes, expected more than {}", size, min),
            },
            source => ModelError::Acquisition { key, source },
        }
    }

    pub fn availability(&self) -> Availability {
        match self {
            ModelError::NotConfigured(_) => Availability::NotConfigured,
            ModelError::LoadTimeout { .. } => Availability::Initializing,
            _ => Availability::Failed,
        }
    }

    /// Worth calling `ensure_loaded` again later
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ModelError::NotConfigured(_) | ModelError::ShutDown
        )
    }

    /// Short machine-readable name for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::NotConfigured(_) => "not_configured",
            ModelError::Acquisition { .. } => "acquisition",
            ModelError::Integrity { .. } => "integrity",
            ModelError::Load { .. } => "load",
            ModelError::SmokeTest { .. } => "smoke_test",
            ModelError::Quantization { .. } => "quantization",
            ModelError::LoadTimeout { .. } => "load_timeout",
            ModelError::Failed { .. } => "failed",
            ModelError::HandleReleased(_) => "handle_released",
            ModelError::ShutDown => "shut_down",
            ModelError::Inference { .. } => "inference",
        }
    }
}
