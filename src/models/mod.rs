//! Model management module
//!
//! Provides functionality for:
//! - Describing configured models and where their files live
//! - Downloading model artifacts atomically with retries
//! - Deriving reduced-precision weight variants
//! - Loading models into an inference engine exactly once
//! - Parsing model metadata from config.json

pub mod descriptor;
pub mod download;
pub mod loader;
pub mod metadata;
pub mod quantize;
pub mod registry;
pub mod store;

pub use descriptor::{ModelCatalog, ModelDescriptor, ModelKey, ModelRole};
pub use download::{AcquireOutcome, Acquirer, Fetcher, HttpFetcher, RetryPolicy};
pub use loader::{EngineOptions, InferenceEngine, InferenceSession, LoadRequest, ProcessEngine};
pub use metadata::{ModelMetadata, parse_model_config};
pub use quantize::{PrecisionLevel, PrecisionReducer, QuantizedVariant};
pub use registry::{LoadedHandle, ModelEntry, ModelEvent, ModelRegistry, ModelStatus, RegistryOptions};
pub use store::ArtifactStore;
