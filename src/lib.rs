//! Model Keeper - acquisition and lifecycle management for local inference models
//!
//! Downloads model artifacts safely, derives reduced-precision variants, and
//! loads each model into a local inference engine exactly once, however many
//! callers ask for it at the same time.

pub mod config;
pub mod error;
pub mod facade;
pub mod metrics;
pub mod models;

pub use config::KeeperConfig;
pub use error::{Availability, ModelError, ModelResult};
pub use facade::TextGenerator;
pub use models::{
    LoadedHandle, ModelCatalog, ModelDescriptor, ModelKey, ModelRegistry, ModelRole, ModelStatus,
    PrecisionLevel,
};
