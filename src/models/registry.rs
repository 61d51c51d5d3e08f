//! Model registry: load-once lifecycle for inference handles
//!
//! Each configured model has one slot in a `DashMap`. The transition into
//! `Loading` is claimed under the slot's entry lock, so exactly one caller
//! runs a load while everyone else waits on the slot's `watch` channel.
//!
//! The load itself runs in a spawned task. A caller that gives up (or is
//! cancelled) never leaves the slot stuck in `Loading`.

use super::descriptor::{ModelCatalog, ModelDescriptor, ModelKey, ModelRole};
use super::download::{AcquireOutcome, Acquirer};
use super::loader::{EngineOptions, InferenceEngine, InferenceSession, LoadRequest, smoke_test};
use super::metadata::{ModelMetadata, parse_model_config, read_model_config};
use super::quantize::{PrecisionLevel, PrecisionReducer, QuantizedVariant};
use crate::error::{ModelError, ModelResult};
use crate::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

/// Lifecycle state of one model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    NotLoaded,
    /// A load is in flight
    Loading,
    /// A handle is cached and smoke-tested
    Loaded,
    /// The last load attempt failed; the next request retries
    Failed,
}

impl ModelStatus {
    /// Whether `self -> next` is a legal lifecycle step
    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, next),
            (NotLoaded, Loading)
                | (Loading, Loaded)
                | (Loading, Failed)
                | (Loaded, NotLoaded)
                | (Failed, Loading)
        )
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLoaded => write!(f, "not_loaded"),
            Self::Loading => write!(f, "loading"),
            Self::Loaded => write!(f, "loaded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Registry lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    StatusChanged {
        key: ModelKey,
        from: ModelStatus,
        to: ModelStatus,
    },
    /// Handle was closed after leaving the cache
    Unloaded(ModelKey),
}

/// An inference-ready model owned by the registry
///
/// Callers get an `Arc` and may use it until the registry unloads the model;
/// after that every call fails with [`ModelError::HandleReleased`].
pub struct LoadedHandle {
    key: ModelKey,
    precision: PrecisionLevel,
    weights_path: PathBuf,
    metadata: ModelMetadata,
    loaded_at: DateTime<Utc>,
    session: Box<dyn InferenceSession>,
    released: AtomicBool,
}

impl std::fmt::Debug for LoadedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedHandle")
            .field("key", &self.key)
            .field("precision", &self.precision)
            .field("weights_path", &self.weights_path)
            .field("released", &self.is_released())
            .finish()
    }
}

impl LoadedHandle {
    pub fn new(
        key: ModelKey,
        precision: PrecisionLevel,
        weights_path: PathBuf,
        metadata: ModelMetadata,
        session: Box<dyn InferenceSession>,
    ) -> Self {
        Self {
            key,
            precision,
            weights_path,
            metadata,
            loaded_at: Utc::now(),
            session,
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn precision(&self) -> PrecisionLevel {
        self.precision
    }

    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn generate(&self, prompt: &str, max_tokens: u32) -> ModelResult<String> {
        self.check_live()?;
        self.session
            .generate(prompt, max_tokens)
            .await
            .map_err(|source| ModelError::Inference {
                key: self.key.clone(),
                source,
            })
    }

    pub async fn embed(&self, text: &str) -> ModelResult<Vec<f32>> {
        self.check_live()?;
        self.session
            .embed(text)
            .await
            .map_err(|source| ModelError::Inference {
                key: self.key.clone(),
                source,
            })
    }

    /// Close the underlying session; a second call fails
    pub(crate) async fn release(&self) -> ModelResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(ModelError::HandleReleased(self.key.clone()));
        }
        self.session
            .close()
            .await
            .map_err(|source| ModelError::Inference {
                key: self.key.clone(),
                source: source.context("failed to close session"),
            })
    }

    fn check_live(&self) -> ModelResult<()> {
        if self.is_released() {
            return Err(ModelError::HandleReleased(self.key.clone()));
        }
        Ok(())
    }
}

/// Serializable view of one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub key: ModelKey,
    pub role: ModelRole,
    pub name: String,
    pub status: ModelStatus,
    /// All required files on disk with plausible weights
    pub artifacts_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ModelMetadata>,
    /// Precision of the loaded weights
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<PrecisionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    /// Error message of the most recent failed load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Tunables for [`ModelRegistry`]
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// How long a caller waits on another caller's load
    pub wait_timeout: Duration,
    pub smoke_prompt: String,
    pub smoke_max_tokens: u32,
    pub smoke_timeout: Duration,
    /// Precision models are loaded at
    pub precision: PrecisionLevel,
    pub engine_options: EngineOptions,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(30),
            smoke_prompt: "Hello".to_string(),
            smoke_max_tokens: 5,
            smoke_timeout: Duration::from_secs(60),
            precision: PrecisionLevel::Fp32,
            engine_options: EngineOptions::default(),
        }
    }
}

enum SlotState {
    NotLoaded,
    Loading,
    Loaded(Arc<LoadedHandle>),
    Failed,
}

impl SlotState {
    fn status(&self) -> ModelStatus {
        match self {
            SlotState::NotLoaded => ModelStatus::NotLoaded,
            SlotState::Loading => ModelStatus::Loading,
            SlotState::Loaded(_) => ModelStatus::Loaded,
            SlotState::Failed => ModelStatus::Failed,
        }
    }
}

struct Slot {
    state: SlotState,
    last_error: Option<String>,
    status_tx: watch::Sender<ModelStatus>,
}

impl Slot {
    fn new() -> Self {
        let (status_tx, _) = watch::channel(ModelStatus::NotLoaded);
        Self {
            state: SlotState::NotLoaded,
            last_error: None,
            status_tx,
        }
    }

    fn handle(&self) -> Option<&Arc<LoadedHandle>> {
        match &self.state {
            SlotState::Loaded(handle) => Some(handle),
            _ => None,
        }
    }
}

/// What the caller of `ensure_loaded` should do next
enum Claim {
    Ready(Arc<LoadedHandle>),
    Wait(watch::Receiver<ModelStatus>),
    Owner,
}

struct RegistryInner {
    catalog: Arc<ModelCatalog>,
    acquirer: Arc<Acquirer>,
    reducer: Option<Arc<PrecisionReducer>>,
    engine: Arc<dyn InferenceEngine>,
    options: RegistryOptions,
    slots: DashMap<ModelKey, Slot>,
    closed: AtomicBool,
    event_tx: broadcast::Sender<ModelEvent>,
}

/// Loads each configured model at most once and hands out shared handles
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        acquirer: Arc<Acquirer>,
        reducer: Option<Arc<PrecisionReducer>>,
        engine: Arc<dyn InferenceEngine>,
        options: RegistryOptions,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RegistryInner {
                catalog,
                acquirer,
                reducer,
                engine,
                options,
                slots: DashMap::new(),
                closed: AtomicBool::new(false),
                event_tx,
            }),
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ModelEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Return a ready handle, loading the model first if needed
    ///
    /// Concurrent callers for the same key share one load. A caller that finds
    /// a load already running waits up to `wait_timeout` and then fails with
    /// [`ModelError::LoadTimeout`]; the load itself keeps going.
    pub async fn ensure_loaded(&self, key: &ModelKey) -> ModelResult<Arc<LoadedHandle>> {
        if !self.inner.catalog.contains(key) {
            return Err(ModelError::NotConfigured(key.clone()));
        }

        let wait_timeout = self.inner.options.wait_timeout;
        let deadline = Instant::now() + wait_timeout;

        loop {
            match self.inner.claim(key)? {
                Claim::Ready(handle) => return Ok(handle),
                Claim::Owner => {
                    let inner = self.inner.clone();
                    let task_key = key.clone();
                    let task = tokio::spawn(async move { inner.run_load(task_key).await });
                    return match task.await {
                        Ok(result) => result,
                        Err(e) => Err(ModelError::Failed {
                            key: key.clone(),
                            reason: format!("load task aborted: {}", e),
                        }),
                    };
                }
                Claim::Wait(mut rx) => {
                    tracing::debug!(model = %key, "Waiting for in-flight load");
                    let remaining = deadline.saturating_duration_since(Instant::now());

                    // The watch borrow must end here; it blocks the status sender.
                    let status = match tokio::time::timeout(
                        remaining,
                        rx.wait_for(|s| *s != ModelStatus::Loading),
                    )
                    .await
                    {
                        Err(_) => {
                            return Err(ModelError::LoadTimeout {
                                key: key.clone(),
                                waited: wait_timeout,
                            });
                        }
                        Ok(Err(_)) => ModelStatus::Failed,
                        Ok(Ok(status)) => *status,
                    };

                    match status {
                        ModelStatus::Failed => {
                            let reason = self
                                .inner
                                .slots
                                .get(key)
                                .and_then(|slot| slot.last_error.clone())
                                .unwrap_or_else(|| "load failed".to_string());
                            return Err(ModelError::Failed {
                                key: key.clone(),
                                reason,
                            });
                        }
                        // Loaded: pick up the handle. NotLoaded: unloaded meanwhile, claim again.
                        _ => continue,
                    }
                }
            }
        }
    }

    /// Drop the cached handle and close it
    ///
    /// Idempotent. Only a `Loaded` model changes state; a load in flight or a
    /// failed model is left alone.
    pub async fn unload(&self, key: &ModelKey) -> ModelResult<()> {
        match self.inner.take_loaded(key) {
            Some(handle) => self.inner.close_handle(handle).await,
            None => {
                tracing::debug!(model = %key, "Unload requested but model is not loaded");
                Ok(())
            }
        }
    }

    /// Stop accepting loads, let in-flight loads settle, unload everything
    ///
    /// Individual close failures are logged, never propagated. Returns the
    /// number of handles unloaded.
    pub async fn shutdown(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Model registry already shut down");
        }
        tracing::info!("Shutting down model registry");

        let in_flight: Vec<(ModelKey, watch::Receiver<ModelStatus>)> = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.state.status() == ModelStatus::Loading)
            .map(|slot| (slot.key().clone(), slot.status_tx.subscribe()))
            .collect();

        for (key, mut rx) in in_flight {
            tracing::info!(model = %key, "Waiting for in-flight load before shutdown");
            let _ = rx.wait_for(|s| *s != ModelStatus::Loading).await;
        }

        let loaded: Vec<ModelKey> = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.handle().is_some())
            .map(|slot| slot.key().clone())
            .collect();

        let mut unloaded = 0;
        for key in loaded {
            let Some(handle) = self.inner.take_loaded(&key) else {
                continue;
            };
            unloaded += 1;
            if let Err(e) = self.inner.close_handle(handle).await {
                tracing::warn!(model = %key, error = %e, "Failed to close model during shutdown");
            }
        }

        tracing::info!(unloaded, "Model registry shut down");
        unloaded
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current status; never blocks on a load
    pub fn status(&self, key: &ModelKey) -> ModelStatus {
        self.inner
            .slots
            .get(key)
            .map(|slot| slot.state.status())
            .unwrap_or(ModelStatus::NotLoaded)
    }

    /// True when a smoke-tested handle is cached
    pub fn model_ready(&self, key: &ModelKey) -> bool {
        self.status(key) == ModelStatus::Loaded
    }

    pub fn loaded_count(&self) -> usize {
        self.inner.loaded_count()
    }

    /// View of one configured model
    pub fn snapshot(&self, key: &ModelKey) -> Option<ModelEntry> {
        let desc = self.inner.catalog.get(key)?;
        let store = self.inner.acquirer.store();

        let mut entry = ModelEntry {
            key: key.clone(),
            role: desc.role,
            name: desc.name.clone(),
            status: ModelStatus::NotLoaded,
            artifacts_present: store.is_complete(desc),
            size_bytes: store.model_size(desc),
            metadata: parse_model_config(&desc.model_dir()),
            precision: None,
            weights_path: None,
            loaded_at: None,
            last_error: None,
        };

        if let Some(slot) = self.inner.slots.get(key) {
            entry.status = slot.state.status();
            entry.last_error = slot.last_error.clone();
            if let Some(handle) = slot.handle() {
                entry.precision = Some(handle.precision());
                entry.weights_path = Some(handle.weights_path().to_path_buf());
                entry.loaded_at = Some(handle.loaded_at());
            }
        }

        Some(entry)
    }

    /// Views of every configured model, sorted by key
    pub fn list(&self) -> Vec<ModelEntry> {
        self.inner
            .catalog
            .keys()
            .iter()
            .filter_map(|key| self.snapshot(key))
            .collect()
    }

    /// Derive (or reuse) a reduced-precision variant of a configured model
    pub async fn reduce(&self, key: &ModelKey, level: PrecisionLevel) -> ModelResult<QuantizedVariant> {
        let reducer = self.inner.reducer(key, level)?;
        reducer.reduce(key, level).await
    }
}

impl RegistryInner {
    /// Decide, under the slot's entry lock, who loads and who waits
    fn claim(&self, key: &ModelKey) -> ModelResult<Claim> {
        let mut slot = self.slots.entry(key.clone()).or_insert_with(Slot::new);

        if let Some(handle) = slot.handle() {
            return Ok(Claim::Ready(handle.clone()));
        }
        if slot.state.status() == ModelStatus::Loading {
            return Ok(Claim::Wait(slot.status_tx.subscribe()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ModelError::ShutDown);
        }

        self.set_state(key, &mut slot, SlotState::Loading);
        Ok(Claim::Owner)
    }

    /// Apply a transition, rejecting anything outside the lifecycle
    fn set_state(&self, key: &ModelKey, slot: &mut Slot, next: SlotState) -> bool {
        let from = slot.state.status();
        let to = next.status();

        if !from.can_transition_to(to) {
            tracing::error!(model = %key, from = %from, to = %to, "Rejected invalid status transition");
            return false;
        }

        slot.state = next;
        slot.status_tx.send_replace(to);
        tracing::debug!(model = %key, from = %from, to = %to, "Model status changed");
        let _ = self.event_tx.send(ModelEvent::StatusChanged {
            key: key.clone(),
            from,
            to,
        });
        true
    }

    fn fail(&self, key: &ModelKey, reason: String) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.last_error = Some(reason);
            self.set_state(key, &mut slot, SlotState::Failed);
        }
    }

    /// Move a `Loaded` slot to `NotLoaded`, handing back its handle
    fn take_loaded(&self, key: &ModelKey) -> Option<Arc<LoadedHandle>> {
        let mut slot = self.slots.get_mut(key)?;
        let handle = slot.handle()?.clone();
        self.set_state(key, &mut slot, SlotState::NotLoaded);
        Some(handle)
    }

    async fn close_handle(&self, handle: Arc<LoadedHandle>) -> ModelResult<()> {
        let key = handle.key().clone();
        let result = handle.release().await;

        metrics::record_model_unloaded(&key.to_string());
        metrics::update_loaded_count(self.loaded_count());
        let _ = self.event_tx.send(ModelEvent::Unloaded(key.clone()));

        match &result {
            Ok(()) => tracing::info!(model = %key, "Model unloaded"),
            Err(e) => tracing::warn!(model = %key, error = %e, "Model unloaded with close error"),
        }
        result
    }

    fn loaded_count(&self) -> usize {
        self.slots.iter().filter(|s| s.handle().is_some()).count()
    }

    fn reducer(&self, key: &ModelKey, level: PrecisionLevel) -> ModelResult<&Arc<PrecisionReducer>> {
        self.reducer.as_ref().ok_or_else(|| ModelError::Quantization {
            key: key.clone(),
            level,
            source: anyhow::anyhow!("no precision reducer configured"),
        })
    }

    /// Body of the spawned load task; always leaves the slot out of `Loading`
    async fn run_load(self: Arc<Self>, key: ModelKey) -> ModelResult<Arc<LoadedHandle>> {
        let mut guard = LoadGuard {
            inner: self.clone(),
            key: key.clone(),
            armed: true,
        };

        let started = Instant::now();
        let outcome = self.load_model(&key).await;
        guard.armed = false;

        match outcome {
            Ok(handle) => self.publish(&key, handle, started).await,
            Err(e) => {
                tracing::error!(model = %key, error = %e, kind = e.kind(), "Model load failed");
                metrics::record_load_failure(&key.to_string(), e.kind());
                self.fail(&key, e.to_string());
                Err(e)
            }
        }
    }

    /// Cache a freshly loaded handle, unless the registry closed meanwhile
    async fn publish(
        &self,
        key: &ModelKey,
        handle: LoadedHandle,
        started: Instant,
    ) -> ModelResult<Arc<LoadedHandle>> {
        let handle = Arc::new(handle);

        let rejection = match self.slots.get_mut(key) {
            Some(mut slot) if self.closed.load(Ordering::SeqCst) => {
                slot.last_error = Some(ModelError::ShutDown.to_string());
                self.set_state(key, &mut slot, SlotState::Failed);
                Some(ModelError::ShutDown)
            }
            Some(mut slot) => {
                if self.set_state(key, &mut slot, SlotState::Loaded(handle.clone())) {
                    slot.last_error = None;
                    None
                } else {
                    Some(ModelError::Failed {
                        key: key.clone(),
                        reason: "status changed while loading".to_string(),
                    })
                }
            }
            None => Some(ModelError::ShutDown),
        };

        if let Some(err) = rejection {
            tracing::warn!(model = %key, error = %err, "Discarding freshly loaded model");
            if let Err(e) = handle.release().await {
                tracing::warn!(model = %key, error = %e, "Failed to close discarded session");
            }
            return Err(err);
        }

        let elapsed = started.elapsed();
        tracing::info!(
            model = %key,
            precision = %handle.precision(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Model loaded"
        );
        metrics::record_model_loaded(&key.to_string(), elapsed);
        metrics::update_loaded_count(self.loaded_count());

        Ok(handle)
    }

    /// Acquire, verify, optionally reduce, load and smoke-test
    async fn load_model(&self, key: &ModelKey) -> ModelResult<LoadedHandle> {
        let desc = self
            .catalog
            .get(key)
            .ok_or_else(|| ModelError::NotConfigured(key.clone()))?;

        tracing::info!(model = %key, engine = self.engine.name(), "Loading model");

        let outcome = self
            .acquirer
            .acquire(desc)
            .await
            .map_err(|e| ModelError::from_acquisition(key.clone(), e))?;
        if let AcquireOutcome::Downloaded { files, bytes } = &outcome {
            tracing::info!(model = %key, files = ?files, bytes, "Artifacts acquired");
        }

        let metadata = self.verify_integrity(desc)?;
        let (weights_path, precision) = self.select_weights(desc).await?;

        let request = LoadRequest {
            key: key.clone(),
            role: desc.role,
            model_dir: desc.model_dir(),
            weights_path: weights_path.clone(),
            precision,
            options: self.options.engine_options.clone(),
        };
        let session = self
            .engine
            .load(request)
            .await
            .map_err(|source| ModelError::Load {
                key: key.clone(),
                source,
            })?;

        let smoke = smoke_test(
            session.as_ref(),
            desc.role,
            &self.options.smoke_prompt,
            self.options.smoke_max_tokens,
            self.options.smoke_timeout,
        )
        .await;

        if let Err(reason) = smoke {
            if let Err(e) = session.close().await {
                tracing::warn!(model = %key, error = %e, "Failed to close session after smoke test failure");
            }
            return Err(ModelError::SmokeTest {
                key: key.clone(),
                reason,
            });
        }

        Ok(LoadedHandle::new(
            key.clone(),
            precision,
            weights_path,
            metadata,
            session,
        ))
    }

    /// Weights plausible, config parses, tokenizer present
    fn verify_integrity(&self, desc: &ModelDescriptor) -> ModelResult<ModelMetadata> {
        let store = self.acquirer.store();

        let weights = desc.weights_path();
        match store.file_size(&weights) {
            None => {
                return Err(ModelError::Integrity {
                    path: weights,
                    reason: "weights file missing".to_string(),
                });
            }
            Some(size) if !store.is_plausible_size(size) => {
                return Err(ModelError::Integrity {
                    path: weights,
                    reason: format!(
                        "{} bytes, expected more than {}",
                        size,
                        store.min_plausible_size()
                    ),
                });
            }
            Some(_) => {}
        }

        let config = desc.file_path(&desc.config_file);
        let metadata = read_model_config(&config)
            .map_err(|reason| ModelError::Integrity { path: config, reason })?;

        let tokenizer = desc.file_path(&desc.tokenizer_file);
        if !store.file_size(&tokenizer).is_some_and(|size| size > 0) {
            return Err(ModelError::Integrity {
                path: tokenizer,
                reason: "tokenizer missing or empty".to_string(),
            });
        }

        Ok(metadata)
    }

    /// Weights file at the configured precision
    async fn select_weights(&self, desc: &ModelDescriptor) -> ModelResult<(PathBuf, PrecisionLevel)> {
        let level = self.options.precision;
        if level == PrecisionLevel::Fp32 {
            return Ok((desc.weights_path(), level));
        }

        let key = desc.key();
        let variant = self.reducer(&key, level)?.reduce(&key, level).await?;
        Ok((variant.path, variant.precision))
    }
}

/// Fails the slot if the load task is dropped before finishing
struct LoadGuard {
    inner: Arc<RegistryInner>,
    key: ModelKey,
    armed: bool,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(model = %self.key, "Load task ended without a result");
            self.inner
                .fail(&self.key, "load task ended without a result".to_string());
        }
    }
}
