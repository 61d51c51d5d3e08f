//! Shared test doubles for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use model_keeper::models::download::{Acquirer, FetchError, Fetcher, RetryPolicy};
use model_keeper::models::loader::{InferenceEngine, InferenceSession, LoadRequest};
use model_keeper::models::quantize::{BlockQuantizer, Converter, PrecisionLevel, PrecisionReducer};
use model_keeper::models::registry::{ModelRegistry, RegistryOptions};
use model_keeper::models::store::ArtifactStore;
use model_keeper::models::{ModelCatalog, ModelDescriptor, ModelKey, ModelRole};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Threshold used by fixtures; weights must be larger than this
pub const MIN_SIZE: u64 = 1024;

pub const SOURCE_URL: &str = "http://models.test/gpt2-medium";

/// `n` little-endian f32 values forming a ramp
pub fn fp32_weights(n: usize) -> Vec<u8> {
    (0..n)
        .flat_map(|i| ((i as f32 - n as f32 / 2.0) * 0.001).to_le_bytes())
        .collect()
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        backoff_multiplier: 2.0,
    }
}

/// How a scripted URL should answer each attempt
#[derive(Debug, Clone)]
pub enum Reply {
    Body(Vec<u8>),
    /// Write this many bytes of the body, then fail like a dropped connection
    Truncate(usize),
    Status(u16),
}

/// In-memory fetcher with per-URL scripts and call counting
#[derive(Default)]
pub struct MemoryFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    scripts: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a model with valid weights, config and tokenizer
    pub fn with_model(self, source_url: &str, weights: Vec<u8>) -> Self {
        self.set_body(&format!("{}/model.safetensors", source_url), weights);
        self.set_body(
            &format!("{}/config.json", source_url),
            br#"{"model_type":"gpt2","n_embd":1024,"n_layer":24,"vocab_size":50257}"#.to_vec(),
        );
        self.set_body(
            &format!("{}/tokenizer.json", source_url),
            br#"{"version":"1.0","model":{"type":"BPE"}}"#.to_vec(),
        );
        self
    }

    pub fn set_body(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    /// Replies consumed in order before falling back to the body
    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        self.scripts.lock().unwrap().insert(url.to_string(), replies);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .get_mut(url)
                .and_then(|replies| (!replies.is_empty()).then(|| replies.remove(0)))
        };
        let body = self.bodies.lock().unwrap().get(url).cloned();

        let reply = match (scripted, body) {
            (Some(reply), _) => reply,
            (None, Some(body)) => Reply::Body(body),
            (None, None) => Reply::Status(404),
        };

        let io_err = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };

        match reply {
            Reply::Body(body) => {
                tokio::fs::write(dest, &body).await.map_err(io_err)?;
                Ok(body.len() as u64)
            }
            Reply::Truncate(n) => {
                let body = self.bodies.lock().unwrap().get(url).cloned().unwrap_or_default();
                let n = n.min(body.len());
                tokio::fs::write(dest, &body[..n]).await.map_err(io_err)?;
                Err(FetchError::Other(format!("connection reset after {} bytes", n)))
            }
            Reply::Status(status) => Err(FetchError::Status {
                url: url.to_string(),
                status,
            }),
        }
    }
}

/// Knobs shared by a [`MockEngine`] and its sessions
#[derive(Default)]
pub struct EngineState {
    pub loads: AtomicUsize,
    pub closes: AtomicUsize,
    pub generations: AtomicUsize,
    /// Remaining loads that should fail
    pub fail_loads: AtomicUsize,
    pub empty_output: AtomicBool,
    pub fail_close: AtomicBool,
    pub load_delay_ms: AtomicUsize,
    pub requests: Mutex<Vec<LoadRequest>>,
}

pub struct MockEngine {
    pub state: Arc<EngineState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState::default()),
        }
    }

    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn set_load_delay(&self, delay: Duration) {
        self.state
            .load_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn fail_next_loads(&self, n: usize) {
        self.state.fail_loads.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn load(&self, request: LoadRequest) -> anyhow::Result<Box<dyn InferenceSession>> {
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().unwrap().push(request.clone());

        let delay = self.state.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let should_fail = self
            .state
            .fail_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("engine crashed while mapping weights");
        }

        Ok(Box::new(MockSession {
            key: request.key,
            state: self.state.clone(),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

pub struct MockSession {
    key: ModelKey,
    state: Arc<EngineState>,
}

#[async_trait]
impl InferenceSession for MockSession {
    async fn generate(&self, prompt: &str, _max_tokens: u32) -> anyhow::Result<String> {
        self.state.generations.fetch_add(1, Ordering::SeqCst);
        if self.state.empty_output.load(Ordering::SeqCst) {
            return Ok(String::new());
        }
        Ok(format!("[{}] {}", self.key, prompt))
    }

    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        if self.state.empty_output.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(vec![0.25; 4])
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            anyhow::bail!("engine did not exit");
        }
        Ok(())
    }
}

/// Block quantizer that counts conversions
pub struct CountingConverter {
    inner: BlockQuantizer,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl CountingConverter {
    pub fn new() -> Self {
        Self {
            inner: BlockQuantizer::default(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for CountingConverter {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        from: PrecisionLevel,
        to: PrecisionLevel,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.convert(input, output, from, to).await
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// A temp store with one language and one embeddings model configured
pub struct Fixture {
    pub dir: TempDir,
    pub catalog: Arc<ModelCatalog>,
    pub fetcher: Arc<MemoryFetcher>,
    pub acquirer: Arc<Acquirer>,
    pub converter: Arc<CountingConverter>,
    pub reducer: Arc<PrecisionReducer>,
    pub engine: Arc<MockEngine>,
}

pub const EMBED_URL: &str = "http://models.test/minilm";

impl Fixture {
    pub fn new() -> Self {
        Self::with_converter(CountingConverter::new())
    }

    pub fn with_converter(converter: CountingConverter) -> Self {
        let dir = TempDir::new().unwrap();
        let language = ModelDescriptor::new(ModelRole::Language, "gpt2-medium", SOURCE_URL, dir.path());
        let embeddings = ModelDescriptor::new(ModelRole::Embeddings, "minilm", EMBED_URL, dir.path());
        let catalog = Arc::new(ModelCatalog::new([language, embeddings]));

        let fetcher = Arc::new(
            MemoryFetcher::new()
                .with_model(SOURCE_URL, fp32_weights(1024))
                .with_model(EMBED_URL, fp32_weights(512)),
        );
        let store = ArtifactStore::new(dir.path(), MIN_SIZE);
        let acquirer = Arc::new(Acquirer::new(store, fetcher.clone(), fast_retry()));
        let converter = Arc::new(converter);
        let reducer = Arc::new(PrecisionReducer::new(
            catalog.clone(),
            acquirer.clone(),
            converter.clone(),
        ));

        Self {
            dir,
            catalog,
            fetcher,
            acquirer,
            converter,
            reducer,
            engine: Arc::new(MockEngine::new()),
        }
    }

    pub fn language_key(&self) -> ModelKey {
        ModelKey::new(ModelRole::Language, "gpt2-medium")
    }

    pub fn embeddings_key(&self) -> ModelKey {
        ModelKey::new(ModelRole::Embeddings, "minilm")
    }

    pub fn descriptor(&self, key: &ModelKey) -> &ModelDescriptor {
        self.catalog.get(key).unwrap()
    }

    pub fn options(&self) -> RegistryOptions {
        RegistryOptions {
            wait_timeout: Duration::from_secs(5),
            smoke_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    pub fn registry(&self) -> ModelRegistry {
        self.registry_with(self.options())
    }

    pub fn registry_with(&self, options: RegistryOptions) -> ModelRegistry {
        ModelRegistry::new(
            self.catalog.clone(),
            self.acquirer.clone(),
            Some(self.reducer.clone()),
            self.engine.clone(),
            options,
        )
    }

    /// Staging directories left in a model directory
    pub fn staging_dirs(&self, key: &ModelKey) -> usize {
        std::fs::read_dir(self.descriptor(key).model_dir())
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
                    .count()
            })
            .unwrap_or(0)
    }
}
