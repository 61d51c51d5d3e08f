//! Inference engine boundary
//!
//! The registry only sees [`InferenceEngine`] and [`InferenceSession`]. The
//! production [`ProcessEngine`] runs a local inference server per model, on a
//! free loopback port, and talks to it over HTTP.

use super::descriptor::{ModelKey, ModelRole};
use super::quantize::PrecisionLevel;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Engine tuning applied to the spawned engine only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<u32>,
    /// Extra environment for the engine process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl EngineOptions {
    /// Environment the engine process is started with
    ///
    /// Explicit `env` entries win over the typed fields.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(threads) = self.threads {
            env.insert("LLAMA_ARG_THREADS".to_string(), threads.to_string());
            env.insert("OMP_NUM_THREADS".to_string(), threads.to_string());
        }
        if let Some(ctx) = self.context_size {
            env.insert("LLAMA_ARG_CTX_SIZE".to_string(), ctx.to_string());
        }
        if let Some(layers) = self.gpu_layers {
            env.insert("LLAMA_ARG_N_GPU_LAYERS".to_string(), layers.to_string());
        }
        for (k, v) in &self.env {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}

/// Everything an engine needs to bring one model up
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub key: ModelKey,
    pub role: ModelRole,
    pub model_dir: PathBuf,
    /// Weights file to load; a reduced variant when one was requested
    pub weights_path: PathBuf,
    pub precision: PrecisionLevel,
    pub options: EngineOptions,
}

/// A model resident in an engine
#[async_trait]
pub trait InferenceSession: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Release engine resources; called at most once by the registry
    async fn close(&self) -> Result<()>;
}

/// Factory for inference sessions
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn load(&self, request: LoadRequest) -> Result<Box<dyn InferenceSession>>;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// One-shot check that a fresh session produces output
///
/// Language models must return non-empty text, embedding models a non-empty
/// vector.
pub async fn smoke_test(
    session: &dyn InferenceSession,
    role: ModelRole,
    prompt: &str,
    max_tokens: u32,
    limit: Duration,
) -> Result<(), String> {
    let outcome = match role {
        ModelRole::Language => timeout(limit, session.generate(prompt, max_tokens))
            .await
            .map(|r| r.map(|text| text.trim().is_empty())),
        ModelRole::Embeddings => timeout(limit, session.embed(prompt))
            .await
            .map(|r| r.map(|v| v.is_empty())),
    };

    match outcome {
        Err(_) => Err(format!("no response within {:?}", limit)),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Ok(Ok(true)) => Err("engine returned empty output".to_string()),
        Ok(Ok(false)) => Ok(()),
    }
}

/// Configuration for [`ProcessEngine`]
#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    pub binary_path: String,
    /// Argument template; `{model}`, `{port}` and `{host}` are substituted
    pub args: Vec<String>,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
    pub stop_grace: Duration,
    /// Output lines that mean the server accepts requests
    pub ready_markers: Vec<String>,
}

impl Default for ProcessEngineConfig {
    fn default() -> Self {
        Self {
            binary_path: "llama-server".to_string(),
            args: vec![
                "--model".to_string(),
                "{model}".to_string(),
                "--host".to_string(),
                "{host}".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            ready_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(10),
            ready_markers: vec![
                "server is listening".to_string(),
                "HTTP server listening".to_string(),
                "Started HTTP server".to_string(),
            ],
        }
    }
}

const LOOPBACK: &str = "127.0.0.1";

/// Spawns one inference server process per loaded model
pub struct ProcessEngine {
    config: ProcessEngineConfig,
    client: reqwest::Client,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .no_proxy()
            .build()
            .context("failed to build engine HTTP client")?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ProcessEngineConfig {
        &self.config
    }

    fn render_args(&self, request: &LoadRequest, port: u16) -> Vec<String> {
        let model = request.weights_path.to_string_lossy();
        let port = port.to_string();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &model)
                    .replace("{host}", LOOPBACK)
                    .replace("{port}", &port)
            })
            .collect()
    }

    async fn wait_for_ready(&self, stderr: &mut ReaderLines, key: &ModelKey) -> Result<()> {
        let result = timeout(
            self.config.ready_timeout,
            monitor_output(stderr, &self.config.ready_markers, key),
        )
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => bail!(
                "timeout after {:?} waiting for engine to become ready",
                self.config.ready_timeout
            ),
        }
    }
}

type ReaderLines = tokio::io::Lines<BufReader<ChildStderr>>;

#[async_trait]
impl InferenceEngine for ProcessEngine {
    async fn load(&self, request: LoadRequest) -> Result<Box<dyn InferenceSession>> {
        let port = free_port().context("no free loopback port")?;
        let args = self.render_args(&request, port);

        let mut cmd = Command::new(&self.config.binary_path);
        cmd.args(&args)
            .envs(request.options.to_env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            binary = %self.config.binary_path,
            model = %request.key,
            port,
            args = ?args,
            "Spawning inference engine"
        );

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.binary_path))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to capture engine stderr"))?;
        let mut lines = BufReader::new(stderr).lines();

        if let Err(e) = self.wait_for_ready(&mut lines, &request.key).await {
            // kill_on_drop would also cover this; reap explicitly so no zombie lingers
            let _ = child.kill().await;
            return Err(e);
        }

        let key = request.key.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(model = %key, line = %line, "engine output");
            }
        });

        tracing::info!(model = %request.key, port, pid = ?child.id(), "Inference engine ready");

        Ok(Box::new(ProcessSession {
            key: request.key,
            base_url: format!("http://{}:{}", LOOPBACK, port),
            client: self.client.clone(),
            child: Mutex::new(Some(child)),
            stop_grace: self.config.stop_grace,
        }))
    }

    fn name(&self) -> &str {
        &self.config.binary_path
    }
}

/// Watch engine output for a readiness marker or an obvious failure
async fn monitor_output(lines: &mut ReaderLines, markers: &[String], key: &ModelKey) -> Result<()> {
    while let Some(line) = lines.next_line().await? {
        tracing::trace!(model = %key, line = %line, "engine output");

        if markers.iter().any(|m| line.contains(m.as_str())) {
            return Ok(());
        }

        if line.contains("out of memory") {
            bail!("engine ran out of memory: {}", line);
        }

        if line.contains("error:") || line.contains("failed to load model") {
            let mut context = vec![line];
            for _ in 0..5 {
                match lines.next_line().await {
                    Ok(Some(next)) => context.push(next),
                    _ => break,
                }
            }
            bail!("{}", context.join("\n"));
        }
    }

    bail!("engine exited before becoming ready")
}

/// Ask the OS for an unused loopback port
pub fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind((LOOPBACK, 0))?;
    Ok(listener.local_addr()?.port())
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub(crate) async fn request_completion(
    client: &reqwest::Client,
    base_url: &str,
    prompt: &str,
    max_tokens: u32,
) -> Result<String> {
    let response = client
        .post(format!("{}/completion", base_url))
        .json(&CompletionRequest {
            prompt,
            n_predict: max_tokens,
        })
        .send()
        .await
        .context("completion request failed")?
        .error_for_status()
        .context("engine rejected completion request")?;

    let body: CompletionResponse = response
        .json()
        .await
        .context("malformed completion response")?;
    Ok(body.content)
}

pub(crate) async fn request_embedding(
    client: &reqwest::Client,
    base_url: &str,
    text: &str,
) -> Result<Vec<f32>> {
    let response = client
        .post(format!("{}/embedding", base_url))
        .json(&EmbeddingRequest { content: text })
        .send()
        .await
        .context("embedding request failed")?
        .error_for_status()
        .context("engine rejected embedding request")?;

    let body: EmbeddingResponse = response
        .json()
        .await
        .context("malformed embedding response")?;
    Ok(body.embedding)
}

/// A running engine process serving one model
pub struct ProcessSession {
    key: ModelKey,
    base_url: String,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
    stop_grace: Duration,
}

impl ProcessSession {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl InferenceSession for ProcessSession {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        request_completion(&self.client, &self.base_url, prompt, max_tokens).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        request_embedding(&self.client, &self.base_url, text).await
    }

    async fn close(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        let Some(pid) = child.id() else {
            // Already reaped
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGTERM);

            tokio::select! {
                status = child.wait() => {
                    tracing::info!(model = %self.key, status = ?status.ok(), "Engine stopped gracefully");
                }
                _ = tokio::time::sleep(self.stop_grace) => {
                    tracing::warn!(model = %self.key, "Graceful stop timed out, sending SIGKILL");
                    let _ = kill(pid, Signal::SIGKILL);
                    child.wait().await.context("failed to reap engine process")?;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            child.kill().await.context("failed to kill engine process")?;
        }

        Ok(())
    }
}
