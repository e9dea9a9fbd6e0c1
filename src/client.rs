use std::path::Path;
use std::time::Duration;

use reqwest::{multipart, Client, Response};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{ComfyError, Result};
use crate::session::SessionToken;
use crate::types::*;

/// WebSocket connection to ComfyUI's `/ws` endpoint.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Async REST and WebSocket access to a ComfyUI server instance.
///
/// One method per server endpoint: prompt queuing, history retrieval, image
/// download and upload, queue control and model discovery. The end-to-end
/// generation flow lives in [`GenerationClient`](crate::GenerationClient).
///
/// # Example
/// ```no_run
/// use comfyui_gen::ComfyClient;
///
/// # async fn example() -> comfyui_gen::Result<()> {
/// let client = ComfyClient::new("127.0.0.1:8188");
/// let healthy = client.health().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ComfyClient {
    http: Client,
    config: ClientConfig,
}

impl ComfyClient {
    /// Create a client for the server at `host:port`, with default settings.
    pub fn new(server_address: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(server_address))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the HTTP base URL, e.g. `http://127.0.0.1:8188`.
    pub fn endpoint(&self) -> String {
        self.config.http_base()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.http_base(), path)
    }

    fn unreachable(&self, err: impl std::fmt::Display) -> ComfyError {
        ComfyError::connection(
            format!(
                "Cannot connect to ComfyUI at {} (is the service running?)",
                self.config.server_address
            ),
            err,
        )
    }

    async fn json_body(resp: Response, what: &str) -> Result<Value> {
        resp.json().await.map_err(|e| {
            ComfyError::InvalidResponse(format!("Failed to parse ComfyUI {} response: {}", what, e))
        })
    }

    async fn ensure_success(resp: Response) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(ComfyError::Http { status, body })
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Check whether ComfyUI is reachable via `/system_stats`.
    pub async fn health(&self) -> Result<bool> {
        let resp = self
            .http
            .get(self.url("/system_stats"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(resp.status().is_success())
    }

    // ── WebSocket ───────────────────────────────────────────────────

    /// Open `/ws?clientId=<token>`. ComfyUI routes progress and completion
    /// messages for prompts queued with this token to the returned socket.
    pub async fn connect_ws(&self, token: &SessionToken) -> Result<WsStream> {
        let ws_url = format!("{}/ws?clientId={}", self.config.ws_base(), token);
        let connect = tokio_tungstenite::connect_async(ws_url.as_str());
        let (ws, _) = tokio::time::timeout(self.config.request_timeout, connect)
            .await
            .map_err(|_| self.unreachable("WebSocket handshake timed out"))?
            .map_err(|e| self.unreachable(e))?;
        info!(server = %self.config.server_address, client_id = %token, "WebSocket connected");
        Ok(ws)
    }

    // ── Prompt ──────────────────────────────────────────────────────

    /// Queue a workflow for execution under `client_id`. Returns the `prompt_id`.
    pub async fn queue_prompt(&self, workflow: &Value, client_id: &str) -> Result<String> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let resp = self
            .http
            .post(self.url("/prompt"))
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ComfyError::Submission { status, message });
        }

        let json = Self::json_body(resp, "/prompt").await?;

        if let Some(errors) = json.get("node_errors").and_then(|e| e.as_object()) {
            if !errors.is_empty() {
                return Err(ComfyError::Submission {
                    status,
                    message: serde_json::to_string_pretty(errors)?,
                });
            }
        }

        let prompt_id = json
            .get("prompt_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ComfyError::InvalidResponse("Response missing prompt_id".into()))?;
        info!(prompt_id = %prompt_id, "prompt queued");
        Ok(prompt_id)
    }

    // ── History ─────────────────────────────────────────────────────

    /// Fetch the history entry for a prompt. Returns `None` if the server
    /// has no entry for it.
    pub async fn history(&self, prompt_id: &str) -> Result<Option<PromptHistory>> {
        let resp = self
            .http
            .get(self.url(&format!("/history/{}", prompt_id)))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let resp = Self::ensure_success(resp).await?;
        let json = Self::json_body(resp, "history").await?;
        let history = parse_history(&json, prompt_id);
        debug!(prompt_id, found = history.is_some(), "fetched history");
        Ok(history)
    }

    // ── Images ──────────────────────────────────────────────────────

    /// Download an image by its reference. Returns raw bytes.
    pub async fn image(&self, img: &ImageRef) -> Result<Vec<u8>> {
        let url = reqwest::Url::parse_with_params(
            &self.url("/view"),
            &[
                ("filename", img.filename.as_str()),
                ("subfolder", img.subfolder.as_str()),
                ("type", img.img_type.as_str()),
            ],
        )
        .map_err(|e| ComfyError::InvalidRequest(format!("Bad image URL: {}", e)))?;

        let resp = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        if !resp.status().is_success() {
            return Err(ComfyError::Http {
                status: resp.status().as_u16(),
                body: format!("Failed to fetch image {}", img.filename),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| {
            ComfyError::connection(format!("Failed to read bytes of {}", img.filename), e)
        })?;
        debug!(filename = %img.filename, size = bytes.len(), "image downloaded");
        Ok(bytes.to_vec())
    }

    /// Upload a local image into ComfyUI's `input` folder so a workflow can
    /// load it. Returns where the server stored it.
    pub async fn upload_image(
        &self,
        path: impl AsRef<Path>,
        name: &str,
        client_id: &str,
        overwrite: bool,
    ) -> Result<ImageRef> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let part = multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("image/png")
            .map_err(|e| ComfyError::InvalidRequest(format!("Bad upload part: {}", e)))?;
        let form = multipart::Form::new()
            .part("image", part)
            .text("type", "input")
            .text("overwrite", overwrite.to_string())
            .text("client_id", client_id.to_string());

        let resp = self
            .http
            .post(self.url("/upload/image"))
            .timeout(self.config.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let resp = Self::ensure_success(resp).await?;
        let json = Self::json_body(resp, "/upload/image").await?;

        let filename = json
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ComfyError::InvalidResponse("Upload response missing name".into()))?;
        info!(filename, "image uploaded");
        Ok(ImageRef {
            filename: filename.to_string(),
            subfolder: json
                .get("subfolder")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            img_type: json
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("input")
                .to_string(),
        })
    }

    // ── Queue status ────────────────────────────────────────────────

    /// Get the current ComfyUI queue state (running + pending counts).
    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let resp = self
            .http
            .get(self.url("/queue"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let json = Self::json_body(Self::ensure_success(resp).await?, "queue").await?;
        Ok(parse_queue_status(&json))
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Ask the server to free memory and/or unload all models.
    pub async fn free_memory(&self, unload_models: bool, free_memory: bool) -> Result<()> {
        let body = serde_json::json!({
            "unload_models": unload_models,
            "free_memory": free_memory,
        });
        let resp = self
            .http
            .post(self.url("/free"))
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Self::ensure_success(resp).await?;
        info!(unload_models, free_memory, "ComfyUI cache cleared");
        Ok(())
    }

    /// Interrupt the currently running generation.
    pub async fn interrupt(&self) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/interrupt"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Self::ensure_success(resp).await?;
        Ok(())
    }

    // ── Model discovery ─────────────────────────────────────────────

    /// Raw `/object_info/<node_class>` description.
    pub async fn object_info(&self, node_class: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!("/object_info/{}", node_class)))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let resp = Self::ensure_success(resp).await?;
        Self::json_body(resp, "object_info").await
    }

    /// List available checkpoint models from ComfyUI.
    pub async fn checkpoints(&self) -> Result<Vec<String>> {
        self.object_info_list(
            "CheckpointLoaderSimple",
            "/CheckpointLoaderSimple/input/required/ckpt_name/0",
        )
        .await
    }

    /// List available sampler algorithms from ComfyUI.
    pub async fn samplers(&self) -> Result<Vec<String>> {
        self.object_info_list("KSampler", "/KSampler/input/required/sampler_name/0")
            .await
    }

    /// List available scheduler algorithms from ComfyUI.
    pub async fn schedulers(&self) -> Result<Vec<String>> {
        self.object_info_list("KSampler", "/KSampler/input/required/scheduler/0")
            .await
    }

    async fn object_info_list(&self, node: &str, pointer: &str) -> Result<Vec<String>> {
        let json = self.object_info(node).await?;
        Ok(string_list(&json, pointer))
    }
}

/// Image references of a `/history/<id>` response, in server order.
fn parse_history(json: &Value, prompt_id: &str) -> Option<PromptHistory> {
    let entry = json.get(prompt_id)?;

    let status = entry
        .pointer("/status/status_str")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let completed = entry
        .pointer("/status/completed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let images = entry
        .get("outputs")
        .and_then(|o| o.as_object())
        .into_iter()
        .flat_map(|outputs| outputs.values())
        .filter_map(|node_output| node_output.get("images").and_then(|i| i.as_array()))
        .flatten()
        .filter_map(|img| serde_json::from_value::<ImageRef>(img.clone()).ok())
        .collect();

    Some(PromptHistory {
        status: status.to_string(),
        completed,
        images,
    })
}

fn parse_queue_status(json: &Value) -> QueueStatus {
    let count = |key: &str| {
        json.get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.len() as u32)
            .unwrap_or(0)
    };
    QueueStatus {
        running: count("queue_running"),
        pending: count("queue_pending"),
    }
}

fn string_list(json: &Value, pointer: &str) -> Vec<String> {
    json.pointer(pointer)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
