use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{ComfyClient, WsStream};
use crate::config::ClientConfig;
use crate::error::{ComfyError, Result};
use crate::session::{self, SessionToken};
use crate::types::*;
use crate::workflow::{GenerationParams, Workflow};

/// Runs text-to-image generations end to end against one ComfyUI server.
///
/// Each call opens its own WebSocket under a fresh [`SessionToken`], queues
/// the workflow, waits for the completion message, then downloads and
/// decodes the outputs. Calls share nothing but the HTTP connection pool, so
/// a client can be cloned into many tasks.
///
/// Dropping a `generate` future closes its socket. The job keeps running on
/// the server.
///
/// # Example
/// ```no_run
/// use comfyui_gen::{GenerationClient, GenerationParams};
///
/// # async fn example() -> comfyui_gen::Result<()> {
/// let client = GenerationClient::new("127.0.0.1:8188");
/// let images = client
///     .generate("a lighthouse in a storm", &GenerationParams::new().steps(30))
///     .await?;
/// for img in &images {
///     println!("{} {:?}", img.filename(), img.dimensions());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct GenerationClient {
    api: ComfyClient,
    template: Workflow,
}

impl GenerationClient {
    /// Client for `host:port` with the built-in txt2img template.
    pub fn new(server_address: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(server_address))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            api: ComfyClient::with_config(config),
            template: Workflow::txt2img(),
        }
    }

    /// Replace the workflow template prompts and parameters are merged into.
    pub fn with_template(mut self, template: Workflow) -> Self {
        self.template = template;
        self
    }

    /// The REST layer, for calls outside the generation flow.
    pub fn api(&self) -> &ComfyClient {
        &self.api
    }

    pub fn config(&self) -> &ClientConfig {
        self.api.config()
    }

    /// Generate images for `prompt`. Returns them in the order the server
    /// reported them; an empty output list yields an empty `Vec`.
    pub async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Vec<GeneratedImage>> {
        self.generate_with_progress(prompt, params, |_| {}).await
    }

    /// Like [`generate`](Self::generate), calling `on_progress` for each
    /// sampling step.
    pub async fn generate_with_progress<F>(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_progress: F,
    ) -> Result<Vec<GeneratedImage>>
    where
        F: FnMut(ProgressUpdate),
    {
        self.generate_detailed(prompt, params, on_progress)
            .await
            .map(|outcome| outcome.images)
    }

    /// Like [`generate_with_progress`](Self::generate_with_progress), also
    /// returning the prompt id, the submitted workflow and the seed it used,
    /// so the generation can be reproduced.
    pub async fn generate_detailed<F>(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_progress: F,
    ) -> Result<GenerationOutcome>
    where
        F: FnMut(ProgressUpdate),
    {
        let started = Instant::now();
        let built = self.template.build(prompt, params)?;
        if let Some(seed) = built.seed {
            debug!(seed, "resolved seed");
        }
        let (prompt_id, images) = self.run(&built.payload, None, on_progress).await?;
        Ok(GenerationOutcome {
            prompt_id,
            images,
            seed: built.seed,
            workflow: built.payload,
            elapsed: started.elapsed(),
        })
    }

    /// Run an already-built API-format workflow.
    pub async fn generate_with_workflow(&self, workflow: &Value) -> Result<Vec<GeneratedImage>> {
        self.run(workflow, None, |_| {}).await.map(|(_, images)| images)
    }

    /// Upload `input_image` to the server, then run `workflow`. The workflow
    /// is expected to reference the image by `upload_name`.
    pub async fn generate_with_input_image(
        &self,
        workflow: &Value,
        input_image: impl AsRef<Path>,
        upload_name: &str,
    ) -> Result<Vec<GeneratedImage>> {
        self.run(workflow, Some((input_image.as_ref(), upload_name)), |_| {})
            .await
            .map(|(_, images)| images)
    }

    /// Queue `workflow` and wait for it to finish without fetching outputs.
    /// Useful to get models loaded before the first real request.
    pub async fn warm_up(&self, workflow: &Value) -> Result<()> {
        let token = SessionToken::new();
        let mut ws = self.api.connect_ws(&token).await?;
        let outcome = self.submit_and_wait(&mut ws, &token, workflow, |_| {}).await;
        close(&mut ws).await;
        outcome.map(|_| ())
    }

    /// Ask the server to free memory and/or unload models.
    pub async fn clear(&self, unload_models: bool, free_memory: bool) -> Result<()> {
        self.api.free_memory(unload_models, free_memory).await
    }

    async fn run<F>(
        &self,
        workflow: &Value,
        upload: Option<(&Path, &str)>,
        on_progress: F,
    ) -> Result<(String, Vec<GeneratedImage>)>
    where
        F: FnMut(ProgressUpdate),
    {
        let started = Instant::now();
        let token = SessionToken::new();
        let mut ws = self.api.connect_ws(&token).await?;

        if let Some((path, name)) = upload {
            if let Err(e) = self.api.upload_image(path, name, token.as_str(), false).await {
                close(&mut ws).await;
                return Err(e);
            }
        }

        let waited = self.submit_and_wait(&mut ws, &token, workflow, on_progress).await;
        let outcome = match waited {
            Ok(prompt_id) => self
                .collect_images(&prompt_id)
                .await
                .map(|images| (prompt_id, images)),
            Err(e) => Err(e),
        };
        close(&mut ws).await;

        if let Ok((_, images)) = &outcome {
            info!(
                count = images.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "generation finished"
            );
        }
        outcome
    }

    /// Queue the workflow under `token` and block on the socket until its
    /// completion message. Returns the prompt id.
    async fn submit_and_wait<F>(
        &self,
        ws: &mut WsStream,
        token: &SessionToken,
        workflow: &Value,
        on_progress: F,
    ) -> Result<String>
    where
        F: FnMut(ProgressUpdate),
    {
        let prompt_id = self.api.queue_prompt(workflow, token.as_str()).await?;
        let timeout = self.config().completion_timeout;
        match tokio::time::timeout(
            timeout,
            session::wait_for_completion(ws, &prompt_id, on_progress),
        )
        .await
        {
            Ok(result) => result.map(|_| prompt_id),
            Err(_) => {
                warn!(prompt_id = %prompt_id, ?timeout, "gave up waiting for completion");
                Err(ComfyError::Timeout)
            }
        }
    }

    /// Fetch and decode every output of `prompt_id`.
    ///
    /// A decode failure does not stop the batch: the remaining images are
    /// still fetched, and the error carries every image that did decode.
    async fn collect_images(&self, prompt_id: &str) -> Result<Vec<GeneratedImage>> {
        let Some(history) = self.api.history(prompt_id).await? else {
            warn!(prompt_id, "no history entry for prompt");
            return Ok(Vec::new());
        };

        let include_previews = self.config().include_previews;
        let refs: Vec<ImageRef> = history
            .images
            .into_iter()
            .filter(|img| img.img_type == "output" || (include_previews && img.is_preview()))
            .collect();
        if refs.is_empty() {
            warn!(prompt_id, "prompt produced no images");
            return Ok(Vec::new());
        }

        let mut images = Vec::with_capacity(refs.len());
        let mut failures = Vec::new();
        for (index, reference) in refs.into_iter().enumerate() {
            let bytes = self.api.image(&reference).await?;
            match decode(reference, bytes) {
                Ok(img) => images.push(img),
                Err((reference, reason)) => {
                    warn!(filename = %reference.filename, %reason, "image failed to decode");
                    failures.push(DecodeFailure {
                        index,
                        filename: reference.filename,
                        reason,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(images)
        } else {
            Err(ComfyError::ImageDecode(Box::new(PartialBatch { images, failures })))
        }
    }
}

fn decode(reference: ImageRef, bytes: Vec<u8>) -> std::result::Result<GeneratedImage, (ImageRef, String)> {
    match image::load_from_memory(&bytes) {
        Ok(image) => Ok(GeneratedImage {
            reference,
            bytes,
            image,
        }),
        Err(e) => Err((reference, e.to_string())),
    }
}

async fn close(ws: &mut WsStream) {
    if let Err(e) = ws.close(None).await {
        debug!(error = %e, "WebSocket close failed");
    }
}

/// True when `path` is non-empty and made only of plain names (no `..`,
/// root or prefix).
fn is_relative_name(path: &Path) -> bool {
    let mut components = path.components().peekable();
    components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
}

/// Where `reference` lands under `output_dir`: previews under `temp/`, then
/// the server's subfolder, then the file name.
fn save_path(output_dir: &Path, reference: &ImageRef) -> Result<PathBuf> {
    let filename = Path::new(&reference.filename);
    if filename.components().count() != 1 || !is_relative_name(filename) {
        return Err(ComfyError::InvalidResponse(format!(
            "Refusing to save image with unsafe filename {:?}",
            reference.filename
        )));
    }
    let subfolder = Path::new(&reference.subfolder);
    if !reference.subfolder.is_empty() && !is_relative_name(subfolder) {
        return Err(ComfyError::InvalidResponse(format!(
            "Refusing to save image with unsafe subfolder {:?}",
            reference.subfolder
        )));
    }

    let mut path = output_dir.to_path_buf();
    if reference.is_preview() {
        path.push("temp");
    }
    path.push(subfolder);
    path.push(filename);
    Ok(path)
}

/// Write `images` into `output_dir`, keeping the server's subfolder and
/// putting preview images under `output_dir/temp/`. Returns the written
/// paths.
///
/// Every name is checked before anything is written; a file name or
/// subfolder that would leave `output_dir` fails with
/// [`ComfyError::InvalidResponse`].
pub fn save_images(images: &[GeneratedImage], output_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let paths = images
        .iter()
        .map(|img| save_path(output_dir.as_ref(), &img.reference))
        .collect::<Result<Vec<_>>>()?;

    for (img, path) in images.iter().zip(&paths) {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, &img.bytes)?;
        info!(path = %path.display(), "image saved");
    }
    Ok(paths)
}

/// Generate images for `prompt` on the ComfyUI server at `server_address`
/// (`host:port`) with the built-in txt2img workflow.
///
/// Returns every image the history reports, `temp` previews included.
///
/// # Example
/// ```no_run
/// # async fn example() -> comfyui_gen::Result<()> {
/// let images = comfyui_gen::text2img(
///     "A majestic dragon flying through the clouds.",
///     &Default::default(),
///     "127.0.0.1:8188",
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn text2img(
    prompt: &str,
    params: &GenerationParams,
    server_address: &str,
) -> Result<Vec<GeneratedImage>> {
    let config = ClientConfig::builder()
        .with_server_address(server_address)
        .with_previews(true)
        .build();
    GenerationClient::with_config(config)
        .generate(prompt, params)
        .await
}
