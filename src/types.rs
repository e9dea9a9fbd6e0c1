use std::time::Duration;

use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Real-time progress update from ComfyUI's WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub current_step: u32,
    pub total_steps: u32,
}

/// Reference to an image stored in one of ComfyUI's folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub img_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

impl ImageRef {
    /// Preview images live in ComfyUI's `temp` folder.
    pub fn is_preview(&self) -> bool {
        self.img_type == "temp"
    }
}

/// Parsed history entry for a prompt.
#[derive(Debug, Clone)]
pub struct PromptHistory {
    pub status: String,
    pub completed: bool,
    /// Image references in the order the server reported them.
    pub images: Vec<ImageRef>,
}

/// Snapshot of ComfyUI's queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub running: u32,
    pub pending: u32,
}

/// A generated image, fetched and decoded.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub reference: ImageRef,
    /// Raw bytes as served by `/view`.
    pub bytes: Vec<u8>,
    pub image: DynamicImage,
}

impl GeneratedImage {
    pub fn filename(&self) -> &str {
        &self.reference.filename
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Why a single image in a batch could not be decoded.
#[derive(Debug, Clone)]
pub struct DecodeFailure {
    /// Position of the image in the server's output list.
    pub index: usize,
    pub filename: String,
    pub reason: String,
}

/// A batch in which at least one image failed to decode.
///
/// `images` holds every image that decoded, in server order.
#[derive(Debug, Clone)]
pub struct PartialBatch {
    pub images: Vec<GeneratedImage>,
    pub failures: Vec<DecodeFailure>,
}

impl PartialBatch {
    pub fn total(&self) -> usize {
        self.images.len() + self.failures.len()
    }
}

/// A finished generation with what is needed to reproduce it.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub prompt_id: String,
    pub images: Vec<GeneratedImage>,
    /// Seed written into the workflow, random ones included.
    pub seed: Option<i64>,
    /// The payload that was queued.
    pub workflow: Value,
    pub elapsed: Duration,
}
