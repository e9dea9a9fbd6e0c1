//! # comfyui-gen
//!
//! Async Rust client for text-to-image generation on a
//! [ComfyUI](https://github.com/comfyanonymous/ComfyUI) server.
//!
//! A generation call builds a workflow from a prompt and a parameter set,
//! opens a WebSocket under a fresh session token, queues the workflow over
//! HTTP, waits for the completion message of that job, then downloads the
//! outputs and decodes them into [`image::DynamicImage`]s.
//!
//! ## Quick Start
//!
//! ```no_run
//! use comfyui_gen::{GenerationClient, GenerationParams};
//!
//! # async fn example() -> comfyui_gen::Result<()> {
//! let client = GenerationClient::new("127.0.0.1:8188");
//!
//! let params = GenerationParams::new()
//!     .negative("lowres, blurry")
//!     .size(512, 768)
//!     .steps(25);
//!
//! let images = client
//!     .generate_with_progress("a sunset over mountains", &params, |p| {
//!         println!("Step {}/{}", p.current_step, p.total_steps)
//!     })
//!     .await?;
//!
//! comfyui_gen::save_images(&images, "out")?;
//! # Ok(())
//! # }
//! ```
//!
//! For a one-off call, [`text2img`] takes the server address directly.

pub mod client;
pub mod config;
pub mod error;
pub mod generation;
pub mod session;
pub mod types;
pub mod workflow;

pub use client::ComfyClient;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{ComfyError, Result};
pub use generation::{save_images, text2img, GenerationClient};
pub use session::{ServerMessage, SessionToken};
pub use types::{
    DecodeFailure, GeneratedImage, GenerationOutcome, ImageRef, PartialBatch, ProgressUpdate,
    PromptHistory, QueueStatus,
};
pub use workflow::{BuiltWorkflow, GenerationParams, LoraTag, Workflow};
