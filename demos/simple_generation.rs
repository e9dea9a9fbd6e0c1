//! Generate images from a text prompt and save them to `./output`.
//!
//! Requires a running ComfyUI instance (default 127.0.0.1:8188, override
//! with `COMFYUI_SERVER_ADDRESS`) with at least one checkpoint installed.
//!
//! ```sh
//! cargo run --example simple_generation
//! ```

use comfyui_gen::{save_images, ClientConfig, ComfyError, GenerationClient, GenerationParams};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let client = GenerationClient::with_config(ClientConfig::from_env());

    // Check connection
    if !client.api().health().await? {
        eprintln!("ComfyUI is not responding");
        return Ok(());
    }

    let checkpoints = client.api().checkpoints().await?;
    let Some(checkpoint) = checkpoints.first() else {
        eprintln!("No checkpoints found, install a model first");
        return Ok(());
    };
    println!("Using checkpoint: {}", checkpoint);

    let params = GenerationParams::new()
        .checkpoint(checkpoint.as_str())
        .negative("lowres, blurry, bad anatomy")
        .steps(25)
        .cfg_scale(7.5);

    let images = match client
        .generate("A majestic dragon flying through the clouds.", &params)
        .await
    {
        Ok(images) => images,
        Err(ComfyError::ImageDecode(batch)) => {
            for failure in &batch.failures {
                eprintln!("Could not decode {}: {}", failure.filename, failure.reason);
            }
            batch.images
        }
        Err(e) => return Err(e.into()),
    };

    if images.is_empty() {
        eprintln!("The server produced no images");
        return Ok(());
    }
    for path in save_images(&images, "output")? {
        println!("Saved: {}", path.display());
    }

    Ok(())
}
