//! Generate an image with real-time WebSocket progress tracking.
//!
//! ```sh
//! cargo run --example progress_tracking
//! ```

use comfyui_gen::{ClientConfig, GenerationClient, GenerationParams};
use std::time::Duration;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ClientConfig::builder()
        .with_server_address("127.0.0.1:8188")
        .with_completion_timeout(Duration::from_secs(300))
        .build();
    let client = GenerationClient::with_config(config);

    let params = GenerationParams::new().steps(30).cfg_scale(7.5).seed(-1);
    let images = client
        .generate_with_progress("a cat wearing a tiny hat, digital art", &params, |progress| {
            let pct = (progress.current_step as f64 / progress.total_steps as f64) * 100.0;
            println!(
                "  Step {}/{} ({:.0}%)",
                progress.current_step, progress.total_steps, pct
            );
        })
        .await?;

    for img in &images {
        let (w, h) = img.dimensions();
        println!("Done: {} ({}x{})", img.filename(), w, h);
    }

    Ok(())
}
