//! Demonstrate model discovery and merging parameters into a workflow.
//!
//! Lists available checkpoints, samplers, and schedulers, then merges a
//! prompt with LoRA tags and a parameter set into the txt2img template and
//! prints the JSON that would be queued.
//!
//! ```sh
//! cargo run --example workflow_builder
//! ```

use comfyui_gen::{ComfyClient, GenerationParams, Workflow};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let client = ComfyClient::new("127.0.0.1:8188");

    // Discover available options
    let checkpoints = client.checkpoints().await?;
    let samplers = client.samplers().await?;
    let schedulers = client.schedulers().await?;

    println!("Checkpoints ({}):", checkpoints.len());
    for c in &checkpoints {
        println!("  - {}", c);
    }
    println!("\nSamplers ({}):", samplers.len());
    for s in &samplers {
        println!("  - {}", s);
    }
    println!("\nSchedulers ({}):", schedulers.len());
    for s in &schedulers {
        println!("  - {}", s);
    }

    let mut params = GenerationParams::new()
        .negative("lowres, blurry, bad anatomy, watermark")
        .size(1024, 1024)
        .steps(30)
        .cfg_scale(7.0)
        .sampler("dpmpp_2m")
        .scheduler("karras")
        .seed(42)
        .batch_size(2)
        .filename_prefix("my-project")
        .set("KSampler.denoise", 0.9);
    if let Some(ckpt) = checkpoints.first() {
        params = params.checkpoint(ckpt.as_str());
    }

    let built = Workflow::txt2img().build(
        "masterpiece, best quality, landscape painting <lora:film_grain:0.6>",
        &params,
    )?;
    println!("\nWorkflow JSON:");
    println!("{}", serde_json::to_string_pretty(&built.payload)?);
    println!("\nSeed: {:?}", built.seed);

    Ok(())
}
