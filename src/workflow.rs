use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::{ComfyError, Result};

const DEFAULT_CHECKPOINT: &str = "v1-5-pruned-emaonly.safetensors";

const LORA_LOADER: &str = "Power Lora Loader (rgthree)";
const SEED_NODE: &str = "Seed (rgthree)";
const PROMPT_GENERATOR: &str = "DPRandomGenerator";

/// Generation options merged into a workflow template.
///
/// Every field is optional: unset fields keep the template's value. Keys the
/// template schema does not name go into `extra` as `"<node>.<input>"`,
/// where `<node>` is a node id or a `class_type`. Deserializing from a
/// free-form JSON object fills the typed fields and leaves the rest in
/// `extra`.
///
/// # Example
/// ```
/// use comfyui_gen::GenerationParams;
///
/// let params = GenerationParams::new()
///     .negative("lowres, blurry")
///     .size(512, 768)
///     .steps(25)
///     .cfg_scale(7.5)
///     .set("SaveImage.filename_prefix", "dragons");
///
/// assert_eq!(params.width, Some(512));
/// assert!(params.extra.contains_key("SaveImage.filename_prefix"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    /// Negative values request a random seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_prefix: Option<String>,
    /// Directory searched when resolving `<lora:name:weight>` tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loras_dir: Option<PathBuf>,
    /// Raw `"<node>.<input>"` overrides for options without a typed field.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the negative prompt.
    pub fn negative(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(prompt.into());
        self
    }

    /// Set output dimensions.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Set the number of sampling steps.
    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Set the classifier-free guidance scale.
    pub fn cfg_scale(mut self, cfg: f64) -> Self {
        self.cfg_scale = Some(cfg);
        self
    }

    /// Set the sampler algorithm (e.g. "euler", "dpmpp_2m", "dpmpp_sde").
    pub fn sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler = Some(sampler.into());
        self
    }

    /// Set the noise scheduler (e.g. "normal", "karras", "exponential").
    pub fn scheduler(mut self, scheduler: impl Into<String>) -> Self {
        self.scheduler = Some(scheduler.into());
        self
    }

    /// Set a specific seed. Use -1 for random.
    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the batch size (number of images per generation).
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = Some(checkpoint.into());
        self
    }

    /// Set the output filename prefix in ComfyUI.
    pub fn filename_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.filename_prefix = Some(prefix.into());
        self
    }

    pub fn loras_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.loras_dir = Some(dir.into());
        self
    }

    /// Set a raw input, keyed `"<node id or class_type>.<input>"`.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A `<lora:name:weight>` tag pulled out of a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraTag {
    pub name: String,
    pub weight: f64,
}

fn lora_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<lora:([a-zA-Z0-9\-_.]+):([\d.]+)>").expect("LoRA tag pattern is valid")
    })
}

/// Remove LoRA tags from `prompt`, returning them with the cleaned text.
pub fn extract_loras(prompt: &str) -> (Vec<LoraTag>, String) {
    let pattern = lora_pattern();
    let loras = pattern
        .captures_iter(prompt)
        .filter_map(|cap| {
            let weight = cap[2].parse::<f64>().ok()?;
            Some(LoraTag {
                name: cap[1].to_string(),
                weight,
            })
        })
        .collect();
    let cleaned = pattern.replace_all(prompt, "").trim().to_string();
    (loras, cleaned)
}

/// First file in `dir` whose name contains `name`.
fn find_lora_file(dir: &Path, name: &str) -> Option<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read LoRA directory");
            return None;
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|file| file.contains(name))
        .collect();
    names.sort();
    names.into_iter().next()
}

/// A workflow payload ready to be queued, with the seed that was used.
#[derive(Debug, Clone)]
pub struct BuiltWorkflow {
    pub payload: Value,
    /// `None` when the template has no seed input.
    pub seed: Option<i64>,
}

/// A ComfyUI API-format workflow template: node id → `{class_type, inputs}`.
#[derive(Debug, Clone)]
pub struct Workflow {
    nodes: Map<String, Value>,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::txt2img()
    }
}

impl Workflow {
    /// The standard 7-node txt2img pipeline: CheckpointLoader → CLIP
    /// encoders → KSampler → VAEDecode → SaveImage.
    pub fn txt2img() -> Self {
        let template = json!({
            "1": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": {
                    "ckpt_name": DEFAULT_CHECKPOINT
                }
            },
            "2": {
                "class_type": "EmptyLatentImage",
                "inputs": {
                    "width": 512,
                    "height": 512,
                    "batch_size": 1
                }
            },
            "3": {
                "class_type": "CLIPTextEncode",
                "inputs": {
                    "text": "",
                    "clip": ["1", 1]
                }
            },
            "4": {
                "class_type": "CLIPTextEncode",
                "inputs": {
                    "text": "",
                    "clip": ["1", 1]
                }
            },
            "5": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": -1,
                    "steps": 25,
                    "cfg": 7.5,
                    "sampler_name": "dpmpp_2m",
                    "scheduler": "karras",
                    "denoise": 1.0,
                    "model": ["1", 0],
                    "positive": ["3", 0],
                    "negative": ["4", 0],
                    "latent_image": ["2", 0]
                }
            },
            "6": {
                "class_type": "VAEDecode",
                "inputs": {
                    "samples": ["5", 0],
                    "vae": ["1", 2]
                }
            },
            "7": {
                "class_type": "SaveImage",
                "inputs": {
                    "filename_prefix": "ComfyUI",
                    "images": ["6", 0]
                }
            }
        });
        match template {
            Value::Object(nodes) => Self { nodes },
            _ => unreachable!("template literal is an object"),
        }
    }

    /// Wrap a workflow exported with ComfyUI's "Save (API Format)".
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(nodes) => Ok(Self { nodes }),
            other => Err(ComfyError::InvalidRequest(format!(
                "workflow must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.nodes.clone())
    }

    /// Id of the first node with the given `class_type`.
    pub fn find_node(&self, class_type: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, node)| node.get("class_type").and_then(|c| c.as_str()) == Some(class_type))
            .map(|(id, _)| id.as_str())
    }

    fn inputs_mut(&mut self, node_id: &str) -> Option<&mut Map<String, Value>> {
        self.nodes
            .get_mut(node_id)?
            .as_object_mut()?
            .entry("inputs")
            .or_insert_with(|| json!({}))
            .as_object_mut()
    }

    fn set_input(&mut self, node_id: &str, input: &str, value: impl Into<Value>) {
        if let Some(inputs) = self.inputs_mut(node_id) {
            inputs.insert(input.to_string(), value.into());
        }
    }

    fn set_on(&mut self, class_type: &str, input: &str, value: Option<impl Into<Value>>) {
        let Some(value) = value else { return };
        match self.find_node(class_type).map(String::from) {
            Some(id) => self.set_input(&id, input, value),
            None => warn!(class_type, input, "no node to receive parameter"),
        }
    }

    /// Node id wired into `input` of `node_id` (links look like `["3", 0]`).
    fn linked_node(&self, node_id: &str, input: &str) -> Option<String> {
        self.nodes
            .get(node_id)?
            .pointer(&format!("/inputs/{}/0", input))?
            .as_str()
            .map(String::from)
    }

    fn text_of(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id)?.pointer("/inputs/text")?.as_str()
    }

    fn positive_node(&self) -> Option<String> {
        if let Some(id) = self.find_node(PROMPT_GENERATOR) {
            return Some(id.to_string());
        }
        self.find_node("KSampler")
            .and_then(|ks| self.linked_node(ks, "positive"))
            .or_else(|| self.find_node("CLIPTextEncode").map(String::from))
    }

    fn negative_node(&self, positive: Option<&str>) -> Option<String> {
        self.find_node("KSampler")
            .and_then(|ks| self.linked_node(ks, "negative"))
            .or_else(|| {
                self.nodes
                    .iter()
                    .find(|(id, node)| {
                        Some(id.as_str()) != positive
                            && node.get("class_type").and_then(|c| c.as_str())
                                == Some("CLIPTextEncode")
                            && self.text_of(id).map_or(true, str::is_empty)
                    })
                    .map(|(id, _)| id.clone())
            })
    }

    fn apply_loras(&mut self, loras: &[LoraTag], loras_dir: Option<&Path>) {
        if loras.is_empty() {
            return;
        }
        let Some(loader) = self.find_node(LORA_LOADER).map(String::from) else {
            warn!("prompt has LoRA tags but the workflow has no '{}' node", LORA_LOADER);
            return;
        };
        let Some(inputs) = self.inputs_mut(&loader) else { return };
        let mut next_idx = inputs
            .keys()
            .filter_map(|k| k.strip_prefix("lora_"))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .unwrap_or(0);

        for lora in loras {
            let file = match loras_dir {
                Some(dir) => match find_lora_file(dir, &lora.name) {
                    Some(file) => file,
                    None => {
                        warn!(lora = %lora.name, "LoRA not found, skipping");
                        continue;
                    }
                },
                None => lora.name.clone(),
            };
            next_idx += 1;
            inputs.insert(
                format!("lora_{}", next_idx),
                json!({"on": true, "lora": file, "strength": lora.weight}),
            );
            info!(lora = %lora.name, strength = lora.weight, "added LoRA to workflow");
        }
    }

    fn apply_extra(&mut self, extra: &Map<String, Value>) {
        for (key, value) in extra {
            let Some((node, input)) = key.rsplit_once('.') else {
                warn!(key = %key, "ignoring parameter without a '<node>.<input>' key");
                continue;
            };
            let target = if self.nodes.contains_key(node) {
                Some(node.to_string())
            } else {
                self.find_node(node).map(String::from)
            };
            match target {
                Some(id) => self.set_input(&id, input, value.clone()),
                None => warn!(key = %key, "no node matches parameter"),
            }
        }
    }

    fn resolve_seed(&mut self, requested: Option<i64>) -> Option<i64> {
        let (node, input) = match self.find_node(SEED_NODE) {
            Some(id) => (id.to_string(), "seed"),
            None => (self.find_node("KSampler")?.to_string(), "seed"),
        };
        if let Some(seed) = requested {
            self.set_input(&node, input, seed);
        }
        let current = self
            .nodes
            .get(&node)?
            .pointer(&format!("/inputs/{}", input))?
            .as_i64()?;
        let seed = if current < 0 {
            rand::rng().random_range(0..i64::MAX)
        } else {
            current
        };
        self.set_input(&node, input, seed);
        Some(seed)
    }

    /// Merge `prompt` and `params` into a copy of this template.
    ///
    /// LoRA tags are stripped from the prompt and attached to the
    /// `Power Lora Loader (rgthree)` node when the template has one. A
    /// negative seed is replaced by a random one, which is returned.
    pub fn build(&self, prompt: &str, params: &GenerationParams) -> Result<BuiltWorkflow> {
        let (loras, prompt) = extract_loras(prompt);
        if prompt.is_empty() {
            return Err(ComfyError::InvalidRequest("prompt must not be empty".into()));
        }

        let mut wf = self.clone();
        let positive = wf
            .positive_node()
            .ok_or_else(|| ComfyError::InvalidRequest("workflow has no prompt node".into()))?;
        let negative = wf.negative_node(Some(&positive));
        wf.set_input(&positive, "text", prompt);

        if let Some(neg) = &params.negative_prompt {
            match &negative {
                Some(id) => wf.set_input(id, "text", neg.as_str()),
                None => warn!("workflow has no negative prompt node"),
            }
        }

        wf.set_on("EmptyLatentImage", "width", params.width);
        wf.set_on("EmptyLatentImage", "height", params.height);
        wf.set_on("EmptyLatentImage", "batch_size", params.batch_size);
        wf.set_on("KSampler", "steps", params.steps);
        wf.set_on("KSampler", "cfg", params.cfg_scale);
        wf.set_on("KSampler", "sampler_name", params.sampler.clone());
        wf.set_on("KSampler", "scheduler", params.scheduler.clone());
        wf.set_on("CheckpointLoaderSimple", "ckpt_name", params.checkpoint.clone());
        wf.set_on("SaveImage", "filename_prefix", params.filename_prefix.clone());

        wf.apply_loras(&loras, params.loras_dir.as_deref());
        wf.apply_extra(&params.extra);
        let seed = wf.resolve_seed(params.seed);

        debug!(nodes = wf.nodes.len(), ?seed, "built workflow payload");
        Ok(BuiltWorkflow {
            payload: wf.as_value(),
            seed,
        })
    }
}
