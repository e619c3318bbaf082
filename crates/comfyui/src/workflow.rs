//! Turning a job payload into a ComfyUI prompt graph.
//!
//! A payload takes one of three shapes:
//!
//! - `{"workflow": {...}}`: a prepared graph, submitted unchanged.
//! - A bare graph, where every entry is a node with a `class_type`.
//! - A character request (image and video jobs only), filled into the
//!   built-in SDXL + LoRA and SVD templates below.
//!
//! Training jobs have no template and must carry a prepared graph.

use charforge_core::job::JobKind;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::client::DriverError;

// ---------------------------------------------------------------------------
// Defaults and limits
// ---------------------------------------------------------------------------

pub const DEFAULT_IMAGE_CHECKPOINT: &str = "sd_xl_base_1.0.safetensors";
pub const DEFAULT_VIDEO_CHECKPOINT: &str = "svd_xt.safetensors";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, deformed";

/// Prefix for every file a template saves on the worker.
const OUTPUT_PREFIX: &str = "charforge";

const MAX_PROMPT_LENGTH: usize = 1000;
const MAX_NEGATIVE_PROMPT_LENGTH: usize = 500;

// Node ids. Image and video ids do not overlap so that a video request
// without a source image can embed the image graph.
const IMAGE_SAMPLER: &str = "3";
const IMAGE_CHECKPOINT: &str = "4";
const IMAGE_LATENT: &str = "5";
const IMAGE_POSITIVE: &str = "6";
const IMAGE_NEGATIVE: &str = "7";
const IMAGE_DECODE: &str = "8";
const IMAGE_SAVE: &str = "9";
const IMAGE_LORA: &str = "10";

const VIDEO_SOURCE: &str = "11";
const VIDEO_CHECKPOINT: &str = "12";
const VIDEO_CONDITIONING: &str = "13";
const VIDEO_GUIDANCE: &str = "14";
const VIDEO_SAMPLER: &str = "15";
const VIDEO_DECODE: &str = "16";
const VIDEO_COMBINE: &str = "17";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// The character whose LoRA adapter conditions the generation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CharacterRef {
    /// Token the adapter was trained on; prefixed to the prompt.
    pub trigger_word: String,
    /// Adapter file name in the worker's `loras` folder.
    pub lora_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageRequest {
    pub character: CharacterRef,
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_image_side")]
    pub width: u32,
    #[serde(default = "default_image_side")]
    pub height: u32,
    #[serde(default = "default_steps", alias = "num_inference_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg", alias = "guidance_scale")]
    pub cfg: f64,
    #[serde(default = "default_lora_strength")]
    pub lora_strength: f64,
    /// Random when absent.
    pub seed: Option<u64>,
    #[serde(default = "default_image_checkpoint")]
    pub checkpoint: String,
}

/// Image-to-video request.
///
/// Without `source_image`, a still of the character is rendered first
/// inside the same graph, so `character` and `prompt` become required.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VideoRequest {
    /// File name in the worker's `input` folder.
    pub source_image: Option<String>,
    pub character: Option<CharacterRef>,
    pub prompt: Option<String>,
    #[serde(default = "default_video_width")]
    pub width: u32,
    #[serde(default = "default_video_height")]
    pub height: u32,
    #[serde(default = "default_num_frames")]
    pub num_frames: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_motion_bucket")]
    pub motion_bucket_id: u32,
    pub seed: Option<u64>,
    #[serde(default = "default_video_checkpoint")]
    pub checkpoint: String,
}

fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}
fn default_image_side() -> u32 {
    1024
}
fn default_steps() -> u32 {
    30
}
fn default_cfg() -> f64 {
    7.5
}
fn default_lora_strength() -> f64 {
    0.8
}
fn default_image_checkpoint() -> String {
    DEFAULT_IMAGE_CHECKPOINT.to_string()
}
fn default_video_width() -> u32 {
    1024
}
fn default_video_height() -> u32 {
    576
}
fn default_num_frames() -> u32 {
    25
}
fn default_fps() -> u32 {
    6
}
fn default_motion_bucket() -> u32 {
    127
}
fn default_video_checkpoint() -> String {
    DEFAULT_VIDEO_CHECKPOINT.to_string()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// What a payload asks the worker to run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowSource<'a> {
    Prepared(&'a Value),
    Image(ImageRequest),
    Video(VideoRequest),
}

/// Classify and validate `payload` for a job of `kind`.
pub fn parse(kind: JobKind, payload: &Value) -> Result<WorkflowSource<'_>, DriverError> {
    let Some(object) = payload.as_object() else {
        return Err(invalid("payload must be a JSON object"));
    };

    if let Some(workflow) = object.get("workflow") {
        return match workflow.as_object() {
            Some(graph) if !graph.is_empty() => Ok(WorkflowSource::Prepared(workflow)),
            _ => Err(invalid("\"workflow\" must be a non-empty JSON object")),
        };
    }
    if is_graph(object) {
        return Ok(WorkflowSource::Prepared(payload));
    }

    match kind {
        JobKind::Train => Err(invalid("training jobs need a prepared \"workflow\" graph")),
        JobKind::GenerateImage => {
            let request: ImageRequest = serde_json::from_value(payload.clone())
                .map_err(|e| invalid(format!("invalid image request: {e}")))?;
            request.validate()?;
            Ok(WorkflowSource::Image(request))
        }
        JobKind::GenerateVideo => {
            let request: VideoRequest = serde_json::from_value(payload.clone())
                .map_err(|e| invalid(format!("invalid video request: {e}")))?;
            request.validate()?;
            Ok(WorkflowSource::Video(request))
        }
    }
}

/// The graph to submit for a job of `kind`.
pub fn build(kind: JobKind, payload: &Value) -> Result<Value, DriverError> {
    Ok(match parse(kind, payload)? {
        WorkflowSource::Prepared(graph) => graph.clone(),
        WorkflowSource::Image(request) => request.to_graph(),
        WorkflowSource::Video(request) => request.to_graph(),
    })
}

fn is_graph(object: &Map<String, Value>) -> bool {
    !object.is_empty()
        && object
            .values()
            .all(|node| node.get("class_type").is_some_and(Value::is_string))
}

fn invalid(message: impl Into<String>) -> DriverError {
    DriverError::InvalidPayload(message.into())
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<(), DriverError> {
    if value < min || value > max {
        return Err(invalid(format!("{name} must be between {min} and {max}, got {value}")));
    }
    Ok(())
}

fn check_prompt(name: &str, text: &str, max: usize, required: bool) -> Result<(), DriverError> {
    if required && text.trim().is_empty() {
        return Err(invalid(format!("{name} must not be empty")));
    }
    if text.chars().count() > max {
        return Err(invalid(format!("{name} exceeds {max} characters")));
    }
    Ok(())
}

impl CharacterRef {
    fn validate(&self) -> Result<(), DriverError> {
        if self.trigger_word.trim().is_empty() {
            return Err(invalid("character.trigger_word must not be empty"));
        }
        if self.lora_name.trim().is_empty() {
            return Err(invalid("character.lora_name must not be empty"));
        }
        Ok(())
    }
}

impl ImageRequest {
    pub fn validate(&self) -> Result<(), DriverError> {
        self.character.validate()?;
        check_prompt("prompt", &self.prompt, MAX_PROMPT_LENGTH, true)?;
        check_prompt(
            "negative_prompt",
            &self.negative_prompt,
            MAX_NEGATIVE_PROMPT_LENGTH,
            false,
        )?;
        check_range("width", self.width, 512, 2048)?;
        check_range("height", self.height, 512, 2048)?;
        check_range("steps", self.steps, 10, 100)?;
        check_range("cfg", self.cfg, 1.0, 20.0)?;
        check_range("lora_strength", self.lora_strength, 0.0, 1.5)
    }
}

impl VideoRequest {
    pub fn validate(&self) -> Result<(), DriverError> {
        match (&self.source_image, &self.character, &self.prompt) {
            (Some(source), _, _) if source.trim().is_empty() => {
                return Err(invalid("source_image must not be empty"));
            }
            (Some(_), _, _) => {}
            (None, Some(character), Some(prompt)) => {
                character.validate()?;
                check_prompt("prompt", prompt, MAX_PROMPT_LENGTH, true)?;
            }
            (None, _, _) => {
                return Err(invalid(
                    "video requests need a source_image, or a character and prompt to render one",
                ));
            }
        }
        check_range("width", self.width, 512, 1024)?;
        check_range("height", self.height, 320, 576)?;
        check_range("num_frames", self.num_frames, 14, 50)?;
        check_range("fps", self.fps, 4, 30)?;
        check_range("motion_bucket_id", self.motion_bucket_id, 1, 255)
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

fn random_seed() -> u64 {
    // Seeds stay within 32 bits; some samplers reject larger values.
    (uuid::Uuid::new_v4().as_u128() as u64) & u64::from(u32::MAX)
}

/// Text-to-image nodes up to the decoded image (`IMAGE_DECODE`).
#[allow(clippy::too_many_arguments)]
fn image_nodes(
    graph: &mut Map<String, Value>,
    character: &CharacterRef,
    prompt: &str,
    negative_prompt: &str,
    width: u32,
    height: u32,
    steps: u32,
    cfg: f64,
    lora_strength: f64,
    seed: u64,
    checkpoint: &str,
) {
    let nodes = [
        (
            IMAGE_CHECKPOINT,
            json!({
                "class_type": "CheckpointLoaderSimple",
                "inputs": {"ckpt_name": checkpoint},
            }),
        ),
        (
            IMAGE_LORA,
            json!({
                "class_type": "LoraLoader",
                "inputs": {
                    "model": [IMAGE_CHECKPOINT, 0],
                    "clip": [IMAGE_CHECKPOINT, 1],
                    "lora_name": character.lora_name,
                    "strength_model": lora_strength,
                    "strength_clip": lora_strength,
                },
            }),
        ),
        (
            IMAGE_POSITIVE,
            json!({
                "class_type": "CLIPTextEncode",
                "inputs": {
                    "text": format!("{}, {prompt}", character.trigger_word),
                    "clip": [IMAGE_LORA, 1],
                },
            }),
        ),
        (
            IMAGE_NEGATIVE,
            json!({
                "class_type": "CLIPTextEncode",
                "inputs": {"text": negative_prompt, "clip": [IMAGE_LORA, 1]},
            }),
        ),
        (
            IMAGE_LATENT,
            json!({
                "class_type": "EmptyLatentImage",
                "inputs": {"width": width, "height": height, "batch_size": 1},
            }),
        ),
        (
            IMAGE_SAMPLER,
            json!({
                "class_type": "KSampler",
                "inputs": {
                    "seed": seed,
                    "steps": steps,
                    "cfg": cfg,
                    "sampler_name": "euler",
                    "scheduler": "normal",
                    "denoise": 1.0,
                    "model": [IMAGE_LORA, 0],
                    "positive": [IMAGE_POSITIVE, 0],
                    "negative": [IMAGE_NEGATIVE, 0],
                    "latent_image": [IMAGE_LATENT, 0],
                },
            }),
        ),
        (
            IMAGE_DECODE,
            json!({
                "class_type": "VAEDecode",
                "inputs": {"samples": [IMAGE_SAMPLER, 0], "vae": [IMAGE_CHECKPOINT, 2]},
            }),
        ),
    ];
    for (id, node) in nodes {
        graph.insert(id.to_string(), node);
    }
}

impl ImageRequest {
    pub fn to_graph(&self) -> Value {
        let mut graph = Map::new();
        image_nodes(
            &mut graph,
            &self.character,
            &self.prompt,
            &self.negative_prompt,
            self.width,
            self.height,
            self.steps,
            self.cfg,
            self.lora_strength,
            self.seed.unwrap_or_else(random_seed),
            &self.checkpoint,
        );
        graph.insert(
            IMAGE_SAVE.to_string(),
            json!({
                "class_type": "SaveImage",
                "inputs": {"images": [IMAGE_DECODE, 0], "filename_prefix": OUTPUT_PREFIX},
            }),
        );
        Value::Object(graph)
    }
}

impl VideoRequest {
    pub fn to_graph(&self) -> Value {
        let seed = self.seed.unwrap_or_else(random_seed);
        let mut graph = Map::new();

        let init_image = match (&self.source_image, &self.character, &self.prompt) {
            (Some(source), _, _) => {
                graph.insert(
                    VIDEO_SOURCE.to_string(),
                    json!({"class_type": "LoadImage", "inputs": {"image": source}}),
                );
                json!([VIDEO_SOURCE, 0])
            }
            (None, Some(character), Some(prompt)) => {
                image_nodes(
                    &mut graph,
                    character,
                    prompt,
                    DEFAULT_NEGATIVE_PROMPT,
                    self.width,
                    self.height,
                    default_steps(),
                    default_cfg(),
                    default_lora_strength(),
                    seed,
                    DEFAULT_IMAGE_CHECKPOINT,
                );
                json!([IMAGE_DECODE, 0])
            }
            // Rejected by `validate`.
            (None, _, _) => Value::Null,
        };

        let nodes = [
            (
                VIDEO_CHECKPOINT,
                json!({
                    "class_type": "ImageOnlyCheckpointLoader",
                    "inputs": {"ckpt_name": self.checkpoint},
                }),
            ),
            (
                VIDEO_CONDITIONING,
                json!({
                    "class_type": "SVD_img2vid_Conditioning",
                    "inputs": {
                        "clip_vision": [VIDEO_CHECKPOINT, 1],
                        "init_image": init_image,
                        "vae": [VIDEO_CHECKPOINT, 2],
                        "width": self.width,
                        "height": self.height,
                        "video_frames": self.num_frames,
                        "motion_bucket_id": self.motion_bucket_id,
                        "fps": self.fps,
                        "augmentation_level": 0.0,
                    },
                }),
            ),
            (
                VIDEO_GUIDANCE,
                json!({
                    "class_type": "VideoLinearCFGGuidance",
                    "inputs": {"model": [VIDEO_CHECKPOINT, 0], "min_cfg": 1.0},
                }),
            ),
            (
                VIDEO_SAMPLER,
                json!({
                    "class_type": "KSampler",
                    "inputs": {
                        "seed": seed,
                        "steps": 20,
                        "cfg": 2.5,
                        "sampler_name": "euler",
                        "scheduler": "karras",
                        "denoise": 1.0,
                        "model": [VIDEO_GUIDANCE, 0],
                        "positive": [VIDEO_CONDITIONING, 0],
                        "negative": [VIDEO_CONDITIONING, 1],
                        "latent_image": [VIDEO_CONDITIONING, 2],
                    },
                }),
            ),
            (
                VIDEO_DECODE,
                json!({
                    "class_type": "VAEDecode",
                    "inputs": {"samples": [VIDEO_SAMPLER, 0], "vae": [VIDEO_CHECKPOINT, 2]},
                }),
            ),
            (
                VIDEO_COMBINE,
                json!({
                    "class_type": "VHS_VideoCombine",
                    "inputs": {
                        "images": [VIDEO_DECODE, 0],
                        "frame_rate": self.fps,
                        "loop_count": 0,
                        "filename_prefix": OUTPUT_PREFIX,
                        "format": "video/h264-mp4",
                        "pingpong": false,
                        "save_output": true,
                    },
                }),
            ),
        ];
        for (id, node) in nodes {
            graph.insert(id.to_string(), node);
        }
        Value::Object(graph)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn character() -> Value {
        json!({"trigger_word": "ohwx_mira", "lora_name": "mira_v2.safetensors"})
    }

    fn input(graph: &Value, node: &str, name: &str) -> Value {
        graph[node]["inputs"][name].clone()
    }

    #[test]
    fn nested_workflow_is_submitted_unchanged() {
        let payload = json!({"character_id": 7, "workflow": {"3": {"class_type": "KSampler"}}});
        let graph = build(JobKind::Train, &payload).unwrap();
        assert_eq!(graph, json!({"3": {"class_type": "KSampler"}}));
    }

    #[test]
    fn bare_graph_is_submitted_unchanged() {
        let payload = json!({"3": {"class_type": "KSampler", "inputs": {}}});
        assert_eq!(build(JobKind::GenerateImage, &payload).unwrap(), payload);
    }

    #[test]
    fn image_request_fills_the_lora_template() {
        let payload = json!({
            "character": character(),
            "prompt": "portrait in a rainy street",
            "seed": 42,
            "guidance_scale": 6.0,
            "width": 832,
            "height": 1216,
            "lora_strength": 0.9,
        });

        let graph = build(JobKind::GenerateImage, &payload).unwrap();

        assert_eq!(
            input(&graph, IMAGE_POSITIVE, "text"),
            "ohwx_mira, portrait in a rainy street"
        );
        assert_eq!(input(&graph, IMAGE_NEGATIVE, "text"), DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(input(&graph, IMAGE_SAMPLER, "seed"), 42);
        assert_eq!(input(&graph, IMAGE_SAMPLER, "steps"), 30);
        assert_eq!(input(&graph, IMAGE_SAMPLER, "cfg"), 6.0);
        assert_eq!(input(&graph, IMAGE_LATENT, "width"), 832);
        assert_eq!(input(&graph, IMAGE_LATENT, "height"), 1216);
        assert_eq!(input(&graph, IMAGE_LORA, "lora_name"), "mira_v2.safetensors");
        assert_eq!(input(&graph, IMAGE_LORA, "strength_model"), 0.9);
        assert_eq!(input(&graph, IMAGE_LORA, "strength_clip"), 0.9);
        assert_eq!(graph[IMAGE_SAVE]["class_type"], "SaveImage");
    }

    #[test]
    fn missing_seed_is_randomised_per_build() {
        let payload = json!({"character": character(), "prompt": "smiling"});
        let seeds: Vec<_> = (0..4)
            .map(|_| build(JobKind::GenerateImage, &payload).unwrap()[IMAGE_SAMPLER]["inputs"]["seed"].clone())
            .collect();
        assert!(seeds.iter().all(|s| s.as_u64().is_some_and(|s| s <= u64::from(u32::MAX))));
        assert!(seeds.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn video_from_source_image() {
        let payload = json!({"source_image": "mira_ref.png", "num_frames": 14, "fps": 8, "seed": 3});

        let graph = build(JobKind::GenerateVideo, &payload).unwrap();

        assert_eq!(input(&graph, VIDEO_SOURCE, "image"), "mira_ref.png");
        assert_eq!(input(&graph, VIDEO_CONDITIONING, "init_image"), json!([VIDEO_SOURCE, 0]));
        assert_eq!(input(&graph, VIDEO_CONDITIONING, "video_frames"), 14);
        assert_eq!(input(&graph, VIDEO_CONDITIONING, "width"), 1024);
        assert_eq!(input(&graph, VIDEO_CONDITIONING, "height"), 576);
        assert_eq!(input(&graph, VIDEO_COMBINE, "frame_rate"), 8);
        assert_eq!(input(&graph, VIDEO_SAMPLER, "seed"), 3);
        assert!(graph.get(IMAGE_SAMPLER).is_none());
    }

    #[test]
    fn video_without_source_renders_the_still_first() {
        let payload = json!({"character": character(), "prompt": "waving", "seed": 9});

        let graph = build(JobKind::GenerateVideo, &payload).unwrap();

        assert_eq!(input(&graph, IMAGE_POSITIVE, "text"), "ohwx_mira, waving");
        assert_eq!(input(&graph, IMAGE_LATENT, "height"), 576);
        assert_eq!(input(&graph, VIDEO_CONDITIONING, "init_image"), json!([IMAGE_DECODE, 0]));
        assert!(graph.get(VIDEO_SOURCE).is_none());
        assert!(graph.get(IMAGE_SAVE).is_none());
    }

    #[test]
    fn training_needs_a_prepared_graph() {
        let payload = json!({"character": character(), "prompt": "x"});
        assert_matches!(
            parse(JobKind::Train, &payload),
            Err(DriverError::InvalidPayload(msg)) if msg.contains("training")
        );
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let cases = [
            (JobKind::GenerateImage, json!([1, 2])),
            (JobKind::GenerateImage, json!({})),
            (JobKind::GenerateImage, json!({"workflow": "oops"})),
            (JobKind::GenerateImage, json!({"workflow": {}})),
            (JobKind::GenerateImage, json!({"prompt": "no character"})),
            (JobKind::GenerateImage, json!({"character": character(), "prompt": "  "})),
            (JobKind::GenerateImage, json!({"character": character(), "prompt": "x", "steps": 500})),
            (
                JobKind::GenerateImage,
                json!({"character": {"trigger_word": "", "lora_name": "a"}, "prompt": "x"}),
            ),
            (JobKind::GenerateVideo, json!({"prompt": "no source and no character"})),
            (JobKind::GenerateVideo, json!({"source_image": "a.png", "fps": 60})),
        ];
        for (kind, payload) in cases {
            assert_matches!(
                parse(kind, &payload),
                Err(DriverError::InvalidPayload(_)),
                "{kind}: {payload}"
            );
        }
    }
}
