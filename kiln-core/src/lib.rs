pub mod adapter;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod job;
pub mod metadata;
pub mod orchestrator;
pub mod pipeline;
pub mod preprocess;
pub mod provenance;
pub mod registry;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub use adapter::{AdapterActivation, AdapterRequest, AdapterResolver, ResolvedAdapters, WeightSource};
pub use config::OrchestratorConfig;
pub use device::{ComputeBackend, Precision};
pub use engine::{
    EngineProvider, EngineSpec, GenerationEngine, Invocation, ProgressSink, SchedulerConfig,
    SchedulerKind,
};
pub use error::{Error, Result};
pub use job::{Job, JobArtifacts, JobState, JobStore, JobView};
pub use orchestrator::{Orchestrator, DEFAULT_NEGATIVE_PROMPT};
pub use pipeline::{PipelineEntry, PipelineManager};
pub use provenance::{ProvenanceParams, ProvenanceRecord};
pub use registry::{AdapterCategory, AdapterDescriptor, EngineFamily, ModelDescriptor, Registry};

/// Generation mode, determining which pipeline variant and preprocessing
/// path applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Txt2Img,
    Img2Img,
    Inpaint,
}

serde_plain::derive_display_from_serialize!(Mode);
serde_plain::derive_fromstr_from_deserialize!(Mode);

impl Mode {
    /// Modes that carry a source image into the pipeline.
    pub fn takes_init_image(self) -> bool {
        matches!(self, Mode::Img2Img | Mode::Inpaint)
    }
}

/// A generation request as accepted by [`Orchestrator::submit`].
///
/// Unset optional parameters fall back to the orchestrator's configured
/// defaults (or the model's native resolution for dimensions). Images arrive
/// already decoded; transport-level concerns (encodings, uploads) live with
/// the caller.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub model_key: String,
    pub mode: Mode,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub guidance: Option<f32>,
    pub seed: Option<u64>,
    /// Transformation strength for img2img/inpaint, 0.0 keeps the original.
    pub strength: Option<f32>,
    pub init_image: Option<DynamicImage>,
    pub mask: Option<DynamicImage>,
    pub mask_blur: bool,
    pub mask_blur_radius: f32,
    pub adapters: Vec<AdapterRequest>,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Txt2Img
    }
}
