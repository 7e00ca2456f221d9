//! Job orchestrator
//!
//! Validates requests synchronously, then runs generation on a blocking
//! worker under a global concurrency permit. Workers report progress into
//! the shared job table; artifacts are stamped with provenance and written
//! to the output directory before the job completes.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapter::AdapterResolver;
use crate::config::OrchestratorConfig;
use crate::engine::{EngineProvider, Invocation, ProgressSink};
use crate::error::{Error, Result};
use crate::job::{JobArtifacts, JobStore, JobView};
use crate::pipeline::PipelineManager;
use crate::provenance::{ProvenanceParams, ProvenanceRecord};
use crate::registry::Registry;
use crate::{metadata, preprocess, GenerationRequest, Mode};

/// Applied when a request leaves the negative prompt unset.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "ugly, deformed, disfigured, poor details, \
bad anatomy, blurry, low quality, low resolution, worst quality, jpeg artifacts, \
watermark, signature, text";

const MAX_PROMPT_LEN: usize = 1000;
const MIN_DIMENSION: u32 = 256;
const MAX_STEPS: u32 = 150;
const MIN_GUIDANCE: f32 = 1.0;
const MAX_GUIDANCE: f32 = 20.0;
const DEFAULT_STRENGTH: f32 = 0.8;

/// A request with every default applied, ready to execute.
struct ExecutionPlan {
    request: GenerationRequest,
    negative_prompt: String,
    width: u32,
    height: u32,
    steps: u32,
    guidance: f32,
    strength: f32,
}

/// Forwards engine progress into the job table.
struct JobProgressSink {
    jobs: Arc<JobStore>,
    id: Uuid,
}

impl ProgressSink for JobProgressSink {
    fn report(&self, percent: f32) -> anyhow::Result<()> {
        self.jobs.update_progress(self.id, percent);
        Ok(())
    }
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    pipelines: PipelineManager,
    resolver: AdapterResolver,
    jobs: Arc<JobStore>,
    permits: Arc<Semaphore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn EngineProvider>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        let pipelines = PipelineManager::new(
            Arc::clone(&registry),
            provider,
            config.backend,
            config.precision,
        );
        let resolver = AdapterResolver::new(Arc::clone(&registry));
        Ok(Self {
            registry,
            pipelines,
            resolver,
            jobs: Arc::new(JobStore::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn pipelines(&self) -> &PipelineManager {
        &self.pipelines
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate a request, register a pending job, and schedule it. Returns
    /// the job id immediately; execution waits for a concurrency permit.
    pub fn submit(self: &Arc<Self>, request: GenerationRequest) -> Result<Uuid> {
        let plan = self.plan(request)?;

        let id = self.jobs.insert(
            plan.request.prompt.clone(),
            plan.request.model_key.clone(),
            plan.request.mode,
        );
        info!(job = %id, model = %plan.request.model_key, mode = %plan.request.mode, "job submitted");

        let this = Arc::clone(self);
        let permits = Arc::clone(&this.permits);
        tokio::spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    this.jobs.fail(id, "orchestrator shut down".to_string(), 0.0);
                    return;
                }
            };
            let worker = Arc::clone(&this);
            let result = tokio::task::spawn_blocking(move || worker.execute(id, plan)).await;
            drop(permit);
            if let Err(e) = result {
                error!(job = %id, error = %e, "job worker panicked");
                this.jobs.fail(id, format!("internal failure: {e}"), 0.0);
            }
        });

        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> Option<JobView> {
        self.jobs.view(id)
    }

    /// Synchronous validation and default resolution. Rejections here mean
    /// no job record is ever created.
    fn plan(&self, request: GenerationRequest) -> Result<ExecutionPlan> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(Error::validation("prompt must not be empty"));
        }
        if prompt.len() > MAX_PROMPT_LEN {
            return Err(Error::validation(format!(
                "prompt exceeds {MAX_PROMPT_LEN} characters"
            )));
        }

        let descriptor = self.registry.describe_model(&request.model_key)?;
        if !descriptor.supports(request.mode) {
            return Err(Error::UnsupportedMode {
                model: request.model_key.clone(),
                mode: request.mode,
                supported: descriptor.modes.clone(),
            });
        }

        self.resolver.validate(&request.adapters, &request.model_key)?;

        if request.mode.takes_init_image() && request.init_image.is_none() {
            return Err(Error::validation(format!(
                "{} requires an init image",
                request.mode
            )));
        }
        if request.mode == Mode::Inpaint && request.mask.is_none() {
            return Err(Error::validation("inpaint requires a mask"));
        }

        let width = request.width.unwrap_or_else(|| {
            if request.mode == Mode::Txt2Img {
                descriptor.native_resolution
            } else {
                self.config.default_width
            }
        });
        let height = request.height.unwrap_or_else(|| {
            if request.mode == Mode::Txt2Img {
                descriptor.native_resolution
            } else {
                self.config.default_height
            }
        });
        for (axis, value) in [("width", width), ("height", height)] {
            if value < MIN_DIMENSION || value > self.config.max_dimension {
                return Err(Error::validation(format!(
                    "{axis} must be between {MIN_DIMENSION} and {}",
                    self.config.max_dimension
                )));
            }
            if value % 8 != 0 {
                return Err(Error::validation(format!(
                    "{axis} must be a multiple of 8, got {value}"
                )));
            }
        }

        let steps = request.steps.unwrap_or(self.config.default_steps);
        if steps == 0 || steps > MAX_STEPS {
            return Err(Error::validation(format!(
                "steps must be between 1 and {MAX_STEPS}"
            )));
        }

        let guidance = request.guidance.unwrap_or(self.config.default_guidance);
        if !(MIN_GUIDANCE..=MAX_GUIDANCE).contains(&guidance) {
            return Err(Error::validation(format!(
                "guidance must be between {MIN_GUIDANCE} and {MAX_GUIDANCE}"
            )));
        }

        let strength = request.strength.unwrap_or(DEFAULT_STRENGTH);
        if !(0.0..=1.0).contains(&strength) {
            return Err(Error::validation("strength must be between 0.0 and 1.0"));
        }

        let negative_prompt = request
            .negative_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string());

        Ok(ExecutionPlan {
            request,
            negative_prompt,
            width,
            height,
            steps,
            guidance,
            strength,
        })
    }

    /// Blocking worker body. Runs with a permit held.
    fn execute(&self, id: Uuid, plan: ExecutionPlan) {
        self.jobs.mark_processing(id);
        let started = Instant::now();
        match self.run(id, plan) {
            Ok(artifacts) => {
                let elapsed = started.elapsed().as_secs_f64();
                info!(job = %id, seconds = elapsed, "job completed");
                self.jobs.complete(id, artifacts, elapsed);
            }
            Err(e) => {
                let elapsed = started.elapsed().as_secs_f64();
                error!(job = %id, error = %e, "job failed");
                self.jobs.fail(id, e.to_string(), elapsed);
            }
        }
    }

    fn run(&self, id: Uuid, plan: ExecutionPlan) -> Result<JobArtifacts> {
        let request = &plan.request;
        let entry = self.pipelines.acquire(&request.model_key, request.mode)?;
        let descriptor = self.registry.describe_model(&request.model_key)?;

        let resolved = self
            .resolver
            .resolve(&request.adapters, &request.model_key)?;
        let prompt = resolved.augment_prompt(request.prompt.trim());
        self.jobs.set_prompt(id, prompt.clone());

        // Image modes take their dimensions from the normalized init image,
        // not from the requested width/height.
        let init_image = request
            .init_image
            .as_ref()
            .map(|img| preprocess::normalize_image(img, self.config.max_dimension));
        let (width, height) = match &init_image {
            Some(img) => img.dimensions(),
            None => (plan.width, plan.height),
        };
        let mask = request.mask.as_ref().map(|m| {
            preprocess::normalize_mask(
                m,
                (width, height),
                request.mask_blur,
                request.mask_blur_radius,
            )
        });

        let invocation = Invocation {
            prompt: prompt.clone(),
            negative_prompt: plan.negative_prompt.clone(),
            steps: plan.steps,
            guidance: plan.guidance,
            width,
            height,
            seed: request.seed,
            init_image,
            mask,
            strength: plan.strength,
        };

        let sink = JobProgressSink {
            jobs: Arc::clone(&self.jobs),
            id,
        };
        let generation_started = Instant::now();
        let image = entry.execute(&resolved.activations, &invocation, &sink)?;
        let generation_seconds = generation_started.elapsed().as_secs_f64();

        let record = ProvenanceRecord::new(ProvenanceParams {
            model_key: &request.model_key,
            model_source: &descriptor.source,
            prompt: &prompt,
            negative_prompt: &plan.negative_prompt,
            steps: plan.steps,
            guidance: plan.guidance,
            seed: request.seed,
            width,
            height,
            adapters: &resolved.activations,
            generation_seconds,
        });

        self.finalize(id, &image.to_rgb8(), &record)
    }

    /// Encode, stamp, and persist the artifacts. A failed metadata embed
    /// falls back to unstamped bytes rather than failing the job.
    fn finalize(
        &self,
        id: Uuid,
        image: &image::RgbImage,
        record: &ProvenanceRecord,
    ) -> Result<JobArtifacts> {
        let png_bytes = match metadata::encode_png(image, Some(record)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(job = %id, error = %e, "provenance embed failed, writing unstamped png");
                metadata::encode_png(image, None).map_err(Error::Finalize)?
            }
        };
        let jpeg_bytes =
            match metadata::encode_jpeg(image, Some(record), self.config.jpeg_quality) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(job = %id, error = %e, "provenance embed failed, writing unstamped jpeg");
                    metadata::encode_jpeg(image, None, self.config.jpeg_quality)
                        .map_err(Error::Finalize)?
                }
            };

        let image_file = format!("{id}.png");
        let preview_file = format!("{id}.jpg");
        std::fs::write(self.config.output_dir.join(&image_file), &png_bytes)?;
        std::fs::write(self.config.output_dir.join(&preview_file), &jpeg_bytes)?;

        let image_base64 = base64::engine::general_purpose::STANDARD.encode(&png_bytes);

        Ok(JobArtifacts {
            image_file: Some(image_file),
            preview_file: Some(preview_file),
            image_base64: Some(image_base64),
        })
    }
}
