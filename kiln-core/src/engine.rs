//! Engine boundary
//!
//! The inference engine itself is opaque to the orchestration layer: the
//! pipeline manager loads engines through [`EngineProvider`] and drives them
//! through [`GenerationEngine`]. Scheduler and memory tuning happen here so
//! the cache can apply the same policy to every freshly loaded pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::device::{ComputeBackend, Precision};
use crate::registry::EngineFamily;
use crate::{AdapterActivation, Mode};

/// Receives progress updates during generation. Implementations must be
/// cheap and non-blocking; engines log and continue when a report fails.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f32) -> anyhow::Result<()>;
}

/// Sampling scheduler algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    #[serde(rename = "ddim")]
    Ddim,
    #[serde(rename = "euler_discrete")]
    EulerDiscrete,
    #[serde(rename = "dpm_solver_multistep")]
    DpmSolverMultistep,
}

serde_plain::derive_display_from_serialize!(SchedulerKind);

impl SchedulerKind {
    /// Whether this scheduler converges in few enough steps that swapping
    /// it in is unnecessary.
    pub fn is_fast(self) -> bool {
        matches!(self, SchedulerKind::DpmSolverMultistep)
    }
}

/// Scheduler options that only exist on some scheduler implementations.
/// Carrying them across a swap makes the target scheduler reject its
/// configuration, so they are stripped before an install.
const NON_PORTABLE_OPTIONS: &[&str] = &["skip_prk_steps", "clip_sample", "set_alpha_to_one"];

/// A scheduler plus its configuration, as read from or installed into an
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    pub options: BTreeMap<String, serde_json::Value>,
}

impl SchedulerConfig {
    /// The fast multistep scheduler, configured from an existing scheduler's
    /// options with the non-portable fields stripped.
    pub fn fast(from: &SchedulerConfig) -> SchedulerConfig {
        let options = from
            .options
            .iter()
            .filter(|(k, _)| !NON_PORTABLE_OPTIONS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        SchedulerConfig {
            kind: SchedulerKind::DpmSolverMultistep,
            options,
        }
    }
}

/// Everything a provider needs to materialize one pipeline variant.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSpec {
    pub model_key: String,
    pub source: String,
    pub family: EngineFamily,
    pub mode: Mode,
    pub backend: ComputeBackend,
    pub precision: Precision,
}

/// One generation call, fully resolved: no defaults remain to be applied.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance: f32,
    pub width: u32,
    pub height: u32,
    pub seed: Option<u64>,
    pub init_image: Option<RgbImage>,
    pub mask: Option<GrayImage>,
    pub strength: f32,
}

/// A loaded pipeline variant. Implementations synchronize internally; the
/// cache additionally serializes adapter installation and generation per
/// entry.
pub trait GenerationEngine: Send + Sync {
    /// The currently installed scheduler and its options.
    fn scheduler(&self) -> SchedulerConfig;

    fn install_scheduler(&self, config: &SchedulerConfig) -> anyhow::Result<()>;

    fn enable_attention_slicing(&self) -> anyhow::Result<()>;

    fn enable_memory_efficient_attention(&self) -> anyhow::Result<()>;

    /// Replace the active adapter set. An empty slice clears all adapters.
    fn set_adapters(&self, adapters: &[AdapterActivation]) -> anyhow::Result<()>;

    fn generate(
        &self,
        invocation: &Invocation,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<DynamicImage>;
}

/// Loads engines on demand. Loading is blocking and may take minutes; the
/// pipeline cache confines it to one loader per cache key.
pub trait EngineProvider: Send + Sync {
    fn load(&self, spec: &EngineSpec) -> anyhow::Result<Arc<dyn GenerationEngine>>;

    /// Hint that cached device memory can be returned to the allocator.
    fn release_pooled_memory(&self) {}
}
