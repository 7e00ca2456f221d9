use std::path::PathBuf;

use serde::Deserialize;

use crate::device::{ComputeBackend, Precision};

/// Orchestrator settings with the same defaults whether constructed in code
/// or deserialized from a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub backend: ComputeBackend,
    pub precision: Precision,
    pub default_steps: u32,
    pub default_guidance: f32,
    pub default_width: u32,
    pub default_height: u32,
    /// Upper bound on either side of a source image before resizing.
    pub max_dimension: u32,
    pub max_concurrent_jobs: usize,
    pub output_dir: PathBuf,
    pub jpeg_quality: u8,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend: ComputeBackend::default(),
            precision: Precision::default(),
            default_steps: 30,
            default_guidance: 7.5,
            default_width: 512,
            default_height: 512,
            max_dimension: 1024,
            max_concurrent_jobs: 2,
            output_dir: PathBuf::from("./generated_images"),
            jpeg_quality: 90,
        }
    }
}
