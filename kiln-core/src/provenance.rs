//! Provenance records
//!
//! Every finished artifact carries a structured description of how it was
//! made: model, full prompts, sampling parameters, adapters, timing, and a
//! synthetic energy estimate. The record serializes to JSON and flattens to
//! ordered text fields for embedding into image metadata.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapter::AdapterActivation;

const SOFTWARE_TAG: &str = concat!("kiln ", env!("CARGO_PKG_VERSION"));

/// Assumed average draw of the generation device, used for the synthetic
/// energy estimate. Not a measurement.
const ASSUMED_DEVICE_WATTS: f64 = 45.0;

#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceRecord {
    pub software: String,
    pub model: String,
    pub source: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance: f32,
    /// Literal seed, or "random" when none was supplied.
    pub seed: String,
    pub width: u32,
    pub height: u32,
    /// "key:weight" per active adapter, in activation order.
    pub adapters: Vec<String>,
    pub generation_seconds: f64,
    pub estimated_energy_wh: f64,
    pub created_at: DateTime<Utc>,
}

pub struct ProvenanceParams<'a> {
    pub model_key: &'a str,
    pub model_source: &'a str,
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub steps: u32,
    pub guidance: f32,
    pub seed: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub adapters: &'a [AdapterActivation],
    pub generation_seconds: f64,
}

impl ProvenanceRecord {
    pub fn new(params: ProvenanceParams<'_>) -> Self {
        let seed = match params.seed {
            Some(s) => s.to_string(),
            None => "random".to_string(),
        };
        let adapters = params
            .adapters
            .iter()
            .map(|a| format!("{}:{}", a.key, a.weight))
            .collect();
        let estimated_energy_wh =
            params.generation_seconds / 3600.0 * ASSUMED_DEVICE_WATTS;
        Self {
            software: SOFTWARE_TAG.to_string(),
            model: params.model_key.to_string(),
            source: params.model_source.to_string(),
            prompt: params.prompt.to_string(),
            negative_prompt: params.negative_prompt.to_string(),
            steps: params.steps,
            guidance: params.guidance,
            seed,
            width: params.width,
            height: params.height,
            adapters,
            generation_seconds: params.generation_seconds,
            estimated_energy_wh,
            created_at: Utc::now(),
        }
    }

    /// Ordered (keyword, value) pairs for text-based metadata containers.
    pub fn text_fields(&self) -> Vec<(String, String)> {
        vec![
            ("Software".to_string(), self.software.clone()),
            ("Source".to_string(), self.source.clone()),
            ("Model".to_string(), self.model.clone()),
            ("Prompt".to_string(), self.prompt.clone()),
            ("NegativePrompt".to_string(), self.negative_prompt.clone()),
            ("Steps".to_string(), self.steps.to_string()),
            ("Guidance".to_string(), self.guidance.to_string()),
            ("Seed".to_string(), self.seed.clone()),
            ("Size".to_string(), format!("{}x{}", self.width, self.height)),
            ("Adapters".to_string(), self.adapters.join(", ")),
            (
                "GenerationSeconds".to_string(),
                format!("{:.2}", self.generation_seconds),
            ),
            (
                "EstimatedEnergyWh".to_string(),
                format!("{:.4}", self.estimated_energy_wh),
            ),
            ("CreationTime".to_string(), self.created_at.to_rfc3339()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WeightSource;

    fn params() -> ProvenanceParams<'static> {
        ProvenanceParams {
            model_key: "sd-v1-5",
            model_source: "runwayml/stable-diffusion-v1-5",
            prompt: "a castle",
            negative_prompt: "blurry",
            steps: 30,
            guidance: 7.5,
            seed: None,
            width: 512,
            height: 512,
            adapters: &[],
            generation_seconds: 12.0,
        }
    }

    #[test]
    fn missing_seed_records_as_random() {
        let record = ProvenanceRecord::new(params());
        assert_eq!(record.seed, "random");
    }

    #[test]
    fn explicit_seed_is_literal() {
        let record = ProvenanceRecord::new(ProvenanceParams {
            seed: Some(42),
            ..params()
        });
        assert_eq!(record.seed, "42");
    }

    #[test]
    fn adapters_format_as_key_weight() {
        let activations = vec![AdapterActivation {
            key: "watercolor".to_string(),
            weight: 0.75,
            source: WeightSource::Remote("r".to_string()),
        }];
        let record = ProvenanceRecord::new(ProvenanceParams {
            adapters: &activations,
            ..params()
        });
        assert_eq!(record.adapters, vec!["watercolor:0.75"]);
    }

    #[test]
    fn energy_estimate_scales_with_duration() {
        let record = ProvenanceRecord::new(params());
        assert!((record.estimated_energy_wh - 12.0 / 3600.0 * 45.0).abs() < 1e-9);
    }

    #[test]
    fn text_fields_include_size_and_software() {
        let record = ProvenanceRecord::new(params());
        let fields = record.text_fields();
        assert!(fields
            .iter()
            .any(|(k, v)| k == "Size" && v == "512x512"));
        assert!(fields
            .iter()
            .any(|(k, v)| k == "Software" && v.starts_with("kiln ")));
    }
}
