//! Capability registry
//!
//! Static catalog of supported base models and style adapters, their
//! compatibility relationships, and resource requirements. All lookups are
//! pure; unknown keys yield a typed not-found error enumerating the valid
//! keys.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::Mode;

/// Engine family a model belongs to, set once at registry construction.
/// Discriminates the pipeline variant to instantiate and the dedicated
/// inpainting counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFamily {
    /// Standard-resolution family (512-768px native).
    Sd,
    /// High-resolution family (1024px native).
    Sdxl,
}

serde_plain::derive_display_from_serialize!(EngineFamily);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterCategory {
    Style,
    Subject,
    Detail,
}

/// Immutable description of a base model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub key: String,
    pub name: String,
    /// Hub-style artifact source identifier.
    pub source: String,
    pub family: EngineFamily,
    pub native_resolution: u32,
    pub modes: Vec<Mode>,
    pub memory_gb: f32,
    pub requires_gpu: bool,
}

impl ModelDescriptor {
    pub fn supports(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }

    /// A dedicated inpainting specialist lists inpaint as its only mode.
    fn is_inpaint_specialist(&self) -> bool {
        self.modes == [Mode::Inpaint]
    }
}

/// Immutable description of a style adapter (LoRA).
#[derive(Debug, Clone, Serialize)]
pub struct AdapterDescriptor {
    pub key: String,
    pub name: String,
    /// Local weight file; takes precedence over the remote source when the
    /// file exists on disk.
    pub local_path: Option<PathBuf>,
    /// Remote weight identifier; resolution is a placeholder, no fetch is
    /// performed here.
    pub remote_id: Option<String>,
    pub default_weight: f32,
    pub weight_min: f32,
    pub weight_max: f32,
    pub compatible_models: Vec<String>,
    pub trigger_words: Vec<String>,
    pub category: AdapterCategory,
}

/// Static catalog with pure lookups.
#[derive(Debug)]
pub struct Registry {
    models: BTreeMap<String, ModelDescriptor>,
    adapters: BTreeMap<String, AdapterDescriptor>,
}

impl Registry {
    /// Build a registry, validating the catalog invariants: unique keys,
    /// non-empty adapter compatibility sets referencing only existing
    /// models, and at least one weight source per adapter.
    pub fn new(
        models: Vec<ModelDescriptor>,
        adapters: Vec<AdapterDescriptor>,
    ) -> Result<Self> {
        let mut model_map = BTreeMap::new();
        for model in models {
            if model_map.insert(model.key.clone(), model).is_some() {
                return Err(Error::validation("duplicate model key in catalog"));
            }
        }

        let mut adapter_map = BTreeMap::new();
        for adapter in adapters {
            if adapter.compatible_models.is_empty() {
                return Err(Error::validation(format!(
                    "adapter '{}' has an empty compatible-model set",
                    adapter.key
                )));
            }
            for model_key in &adapter.compatible_models {
                if !model_map.contains_key(model_key) {
                    return Err(Error::validation(format!(
                        "adapter '{}' references unknown model '{}'",
                        adapter.key, model_key
                    )));
                }
            }
            if adapter.local_path.is_none() && adapter.remote_id.is_none() {
                return Err(Error::validation(format!(
                    "adapter '{}' has no weight source configured",
                    adapter.key
                )));
            }
            if adapter_map.insert(adapter.key.clone(), adapter).is_some() {
                return Err(Error::validation("duplicate adapter key in catalog"));
            }
        }

        Ok(Self {
            models: model_map,
            adapters: adapter_map,
        })
    }

    /// The built-in catalog.
    pub fn builtin() -> Result<Self> {
        let models = vec![
            ModelDescriptor {
                key: "sd-v1-5".into(),
                name: "Stable Diffusion 1.5".into(),
                source: "runwayml/stable-diffusion-v1-5".into(),
                family: EngineFamily::Sd,
                native_resolution: 512,
                modes: vec![Mode::Txt2Img, Mode::Img2Img, Mode::Inpaint],
                memory_gb: 4.0,
                requires_gpu: false,
            },
            ModelDescriptor {
                key: "sd-v2-1".into(),
                name: "Stable Diffusion 2.1".into(),
                source: "stabilityai/stable-diffusion-2-1".into(),
                family: EngineFamily::Sd,
                native_resolution: 768,
                modes: vec![Mode::Txt2Img, Mode::Img2Img],
                memory_gb: 5.0,
                requires_gpu: false,
            },
            ModelDescriptor {
                key: "sdxl".into(),
                name: "Stable Diffusion XL".into(),
                source: "stabilityai/stable-diffusion-xl-base-1.0".into(),
                family: EngineFamily::Sdxl,
                native_resolution: 1024,
                modes: vec![Mode::Txt2Img, Mode::Img2Img, Mode::Inpaint],
                memory_gb: 12.0,
                requires_gpu: true,
            },
            ModelDescriptor {
                key: "sd-inpainting".into(),
                name: "Stable Diffusion 1.5 Inpainting".into(),
                source: "runwayml/stable-diffusion-inpainting".into(),
                family: EngineFamily::Sd,
                native_resolution: 512,
                modes: vec![Mode::Inpaint],
                memory_gb: 4.0,
                requires_gpu: false,
            },
            ModelDescriptor {
                key: "sdxl-inpainting".into(),
                name: "Stable Diffusion XL Inpainting".into(),
                source: "diffusers/stable-diffusion-xl-1.0-inpainting-0.1".into(),
                family: EngineFamily::Sdxl,
                native_resolution: 1024,
                modes: vec![Mode::Inpaint],
                memory_gb: 12.0,
                requires_gpu: true,
            },
        ];

        let adapters = vec![
            AdapterDescriptor {
                key: "watercolor".into(),
                name: "Watercolor Style".into(),
                local_path: Some("loras/watercolor.safetensors".into()),
                remote_id: Some("artificialguybr/watercolor-style".into()),
                default_weight: 0.75,
                weight_min: 0.0,
                weight_max: 1.2,
                compatible_models: vec!["sd-v1-5".into(), "sd-v2-1".into()],
                trigger_words: vec!["watercolor style".into(), "wet on wet".into()],
                category: AdapterCategory::Style,
            },
            AdapterDescriptor {
                key: "pixel-art".into(),
                name: "Pixel Art".into(),
                local_path: Some("loras/pixel-art.safetensors".into()),
                remote_id: Some("kohbanye/pixel-art-style".into()),
                default_weight: 1.0,
                weight_min: 0.5,
                weight_max: 1.5,
                compatible_models: vec!["sd-v1-5".into()],
                trigger_words: vec!["pixel art".into()],
                category: AdapterCategory::Style,
            },
            AdapterDescriptor {
                key: "thangka".into(),
                name: "Thangka Painting".into(),
                local_path: Some("loras/thangka.safetensors".into()),
                remote_id: Some("norbu/thangka-style-sdxl".into()),
                default_weight: 0.8,
                weight_min: 0.0,
                weight_max: 1.0,
                compatible_models: vec!["sdxl".into()],
                trigger_words: vec!["thangka painting".into(), "tibetan art".into()],
                category: AdapterCategory::Style,
            },
            AdapterDescriptor {
                key: "detail-tweaker".into(),
                name: "Detail Tweaker".into(),
                local_path: None,
                remote_id: Some("ntc-ai/detail-tweaker-lora".into()),
                default_weight: 0.6,
                weight_min: -1.0,
                weight_max: 2.0,
                compatible_models: vec!["sd-v1-5".into(), "sd-v2-1".into(), "sdxl".into()],
                trigger_words: vec!["highly detailed".into()],
                category: AdapterCategory::Detail,
            },
        ];

        Self::new(models, adapters)
    }

    pub fn describe_model(&self, key: &str) -> Result<&ModelDescriptor> {
        self.models.get(key).ok_or_else(|| Error::UnknownModel {
            key: key.to_string(),
            known: self.model_keys(),
        })
    }

    pub fn describe_adapter(&self, key: &str) -> Result<&AdapterDescriptor> {
        self.adapters.get(key).ok_or_else(|| Error::UnknownAdapter {
            key: key.to_string(),
            known: self.adapter_keys(),
        })
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &AdapterDescriptor> {
        self.adapters.values()
    }

    pub fn model_keys(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn adapter_keys(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    /// Keys of every adapter compatible with the given model, in catalog
    /// order. Empty when the model is unknown.
    pub fn compatible_adapters(&self, model_key: &str) -> Vec<String> {
        self.adapters
            .values()
            .filter(|a| a.compatible_models.iter().any(|m| m == model_key))
            .map(|a| a.key.clone())
            .collect()
    }

    pub fn is_compatible(&self, adapter_key: &str, model_key: &str) -> bool {
        self.adapters
            .get(adapter_key)
            .map(|a| a.compatible_models.iter().any(|m| m == model_key))
            .unwrap_or(false)
    }

    /// The dedicated inpainting-specialized model for the given base model,
    /// chosen by engine family. Returns the model itself when it already is
    /// an inpainting specialist.
    pub fn inpaint_counterpart(&self, model_key: &str) -> Option<&ModelDescriptor> {
        let base = self.models.get(model_key)?;
        if base.is_inpaint_specialist() {
            return Some(base);
        }
        self.models
            .values()
            .find(|m| m.family == base.family && m.is_inpaint_specialist())
    }
}
