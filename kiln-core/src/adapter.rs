//! Adapter resolution
//!
//! Turns requested adapter keys into concrete activations: compatibility is
//! checked against the registry all-or-nothing, weights fall back to
//! per-adapter defaults, and each adapter contributes its primary trigger
//! word to the prompt.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::registry::Registry;

/// An adapter as named in a generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterRequest {
    pub key: String,
    /// Override for the adapter's default weight.
    pub weight: Option<f32>,
}

/// Where an adapter's weights come from.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightSource {
    Local(PathBuf),
    /// Remote identifier; fetching is the engine's concern.
    Remote(String),
}

/// A fully resolved adapter ready to hand to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterActivation {
    pub key: String,
    pub weight: f32,
    pub source: WeightSource,
}

/// Output of a successful resolution pass.
#[derive(Debug, Clone)]
pub struct ResolvedAdapters {
    /// Activations in request order.
    pub activations: Vec<AdapterActivation>,
    /// Primary trigger word per adapter, in request order.
    pub trigger_words: Vec<String>,
}

impl ResolvedAdapters {
    /// Prepend the trigger words to a prompt so the adapters actually take
    /// effect. A prompt without adapters passes through unchanged.
    pub fn augment_prompt(&self, prompt: &str) -> String {
        if self.trigger_words.is_empty() {
            return prompt.to_string();
        }
        format!("{}, {}", self.trigger_words.join(", "), prompt)
    }
}

pub struct AdapterResolver {
    registry: Arc<Registry>,
}

impl AdapterResolver {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Check every requested adapter against the target model. Fails on the
    /// first unknown or incompatible adapter; no partial acceptance.
    pub fn validate(&self, requests: &[AdapterRequest], model_key: &str) -> Result<()> {
        for request in requests {
            self.registry.describe_adapter(&request.key)?;
            if !self.registry.is_compatible(&request.key, model_key) {
                return Err(Error::IncompatibleAdapter {
                    adapter: request.key.clone(),
                    model: model_key.to_string(),
                    compatible: self.registry.compatible_adapters(model_key),
                });
            }
        }
        Ok(())
    }

    /// Resolve requests into activations. Assumes [`validate`] already
    /// passed; still re-checks compatibility so direct callers cannot slip
    /// an incompatible adapter through.
    ///
    /// [`validate`]: AdapterResolver::validate
    pub fn resolve(&self, requests: &[AdapterRequest], model_key: &str) -> Result<ResolvedAdapters> {
        self.validate(requests, model_key)?;

        let mut activations = Vec::with_capacity(requests.len());
        let mut trigger_words = Vec::new();

        for request in requests {
            let descriptor = self.registry.describe_adapter(&request.key)?;

            let weight = request.weight.unwrap_or(descriptor.default_weight);
            if weight < descriptor.weight_min || weight > descriptor.weight_max {
                warn!(
                    adapter = %descriptor.key,
                    weight,
                    min = descriptor.weight_min,
                    max = descriptor.weight_max,
                    "adapter weight outside recommended range"
                );
            }

            let source = match &descriptor.local_path {
                Some(path) if path.exists() => WeightSource::Local(path.clone()),
                _ => match &descriptor.remote_id {
                    Some(id) => WeightSource::Remote(id.clone()),
                    None => {
                        return Err(Error::Engine(anyhow::anyhow!(
                            "adapter '{}' has no usable weight source",
                            descriptor.key
                        )))
                    }
                },
            };

            if let Some(word) = descriptor.trigger_words.first() {
                trigger_words.push(word.clone());
            }

            activations.push(AdapterActivation {
                key: descriptor.key.clone(),
                weight,
                source,
            });
        }

        Ok(ResolvedAdapters {
            activations,
            trigger_words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> AdapterResolver {
        AdapterResolver::new(Arc::new(Registry::builtin().unwrap()))
    }

    fn request(key: &str, weight: Option<f32>) -> AdapterRequest {
        AdapterRequest {
            key: key.to_string(),
            weight,
        }
    }

    #[test]
    fn default_weight_applies_when_unset() {
        let resolved = resolver()
            .resolve(&[request("watercolor", None)], "sd-v1-5")
            .unwrap();
        assert_eq!(resolved.activations.len(), 1);
        assert_eq!(resolved.activations[0].weight, 0.75);
    }

    #[test]
    fn explicit_weight_wins() {
        let resolved = resolver()
            .resolve(&[request("watercolor", Some(0.3))], "sd-v1-5")
            .unwrap();
        assert_eq!(resolved.activations[0].weight, 0.3);
    }

    #[test]
    fn out_of_range_weight_passes_through() {
        let resolved = resolver()
            .resolve(&[request("watercolor", Some(5.0))], "sd-v1-5")
            .unwrap();
        assert_eq!(resolved.activations[0].weight, 5.0);
    }

    #[test]
    fn incompatible_adapter_rejected_with_alternatives() {
        let err = resolver()
            .resolve(&[request("thangka", None)], "sd-v1-5")
            .unwrap_err();
        match err {
            Error::IncompatibleAdapter {
                adapter,
                model,
                compatible,
            } => {
                assert_eq!(adapter, "thangka");
                assert_eq!(model, "sd-v1-5");
                assert!(compatible.contains(&"watercolor".to_string()));
                assert!(!compatible.contains(&"thangka".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn one_bad_adapter_fails_the_whole_set() {
        let err = resolver()
            .resolve(
                &[request("watercolor", None), request("thangka", None)],
                "sd-v1-5",
            )
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleAdapter { .. }));
    }

    #[test]
    fn trigger_words_prepend_in_request_order() {
        let resolved = resolver()
            .resolve(
                &[request("pixel-art", None), request("watercolor", None)],
                "sd-v1-5",
            )
            .unwrap();
        assert_eq!(
            resolved.augment_prompt("a castle"),
            "pixel art, watercolor style, a castle"
        );
    }

    #[test]
    fn missing_local_file_falls_back_to_remote() {
        let resolved = resolver()
            .resolve(&[request("watercolor", None)], "sd-v1-5")
            .unwrap();
        // No loras/ directory in the test environment.
        assert!(matches!(
            resolved.activations[0].source,
            WeightSource::Remote(_)
        ));
    }

    #[test]
    fn empty_request_resolves_to_nothing() {
        let resolved = resolver().resolve(&[], "sd-v1-5").unwrap();
        assert!(resolved.activations.is_empty());
        assert_eq!(resolved.augment_prompt("plain"), "plain");
    }
}
