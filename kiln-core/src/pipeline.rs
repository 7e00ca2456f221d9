//! Pipeline cache
//!
//! Loaded engines are cached per (model, mode) so repeated jobs skip the
//! multi-minute load. Loading for a given key is confined to one caller at a
//! time while loads for distinct keys proceed concurrently; a failed load
//! leaves its slot empty so the next acquire retries. Freshly loaded
//! pipelines get the fast scheduler and, on accelerators, the memory
//! optimizations applied before they are published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::adapter::AdapterActivation;
use crate::device::{ComputeBackend, Precision};
use crate::engine::{
    EngineProvider, EngineSpec, GenerationEngine, Invocation, ProgressSink, SchedulerConfig,
};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::Mode;

/// A cached pipeline variant. Adapter state is tracked per entry so the
/// engine is only reconfigured when the active set actually changes.
pub struct PipelineEntry {
    pub model_key: String,
    pub mode: Mode,
    engine: Arc<dyn GenerationEngine>,
    active_adapters: Mutex<Vec<AdapterActivation>>,
    /// Serializes adapter installation and generation so a concurrent job
    /// cannot swap adapters mid-run.
    gate: Mutex<()>,
}

impl PipelineEntry {
    /// Install the given adapter set and run one generation while holding
    /// the entry's gate.
    pub fn execute(
        &self,
        adapters: &[AdapterActivation],
        invocation: &Invocation,
        progress: &dyn ProgressSink,
    ) -> Result<DynamicImage> {
        let _guard = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.activate(adapters)?;
        self.engine
            .generate(invocation, progress)
            .map_err(Error::Engine)
    }

    fn activate(&self, adapters: &[AdapterActivation]) -> Result<()> {
        let mut active = self
            .active_adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *active == adapters {
            return Ok(());
        }
        self.engine.set_adapters(adapters).map_err(Error::Engine)?;
        *active = adapters.to_vec();
        Ok(())
    }
}

#[derive(Default)]
struct Slot {
    entry: Mutex<Option<Arc<PipelineEntry>>>,
}

/// Loads, caches, and evicts pipeline variants.
pub struct PipelineManager {
    registry: Arc<Registry>,
    provider: Arc<dyn EngineProvider>,
    backend: ComputeBackend,
    precision: Precision,
    slots: Mutex<HashMap<(String, Mode), Arc<Slot>>>,
}

impl PipelineManager {
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn EngineProvider>,
        backend: ComputeBackend,
        precision: Precision,
    ) -> Self {
        Self {
            registry,
            provider,
            backend,
            precision,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get or load the pipeline for (model, mode). Inpaint requests on a
    /// general model substitute the family's dedicated inpainting weights
    /// while caching under the requested key.
    pub fn acquire(&self, model_key: &str, mode: Mode) -> Result<Arc<PipelineEntry>> {
        let descriptor = self.registry.describe_model(model_key)?;
        if !descriptor.supports(mode) {
            return Err(Error::UnsupportedMode {
                model: model_key.to_string(),
                mode,
                supported: descriptor.modes.clone(),
            });
        }

        let slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                slots
                    .entry((model_key.to_string(), mode))
                    .or_insert_with(|| Arc::new(Slot::default())),
            )
        };

        // Holding the slot lock across the load blocks only callers of this
        // same (model, mode); distinct keys load in parallel.
        let mut entry = slot.entry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entry.as_ref() {
            debug!(model = model_key, %mode, "pipeline cache hit");
            return Ok(Arc::clone(existing));
        }

        let loaded = self.load(model_key, mode)?;
        *entry = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    fn load(&self, model_key: &str, mode: Mode) -> Result<Arc<PipelineEntry>> {
        let descriptor = self.registry.describe_model(model_key)?;

        // Inpainting runs on dedicated weights when the family has them.
        let source = if mode == Mode::Inpaint {
            match self.registry.inpaint_counterpart(model_key) {
                Some(counterpart) => counterpart.source.clone(),
                None => {
                    warn!(
                        model = model_key,
                        "no dedicated inpainting weights in family, using base weights"
                    );
                    descriptor.source.clone()
                }
            }
        } else {
            descriptor.source.clone()
        };

        let precision = self.precision.resolve(self.backend);
        let spec = EngineSpec {
            model_key: model_key.to_string(),
            source,
            family: descriptor.family,
            mode,
            backend: self.backend,
            precision,
        };

        info!(model = model_key, %mode, source = %spec.source, "loading pipeline");
        let engine = self.provider.load(&spec).map_err(Error::Engine)?;

        let scheduler = engine.scheduler();
        if !scheduler.kind.is_fast() {
            let fast = SchedulerConfig::fast(&scheduler);
            engine.install_scheduler(&fast).map_err(Error::Engine)?;
            debug!(model = model_key, from = %scheduler.kind, "installed fast scheduler");
        }

        if self.backend.is_accelerator() {
            // Both optimizations are opportunistic; absence of support is
            // not a load failure.
            if let Err(e) = engine.enable_attention_slicing() {
                warn!(model = model_key, error = %e, "attention slicing unavailable");
            }
            if let Err(e) = engine.enable_memory_efficient_attention() {
                warn!(model = model_key, error = %e, "memory-efficient attention unavailable");
            }
        }

        Ok(Arc::new(PipelineEntry {
            model_key: model_key.to_string(),
            mode,
            engine,
            active_adapters: Mutex::new(Vec::new()),
            gate: Mutex::new(()),
        }))
    }

    /// Evict one model's variants, or everything when no key is given.
    /// Evicting an unknown or unloaded key is a logged no-op.
    pub fn release(&self, model_key: Option<&str>) {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match model_key {
            Some(key) => {
                let before = slots.len();
                slots.retain(|(k, _), _| k.as_str() != key);
                if slots.len() == before {
                    debug!(model = key, "release of unloaded model, nothing to do");
                } else {
                    info!(model = key, "evicted pipeline variants");
                }
            }
            None => {
                if !slots.is_empty() {
                    info!(count = slots.len(), "evicted all pipelines");
                }
                slots.clear();
                self.provider.release_pooled_memory();
            }
        }
    }

    /// Number of loaded (model, mode) variants.
    pub fn cached_len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| {
                slot.entry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
            })
            .count()
    }
}
