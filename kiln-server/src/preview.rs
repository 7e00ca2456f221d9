//! Preview engine
//!
//! A deterministic stand-in for a real diffusion backend, used for local
//! development and API testing. Output is a seeded gradient-plus-noise image
//! that honors init images, masks, and strength, with per-step progress and
//! a small delay so the async job machinery behaves like production.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};
use kiln_core::{
    AdapterActivation, EngineProvider, EngineSpec, GenerationEngine, Invocation, ProgressSink,
    SchedulerConfig, SchedulerKind,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

const STEP_DELAY: Duration = Duration::from_millis(25);

pub struct PreviewEngine {
    spec: EngineSpec,
    scheduler: Mutex<SchedulerConfig>,
    adapters: Mutex<Vec<AdapterActivation>>,
}

impl PreviewEngine {
    fn new(spec: EngineSpec) -> Self {
        Self {
            spec,
            scheduler: Mutex::new(SchedulerConfig {
                kind: SchedulerKind::Ddim,
                options: Default::default(),
            }),
            adapters: Mutex::new(Vec::new()),
        }
    }

    fn render(&self, invocation: &Invocation) -> RgbImage {
        // Seed folds in the prompt so distinct prompts look distinct while
        // the same request reproduces byte-identical output.
        let prompt_hash: u64 = invocation
            .prompt
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let seed = invocation.seed.unwrap_or(0).wrapping_add(prompt_hash);
        let mut rng = StdRng::seed_from_u64(seed);

        let (w, h) = (invocation.width, invocation.height);
        let mut image = RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                (x * 255 / w.max(1)) as u8,
                (y * 255 / h.max(1)) as u8,
                ((x + y) * 255 / (w + h).max(1)) as u8,
            ])
        });
        for pixel in image.pixels_mut() {
            for channel in pixel.0.iter_mut() {
                let noise: i16 = rng.gen_range(-16..=16);
                *channel = (*channel as i16 + noise).clamp(0, 255) as u8;
            }
        }

        if let Some(init) = &invocation.init_image {
            let strength = invocation.strength.clamp(0.0, 1.0);
            for (x, y, pixel) in image.enumerate_pixels_mut() {
                let base = init.get_pixel(x.min(init.width() - 1), y.min(init.height() - 1));
                // White mask regions take the generated value, black keeps
                // the source. Without a mask, strength blends globally.
                let blend = match &invocation.mask {
                    Some(mask) => {
                        let m = mask.get_pixel(x.min(mask.width() - 1), y.min(mask.height() - 1));
                        strength * (m.0[0] as f32 / 255.0)
                    }
                    None => strength,
                };
                for i in 0..3 {
                    pixel.0[i] = (base.0[i] as f32 * (1.0 - blend)
                        + pixel.0[i] as f32 * blend) as u8;
                }
            }
        }

        image
    }
}

impl GenerationEngine for PreviewEngine {
    fn scheduler(&self) -> SchedulerConfig {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install_scheduler(&self, config: &SchedulerConfig) -> anyhow::Result<()> {
        *self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(())
    }

    fn enable_attention_slicing(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn enable_memory_efficient_attention(&self) -> anyhow::Result<()> {
        anyhow::bail!("preview engine has no attention kernels")
    }

    fn set_adapters(&self, adapters: &[AdapterActivation]) -> anyhow::Result<()> {
        *self
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = adapters.to_vec();
        Ok(())
    }

    fn generate(
        &self,
        invocation: &Invocation,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<DynamicImage> {
        info!(
            model = %self.spec.model_key,
            mode = %self.spec.mode,
            steps = invocation.steps,
            "preview generation"
        );
        for step in 1..=invocation.steps {
            std::thread::sleep(STEP_DELAY);
            let percent = step as f32 / invocation.steps as f32 * 100.0;
            if let Err(e) = progress.report(percent) {
                warn!(error = %e, "progress report failed");
            }
        }
        Ok(DynamicImage::ImageRgb8(self.render(invocation)))
    }
}

/// Provider handing out [`PreviewEngine`] instances.
#[derive(Default)]
pub struct PreviewProvider;

impl EngineProvider for PreviewProvider {
    fn load(&self, spec: &EngineSpec) -> anyhow::Result<Arc<dyn GenerationEngine>> {
        info!(model = %spec.model_key, mode = %spec.mode, "loading preview engine");
        Ok(Arc::new(PreviewEngine::new(spec.clone())))
    }
}
