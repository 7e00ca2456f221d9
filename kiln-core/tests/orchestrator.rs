use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::DynamicImage;
use kiln_core::{
    AdapterActivation, AdapterRequest, ComputeBackend, EngineProvider, EngineSpec,
    GenerationEngine, GenerationRequest, Invocation, JobState, JobView, Mode, Orchestrator,
    OrchestratorConfig, Precision, ProgressSink, Registry, SchedulerConfig, SchedulerKind,
};

/// Engine that records what it was asked to do and returns a flat image.
struct StubEngine {
    scheduler: Mutex<SchedulerConfig>,
    installed_schedulers: Mutex<Vec<SchedulerConfig>>,
    adapter_sets: Mutex<Vec<Vec<AdapterActivation>>>,
    invocations: Mutex<Vec<Invocation>>,
    fail_generation: bool,
}

impl StubEngine {
    fn new(fail_generation: bool) -> Self {
        let mut options = BTreeMap::new();
        options.insert("beta_start".to_string(), serde_json::json!(0.00085));
        options.insert("clip_sample".to_string(), serde_json::json!(false));
        Self {
            scheduler: Mutex::new(SchedulerConfig {
                kind: SchedulerKind::Ddim,
                options,
            }),
            installed_schedulers: Mutex::new(Vec::new()),
            adapter_sets: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            fail_generation,
        }
    }
}

impl GenerationEngine for StubEngine {
    fn scheduler(&self) -> SchedulerConfig {
        self.scheduler.lock().unwrap().clone()
    }

    fn install_scheduler(&self, config: &SchedulerConfig) -> anyhow::Result<()> {
        self.installed_schedulers.lock().unwrap().push(config.clone());
        *self.scheduler.lock().unwrap() = config.clone();
        Ok(())
    }

    fn enable_attention_slicing(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn enable_memory_efficient_attention(&self) -> anyhow::Result<()> {
        anyhow::bail!("not built with memory-efficient attention")
    }

    fn set_adapters(&self, adapters: &[AdapterActivation]) -> anyhow::Result<()> {
        self.adapter_sets.lock().unwrap().push(adapters.to_vec());
        Ok(())
    }

    fn generate(
        &self,
        invocation: &Invocation,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<DynamicImage> {
        self.invocations.lock().unwrap().push(invocation.clone());
        if self.fail_generation {
            anyhow::bail!("synthetic generation failure");
        }
        let _ = progress.report(50.0);
        let _ = progress.report(100.0);
        Ok(DynamicImage::ImageRgb8(image::RgbImage::new(
            invocation.width,
            invocation.height,
        )))
    }
}

/// Provider that counts loads and keeps every engine it hands out.
#[derive(Default)]
struct StubProvider {
    loads: AtomicUsize,
    specs: Mutex<Vec<EngineSpec>>,
    engines: Mutex<Vec<Arc<StubEngine>>>,
    fail_generation: bool,
    load_delay: Option<Duration>,
}

impl StubProvider {
    fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn last_engine(&self) -> Arc<StubEngine> {
        self.engines.lock().unwrap().last().cloned().unwrap()
    }
}

impl EngineProvider for StubProvider {
    fn load(&self, spec: &EngineSpec) -> anyhow::Result<Arc<dyn GenerationEngine>> {
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());
        let engine = Arc::new(StubEngine::new(self.fail_generation));
        self.engines.lock().unwrap().push(Arc::clone(&engine));
        Ok(engine)
    }
}

fn orchestrator_with(
    provider: Arc<StubProvider>,
    output_dir: &std::path::Path,
) -> Arc<Orchestrator> {
    let config = OrchestratorConfig {
        output_dir: output_dir.to_path_buf(),
        ..OrchestratorConfig::default()
    };
    Arc::new(
        Orchestrator::new(Arc::new(Registry::builtin().unwrap()), provider, config).unwrap(),
    )
}

async fn wait_terminal(orchestrator: &Orchestrator, id: uuid::Uuid) -> JobView {
    for _ in 0..200 {
        if let Some(view) = orchestrator.status(id) {
            if view.status.is_terminal() {
                return view;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} never reached a terminal state");
}

fn txt2img(prompt: &str) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt.to_string(),
        model_key: "sd-v1-5".to_string(),
        ..GenerationRequest::default()
    }
}

#[test]
fn repeated_acquire_loads_once() {
    let provider = Arc::new(StubProvider::default());
    let manager = kiln_core::PipelineManager::new(
        Arc::new(Registry::builtin().unwrap()),
        Arc::clone(&provider) as Arc<dyn EngineProvider>,
        ComputeBackend::Cpu,
        Precision::Full,
    );

    let first = manager.acquire("sd-v1-5", Mode::Txt2Img).unwrap();
    let second = manager.acquire("sd-v1-5", Mode::Txt2Img).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(provider.load_count(), 1);

    manager.acquire("sd-v1-5", Mode::Img2Img).unwrap();
    assert_eq!(provider.load_count(), 2);
    assert_eq!(manager.cached_len(), 2);
}

#[test]
fn concurrent_same_key_loads_once() {
    let provider = Arc::new(StubProvider {
        load_delay: Some(Duration::from_millis(50)),
        ..StubProvider::default()
    });
    let manager = Arc::new(kiln_core::PipelineManager::new(
        Arc::new(Registry::builtin().unwrap()),
        Arc::clone(&provider) as Arc<dyn EngineProvider>,
        ComputeBackend::Cpu,
        Precision::Full,
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.acquire("sd-v1-5", Mode::Txt2Img).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(provider.load_count(), 1);
}

#[test]
fn concurrent_distinct_keys_load_independently() {
    let provider = Arc::new(StubProvider {
        load_delay: Some(Duration::from_millis(50)),
        ..StubProvider::default()
    });
    let manager = Arc::new(kiln_core::PipelineManager::new(
        Arc::new(Registry::builtin().unwrap()),
        Arc::clone(&provider) as Arc<dyn EngineProvider>,
        ComputeBackend::Cpu,
        Precision::Full,
    ));

    let keys = ["sd-v1-5", "sd-v2-1"];
    let handles: Vec<_> = keys
        .iter()
        .map(|key| {
            let manager = Arc::clone(&manager);
            let key = key.to_string();
            std::thread::spawn(move || manager.acquire(&key, Mode::Txt2Img).unwrap())
        })
        .collect();
    let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(!Arc::ptr_eq(&entries[0], &entries[1]));
    assert_eq!(provider.load_count(), 2);
}

#[test]
fn inpaint_substitutes_dedicated_weights() {
    let provider = Arc::new(StubProvider::default());
    let manager = kiln_core::PipelineManager::new(
        Arc::new(Registry::builtin().unwrap()),
        Arc::clone(&provider) as Arc<dyn EngineProvider>,
        ComputeBackend::Cpu,
        Precision::Full,
    );

    let entry = manager.acquire("sd-v1-5", Mode::Inpaint).unwrap();
    assert_eq!(entry.model_key, "sd-v1-5");
    let specs = provider.specs.lock().unwrap();
    assert_eq!(specs[0].source, "runwayml/stable-diffusion-inpainting");
    assert_eq!(specs[0].model_key, "sd-v1-5");
}

#[test]
fn fresh_pipeline_gets_fast_scheduler_with_sanitized_options() {
    let provider = Arc::new(StubProvider::default());
    let manager = kiln_core::PipelineManager::new(
        Arc::new(Registry::builtin().unwrap()),
        Arc::clone(&provider) as Arc<dyn EngineProvider>,
        ComputeBackend::Cpu,
        Precision::Full,
    );

    manager.acquire("sd-v1-5", Mode::Txt2Img).unwrap();
    let engine = provider.last_engine();
    let installed = engine.installed_schedulers.lock().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].kind, SchedulerKind::DpmSolverMultistep);
    assert!(installed[0].options.contains_key("beta_start"));
    assert!(!installed[0].options.contains_key("clip_sample"));
}

#[test]
fn release_evicts_and_reload_counts() {
    let provider = Arc::new(StubProvider::default());
    let manager = kiln_core::PipelineManager::new(
        Arc::new(Registry::builtin().unwrap()),
        Arc::clone(&provider) as Arc<dyn EngineProvider>,
        ComputeBackend::Cpu,
        Precision::Full,
    );

    manager.acquire("sd-v1-5", Mode::Txt2Img).unwrap();
    manager.acquire("sd-v2-1", Mode::Txt2Img).unwrap();
    manager.release(Some("sd-v1-5"));
    assert_eq!(manager.cached_len(), 1);

    // Releasing something never loaded is a no-op.
    manager.release(Some("sdxl"));
    assert_eq!(manager.cached_len(), 1);

    manager.release(None);
    assert_eq!(manager.cached_len(), 0);

    manager.acquire("sd-v1-5", Mode::Txt2Img).unwrap();
    assert_eq!(provider.load_count(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_rejects_bad_dimensions_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with(Arc::new(StubProvider::default()), dir.path());

    let mut request = txt2img("a castle");
    request.width = Some(500);
    let err = orchestrator.submit(request).unwrap_err();
    assert!(err.to_string().contains("multiple of 8"));
    assert!(orchestrator.jobs().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_rejects_unsupported_mode() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with(Arc::new(StubProvider::default()), dir.path());

    let request = GenerationRequest {
        prompt: "restore the sky".to_string(),
        model_key: "sd-v2-1".to_string(),
        mode: Mode::Inpaint,
        init_image: Some(DynamicImage::ImageRgb8(image::RgbImage::new(64, 64))),
        mask: Some(DynamicImage::ImageLuma8(image::GrayImage::new(64, 64))),
        ..GenerationRequest::default()
    };
    let err = orchestrator.submit(request).unwrap_err();
    assert!(matches!(err, kiln_core::Error::UnsupportedMode { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_rejects_incompatible_adapter_listing_alternatives() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with(Arc::new(StubProvider::default()), dir.path());

    let mut request = txt2img("a monastery");
    request.adapters = vec![AdapterRequest {
        key: "thangka".to_string(),
        weight: None,
    }];
    let err = orchestrator.submit(request).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("watercolor"));
    assert!(!message.contains("Compatible adapters: thangka"));
}

#[tokio::test(flavor = "multi_thread")]
async fn txt2img_job_completes_with_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubProvider::default());
    let orchestrator = orchestrator_with(Arc::clone(&provider), dir.path());

    let mut request = txt2img("a castle on a cliff");
    request.adapters = vec![AdapterRequest {
        key: "watercolor".to_string(),
        weight: None,
    }];
    request.seed = Some(42);
    let id = orchestrator.submit(request).unwrap();

    let view = wait_terminal(&orchestrator, id).await;
    assert_eq!(view.status, JobState::Completed);
    assert_eq!(view.progress_percent, 100.0);
    assert!(view.prompt.starts_with("watercolor style, "));
    assert!(view.generation_time.is_some());
    assert!(view.image_base64.is_some());

    let image_file = view.image_file.unwrap();
    let png = std::fs::read(dir.path().join(&image_file)).unwrap();
    assert!(image::load_from_memory(&png).is_ok());
    let jpg = std::fs::read(dir.path().join(view.preview_file.unwrap())).unwrap();
    assert!(image::load_from_memory(&jpg).is_ok());

    // The engine saw the augmented prompt, the default weight, and the
    // model's native dimensions.
    let engine = provider.last_engine();
    let invocations = engine.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].prompt.starts_with("watercolor style, "));
    assert_eq!(invocations[0].width, 512);
    assert_eq!(invocations[0].seed, Some(42));
    let adapter_sets = engine.adapter_sets.lock().unwrap();
    assert_eq!(adapter_sets[0][0].weight, 0.75);
}

#[tokio::test(flavor = "multi_thread")]
async fn img2img_dimensions_follow_the_init_image() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubProvider::default());
    let orchestrator = orchestrator_with(Arc::clone(&provider), dir.path());

    let request = GenerationRequest {
        prompt: "repaint as oil on canvas".to_string(),
        model_key: "sd-v1-5".to_string(),
        mode: Mode::Img2Img,
        init_image: Some(DynamicImage::ImageRgb8(image::RgbImage::new(500, 300))),
        ..GenerationRequest::default()
    };
    let id = orchestrator.submit(request).unwrap();
    let view = wait_terminal(&orchestrator, id).await;
    assert_eq!(view.status, JobState::Completed);

    let engine = provider.last_engine();
    let invocations = engine.invocations.lock().unwrap();
    assert_eq!(invocations[0].width, 496);
    assert_eq!(invocations[0].height, 296);
    assert!(invocations[0].init_image.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_generation_marks_job_failed() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubProvider {
        fail_generation: true,
        ..StubProvider::default()
    });
    let orchestrator = orchestrator_with(provider, dir.path());

    let id = orchestrator.submit(txt2img("doomed")).unwrap();
    let view = wait_terminal(&orchestrator, id).await;
    assert_eq!(view.status, JobState::Failed);
    assert!(view
        .message
        .unwrap()
        .contains("synthetic generation failure"));
    assert!(view.image_file.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_job_id_has_no_status() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with(Arc::new(StubProvider::default()), dir.path());
    assert!(orchestrator.status(uuid::Uuid::new_v4()).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_jobs_share_one_pipeline_load() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubProvider::default());
    let orchestrator = orchestrator_with(Arc::clone(&provider), dir.path());

    let ids: Vec<_> = (0..4)
        .map(|i| orchestrator.submit(txt2img(&format!("scene {i}"))).unwrap())
        .collect();
    for id in ids {
        let view = wait_terminal(&orchestrator, id).await;
        assert_eq!(view.status, JobState::Completed);
    }
    assert_eq!(provider.load_count(), 1);
}
