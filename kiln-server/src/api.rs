//! HTTP API
//!
//! Thin translation layer over the orchestrator: JSON requests in, job ids
//! and status views out. Images travel base64-encoded in request bodies and
//! as files under /images once a job completes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use kiln_core::{
    AdapterRequest, ComputeBackend, GenerationRequest, Mode, Orchestrator,
};

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/generate_img2img", post(generate_img2img))
        .route("/api/inpaint", post(inpaint))
        .route("/api/status/{id}", get(status))
        .route("/api/models", get(list_models))
        .route("/api/loras", get(list_adapters))
        .route("/api/loras/{key}", get(describe_adapter))
        .route("/api/health", get(health))
        .with_state(orchestrator)
}

enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<kiln_core::Error> for AppError {
    fn from(err: kiln_core::Error) -> Self {
        if err.is_client() {
            AppError::BadRequest(err.to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            AppError::Internal(detail) => {
                error!(%detail, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, detail)
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[derive(Deserialize)]
struct LoraSpec {
    key: String,
    weight: Option<f32>,
}

impl From<LoraSpec> for AdapterRequest {
    fn from(spec: LoraSpec) -> Self {
        AdapterRequest {
            key: spec.key,
            weight: spec.weight,
        }
    }
}

#[derive(Deserialize)]
struct GenerateBody {
    prompt: String,
    negative_prompt: Option<String>,
    #[serde(default = "default_model")]
    model: String,
    width: Option<u32>,
    height: Option<u32>,
    steps: Option<u32>,
    guidance_scale: Option<f32>,
    seed: Option<u64>,
    strength: Option<f32>,
    /// Base64-encoded source image, required for img2img and inpaint.
    init_image: Option<String>,
    /// Base64-encoded mask, white marks the region to regenerate.
    mask: Option<String>,
    #[serde(default)]
    mask_blur: bool,
    #[serde(default = "default_mask_blur_radius")]
    mask_blur_radius: f32,
    #[serde(default)]
    loras: Vec<LoraSpec>,
}

fn default_model() -> String {
    "sd-v1-5".to_string()
}

fn default_mask_blur_radius() -> f32 {
    4.0
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    status: &'static str,
}

fn decode_image(field: &str, data: &str) -> Result<image::DynamicImage, AppError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| AppError::BadRequest(format!("{field} is not valid base64: {e}")))?;
    image::load_from_memory(&bytes)
        .map_err(|e| AppError::BadRequest(format!("{field} is not a decodable image: {e}")))
}

fn build_request(body: GenerateBody, mode: Mode) -> Result<GenerationRequest, AppError> {
    let init_image = body
        .init_image
        .as_deref()
        .map(|data| decode_image("init_image", data))
        .transpose()?;
    let mask = body
        .mask
        .as_deref()
        .map(|data| decode_image("mask", data))
        .transpose()?;
    Ok(GenerationRequest {
        prompt: body.prompt,
        negative_prompt: body.negative_prompt,
        model_key: body.model,
        mode,
        width: body.width,
        height: body.height,
        steps: body.steps,
        guidance: body.guidance_scale,
        seed: body.seed,
        strength: body.strength,
        init_image,
        mask,
        mask_blur: body.mask_blur,
        mask_blur_radius: body.mask_blur_radius,
        adapters: body.loras.into_iter().map(Into::into).collect(),
    })
}

async fn submit(
    orchestrator: Arc<Orchestrator>,
    body: GenerateBody,
    mode: Mode,
) -> Result<Json<SubmitResponse>, AppError> {
    let request = build_request(body, mode)?;
    let job_id = orchestrator.submit(request)?;
    Ok(Json(SubmitResponse {
        job_id,
        status: "pending",
    }))
}

async fn generate(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<SubmitResponse>, AppError> {
    submit(orchestrator, body, Mode::Txt2Img).await
}

async fn generate_img2img(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<SubmitResponse>, AppError> {
    submit(orchestrator, body, Mode::Img2Img).await
}

async fn inpaint(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<SubmitResponse>, AppError> {
    submit(orchestrator, body, Mode::Inpaint).await
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    view: kiln_core::JobView,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<String>,
}

async fn status(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    let view = orchestrator
        .status(id)
        .ok_or_else(|| AppError::NotFound(format!("no job with id {id}")))?;
    let image_url = view.image_file.as_ref().map(|f| format!("/images/{f}"));
    Ok(Json(StatusResponse { view, image_url }))
}

async fn list_models(State(orchestrator): State<Arc<Orchestrator>>) -> Json<serde_json::Value> {
    let on_cpu = orchestrator.config().backend == ComputeBackend::Cpu;
    let models: Vec<_> = orchestrator
        .registry()
        .models()
        .filter(|m| !(on_cpu && m.requires_gpu))
        .map(|m| {
            json!({
                "key": m.key,
                "name": m.name,
                "family": m.family,
                "native_resolution": m.native_resolution,
                "modes": m.modes,
                "memory_gb": m.memory_gb,
                "requires_gpu": m.requires_gpu,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

#[derive(Deserialize)]
struct AdapterFilter {
    model: Option<String>,
}

fn adapter_json(a: &kiln_core::AdapterDescriptor) -> serde_json::Value {
    json!({
        "key": a.key,
        "name": a.name,
        "category": a.category,
        "default_weight": a.default_weight,
        "weight_range": [a.weight_min, a.weight_max],
        "compatible_models": a.compatible_models,
        "trigger_words": a.trigger_words,
    })
}

async fn list_adapters(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(filter): Query<AdapterFilter>,
) -> Json<serde_json::Value> {
    let adapters: Vec<_> = orchestrator
        .registry()
        .adapters()
        .filter(|a| match &filter.model {
            Some(model) => a.compatible_models.iter().any(|m| m == model),
            None => true,
        })
        .map(adapter_json)
        .collect();
    Json(json!({ "loras": adapters }))
}

async fn describe_adapter(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let descriptor = orchestrator
        .registry()
        .describe_adapter(&key)
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(adapter_json(descriptor)))
}

async fn health(State(orchestrator): State<Arc<Orchestrator>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "device": orchestrator.config().backend,
        "precision": orchestrator.config().precision,
        "loaded_pipelines": orchestrator.pipelines().cached_len(),
        "jobs": orchestrator.jobs().len(),
    }))
}
