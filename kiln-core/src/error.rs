use thiserror::Error;

use crate::Mode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy for the orchestrator and its collaborators.
///
/// Validation and resource errors surface synchronously at submission where
/// possible; engine errors always surface as job failures and are never
/// retried automatically.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request. The job is never created.
    #[error("{0}")]
    Validation(String),

    /// Model key not present in the capability registry.
    #[error("unknown model '{key}'; available models: {}", known.join(", "))]
    UnknownModel { key: String, known: Vec<String> },

    /// Adapter key not present in the capability registry.
    #[error("unknown adapter '{key}'; available adapters: {}", known.join(", "))]
    UnknownAdapter { key: String, known: Vec<String> },

    /// The model's descriptor does not list the requested mode.
    #[error(
        "model '{model}' does not support {mode} (supported: {})",
        supported.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
    )]
    UnsupportedMode {
        model: String,
        mode: Mode,
        supported: Vec<Mode>,
    },

    /// Requested adapter is not in the model's compatibility set.
    #[error(
        "adapter '{adapter}' is not compatible with model '{model}'. Compatible adapters: {}",
        if compatible.is_empty() { "none".to_string() } else { compatible.join(", ") }
    )]
    IncompatibleAdapter {
        adapter: String,
        model: String,
        compatible: Vec<String>,
    },

    /// Underlying engine load or generation failed. Propagated as-is.
    #[error("engine failure: {0}")]
    Engine(#[source] anyhow::Error),

    /// Artifact encoding or persistence failed after generation succeeded.
    #[error("artifact finalization failed: {0}")]
    Finalize(#[source] anyhow::Error),

    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// True when the submitter supplied a malformed or unsatisfiable
    /// request, as opposed to an internal failure.
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::UnknownModel { .. }
                | Error::UnknownAdapter { .. }
                | Error::UnsupportedMode { .. }
                | Error::IncompatibleAdapter { .. }
        )
    }
}
