//! Job table
//!
//! Submitted jobs live in a concurrent map keyed by id. State transitions
//! are one-directional: terminal states latch, progress only moves forward,
//! and stale worker updates after completion are silently dropped.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

serde_plain::derive_display_from_serialize!(JobState);

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Outputs of a completed job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobArtifacts {
    pub image_file: Option<String>,
    pub preview_file: Option<String>,
    /// Base64 PNG for immediate display without a second request.
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub state: JobState,
    /// Final prompt after trigger-word augmentation.
    pub prompt: String,
    pub model_key: String,
    pub mode: Mode,
    pub progress: f32,
    pub artifacts: JobArtifacts,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: Option<f64>,
}

impl Job {
    fn new(id: Uuid, prompt: String, model_key: String, mode: Mode) -> Self {
        Self {
            id,
            state: JobState::Pending,
            prompt,
            model_key,
            mode,
            progress: 0.0,
            artifacts: JobArtifacts::default(),
            message: None,
            created_at: Utc::now(),
            duration_seconds: None,
        }
    }
}

/// Read-only projection served to status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobState,
    pub progress_percent: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    pub prompt: String,
    pub model_key: String,
    pub mode: Mode,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.state,
            progress_percent: job.progress,
            message: job.message.clone(),
            generation_time: job.duration_seconds,
            image_file: job.artifacts.image_file.clone(),
            preview_file: job.artifacts.preview_file.clone(),
            image_base64: job.artifacts.image_base64.clone(),
            prompt: job.prompt.clone(),
            model_key: job.model_key.clone(),
            mode: job.mode,
        }
    }
}

/// Concurrent job table shared between the orchestrator and its workers.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<Uuid, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending job and return its id.
    pub fn insert(&self, prompt: String, model_key: String, mode: Mode) -> Uuid {
        let id = Uuid::new_v4();
        self.jobs.insert(id, Job::new(id, prompt, model_key, mode));
        id
    }

    pub fn view(&self, id: Uuid) -> Option<JobView> {
        self.jobs.get(&id).map(|j| JobView::from(&*j))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pending -> Processing. Any other starting state is left alone.
    pub fn mark_processing(&self, id: Uuid) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if job.state == JobState::Pending {
                job.state = JobState::Processing;
            }
        }
    }

    /// Advance progress while processing. Regressions and post-terminal
    /// updates are dropped; values cap at 100.
    pub fn update_progress(&self, id: Uuid, percent: f32) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if job.state == JobState::Processing && percent > job.progress {
                job.progress = percent.min(100.0);
            }
        }
    }

    /// Record the augmented prompt once resolution has run.
    pub fn set_prompt(&self, id: Uuid, prompt: String) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if !job.state.is_terminal() {
                job.prompt = prompt;
            }
        }
    }

    pub fn complete(&self, id: Uuid, artifacts: JobArtifacts, duration_seconds: f64) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if job.state.is_terminal() {
                return;
            }
            job.state = JobState::Completed;
            job.progress = 100.0;
            job.artifacts = artifacts;
            job.duration_seconds = Some(duration_seconds);
        }
    }

    pub fn fail(&self, id: Uuid, message: String, duration_seconds: f64) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if job.state.is_terminal() {
                return;
            }
            job.state = JobState::Failed;
            job.message = Some(message);
            job.duration_seconds = Some(duration_seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_job() -> (JobStore, Uuid) {
        let store = JobStore::new();
        let id = store.insert("p".into(), "sd-v1-5".into(), Mode::Txt2Img);
        (store, id)
    }

    #[test]
    fn lifecycle_pending_processing_completed() {
        let (store, id) = store_with_job();
        assert_eq!(store.view(id).unwrap().status, JobState::Pending);

        store.mark_processing(id);
        assert_eq!(store.view(id).unwrap().status, JobState::Processing);

        store.complete(id, JobArtifacts::default(), 2.0);
        let view = store.view(id).unwrap();
        assert_eq!(view.status, JobState::Completed);
        assert_eq!(view.progress_percent, 100.0);
        assert_eq!(view.generation_time, Some(2.0));
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let (store, id) = store_with_job();
        store.mark_processing(id);
        store.update_progress(id, 40.0);
        store.update_progress(id, 20.0);
        assert_eq!(store.view(id).unwrap().progress_percent, 40.0);
        store.update_progress(id, 250.0);
        assert_eq!(store.view(id).unwrap().progress_percent, 100.0);
    }

    #[test]
    fn progress_ignored_while_pending() {
        let (store, id) = store_with_job();
        store.update_progress(id, 50.0);
        assert_eq!(store.view(id).unwrap().progress_percent, 0.0);
    }

    #[test]
    fn terminal_states_latch() {
        let (store, id) = store_with_job();
        store.mark_processing(id);
        store.fail(id, "boom".into(), 1.0);
        store.complete(id, JobArtifacts::default(), 3.0);
        store.update_progress(id, 90.0);

        let view = store.view(id).unwrap();
        assert_eq!(view.status, JobState::Failed);
        assert_eq!(view.message.as_deref(), Some("boom"));
        assert_eq!(view.generation_time, Some(1.0));
    }

    #[test]
    fn unknown_id_yields_none() {
        let store = JobStore::new();
        assert!(store.view(Uuid::new_v4()).is_none());
    }
}
