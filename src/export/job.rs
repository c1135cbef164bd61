use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Preparing,
    Analyzing,
    Rendering,
    Encoding,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Preparing => "preparing",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Rendering => "rendering",
            JobStatus::Encoding => "encoding",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub phase: JobStatus,
    /// Fraction of the current phase, 0.0-1.0.
    pub fraction: f32,
    pub message: String,
    pub current_frame: Option<usize>,
    pub total_frames: Option<usize>,
}

impl JobProgress {
    pub fn new(phase: JobStatus, fraction: f32, message: impl Into<String>) -> Self {
        Self {
            phase,
            fraction: if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 },
            message: message.into(),
            current_frame: None,
            total_frames: None,
        }
    }

    pub fn with_frames(mut self, current: usize, total: usize) -> Self {
        self.current_frame = Some(current);
        self.total_frames = Some(total);
        self
    }
}

/// Handle returned by a renderer once the output exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef(pub PathBuf);

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Snapshot of one export job. The orchestrator owns the live record;
/// callers only ever see clones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: JobId,
    pub label: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub created_at: SystemTime,
    pub completed_at: Option<SystemTime>,
    pub output_ref: Option<OutputRef>,
    pub error: Option<String>,
}

impl ExportJob {
    pub fn new(id: JobId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            status: JobStatus::Queued,
            progress: JobProgress::new(JobStatus::Queued, 0.0, "waiting for render slot"),
            created_at: SystemTime::now(),
            completed_at: None,
            output_ref: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status change or progress report, broadcast to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub error: Option<String>,
}

impl JobEvent {
    pub fn from_job(job: &ExportJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress.clone(),
            error: job.error.clone(),
        }
    }
}
