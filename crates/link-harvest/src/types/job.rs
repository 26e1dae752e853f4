//! Job lifecycle types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Job state. `Success` and `Failure` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "RUNNING" => Some(JobState::Running),
            "SUCCESS" => Some(JobState::Success),
            "FAILURE" => Some(JobState::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing status of a job
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running { completed: usize, total: usize },
    Success { artifact: String },
    Failure { cause: String },
}

/// Immutable snapshot of a job
///
/// Snapshots are never mutated in place. Every transition builds a new snapshot
/// which replaces the previous one in the status store as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub state: JobState,
    /// Records finished in the current attempt
    pub completed: usize,
    /// Records in the batch, fixed at submission
    pub total: usize,
    /// 1-based attempt number, 0 while pending
    pub attempt: u32,
    /// Records of the current attempt that yielded an empty result
    pub failed_records: usize,
    /// Artifact reference (SUCCESS only)
    pub artifact: Option<String>,
    /// Failure cause (FAILURE only)
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// New job in PENDING
    pub fn new(id: Uuid, total: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: JobState::Pending,
            completed: 0,
            total,
            attempt: 0,
            failed_records: 0,
            artifact: None,
            error: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Floor percentage of the current attempt, clamped to [0, 100]
    pub fn percent_complete(&self) -> u8 {
        percent(self.completed, self.total)
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Running => JobStatus::Running {
                completed: self.completed,
                total: self.total,
            },
            JobState::Success => JobStatus::Success {
                artifact: self.artifact.clone().unwrap_or_default(),
            },
            JobState::Failure => JobStatus::Failure {
                cause: self.error.clone().unwrap_or_default(),
            },
        }
    }

    /// Begin an attempt. Allowed from PENDING (first attempt) and RUNNING (retry);
    /// progress restarts at zero.
    pub fn started(&self, attempt: u32) -> Result<Self> {
        if self.state.is_terminal() {
            return Err(self.invalid("start"));
        }
        let now = Utc::now();
        Ok(Self {
            state: JobState::Running,
            completed: 0,
            attempt,
            failed_records: 0,
            started_at: Some(now),
            updated_at: now,
            ..self.clone()
        })
    }

    /// Record progress of the running attempt
    pub fn with_progress(&self, completed: usize, failed_records: usize) -> Result<Self> {
        if self.state != JobState::Running {
            return Err(self.invalid("record progress"));
        }
        if completed > self.total {
            return Err(Error::InvalidState(format!(
                "job {} progress {} exceeds total {}",
                self.id, completed, self.total
            )));
        }
        if completed < self.completed {
            return Err(Error::InvalidState(format!(
                "job {} progress went backwards ({} -> {})",
                self.id, self.completed, completed
            )));
        }
        Ok(Self {
            completed,
            failed_records,
            updated_at: Utc::now(),
            ..self.clone()
        })
    }

    /// RUNNING -> SUCCESS
    pub fn succeeded(&self, artifact: impl Into<String>) -> Result<Self> {
        if self.state != JobState::Running {
            return Err(self.invalid("succeed"));
        }
        let now = Utc::now();
        Ok(Self {
            state: JobState::Success,
            completed: self.total,
            artifact: Some(artifact.into()),
            error: None,
            updated_at: now,
            finished_at: Some(now),
            ..self.clone()
        })
    }

    /// PENDING | RUNNING -> FAILURE
    pub fn failed(&self, cause: impl Into<String>) -> Result<Self> {
        if self.state.is_terminal() {
            return Err(self.invalid("fail"));
        }
        let now = Utc::now();
        Ok(Self {
            state: JobState::Failure,
            artifact: None,
            error: Some(cause.into()),
            updated_at: now,
            finished_at: Some(now),
            ..self.clone()
        })
    }

    fn invalid(&self, action: &str) -> Error {
        Error::InvalidState(format!(
            "cannot {} job {} in state {}",
            action, self.id, self.state
        ))
    }
}

/// `floor(completed / total * 100)` clamped to [0, 100]; zero for an empty total
pub fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (completed.min(total) as u128 * 100) / total as u128;
    pct.min(100) as u8
}
