//! Job record and its state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::council::CouncilResult;

/// Error string stored on cancelled jobs.
pub const CANCELLED_ERROR: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// State-dependent part of a job. Each field exists only in the states
/// where it is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing {
        started_at: DateTime<Utc>,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        result: Box<CouncilResult>,
    },
    Failed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: String,
    },
    Cancelled {
        /// Absent when the job was cancelled before a worker picked it up.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
    },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
            JobState::Cancelled { .. } => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: JobState,
}

impl Job {
    pub fn new(query: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            conversation_id,
            created_at: Utc::now(),
            state: JobState::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Pending => None,
            JobState::Processing { started_at }
            | JobState::Completed { started_at, .. }
            | JobState::Failed { started_at, .. } => Some(*started_at),
            JobState::Cancelled { started_at, .. } => *started_at,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Completed { completed_at, .. }
            | JobState::Failed { completed_at, .. }
            | JobState::Cancelled { completed_at, .. } => Some(*completed_at),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&CouncilResult> {
        match &self.state {
            JobState::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            JobState::Cancelled { .. } => Some(CANCELLED_ERROR),
            _ => None,
        }
    }
}

/// A requested state change.
#[derive(Debug, Clone)]
pub enum Transition {
    Start,
    Complete(Box<CouncilResult>),
    Fail(String),
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start => JobStatus::Processing,
            Transition::Complete(_) => JobStatus::Completed,
            Transition::Fail(_) => JobStatus::Failed,
            Transition::Cancel => JobStatus::Cancelled,
        }
    }

    /// Next state, or `None` when the edge does not exist.
    ///
    /// Timestamps never run backwards: `completed_at` is at least
    /// `started_at`, which is at least `created_at`.
    pub fn apply(self, job: &Job, now: DateTime<Utc>) -> Option<JobState> {
        let floor = |t: DateTime<Utc>| if now < t { t } else { now };

        match (&job.state, self) {
            (JobState::Pending, Transition::Start) => Some(JobState::Processing {
                started_at: floor(job.created_at),
            }),
            (JobState::Pending, Transition::Cancel) => Some(JobState::Cancelled {
                started_at: None,
                completed_at: floor(job.created_at),
            }),
            (JobState::Processing { started_at }, transition) => {
                let started_at = *started_at;
                let completed_at = floor(started_at);
                match transition {
                    Transition::Start => None,
                    Transition::Complete(result) => Some(JobState::Completed {
                        started_at,
                        completed_at,
                        result,
                    }),
                    Transition::Fail(error) => Some(JobState::Failed {
                        started_at,
                        completed_at,
                        error,
                    }),
                    Transition::Cancel => Some(JobState::Cancelled {
                        started_at: Some(started_at),
                        completed_at,
                    }),
                }
            }
            _ => None,
        }
    }
}
