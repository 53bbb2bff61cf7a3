//! Scheduled (recurring or one-off) notebook jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;
use crate::identifier::Identifier;

/// Interval between runs. `Once` is the sentinel for a job that runs a single time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunInterval {
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl RunInterval {
    /// Interval length in hours; `0` encodes `Once`.
    pub fn hours(&self) -> i64 {
        match self {
            RunInterval::Once => 0,
            RunInterval::Daily => 24,
            RunInterval::Weekly => 24 * 7,
            RunInterval::Monthly => 24 * 30,
        }
    }

    pub fn from_hours(hours: i64) -> Result<Self, ModelError> {
        match hours {
            0 => Ok(RunInterval::Once),
            24 => Ok(RunInterval::Daily),
            168 => Ok(RunInterval::Weekly),
            720 => Ok(RunInterval::Monthly),
            other => Err(ModelError::InvalidInterval(other)),
        }
    }

    /// `None` for `Once`.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            RunInterval::Once => None,
            other => Some(Duration::hours(other.hours())),
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, RunInterval::Once)
    }
}

/// Upper bound on a single run, in whole hours (1-24).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct JobTimeout(u32);

impl JobTimeout {
    pub const MAX_HOURS: u32 = 24;

    pub fn hours(hours: u32) -> Result<Self, ModelError> {
        if hours == 0 || hours > Self::MAX_HOURS {
            return Err(ModelError::InvalidTimeout(hours));
        }
        Ok(Self(hours))
    }

    pub fn as_hours(&self) -> u32 {
        self.0
    }

    pub fn as_minutes(&self) -> u32 {
        self.0 * 60
    }

    pub fn duration(&self) -> Duration {
        Duration::hours(i64::from(self.0))
    }
}

impl TryFrom<u32> for JobTimeout {
    type Error = ModelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::hours(value)
    }
}

impl From<JobTimeout> for u32 {
    fn from(value: JobTimeout) -> Self {
        value.0
    }
}

/// Whether notebook results are written to the public or private bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultVisibility {
    Public,
    Private,
}

impl ResultVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultVisibility::Public => "public",
            ResultVisibility::Private => "private",
        }
    }
}

impl fmt::Display for ResultVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultVisibility {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(ResultVisibility::Public),
            "private" => Ok(ResultVisibility::Private),
            other => Err(ModelError::UnknownVariant {
                kind: "result visibility",
                value: other.to_string(),
            }),
        }
    }
}

/// Key of an uploaded notebook inside the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotebookRef {
    pub key: String,
}

impl NotebookRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// File name portion of the key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Parameters for a new scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub identifier: Identifier,
    pub notebook: NotebookRef,
    pub result_visibility: ResultVisibility,
    pub size: u32,
    pub interval: RunInterval,
    pub timeout: JobTimeout,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub requested_by: String,
    pub release: String,
}

impl JobSpec {
    pub fn validate(&self, max_size: u32) -> Result<(), ModelError> {
        if self.size == 0 || self.size > max_size {
            return Err(ModelError::InvalidSize {
                size: self.size,
                max: max_size,
            });
        }
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(ModelError::InvalidWindow {
                    start: self.start_date.to_rfc3339(),
                    end: end.to_rfc3339(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub identifier: Identifier,
    pub notebook: NotebookRef,
    pub result_visibility: ResultVisibility,
    pub size: u32,
    pub interval: RunInterval,
    pub timeout: JobTimeout,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// Nominal start time of the most recently completed run.
    pub last_run_at: Option<DateTime<Utc>>,
    pub requested_by: String,
    pub release: String,
    pub enabled: bool,
    /// Run currently in flight, if any.
    pub active_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn new(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: spec.identifier,
            notebook: spec.notebook,
            result_visibility: spec.result_visibility,
            size: spec.size,
            interval: spec.interval,
            timeout: spec.timeout,
            start_date: spec.start_date,
            end_date: spec.end_date,
            last_run_at: None,
            requested_by: spec.requested_by,
            release: spec.release,
            enabled: true,
            active_run_id: None,
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether `now` falls inside the job's start/end window.
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        if now < self.start_date {
            return false;
        }
        !matches!(self.end_date, Some(end) if now > end)
    }
}
