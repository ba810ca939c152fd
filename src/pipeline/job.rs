//! Posting jobs
//!
//! A job names the document to post and carries the minimal event payload
//! needed to rebuild the posting; never the full document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{DocumentRef, DomainError};
use crate::posting::PostingEvent;

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at`
    Queued,
    /// Claimed by a worker until `locked_until`
    Running,
    Completed,
    /// Finished without posting; not retried by the queue
    Failed,
    /// Retries exhausted
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dead
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::not_found(format!("job status '{}'", s)))
    }
}

/// A queued posting job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingJob {
    pub id: Uuid,
    /// Job name, e.g. `post_invoice`
    pub name: String,
    pub document: DocumentRef,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Deliveries so far (incremented on claim)
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PostingJob {
    /// Build the job posting `event`, runnable immediately.
    pub fn for_event(event: &PostingEvent, max_attempts: u32) -> Result<Self, serde_json::Error> {
        let document = event.document();
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: document.kind.job_name().to_string(),
            document,
            payload: serde_json::to_value(event)?,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            run_at: now,
            locked_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Decode the event payload
    pub fn event(&self) -> Result<PostingEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Whether a worker may claim this job at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.run_at <= now,
            // Visibility timeout elapsed: the previous worker is presumed dead
            JobStatus::Running => self.locked_until.map_or(true, |until| until <= now),
            _ => false,
        }
    }

    /// Apply a claim in place
    pub fn mark_claimed(&mut self, now: DateTime<Utc>, visibility: Duration) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.locked_until = Some(now + chrono_duration(visibility));
        self.updated_at = now;
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    Linear,
}

/// Retry policy for transient posting failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before the next delivery after `attempt` (1-indexed) failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(20));
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn next_run_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono_duration(self.delay_for_attempt(attempt))
    }
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Queue counters by job status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Dead => self.dead += count,
        }
    }
}
