//! SyncPass domain entity
//!
//! A SyncPass tracks one full or incremental reconciliation of a container:
//! its state machine, outcome counters and the per-entry errors that were
//! skipped along the way.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ContainerRef, PassId};

/// Kind of pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Full,
    Incremental,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Full => "full",
            PassKind::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(PassKind::Full),
            "incremental" => Some(PassKind::Incremental),
            _ => None,
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pass state: NotStarted -> Running -> Completed | Failed
///
/// Failed is retryable: a new pass may start for the same container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed(String),
}

impl PassStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, PassStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, PassStatus::Completed | PassStatus::Failed(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PassStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PassStatus::Failed(_))
    }

    fn name(&self) -> &'static str {
        match self {
            PassStatus::NotStarted => "not_started",
            PassStatus::Running => "running",
            PassStatus::Completed => "completed",
            PassStatus::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for PassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassStatus::Failed(msg) => write!(f, "failed: {msg}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Outcome counters of a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCounters {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub moved: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl PassCounters {
    /// Number of records whose persisted state changed
    pub fn changed(&self) -> u64 {
        self.created + self.updated + self.moved + self.deleted
    }
}

/// One reconciliation pass over a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPass {
    id: PassId,
    container: ContainerRef,
    kind: PassKind,
    status: PassStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    counters: PassCounters,
    errors: Vec<String>,
}

impl SyncPass {
    pub fn new(container: ContainerRef, kind: PassKind) -> Self {
        Self {
            id: PassId::new(),
            container,
            kind,
            status: PassStatus::NotStarted,
            started_at: None,
            completed_at: None,
            counters: PassCounters::default(),
            errors: Vec::new(),
        }
    }

    /// NotStarted -> Running
    ///
    /// # Errors
    /// Returns `InvalidState` if the pass already started
    pub fn start(&mut self) -> Result<(), DomainError> {
        self.transition(PassStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Completed
    ///
    /// # Errors
    /// Returns `InvalidState` if the pass is not running
    pub fn complete(&mut self) -> Result<(), DomainError> {
        self.transition(PassStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Failed
    ///
    /// # Errors
    /// Returns `InvalidState` if the pass is not running
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), DomainError> {
        self.transition(PassStatus::Failed(reason.into()))?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, to: PassStatus) -> Result<(), DomainError> {
        let allowed = matches!(
            (&self.status, &to),
            (PassStatus::NotStarted, PassStatus::Running)
                | (PassStatus::Running, PassStatus::Completed)
                | (PassStatus::Running, PassStatus::Failed(_))
        );
        if !allowed {
            return Err(DomainError::InvalidState {
                from: self.status.name().to_string(),
                to: to.name().to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Records a per-entry error that was skipped
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn counters_mut(&mut self) -> &mut PassCounters {
        &mut self.counters
    }

    pub fn id(&self) -> &PassId {
        &self.id
    }

    pub fn container(&self) -> &ContainerRef {
        &self.container
    }

    pub fn kind(&self) -> PassKind {
        self.kind
    }

    pub fn status(&self) -> &PassStatus {
        &self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn counters(&self) -> &PassCounters {
        &self.counters
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Wall-clock duration, if the pass has finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass() -> SyncPass {
        SyncPass::new(
            ContainerRef::parse("acme", "s3", "bucket").unwrap(),
            PassKind::Full,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut p = pass();
        assert_eq!(*p.status(), PassStatus::NotStarted);
        p.start().unwrap();
        assert!(p.status().is_running());
        p.counters_mut().created += 2;
        p.complete().unwrap();
        assert!(p.status().is_success());
        assert!(p.duration().is_some());
        assert_eq!(p.counters().changed(), 2);
    }

    #[test]
    fn test_failure_is_terminal_for_the_pass() {
        let mut p = pass();
        p.start().unwrap();
        p.fail("flush failed").unwrap();
        assert!(p.status().is_failed());
        assert_eq!(p.status().to_string(), "failed: flush failed");
        assert!(p.complete().is_err());
        assert!(p.start().is_err());
    }

    #[test]
    fn test_cannot_complete_before_start() {
        let mut p = pass();
        let err = p.complete().unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidState {
                from: "not_started".into(),
                to: "completed".into()
            }
        );
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(PassKind::parse("full"), Some(PassKind::Full));
        assert_eq!(PassKind::parse("incremental"), Some(PassKind::Incremental));
        assert_eq!(PassKind::parse("delta"), None);
    }
}
