//! Job lifecycle. [`JobState::apply`] is the only place a job changes state,
//! and [`RunStatus::from_scheduler_view`] the only place scheduler text is
//! interpreted.

use crate::config::ExecutionMode;
use crate::suite::{JobSpec, ScenarioType};
use chrono::{DateTime, Utc};
use regress_compare::ComparisonResult;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// What the execution backend reports for a started job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }

    /// Reads the `State : X` line of a scheduler job view. Unknown or absent
    /// states count as still running.
    pub fn from_scheduler_view(text: &str) -> Self {
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim() != "State" {
                continue;
            }
            return match value.trim() {
                "Completed" | "Finished" => RunStatus::Completed,
                "Failed" => RunStatus::Failed,
                "Canceled" => RunStatus::Canceled,
                _ => RunStatus::Running,
            };
        }
        RunStatus::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    Errored,
    VerifiedPass,
    VerifiedFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// Emitted only while the worker holds a dispatcher slot.
    Launched,
    Exited(RunStatus),
    Verified { passed: bool },
    /// Commission or submission failure before launch, or the backend
    /// losing track of a launched job.
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition from {from:?} on {event:?}")]
pub struct IllegalTransition {
    pub from: JobState,
    pub event: JobEvent,
}

impl JobState {
    pub fn apply(self, event: JobEvent) -> Result<JobState, IllegalTransition> {
        use JobEvent as E;
        use JobState as S;
        let next = match (self, event) {
            (S::Pending, E::Launched) => S::Running,
            (S::Pending, E::Errored) => S::Errored,
            (S::Running, E::Errored) => S::Errored,
            (S::Running, E::Exited(RunStatus::Running)) => S::Running,
            (S::Running, E::Exited(RunStatus::Completed)) => S::Completed,
            (S::Running, E::Exited(RunStatus::Failed)) => S::Failed,
            (S::Running, E::Exited(RunStatus::Canceled)) => S::Canceled,
            (S::Completed, E::Verified { passed: true }) => S::VerifiedPass,
            (S::Completed, E::Verified { passed: false }) => S::VerifiedFail,
            (from, event) => return Err(IllegalTransition { from, event }),
        };
        Ok(next)
    }

    /// `Completed` ends a sweep job, which is collected rather than verified.
    pub fn is_terminal(self, scenario_type: ScenarioType) -> bool {
        match self {
            JobState::Pending | JobState::Running => false,
            JobState::Completed => scenario_type == ScenarioType::Sweep,
            _ => true,
        }
    }
}

/// Mutable run state of one job, owned by its worker.
#[derive(Debug)]
pub struct ExecutionRecord {
    pub sim_id: String,
    pub work_dir: Option<PathBuf>,
    pub backend: ExecutionMode,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub results: Vec<ComparisonResult>,
    state: JobState,
}

impl ExecutionRecord {
    pub fn new(job: &JobSpec, backend: ExecutionMode) -> Self {
        Self {
            sim_id: job.sim_id.clone(),
            work_dir: None,
            backend,
            started_at: None,
            ended_at: None,
            results: Vec::new(),
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn advance(&mut self, event: JobEvent) -> Result<JobState, IllegalTransition> {
        let next = self.state.apply(event)?;
        match event {
            JobEvent::Launched => self.started_at = Some(Utc::now()),
            JobEvent::Exited(status) if status.is_terminal() => self.ended_at = Some(Utc::now()),
            JobEvent::Errored if self.started_at.is_some() => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        debug!(sim_id = %self.sim_id, from = ?self.state, to = ?next, "job state change");
        self.state = next;
        Ok(next)
    }
}
