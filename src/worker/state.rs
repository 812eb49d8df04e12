//! Per-job lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::model::{JobId, JobStatus};

/// Phase of a job inside the worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// Queued, no slot held yet.
    Pending,
    /// Slot held, sandbox being provisioned.
    Spawning,
    /// Container started, polling the health prober.
    AwaitingHealthy,
    /// Task running against the worker or a persistent backend.
    Dispatching,
    Completed,
    Failed,
}

impl LifecyclePhase {
    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: LifecyclePhase) -> bool {
        use LifecyclePhase::*;

        matches!(
            (self, target),
            // Backend-only tasks skip the sandbox phases.
            (Pending, Spawning) | (Pending, Dispatching) | (Pending, Failed) |
            (Spawning, AwaitingHealthy) | (Spawning, Failed) |
            (AwaitingHealthy, Dispatching) | (AwaitingHealthy, Failed) |
            (Dispatching, Completed) | (Dispatching, Failed)
        )
    }

    /// Terminal phases trigger teardown.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The persisted job status this phase maps to.
    pub fn job_status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Spawning | Self::AwaitingHealthy | Self::Dispatching => JobStatus::Running,
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
        }
    }

    /// Human-readable description used in cancellation errors.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Pending => "waiting for a concurrency slot",
            Self::Spawning => "spawning",
            Self::AwaitingHealthy => "awaiting healthy",
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Spawning => "spawning",
            Self::AwaitingHealthy => "awaiting_healthy",
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A phase transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: LifecyclePhase,
    pub to: LifecyclePhase,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// In-memory tracking of a single job run.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job_id: JobId,
    pub phase: LifecyclePhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<PhaseTransition>,
}

impl JobRun {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            phase: LifecyclePhase::Pending,
            started_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new phase.
    pub fn transition_to(
        &mut self,
        new_phase: LifecyclePhase,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.phase.can_transition_to(new_phase) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.phase, new_phase
            ));
        }

        self.transitions.push(PhaseTransition {
            from: self.phase,
            to: new_phase,
            timestamp: Utc::now(),
            reason,
        });
        self.phase = new_phase;

        if new_phase.is_terminal() {
            self.finished_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Phases visited so far, in order, including the initial one.
    pub fn path(&self) -> Vec<LifecyclePhase> {
        let mut path = vec![LifecyclePhase::Pending];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_path_is_valid() {
        use LifecyclePhase::*;
        assert!(Pending.can_transition_to(Spawning));
        assert!(Spawning.can_transition_to(AwaitingHealthy));
        assert!(AwaitingHealthy.can_transition_to(Dispatching));
        assert!(Dispatching.can_transition_to(Completed));
    }

    #[test]
    fn every_active_phase_can_fail() {
        use LifecyclePhase::*;
        for phase in [Pending, Spawning, AwaitingHealthy, Dispatching] {
            assert!(phase.can_transition_to(Failed), "{phase} -> failed");
        }
    }

    #[test]
    fn invalid_transitions() {
        use LifecyclePhase::*;
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Spawning.can_transition_to(Dispatching));
        assert!(!Spawning.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn phase_maps_to_job_status() {
        assert_eq!(LifecyclePhase::Pending.job_status(), JobStatus::Pending);
        assert_eq!(LifecyclePhase::AwaitingHealthy.job_status(), JobStatus::Running);
        assert_eq!(LifecyclePhase::Failed.job_status(), JobStatus::Failed);
    }

    #[test]
    fn run_records_path() {
        let mut run = JobRun::new(JobId::new());
        run.transition_to(LifecyclePhase::Spawning, None).unwrap();
        run.transition_to(LifecyclePhase::Failed, Some("no image".into()))
            .unwrap();
        assert_eq!(
            run.path(),
            vec![
                LifecyclePhase::Pending,
                LifecyclePhase::Spawning,
                LifecyclePhase::Failed
            ]
        );
        assert!(run.finished_at.is_some());
        assert!(run.transition_to(LifecyclePhase::Dispatching, None).is_err());
    }

    #[test]
    fn phase_display() {
        assert_eq!(LifecyclePhase::AwaitingHealthy.to_string(), "awaiting_healthy");
    }
}
