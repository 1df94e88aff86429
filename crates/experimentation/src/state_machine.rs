use insight_core::types::ExperimentStatus;
use insight_core::{InsightError, InsightResult};
use serde::{Deserialize, Serialize};

/// Describes a single valid lifecycle transition for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
    pub trigger: String,
}

/// Guards the experiment lifecycle by enforcing a finite set of valid
/// state transitions. Deletion is not a status and is checked separately
/// with [`ExperimentStateMachine::can_delete`].
#[derive(Debug, Clone)]
pub struct ExperimentStateMachine {
    pub transitions: Vec<StateTransition>,
}

impl ExperimentStateMachine {
    pub fn new() -> Self {
        let transitions = vec![
            // Draft ->
            StateTransition {
                from: ExperimentStatus::Draft,
                to: ExperimentStatus::Running,
                trigger: "start".to_string(),
            },
            // Running ->
            StateTransition {
                from: ExperimentStatus::Running,
                to: ExperimentStatus::Paused,
                trigger: "pause".to_string(),
            },
            StateTransition {
                from: ExperimentStatus::Running,
                to: ExperimentStatus::Completed,
                trigger: "complete".to_string(),
            },
            // Paused ->
            StateTransition {
                from: ExperimentStatus::Paused,
                to: ExperimentStatus::Running,
                trigger: "resume".to_string(),
            },
            StateTransition {
                from: ExperimentStatus::Paused,
                to: ExperimentStatus::Completed,
                trigger: "complete".to_string(),
            },
        ];

        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &ExperimentStatus, to: &ExperimentStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Operations that can be applied to an experiment in `from`.
    pub fn triggers_from(&self, from: &ExperimentStatus) -> Vec<&str> {
        let mut triggers: Vec<&str> = self
            .transitions
            .iter()
            .filter(|t| t.from == *from)
            .map(|t| t.trigger.as_str())
            .collect();
        triggers.dedup();
        triggers
    }

    /// Returns an `InvalidState` error if moving from `from` to `to` is not
    /// permitted. The message names the operations `from` does allow.
    pub fn check(&self, from: ExperimentStatus, to: ExperimentStatus) -> InsightResult<()> {
        if self.can_transition(&from, &to) {
            return Ok(());
        }
        let allowed = self.triggers_from(&from);
        let allowed = if allowed.is_empty() {
            "none".to_string()
        } else {
            allowed.join(", ")
        };
        Err(InsightError::InvalidState(format!(
            "Invalid state transition from {:?} to {:?} (allowed: {})",
            from, to, allowed
        )))
    }

    pub fn can_delete(&self, status: ExperimentStatus) -> bool {
        status != ExperimentStatus::Running
    }

    /// Experiment settings are editable only before launch.
    pub fn can_edit_settings(&self, status: ExperimentStatus) -> bool {
        status == ExperimentStatus::Draft
    }

    pub fn can_edit_variants(&self, status: ExperimentStatus) -> bool {
        matches!(status, ExperimentStatus::Draft | ExperimentStatus::Paused)
    }

    /// Events are collected while the experiment is live or paused.
    pub fn accepts_events(&self, status: ExperimentStatus) -> bool {
        matches!(status, ExperimentStatus::Running | ExperimentStatus::Paused)
    }
}

impl Default for ExperimentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
