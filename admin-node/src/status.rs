//! Read-only status view over the orchestrator state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::orchestrator::{OrchestratorState, RestartOrchestrator, RestartPhase, RestartProgress};

/// Snapshot returned by the status endpoint, with derived fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartStatus {
    pub phase: RestartPhase,
    pub phase_description: &'static str,
    pub is_active: bool,
    pub run_id: Option<uuid::Uuid>,
    pub progress: RestartProgress,
    pub progress_percent: u64,
    /// Seconds; present only while a run is active and has completed nodes
    pub estimated_time_remaining: Option<u64>,
    /// Live connection count, only while draining
    pub connections_draining: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
}

/// Builds [`RestartStatus`] snapshots. Never mutates orchestrator state.
pub struct StatusReporter {
    orchestrator: Arc<RestartOrchestrator>,
}

impl StatusReporter {
    pub fn new(orchestrator: Arc<RestartOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn status(&self) -> RestartStatus {
        let state = self.orchestrator.snapshot().await;
        Self::derive(state, Utc::now())
    }

    /// Pure derivation, separated from the snapshot for testability.
    fn derive(state: OrchestratorState, now: DateTime<Utc>) -> RestartStatus {
        let progress_percent = progress_percent(state.progress.completed, state.progress.total);
        let estimated_time_remaining = estimate_remaining_seconds(&state, now);
        let connections_draining = if state.phase == RestartPhase::Draining {
            state.current_node_connections
        } else {
            None
        };

        RestartStatus {
            phase: state.phase,
            phase_description: state.phase.description(),
            is_active: state.is_active,
            run_id: state.run_id,
            progress_percent,
            estimated_time_remaining,
            connections_draining,
            started_at: state.started_at,
            completed_at: state.completed_at,
            last_error: state.errors.last().cloned(),
            errors: state.errors,
            cancel_requested: state.cancel_requested,
            progress: state.progress,
        }
    }
}

fn progress_percent(completed: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (completed as f64 / total as f64 * 100.0).round() as u64
}

/// `(total − completed) × (elapsed / completed)`, in whole seconds.
fn estimate_remaining_seconds(state: &OrchestratorState, now: DateTime<Utc>) -> Option<u64> {
    if !state.is_active || state.progress.completed == 0 {
        return None;
    }
    let started_at = state.started_at?;
    let elapsed = (now - started_at).num_seconds().max(0) as f64;
    let per_node = elapsed / state.progress.completed as f64;
    let remaining = (state.progress.total - state.progress.completed) as f64 * per_node;
    Some(remaining.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn active_state(completed: u64, total: u64) -> OrchestratorState {
        let mut state = OrchestratorState::default();
        state.phase = RestartPhase::Restarting;
        state.is_active = true;
        state.progress = RestartProgress {
            total,
            completed,
            current: Some("b".to_string()),
        };
        state.started_at = Some(Utc::now());
        state
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(0, 3), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(3, 3), 100);
    }

    #[test]
    fn test_eta_null_when_idle_or_no_completions() {
        let idle = OrchestratorState::default();
        assert_eq!(estimate_remaining_seconds(&idle, Utc::now()), None);

        let no_completions = active_state(0, 3);
        assert_eq!(estimate_remaining_seconds(&no_completions, Utc::now()), None);
    }

    #[test]
    fn test_eta_extrapolates_per_node_cost() {
        let mut state = active_state(1, 3);
        let started = Utc::now() - Duration::seconds(120);
        state.started_at = Some(started);
        // 1 node in 120s -> 2 nodes remaining at 120s each
        let eta = estimate_remaining_seconds(&state, Utc::now()).unwrap();
        assert!((239..=241).contains(&eta), "eta was {}", eta);
    }

    #[test]
    fn test_connections_shown_only_while_draining() {
        let mut state = active_state(0, 3);
        state.current_node_connections = Some(7);

        state.phase = RestartPhase::Draining;
        let status = StatusReporter::derive(state.clone(), Utc::now());
        assert_eq!(status.connections_draining, Some(7));

        state.phase = RestartPhase::Restarting;
        let status = StatusReporter::derive(state, Utc::now());
        assert_eq!(status.connections_draining, None);
    }

    #[test]
    fn test_last_error_is_final_entry() {
        let mut state = OrchestratorState::default();
        state.errors = vec!["first".to_string(), "second".to_string()];
        let status = StatusReporter::derive(state, Utc::now());
        assert_eq!(status.last_error.as_deref(), Some("second"));
    }
}
