use indexmap::IndexMap;
use tokio::time::Instant;

use crate::state::CoordinatorState;

/// Status of an action in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OutcomeStatus {
    /// Registered but not finished.
    Pending,
    /// Forward action succeeded.
    Succeeded,
    /// Forward action failed, panicked or was cut short.
    Failed,
    /// Compensation ran successfully.
    Compensated,
    /// Compensation failed.
    CompensationFailed,
}

/// Record of one action's progress through a commit.
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    /// Name of the action.
    pub name: String,
    /// Current status.
    pub status: OutcomeStatus,
    /// When the forward action was dispatched, on the tokio clock.
    pub started_at: Option<Instant>,
    /// When the forward action or its compensation last finished.
    pub completed_at: Option<Instant>,
    /// Failure description, for failed forward actions and compensations.
    pub reason: Option<String>,
}

/// Audit log tracking every action of one commit.
#[derive(Debug, Default)]
pub struct SagaAuditLog {
    records: IndexMap<String, OutcomeRecord>,
    completion_order: Vec<String>,
    state: CoordinatorState,
}

impl SagaAuditLog {
    pub(crate) fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let records = names
            .into_iter()
            .map(|name| {
                let record = OutcomeRecord {
                    name: name.to_string(),
                    status: OutcomeStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    reason: None,
                };
                (name.to_string(), record)
            })
            .collect();

        Self {
            records,
            ..Self::default()
        }
    }

    pub(crate) fn set_state(&mut self, state: CoordinatorState) {
        self.state = state;
    }

    pub(crate) fn record_start(&mut self, name: &str) {
        if let Some(record) = self.records.get_mut(name) {
            record.started_at = Some(Instant::now());
        }
    }

    /// Returns `false` if the action was no longer pending.
    pub(crate) fn record_success(&mut self, name: &str) -> bool {
        match self.records.get_mut(name) {
            Some(record) if record.status == OutcomeStatus::Pending => {
                record.status = OutcomeStatus::Succeeded;
                record.completed_at = Some(Instant::now());
                self.completion_order.push(name.to_string());
                true
            }
            _ => false,
        }
    }

    /// Returns `false` if the action was no longer pending.
    pub(crate) fn record_failure(&mut self, name: &str, reason: String) -> bool {
        match self.records.get_mut(name) {
            Some(record) if record.status == OutcomeStatus::Pending => {
                record.status = OutcomeStatus::Failed;
                record.completed_at = Some(Instant::now());
                record.reason = Some(reason);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn pending_actions(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|record| record.status == OutcomeStatus::Pending)
            .map(|record| record.name.clone())
            .collect()
    }

    pub(crate) fn record_compensated(&mut self, name: &str) {
        if let Some(record) = self.records.get_mut(name) {
            record.status = OutcomeStatus::Compensated;
            record.completed_at = Some(Instant::now());
        }
    }

    pub(crate) fn record_compensation_failed(&mut self, name: &str, reason: String) {
        if let Some(record) = self.records.get_mut(name) {
            record.status = OutcomeStatus::CompensationFailed;
            record.completed_at = Some(Instant::now());
            record.reason = Some(reason);
        }
    }

    /// All records, in registration order.
    pub fn records(&self) -> impl Iterator<Item = &OutcomeRecord> {
        self.records.values()
    }

    #[must_use]
    pub fn record(&self, name: &str) -> Option<&OutcomeRecord> {
        self.records.get(name)
    }

    /// Names of succeeded forward actions, in the order they finished.
    #[must_use]
    pub fn completion_order(&self) -> &[String] {
        &self.completion_order
    }

    /// State the coordinator ended in.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Get a summary of the commit for display.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("state: {}", self.state)];
        for record in self.records.values() {
            let status = match record.status {
                OutcomeStatus::Pending => "·",
                OutcomeStatus::Succeeded => "✓",
                OutcomeStatus::Failed => "✗",
                OutcomeStatus::Compensated => "↩",
                OutcomeStatus::CompensationFailed => "⚠",
            };
            match &record.reason {
                Some(reason) => lines.push(format!("{status} {} ({reason})", record.name)),
                None => lines.push(format!("{status} {}", record.name)),
            }
        }
        lines.join("\n")
    }
}
