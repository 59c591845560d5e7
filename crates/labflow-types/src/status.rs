//! Lifecycle states for actions, methods, threads and workflows.
//!
//! Every status renders (via `Display` and serde) as its SCREAMING_SNAKE_CASE
//! name; those strings are what the status manager caches and what appears in
//! event names such as `method.<id>.IN_PROGRESS`.

use serde::{Deserialize, Serialize};

/// State of a single action.
///
/// Forward path: `CREATED → RESOLVED → AWAITING_LOCATION_RESERVATION →
/// AWAITING_CO_THREADS → PERFORMING_ACTION → AWAITING_MOVE_RESERVATION →
/// MOVING → COMPLETED`. `ERRORED` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Created,
    Resolved,
    AwaitingLocationReservation,
    AwaitingCoThreads,
    PerformingAction,
    AwaitingMoveReservation,
    Moving,
    Completed,
    Errored,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Created => "CREATED",
            ActionStatus::Resolved => "RESOLVED",
            ActionStatus::AwaitingLocationReservation => "AWAITING_LOCATION_RESERVATION",
            ActionStatus::AwaitingCoThreads => "AWAITING_CO_THREADS",
            ActionStatus::PerformingAction => "PERFORMING_ACTION",
            ActionStatus::AwaitingMoveReservation => "AWAITING_MOVE_RESERVATION",
            ActionStatus::Moving => "MOVING",
            ActionStatus::Completed => "COMPLETED",
            ActionStatus::Errored => "ERRORED",
        }
    }

    /// `COMPLETED` and `ERRORED` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Errored)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a method instance. Monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MethodStatus {
    Created,
    InProgress,
    Completed,
}

impl MethodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodStatus::Created => "CREATED",
            MethodStatus::InProgress => "IN_PROGRESS",
            MethodStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for MethodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a labware thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabwareThreadStatus {
    Uncreated,
    Created,
    AwaitingActionReservation,
    AwaitingMoveReservation,
    AwaitingMoveTargetAvailability,
    Moving,
    AwaitingCoThreads,
    PerformingAction,
    Completed,
    Stopping,
    Stopped,
    Errored,
}

impl LabwareThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabwareThreadStatus::Uncreated => "UNCREATED",
            LabwareThreadStatus::Created => "CREATED",
            LabwareThreadStatus::AwaitingActionReservation => "AWAITING_ACTION_RESERVATION",
            LabwareThreadStatus::AwaitingMoveReservation => "AWAITING_MOVE_RESERVATION",
            LabwareThreadStatus::AwaitingMoveTargetAvailability => {
                "AWAITING_MOVE_TARGET_AVAILABILITY"
            }
            LabwareThreadStatus::Moving => "MOVING",
            LabwareThreadStatus::AwaitingCoThreads => "AWAITING_CO_THREADS",
            LabwareThreadStatus::PerformingAction => "PERFORMING_ACTION",
            LabwareThreadStatus::Completed => "COMPLETED",
            LabwareThreadStatus::Stopping => "STOPPING",
            LabwareThreadStatus::Stopped => "STOPPED",
            LabwareThreadStatus::Errored => "ERRORED",
        }
    }

    /// True iff the thread ran to completion or was stopped.
    pub fn has_completed(&self) -> bool {
        matches!(
            self,
            LabwareThreadStatus::Completed | LabwareThreadStatus::Stopped
        )
    }

    /// True once the thread will make no further progress, including failure.
    pub fn is_finished(&self) -> bool {
        self.has_completed() || *self == LabwareThreadStatus::Errored
    }
}

impl std::fmt::Display for LabwareThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Stopped,
    Errored,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "CREATED",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Stopped => "STOPPED",
            WorkflowStatus::Errored => "ERRORED",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
