//! Append-only activity records consumed by the operator dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::position::Ticket;

/// What the core was trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Open,
    Modify,
    Close,
    Sweep,
    Health,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::Open => "open",
            ActivityAction::Modify => "modify",
            ActivityAction::Close => "close",
            ActivityAction::Sweep => "sweep",
            ActivityAction::Health => "health",
        }
    }
}

/// Terminal outcome of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityOutcome {
    Success,
    Failed,
    Skipped,
    Warning,
}

impl ActivityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityOutcome::Success => "success",
            ActivityOutcome::Failed => "failed",
            ActivityOutcome::Skipped => "skipped",
            ActivityOutcome::Warning => "warning",
        }
    }
}

/// One append-only log entry. Write-only from the core's perspective.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub child_account: String,
    pub master_ticket: Option<Ticket>,
    pub child_ticket: Option<Ticket>,
    pub action: ActivityAction,
    pub outcome: ActivityOutcome,
    pub detail: String,
}

impl ActivityRecord {
    pub fn new(
        child_account: &str,
        action: ActivityAction,
        outcome: ActivityOutcome,
        master_ticket: Option<Ticket>,
        child_ticket: Option<Ticket>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            child_account: child_account.to_string(),
            master_ticket,
            child_ticket,
            action,
            outcome,
            detail: detail.into(),
        }
    }
}
