//! Change events emitted by the master watcher.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::position::{Position, Ticket};

/// Which mutable fields differ between two snapshots of the same ticket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangedFields {
    pub volume: bool,
    pub stop_loss: bool,
    pub take_profit: bool,
    pub comment: bool,
}

impl ChangedFields {
    pub fn any(&self) -> bool {
        self.volume || self.stop_loss || self.take_profit || self.comment
    }

    /// Compare two snapshots of the same position. Comment changes are only
    /// material when comment tracking is enabled.
    pub fn between(prev: &Position, curr: &Position, track_comment: bool) -> Self {
        Self {
            volume: prev.volume != curr.volume,
            stop_loss: prev.stop_loss != curr.stop_loss,
            take_profit: prev.take_profit != curr.take_profit,
            comment: track_comment && prev.comment != curr.comment,
        }
    }
}

/// One observed transition on the master account.
///
/// Produced by the watcher's snapshot diff, consumed exactly once per child
/// account by that child's executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// Ticket present now but not in the previous snapshot.
    Opened(Position),

    /// Ticket present in both snapshots with a materially changed field.
    Modified(Position, ChangedFields),

    /// Ticket absent now but present before. Close price falls back to the
    /// last known price when the gateway does not report it.
    Closed {
        master_ticket: Ticket,
        close_price: Decimal,
        close_time: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn master_ticket(&self) -> Ticket {
        match self {
            ChangeEvent::Opened(p) => p.ticket,
            ChangeEvent::Modified(p, _) => p.ticket,
            ChangeEvent::Closed { master_ticket, .. } => *master_ticket,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Opened(_) => "opened",
            ChangeEvent::Modified(_, _) => "modified",
            ChangeEvent::Closed { .. } => "closed",
        }
    }
}
