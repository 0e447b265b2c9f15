//! Data models for positions, change events, and activity records.

mod activity;
mod event;
mod position;

pub use activity::{ActivityAction, ActivityOutcome, ActivityRecord};
pub use event::{ChangeEvent, ChangedFields};
pub use position::{Direction, Position, Ticket};
