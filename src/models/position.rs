//! Open position model as reported by a terminal gateway.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Account-scoped position identifier. Never reused within an account's
/// lifetime.
pub type Ticket = u64;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

/// One open position on an account.
///
/// Ticket, symbol, direction, open price, and open time are immutable for
/// the lifetime of the position; volume, stops, and comment may be modified
/// in place by the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Account-scoped unique identifier
    pub ticket: Ticket,

    /// Trading symbol (e.g. "EURUSD")
    pub symbol: String,

    /// Long or short
    pub direction: Direction,

    /// Volume in lots
    pub volume: Decimal,

    /// Price the position was opened at
    pub open_price: Decimal,

    /// Stop loss level, if set
    #[serde(default)]
    pub stop_loss: Option<Decimal>,

    /// Take profit level, if set
    #[serde(default)]
    pub take_profit: Option<Decimal>,

    /// When the position was opened
    pub open_time: DateTime<Utc>,

    /// Free-form comment attached by the terminal or trader
    #[serde(default)]
    pub comment: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_flip() {
        assert_eq!(Direction::Long.flipped(), Direction::Short);
        assert_eq!(Direction::Short.flipped(), Direction::Long);
        assert_eq!(Direction::Long.flipped().flipped(), Direction::Long);
    }
}
