//! Error taxonomy for the replication core.
//!
//! Three layers: `GatewayError` for connection-level failures (skip, don't
//! retry), `OrderError` for per-order failures (retried with backoff), and
//! `CopyError` as the umbrella the pipeline reports upward.

use thiserror::Error;

/// Connection-level failure talking to a terminal gateway.
///
/// These never count against an order's retry budget: the owning loop skips
/// its tick or pauses until the supervisor restores the connection.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("terminal not connected")]
    Disconnected,

    #[error("terminal call timed out")]
    Timeout,

    #[error("terminal error: {0}")]
    Terminal(String),
}

/// Reason a single order submission failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderErrorKind {
    /// Price moved past the slippage bound; retried with widened tolerance.
    Requote,
    /// Terminal rejected the order outright.
    Rejected,
    /// The call exceeded its deadline; counted like a rejection.
    Timeout,
    /// Connection dropped mid-call; pauses the retry loop instead of counting.
    Disconnected,
}

impl OrderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderErrorKind::Requote => "requote",
            OrderErrorKind::Rejected => "rejected",
            OrderErrorKind::Timeout => "timeout",
            OrderErrorKind::Disconnected => "disconnected",
        }
    }
}

/// Failed order submission, modification, or close.
#[derive(Debug, Clone, Error)]
#[error("order {}: {detail}", kind.as_str())]
pub struct OrderError {
    pub kind: OrderErrorKind,
    pub detail: String,
}

impl OrderError {
    pub fn new(kind: OrderErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn requote(detail: impl Into<String>) -> Self {
        Self::new(OrderErrorKind::Requote, detail)
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self::new(OrderErrorKind::Rejected, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(OrderErrorKind::Timeout, detail)
    }

    pub fn disconnected(detail: impl Into<String>) -> Self {
        Self::new(OrderErrorKind::Disconnected, detail)
    }

    /// Whether widening the slippage tolerance could help the next attempt.
    pub fn is_price_rejection(&self) -> bool {
        self.kind == OrderErrorKind::Requote
    }
}

/// Top-level failure modes of the replication pipeline.
#[derive(Debug, Error)]
pub enum CopyError {
    /// The gateway is down; the current tick or submission is skipped.
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(GatewayError),

    #[error(transparent)]
    Order(#[from] OrderError),

    /// Malformed pair rule; the pair is treated as disabled, not fatal.
    #[error("invalid pair config for {symbol}: {reason}")]
    ConfigInvalid { symbol: String, reason: String },

    /// A mapping row attempted an illegal lifecycle transition. The row is
    /// quarantined by the store; this is a critical log, never silent.
    #[error("invariant violation on master ticket {ticket}: {detail}")]
    InvariantViolation { ticket: u64, detail: String },
}
