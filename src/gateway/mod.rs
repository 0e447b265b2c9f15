//! Terminal gateway abstraction.
//!
//! One gateway instance per account. The trait is the boundary of the
//! replication core: the real terminal bridge lives behind it, and the
//! simulated gateway stands in for dry runs and tests.

mod sim;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{GatewayError, OrderError};
use crate::models::{Direction, Position, Ticket};

pub use sim::SimGateway;

/// Deadline applied to every terminal call. A timeout counts as a failure
/// for retry purposes, identical to an explicit rejection.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness of one gateway as tracked by the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Order filling policy sent with each submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillingMode {
    Fok,
    Ioc,
    Return,
}

impl FillingMode {
    /// Less strict mode to fall back to after repeated price rejections.
    pub fn fallback(self) -> Self {
        match self {
            FillingMode::Fok => FillingMode::Ioc,
            other => other,
        }
    }
}

/// Parameters for a new child order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub slippage_points: u32,
    pub filling_mode: FillingMode,
    pub comment: String,
}

/// In-place modification of an open position. `None` fields are untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifyRequest {
    pub volume: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub comment: Option<String>,
}

impl ModifyRequest {
    pub fn is_empty(&self) -> bool {
        self.volume.is_none()
            && self.stop_loss.is_none()
            && self.take_profit.is_none()
            && self.comment.is_none()
    }
}

/// Per-account terminal capability.
#[async_trait]
pub trait TerminalGateway: Send + Sync {
    /// Account login this gateway is bound to.
    fn account(&self) -> &str;

    async fn connection_state(&self) -> ConnectionState;

    /// Attempt to (re)establish the terminal connection.
    async fn connect(&self) -> Result<(), GatewayError>;

    async fn list_open_positions(&self) -> Result<Vec<Position>, GatewayError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<Ticket, OrderError>;

    async fn modify_order(&self, ticket: Ticket, request: &ModifyRequest)
        -> Result<(), OrderError>;

    async fn close_position(&self, ticket: Ticket) -> Result<(), OrderError>;
}

/// Run an order-path gateway call under the standard deadline.
pub async fn order_call<T, F>(fut: F) -> Result<T, OrderError>
where
    F: Future<Output = Result<T, OrderError>>,
{
    match timeout(CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(OrderError::timeout("terminal call exceeded deadline")),
    }
}

/// Run a listing/connection gateway call under the standard deadline.
pub async fn gateway_call<T, F>(fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match timeout(CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout),
    }
}
