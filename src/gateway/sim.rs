//! Simulated terminal gateway.
//!
//! Backs the dry-run mode of the binary and every pipeline test. Positions
//! live in memory; failure sequences can be scripted per call site.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::error::{GatewayError, OrderError};
use crate::models::{Position, Ticket};

use super::{ConnectionState, ModifyRequest, OrderRequest, TerminalGateway};

/// In-memory gateway bound to one simulated account.
pub struct SimGateway {
    account: String,
    state: RwLock<ConnectionState>,
    positions: RwLock<HashMap<Ticket, Position>>,
    next_ticket: AtomicU64,

    // Scripted failures, consumed one per submit/modify/close call.
    fail_plan: Mutex<VecDeque<OrderError>>,

    // Call log for assertions.
    submitted: Mutex<Vec<OrderRequest>>,
    modified: Mutex<Vec<(Ticket, ModifyRequest)>>,
    closed: Mutex<Vec<Ticket>>,
}

impl SimGateway {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            state: RwLock::new(ConnectionState::Connected),
            positions: RwLock::new(HashMap::new()),
            next_ticket: AtomicU64::new(5000),
            fail_plan: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            modified: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Seed or replace a position, e.g. to script master account activity.
    pub async fn upsert_position(&self, position: Position) {
        self.positions.write().await.insert(position.ticket, position);
    }

    pub async fn remove_position(&self, ticket: Ticket) {
        self.positions.write().await.remove(&ticket);
    }

    /// Queue an error for the next order-path call.
    pub async fn fail_next(&self, error: OrderError) {
        self.fail_plan.lock().await.push_back(error);
    }

    pub async fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.submitted.lock().await.clone()
    }

    pub async fn modified_orders(&self) -> Vec<(Ticket, ModifyRequest)> {
        self.modified.lock().await.clone()
    }

    pub async fn closed_tickets(&self) -> Vec<Ticket> {
        self.closed.lock().await.clone()
    }

    async fn take_planned_failure(&self) -> Option<OrderError> {
        self.fail_plan.lock().await.pop_front()
    }
}

#[async_trait]
impl TerminalGateway for SimGateway {
    fn account(&self) -> &str {
        &self.account
    }

    async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn connect(&self) -> Result<(), GatewayError> {
        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    async fn list_open_positions(&self) -> Result<Vec<Position>, GatewayError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(GatewayError::Disconnected);
        }
        Ok(self.positions.read().await.values().cloned().collect())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<Ticket, OrderError> {
        self.submitted.lock().await.push(request.clone());

        if let Some(err) = self.take_planned_failure().await {
            return Err(err);
        }
        if *self.state.read().await != ConnectionState::Connected {
            return Err(OrderError::disconnected("sim gateway offline"));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let position = Position {
            ticket,
            symbol: request.symbol.clone(),
            direction: request.direction,
            volume: request.volume,
            open_price: rust_decimal::Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            open_time: Utc::now(),
            comment: request.comment.clone(),
        };
        self.positions.write().await.insert(ticket, position);
        Ok(ticket)
    }

    async fn modify_order(
        &self,
        ticket: Ticket,
        request: &ModifyRequest,
    ) -> Result<(), OrderError> {
        self.modified.lock().await.push((ticket, request.clone()));

        if let Some(err) = self.take_planned_failure().await {
            return Err(err);
        }

        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&ticket)
            .ok_or_else(|| OrderError::rejected(format!("position {ticket} not found")))?;

        if let Some(volume) = request.volume {
            position.volume = volume;
        }
        if let Some(stop_loss) = request.stop_loss {
            position.stop_loss = Some(stop_loss);
        }
        if let Some(take_profit) = request.take_profit {
            position.take_profit = Some(take_profit);
        }
        if let Some(ref comment) = request.comment {
            position.comment = comment.clone();
        }
        Ok(())
    }

    async fn close_position(&self, ticket: Ticket) -> Result<(), OrderError> {
        self.closed.lock().await.push(ticket);

        if let Some(err) = self.take_planned_failure().await {
            return Err(err);
        }

        let mut positions = self.positions.write().await;
        if positions.remove(&ticket).is_none() {
            return Err(OrderError::rejected(format!("position {ticket} not found")));
        }
        Ok(())
    }
}
