//! Child executor: consumes one replication queue and drives the child
//! account through the gateway.
//!
//! Each executor owns its child's mapping rows. Events for the same master
//! ticket are applied strictly in order because they arrive through one
//! FIFO queue and this task is the only consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHandle, GlobalSettings, PairBook, PairConfig};
use crate::db::{MappingRow, MappingStatus, MappingStore, TransitionOutcome};
use crate::error::{CopyError, OrderError, OrderErrorKind};
use crate::gateway::{
    gateway_call, order_call, ModifyRequest, OrderRequest, TerminalGateway,
};
use crate::models::{
    ActivityAction, ActivityOutcome, ActivityRecord, ChangeEvent, ChangedFields, Position, Ticket,
};

use super::queue::ReplicationQueue;
use super::retry::{filling_for_attempt, retry_delay, widened_slippage};
use super::supervisor::HealthBoard;

/// Poll period while paused waiting for the child gateway to come back.
const CONNECTION_WAIT: Duration = Duration::from_millis(100);

/// Replicates one master's change events onto one child account.
pub struct ChildExecutor {
    account: String,
    gateway: Arc<dyn TerminalGateway>,
    store: Arc<MappingStore>,
    config: ConfigHandle,
    queue: Arc<ReplicationQueue>,
    board: HealthBoard,
    shutdown: Arc<AtomicBool>,
}

impl ChildExecutor {
    pub fn new(
        gateway: Arc<dyn TerminalGateway>,
        store: Arc<MappingStore>,
        config: ConfigHandle,
        queue: Arc<ReplicationQueue>,
        board: HealthBoard,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            account: gateway.account().to_string(),
            gateway,
            store,
            config,
            queue,
            board,
            shutdown,
        }
    }

    /// Drain the queue until it is closed and empty.
    pub async fn run(self) {
        info!(account = %self.account, "Starting child executor");

        while let Some(event) = self.queue.pop().await {
            // Finish the event in hand on shutdown, but start no new
            // gateway calls for whatever is still queued.
            if self.shutdown.load(Ordering::SeqCst) {
                let remaining = self.queue.len().await;
                warn!(
                    account = %self.account,
                    ticket = event.master_ticket(),
                    remaining,
                    "Shutdown signalled, leaving queued events unprocessed"
                );
                break;
            }
            if let Err(e) = self.handle_event(event).await {
                error!(account = %self.account, error = %e, "Event handling failed");
            }
        }

        info!(account = %self.account, "Child executor stopped");
    }

    pub async fn handle_event(&self, event: ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::Opened(position) => self.handle_open(&position).await,
            ChangeEvent::Modified(position, changes) => {
                self.handle_modify(&position, changes).await
            }
            ChangeEvent::Closed { master_ticket, .. } => self.handle_close(master_ticket).await,
        }
    }

    // ==================== Open ====================

    async fn handle_open(&self, position: &Position) -> Result<()> {
        // Idempotency: one row per (child, master ticket). Anything but an
        // eligible failed row means this event was already handled.
        let existing = self.store.get(&self.account, position.ticket).await?;
        if let Some(row) = &existing {
            let retryable = !row.quarantined
                && row.parsed_status() == Some(MappingStatus::Failed)
                && row.child_ticket.is_none();
            if !retryable {
                debug!(
                    account = %self.account,
                    ticket = position.ticket,
                    "Open already replicated, ignoring duplicate"
                );
                return Ok(());
            }
        }

        let config = self.config.current().await;
        let book = PairBook::from_pairs(&config.pairs);

        let pair = match book.resolve(&position.symbol) {
            Some(pair) if pair.enabled => pair,
            resolved => {
                let detail = if resolved.is_some() {
                    format!("pair {} disabled", position.symbol)
                } else {
                    format!("no pair rule for {}", position.symbol)
                };
                if existing.is_some() {
                    // A failed row with budget left would be re-offered on
                    // every watcher tick; spend the budget so the retry is
                    // abandoned exactly once.
                    if self
                        .store
                        .consume_retry_budget(&self.account, position.ticket)
                        .await?
                    {
                        warn!(
                            account = %self.account,
                            ticket = position.ticket,
                            detail = %detail,
                            "Abandoning failed-open retry"
                        );
                        self.record(
                            ActivityAction::Open,
                            ActivityOutcome::Skipped,
                            Some(position.ticket),
                            None,
                            format!("{detail}, abandoning retry"),
                        )
                        .await?;
                    }
                } else {
                    debug!(
                        account = %self.account,
                        symbol = %position.symbol,
                        "Not copying open"
                    );
                    self.record(
                        ActivityAction::Open,
                        ActivityOutcome::Skipped,
                        Some(position.ticket),
                        None,
                        detail,
                    )
                    .await?;
                }
                return Ok(());
            }
        };

        let (child_symbol, multiplier, flip) = match existing {
            Some(row) => {
                if !self
                    .store
                    .consume_retry_budget(&self.account, position.ticket)
                    .await?
                {
                    debug!(account = %self.account, ticket = position.ticket, "Retry budget exhausted");
                    return Ok(());
                }
                self.apply_transition(position.ticket, MappingStatus::Pending, None, None)
                    .await?;
                frozen_params(&row)
            }
            None => {
                self.store
                    .insert_pending(
                        &self.account,
                        position.ticket,
                        pair.resolved_symbol(),
                        pair.lot_multiplier.to_f64().unwrap_or(1.0),
                        pair.direction_flip,
                    )
                    .await?;
                (
                    pair.resolved_symbol().to_string(),
                    pair.lot_multiplier,
                    pair.direction_flip,
                )
            }
        };

        let direction = if flip {
            position.direction.flipped()
        } else {
            position.direction
        };
        let volume = (position.volume * multiplier).round_dp(2);
        if volume <= Decimal::ZERO {
            self.apply_transition(
                position.ticket,
                MappingStatus::Failed,
                None,
                Some("scaled volume rounds to zero"),
            )
            .await?;
            self.record(
                ActivityAction::Open,
                ActivityOutcome::Failed,
                Some(position.ticket),
                None,
                format!("scaled volume {volume} not tradeable"),
            )
            .await?;
            return Ok(());
        }

        let result = self
            .submit_with_retry(
                position.ticket,
                &child_symbol,
                direction,
                volume,
                &config.settings,
                pair,
            )
            .await;

        match result {
            Ok(child_ticket) => {
                self.apply_transition(position.ticket, MappingStatus::Open, Some(child_ticket), None)
                    .await?;
                info!(
                    account = %self.account,
                    master_ticket = position.ticket,
                    child_ticket,
                    symbol = %child_symbol,
                    volume = %volume,
                    "Copied open"
                );
                self.record(
                    ActivityAction::Open,
                    ActivityOutcome::Success,
                    Some(position.ticket),
                    Some(child_ticket),
                    format!("opened {child_symbol} {volume} lots"),
                )
                .await?;
            }
            Err(e) => {
                warn!(
                    account = %self.account,
                    master_ticket = position.ticket,
                    error = %e,
                    "Open replication exhausted retries"
                );
                self.apply_transition(
                    position.ticket,
                    MappingStatus::Failed,
                    None,
                    Some(&e.to_string()),
                )
                .await?;
                self.record(
                    ActivityAction::Open,
                    ActivityOutcome::Failed,
                    Some(position.ticket),
                    None,
                    e.to_string(),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn submit_with_retry(
        &self,
        master_ticket: Ticket,
        symbol: &str,
        direction: crate::models::Direction,
        volume: Decimal,
        settings: &GlobalSettings,
        pair: &PairConfig,
    ) -> Result<Ticket, OrderError> {
        let mut attempts = 0u32;
        let mut price_rejections = 0u32;

        loop {
            if !self.wait_for_connection().await {
                return Err(OrderError::disconnected("shut down while waiting for gateway"));
            }

            let request = OrderRequest {
                symbol: symbol.to_string(),
                direction,
                volume,
                slippage_points: widened_slippage(
                    settings.slippage,
                    price_rejections,
                    pair.max_slippage_points,
                ),
                filling_mode: filling_for_attempt(settings.filling_mode, price_rejections),
                comment: format!("mirror:{master_ticket}"),
            };

            self.store
                .record_attempt(&self.account, master_ticket)
                .await
                .map_err(|e| OrderError::rejected(e.to_string()))?;

            match order_call(self.gateway.submit_order(&request)).await {
                Ok(ticket) => return Ok(ticket),
                // Connection drops pause the loop, they never burn attempts.
                Err(e) if e.kind == OrderErrorKind::Disconnected => {
                    warn!(
                        account = %self.account,
                        master_ticket,
                        "Gateway dropped mid-submission, pausing"
                    );
                    tokio::time::sleep(CONNECTION_WAIT).await;
                }
                Err(e) => {
                    attempts += 1;
                    if e.is_price_rejection() {
                        price_rejections += 1;
                    }
                    if attempts >= settings.retry_attempts {
                        return Err(e);
                    }
                    let delay = retry_delay(attempts);
                    debug!(
                        account = %self.account,
                        master_ticket,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Order attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // ==================== Modify ====================

    async fn handle_modify(&self, position: &Position, changes: ChangedFields) -> Result<()> {
        let Some(row) = self.store.get(&self.account, position.ticket).await? else {
            debug!(account = %self.account, ticket = position.ticket, "Modify for untracked ticket, ignoring");
            return Ok(());
        };
        if row.quarantined || row.parsed_status() != Some(MappingStatus::Open) {
            debug!(
                account = %self.account,
                ticket = position.ticket,
                status = %row.status,
                "Modify on non-open row, ignoring"
            );
            return Ok(());
        }
        let Some(child_ticket) = row.child_ticket else {
            return self.invariant_violation(position.ticket, "open row without child ticket").await;
        };
        let child_ticket = child_ticket as Ticket;

        let config = self.config.current().await;
        self.warn_on_drift(position, &row, &config.pairs);

        let (_, multiplier, _) = frozen_params(&row);
        let mut request = ModifyRequest::default();
        if changes.volume {
            request.volume = Some((position.volume * multiplier).round_dp(2));
        }
        // Stops and targets are prices, copied unscaled. A cleared stop
        // cannot be expressed by the modify call and stays in place.
        if changes.stop_loss {
            request.stop_loss = position.stop_loss;
        }
        if changes.take_profit {
            request.take_profit = position.take_profit;
        }
        if changes.comment && config.settings.comment_tracking {
            request.comment = Some(position.comment.clone());
        }
        if request.is_empty() {
            return Ok(());
        }

        match order_call(self.gateway.modify_order(child_ticket, &request)).await {
            Ok(()) => {
                debug!(
                    account = %self.account,
                    master_ticket = position.ticket,
                    child_ticket,
                    "Copied modification"
                );
                self.record(
                    ActivityAction::Modify,
                    ActivityOutcome::Success,
                    Some(position.ticket),
                    Some(child_ticket),
                    "modification copied",
                )
                .await?;
            }
            Err(e) => {
                // Single-shot: the next master change will carry the latest
                // state, so a failed modify is logged and dropped.
                warn!(
                    account = %self.account,
                    master_ticket = position.ticket,
                    child_ticket,
                    error = %e,
                    "Modification failed"
                );
                self.record(
                    ActivityAction::Modify,
                    ActivityOutcome::Failed,
                    Some(position.ticket),
                    Some(child_ticket),
                    e.to_string(),
                )
                .await?;
            }
        }

        Ok(())
    }

    fn warn_on_drift(&self, position: &Position, row: &MappingRow, pairs: &[PairConfig]) {
        let book = PairBook::from_pairs(pairs);
        if let Some(pair) = book.resolve(&position.symbol) {
            let current = pair.lot_multiplier.to_f64().unwrap_or(1.0);
            if (current - row.lot_multiplier).abs() > f64::EPSILON {
                warn!(
                    account = %self.account,
                    ticket = position.ticket,
                    frozen = row.lot_multiplier,
                    configured = current,
                    "Pair multiplier changed since open, replaying with frozen value"
                );
            }
        }
    }

    // ==================== Close ====================

    async fn handle_close(&self, master_ticket: Ticket) -> Result<()> {
        let Some(row) = self.store.get(&self.account, master_ticket).await? else {
            debug!(account = %self.account, ticket = master_ticket, "Close for untracked ticket, ignoring");
            return Ok(());
        };
        if row.quarantined {
            return Ok(());
        }

        let settings = self.config.current().await.settings.clone();

        match row.parsed_status() {
            // Master closed before the child open ever confirmed.
            Some(MappingStatus::Pending) => {
                self.apply_transition(
                    master_ticket,
                    MappingStatus::Failed,
                    None,
                    Some("master closed before child open confirmed"),
                )
                .await?;
                self.record(
                    ActivityAction::Close,
                    ActivityOutcome::Skipped,
                    Some(master_ticket),
                    None,
                    "master closed while child open still pending",
                )
                .await?;
                Ok(())
            }
            Some(MappingStatus::Open) | Some(MappingStatus::Failed) => {
                let Some(child_ticket) = row.child_ticket else {
                    // A failed open with no child ticket has nothing to
                    // close; the row stays failed.
                    return Ok(());
                };
                self.close_child(master_ticket, child_ticket as Ticket, &settings)
                    .await
            }
            Some(MappingStatus::Closing) | Some(MappingStatus::Closed) => {
                debug!(
                    account = %self.account,
                    ticket = master_ticket,
                    status = %row.status,
                    "Close already handled, ignoring duplicate"
                );
                Ok(())
            }
            None => self.invariant_violation(master_ticket, "unparseable row status").await,
        }
    }

    async fn close_child(
        &self,
        master_ticket: Ticket,
        child_ticket: Ticket,
        settings: &GlobalSettings,
    ) -> Result<()> {
        if !settings.copy_closes {
            // Bookkeeping only: the child position stays open on purpose.
            self.apply_transition(master_ticket, MappingStatus::Closing, None, None)
                .await?;
            self.apply_transition(master_ticket, MappingStatus::Closed, None, None)
                .await?;
            info!(
                account = %self.account,
                master_ticket,
                child_ticket,
                "Close copying disabled, child position left open"
            );
            self.record(
                ActivityAction::Close,
                ActivityOutcome::Skipped,
                Some(master_ticket),
                Some(child_ticket),
                "copy_closes disabled, child position left open",
            )
            .await?;
            return Ok(());
        }

        // Confirm the child position still exists before spending retries.
        if let Ok(live) = gateway_call(self.gateway.list_open_positions()).await {
            if !live.iter().any(|p| p.ticket == child_ticket) {
                self.apply_transition(master_ticket, MappingStatus::Closing, None, None)
                    .await?;
                self.apply_transition(
                    master_ticket,
                    MappingStatus::Closed,
                    None,
                    Some("child position already flat"),
                )
                .await?;
                self.record(
                    ActivityAction::Close,
                    ActivityOutcome::Success,
                    Some(master_ticket),
                    Some(child_ticket),
                    "child position already flat",
                )
                .await?;
                return Ok(());
            }
        }

        self.apply_transition(master_ticket, MappingStatus::Closing, None, None)
            .await?;

        match self.close_with_retry(master_ticket, child_ticket, settings).await {
            Ok(()) => {
                self.apply_transition(master_ticket, MappingStatus::Closed, None, None)
                    .await?;
                info!(
                    account = %self.account,
                    master_ticket,
                    child_ticket,
                    "Copied close"
                );
                self.record(
                    ActivityAction::Close,
                    ActivityOutcome::Success,
                    Some(master_ticket),
                    Some(child_ticket),
                    "closed child position",
                )
                .await?;
            }
            Err(e) => {
                warn!(
                    account = %self.account,
                    master_ticket,
                    child_ticket,
                    error = %e,
                    "Close replication exhausted retries"
                );
                // Failed closes keep their child ticket; the watcher keeps
                // re-offering them until the child is confirmed flat.
                self.apply_transition(
                    master_ticket,
                    MappingStatus::Failed,
                    None,
                    Some(&e.to_string()),
                )
                .await?;
                self.record(
                    ActivityAction::Close,
                    ActivityOutcome::Failed,
                    Some(master_ticket),
                    Some(child_ticket),
                    e.to_string(),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn close_with_retry(
        &self,
        master_ticket: Ticket,
        child_ticket: Ticket,
        settings: &GlobalSettings,
    ) -> Result<(), OrderError> {
        let mut attempts = 0u32;

        loop {
            if !self.wait_for_connection().await {
                return Err(OrderError::disconnected("shut down while waiting for gateway"));
            }

            self.store
                .record_attempt(&self.account, master_ticket)
                .await
                .map_err(|e| OrderError::rejected(e.to_string()))?;

            match order_call(self.gateway.close_position(child_ticket)).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind == OrderErrorKind::Disconnected => {
                    warn!(
                        account = %self.account,
                        master_ticket,
                        "Gateway dropped mid-close, pausing"
                    );
                    tokio::time::sleep(CONNECTION_WAIT).await;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= settings.retry_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(retry_delay(attempts)).await;
                }
            }
        }
    }

    // ==================== Shared plumbing ====================

    /// Block until the child gateway is connected. Returns false when the
    /// shutdown flag was raised while waiting.
    async fn wait_for_connection(&self) -> bool {
        while !self.board.is_connected(&self.account) {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            tokio::time::sleep(CONNECTION_WAIT).await;
        }
        true
    }

    /// Apply a lifecycle transition, escalating an invalid edge to a
    /// critical log plus a warning record. The store has already
    /// quarantined the row at that point.
    async fn apply_transition(
        &self,
        master_ticket: Ticket,
        to: MappingStatus,
        child_ticket: Option<Ticket>,
        error_detail: Option<&str>,
    ) -> Result<()> {
        let outcome = self
            .store
            .transition(&self.account, master_ticket, to, child_ticket, error_detail)
            .await?;

        if let TransitionOutcome::Invalid { current } = outcome {
            let detail = format!(
                "illegal transition {} -> {}",
                current.map(|s| s.as_str()).unwrap_or("missing"),
                to.as_str()
            );
            return self.invariant_violation(master_ticket, &detail).await;
        }
        Ok(())
    }

    async fn invariant_violation(&self, master_ticket: Ticket, detail: &str) -> Result<()> {
        let violation = CopyError::InvariantViolation {
            ticket: master_ticket,
            detail: detail.to_string(),
        };
        error!(
            account = %self.account,
            error = %violation,
            "Mapping lifecycle invariant violated, row quarantined"
        );
        self.record(
            ActivityAction::Open,
            ActivityOutcome::Warning,
            Some(master_ticket),
            None,
            detail,
        )
        .await
    }

    async fn record(
        &self,
        action: ActivityAction,
        outcome: ActivityOutcome,
        master_ticket: Option<Ticket>,
        child_ticket: Option<Ticket>,
        detail: impl Into<String>,
    ) -> Result<()> {
        self.store
            .record_activity(&ActivityRecord::new(
                &self.account,
                action,
                outcome,
                master_ticket,
                child_ticket,
                detail,
            ))
            .await
    }
}

/// Pair parameters as frozen in the mapping row at open time.
fn frozen_params(row: &MappingRow) -> (String, Decimal, bool) {
    (
        row.child_symbol.clone(),
        Decimal::try_from(row.lot_multiplier).unwrap_or(Decimal::ONE),
        row.direction_flip,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CopyConfig, GlobalSettings, PairConfig};
    use crate::gateway::{ConnectionState, FillingMode, SimGateway};
    use crate::models::Direction;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn master_position(ticket: Ticket, symbol: &str, volume: Decimal) -> Position {
        Position {
            ticket,
            symbol: symbol.to_string(),
            direction: Direction::Long,
            volume,
            open_price: dec!(1.1000),
            stop_loss: None,
            take_profit: None,
            open_time: Utc::now(),
            comment: String::new(),
        }
    }

    struct ExecHarness {
        executor: ChildExecutor,
        gateway: Arc<SimGateway>,
        store: Arc<MappingStore>,
        queue: Arc<ReplicationQueue>,
        shutdown: Arc<AtomicBool>,
    }

    async fn harness(config: CopyConfig) -> ExecHarness {
        let gateway = Arc::new(SimGateway::new("child-1"));
        let store = Arc::new(MappingStore::new("sqlite::memory:").await.unwrap());
        let queue = Arc::new(ReplicationQueue::new("child-1", 32));
        let shutdown = Arc::new(AtomicBool::new(false));
        let board = HealthBoard::new();
        board.set("child-1", ConnectionState::Connected);

        let executor = ChildExecutor::new(
            gateway.clone(),
            store.clone(),
            ConfigHandle::from_static(config),
            queue.clone(),
            board,
            shutdown.clone(),
        );

        ExecHarness {
            executor,
            gateway,
            store,
            queue,
            shutdown,
        }
    }

    fn config_with_pair(pair: PairConfig) -> CopyConfig {
        CopyConfig {
            settings: GlobalSettings::default(),
            pairs: vec![pair],
        }
    }

    #[tokio::test]
    async fn test_open_scales_volume_by_multiplier() {
        let mut pair = PairConfig::new("EURUSD");
        pair.lot_multiplier = dec!(0.5);
        let h = harness(config_with_pair(pair)).await;

        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();

        let orders = h.gateway.submitted_orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].volume, dec!(0.50));
        assert_eq!(orders[0].symbol, "EURUSD");
        assert_eq!(orders[0].slippage_points, 20);
        assert_eq!(orders[0].filling_mode, FillingMode::Fok);

        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        assert_eq!(row.parsed_status(), Some(MappingStatus::Open));
        assert!(row.child_ticket.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_open_submits_once() {
        let h = harness(config_with_pair(PairConfig::new("EURUSD"))).await;
        let event = ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0)));

        h.executor.handle_event(event.clone()).await.unwrap();
        h.executor.handle_event(event).await.unwrap();

        assert_eq!(h.gateway.submitted_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_pair_makes_no_gateway_calls() {
        let mut pair = PairConfig::new("EURUSD");
        pair.enabled = false;
        let h = harness(config_with_pair(pair)).await;

        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();

        assert!(h.gateway.submitted_orders().await.is_empty());
        assert!(h.store.get("child-1", 1001).await.unwrap().is_none());

        let activity = h.store.recent_activity(10).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].outcome, "skipped");
    }

    #[tokio::test]
    async fn test_rejections_exhaust_exactly_retry_attempts() {
        let h = harness(config_with_pair(PairConfig::new("EURUSD"))).await;
        for _ in 0..3 {
            h.gateway.fail_next(OrderError::rejected("not enough money")).await;
        }

        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();

        assert_eq!(h.gateway.submitted_orders().await.len(), 3);

        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        assert_eq!(row.parsed_status(), Some(MappingStatus::Failed));
        assert!(row.child_ticket.is_none());
        assert_eq!(row.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_requotes_widen_slippage_and_relax_filling() {
        let mut pair = PairConfig::new("EURUSD");
        pair.max_slippage_points = 60;
        let h = harness(config_with_pair(pair)).await;
        h.gateway.fail_next(OrderError::requote("price moved")).await;
        h.gateway.fail_next(OrderError::requote("price moved again")).await;

        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();

        let orders = h.gateway.submitted_orders().await;
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].slippage_points, 20);
        assert_eq!(orders[0].filling_mode, FillingMode::Fok);
        assert_eq!(orders[1].slippage_points, 30);
        assert_eq!(orders[1].filling_mode, FillingMode::Fok);
        assert_eq!(orders[2].slippage_points, 40);
        assert_eq!(orders[2].filling_mode, FillingMode::Ioc);

        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        assert_eq!(row.parsed_status(), Some(MappingStatus::Open));
    }

    #[tokio::test]
    async fn test_direction_flip_inverts_child_side() {
        let mut pair = PairConfig::new("EURUSD");
        pair.direction_flip = true;
        let h = harness(config_with_pair(pair)).await;

        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();

        let orders = h.gateway.submitted_orders().await;
        assert_eq!(orders[0].direction, Direction::Short);
    }

    #[tokio::test]
    async fn test_close_walks_full_lifecycle() {
        let h = harness(config_with_pair(PairConfig::new("EURUSD"))).await;
        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();

        h.executor
            .handle_event(ChangeEvent::Closed {
                master_ticket: 1001,
                close_price: dec!(1.1050),
                close_time: Utc::now(),
            })
            .await
            .unwrap();

        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        assert_eq!(row.parsed_status(), Some(MappingStatus::Closed));
        assert_eq!(h.gateway.closed_tickets().await.len(), 1);
        assert!(h.gateway.list_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_closes_disabled_leaves_child_open() {
        let mut config = config_with_pair(PairConfig::new("EURUSD"));
        config.settings.copy_closes = false;
        let h = harness(config).await;

        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();
        h.executor
            .handle_event(ChangeEvent::Closed {
                master_ticket: 1001,
                close_price: dec!(1.1050),
                close_time: Utc::now(),
            })
            .await
            .unwrap();

        // Row is closed locally but the child position was never touched.
        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        assert_eq!(row.parsed_status(), Some(MappingStatus::Closed));
        assert!(h.gateway.closed_tickets().await.is_empty());
        assert_eq!(h.gateway.list_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_of_already_flat_child_marks_closed() {
        let h = harness(config_with_pair(PairConfig::new("EURUSD"))).await;
        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();

        // Child position disappears out of band.
        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        h.gateway.remove_position(row.child_ticket.unwrap() as Ticket).await;

        h.executor
            .handle_event(ChangeEvent::Closed {
                master_ticket: 1001,
                close_price: dec!(1.1050),
                close_time: Utc::now(),
            })
            .await
            .unwrap();

        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        assert_eq!(row.parsed_status(), Some(MappingStatus::Closed));
        // No close order was ever sent.
        assert!(h.gateway.closed_tickets().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_while_pending_fails_row() {
        let h = harness(config_with_pair(PairConfig::new("EURUSD"))).await;
        h.store
            .insert_pending("child-1", 1001, "EURUSD", 1.0, false)
            .await
            .unwrap();

        h.executor
            .handle_event(ChangeEvent::Closed {
                master_ticket: 1001,
                close_price: dec!(1.1050),
                close_time: Utc::now(),
            })
            .await
            .unwrap();

        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        assert_eq!(row.parsed_status(), Some(MappingStatus::Failed));
    }

    #[tokio::test]
    async fn test_modify_rescales_volume_with_frozen_multiplier() {
        let mut pair = PairConfig::new("EURUSD");
        pair.lot_multiplier = dec!(0.5);
        let h = harness(config_with_pair(pair)).await;

        h.executor
            .handle_event(ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0))))
            .await
            .unwrap();

        let mut changed = master_position(1001, "EURUSD", dec!(2.0));
        changed.stop_loss = Some(dec!(1.0900));
        h.executor
            .handle_event(ChangeEvent::Modified(
                changed,
                ChangedFields {
                    volume: true,
                    stop_loss: true,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        let modified = h.gateway.modified_orders().await;
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].1.volume, Some(dec!(1.00)));
        // Prices copy unscaled.
        assert_eq!(modified[0].1.stop_loss, Some(dec!(1.0900)));
        assert!(modified[0].1.comment.is_none());
    }

    #[tokio::test]
    async fn test_modify_for_untracked_ticket_is_ignored() {
        let h = harness(config_with_pair(PairConfig::new("EURUSD"))).await;

        h.executor
            .handle_event(ChangeEvent::Modified(
                master_position(9999, "EURUSD", dec!(1.0)),
                ChangedFields {
                    volume: true,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(h.gateway.modified_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_with_disabled_pair_abandons_retry() {
        let mut pair = PairConfig::new("EURUSD");
        pair.enabled = false;
        let h = harness(config_with_pair(pair)).await;

        // Failed open from an earlier run, before the pair was disabled.
        h.store
            .insert_pending("child-1", 1001, "EURUSD", 1.0, false)
            .await
            .unwrap();
        h.store
            .transition("child-1", 1001, MappingStatus::Failed, None, Some("rejected"))
            .await
            .unwrap();
        assert_eq!(h.store.list_failed_opens("child-1").await.unwrap().len(), 1);

        let event = ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0)));
        for _ in 0..5 {
            h.executor.handle_event(event.clone()).await.unwrap();
        }

        // Budget spent on first delivery: no orders, no further re-offers,
        // and exactly one skip record.
        assert!(h.gateway.submitted_orders().await.is_empty());
        assert!(h.store.list_failed_opens("child-1").await.unwrap().is_empty());
        assert_eq!(h.store.recent_activity(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_skips_queued_events() {
        let h = harness(config_with_pair(PairConfig::new("EURUSD"))).await;

        for ticket in 1001..=1003 {
            h.queue
                .push(
                    ChangeEvent::Opened(master_position(ticket, "EURUSD", dec!(1.0))),
                    Duration::from_millis(5),
                )
                .await;
        }
        h.shutdown.store(true, Ordering::SeqCst);
        h.queue.close().await;

        h.executor.run().await;

        assert!(h.gateway.submitted_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_retry_consumes_budget_once() {
        let h = harness(config_with_pair(PairConfig::new("EURUSD"))).await;
        for _ in 0..3 {
            h.gateway.fail_next(OrderError::rejected("no money")).await;
        }
        let event = ChangeEvent::Opened(master_position(1001, "EURUSD", dec!(1.0)));

        h.executor.handle_event(event.clone()).await.unwrap();
        assert_eq!(
            h.store.get("child-1", 1001).await.unwrap().unwrap().parsed_status(),
            Some(MappingStatus::Failed)
        );

        // Budgeted retry succeeds this time.
        h.executor.handle_event(event.clone()).await.unwrap();
        let row = h.store.get("child-1", 1001).await.unwrap().unwrap();
        assert_eq!(row.parsed_status(), Some(MappingStatus::Open));
        assert_eq!(row.retry_budget, 0);
        assert_eq!(h.gateway.submitted_orders().await.len(), 4);
    }
}
