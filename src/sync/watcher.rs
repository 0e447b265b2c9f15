//! Master watcher: polls the master gateway, diffs against the last accepted
//! snapshot, and fans change events out to every child's replication queue.
//!
//! A fetch failure retains the previous snapshot unchanged, so a transient
//! empty read never synthesizes spurious close events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHandle;
use crate::db::MappingStore;
use crate::error::CopyError;
use crate::gateway::{gateway_call, TerminalGateway};
use crate::models::{
    ActivityAction, ActivityOutcome, ActivityRecord, ChangeEvent, ChangedFields, Position, Ticket,
};

use super::queue::ReplicationQueue;
use super::supervisor::HealthBoard;

/// How long the watcher blocks on a full child queue before the queue's
/// last-resort eviction kicks in.
pub const ENQUEUE_PATIENCE: Duration = Duration::from_secs(2);

/// Shared view of the last accepted master snapshot. Replaced atomically so
/// the reconciliation sweep never observes a torn snapshot.
#[derive(Clone, Default)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<HashMap<Ticket, Position>>>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self) -> Arc<HashMap<Ticket, Position>> {
        self.inner.read().await.clone()
    }

    async fn store(&self, snapshot: HashMap<Ticket, Position>) {
        *self.inner.write().await = Arc::new(snapshot);
    }
}

/// One child account's end of the pipeline, as seen by the watcher.
pub struct ChildChannel {
    pub account: String,
    pub queue: Arc<ReplicationQueue>,
}

/// Outcome of one polling tick.
#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Completed { events: usize },
    SkippedDisconnected,
}

/// Compute the symmetric difference between two accepted snapshots.
///
/// Events are ordered by position open time (ties broken by ticket) so
/// replay on the child preserves the master's opening order within a tick.
pub fn diff_snapshots(
    prev: &HashMap<Ticket, Position>,
    curr: &HashMap<Ticket, Position>,
    track_comment: bool,
    now: DateTime<Utc>,
) -> Vec<ChangeEvent> {
    let mut keyed: Vec<(DateTime<Utc>, Ticket, ChangeEvent)> = Vec::new();

    for (ticket, position) in curr {
        match prev.get(ticket) {
            None => {
                keyed.push((
                    position.open_time,
                    *ticket,
                    ChangeEvent::Opened(position.clone()),
                ));
            }
            Some(previous) => {
                let changes = ChangedFields::between(previous, position, track_comment);
                if changes.any() {
                    keyed.push((
                        position.open_time,
                        *ticket,
                        ChangeEvent::Modified(position.clone(), changes),
                    ));
                }
            }
        }
    }

    for (ticket, previous) in prev {
        if !curr.contains_key(ticket) {
            // The gateway only reports open positions, so the close price is
            // the last known price for the ticket.
            keyed.push((
                previous.open_time,
                *ticket,
                ChangeEvent::Closed {
                    master_ticket: *ticket,
                    close_price: previous.open_price,
                    close_time: now,
                },
            ));
        }
    }

    keyed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    keyed.into_iter().map(|(_, _, event)| event).collect()
}

/// Polls the master account and feeds every child queue.
pub struct MasterWatcher {
    gateway: Arc<dyn TerminalGateway>,
    store: Arc<MappingStore>,
    config: ConfigHandle,
    children: Vec<ChildChannel>,
    board: HealthBoard,
    snapshot: SnapshotHandle,
    shutdown: Arc<AtomicBool>,
    master_available: bool,
}

impl MasterWatcher {
    pub fn new(
        gateway: Arc<dyn TerminalGateway>,
        store: Arc<MappingStore>,
        config: ConfigHandle,
        children: Vec<ChildChannel>,
        board: HealthBoard,
        snapshot: SnapshotHandle,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            gateway,
            store,
            config,
            children,
            board,
            snapshot,
            shutdown,
            master_available: true,
        }
    }

    /// One polling cycle: reload config, fetch, diff, fan out, accept.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let config = self.config.reload().await;
        let account = self.gateway.account().to_string();

        if !self.board.is_connected(&account) {
            self.note_master_unavailable(&account, "supervisor reports master disconnected")
                .await?;
            return Ok(TickOutcome::SkippedDisconnected);
        }

        let listed = match gateway_call(self.gateway.list_open_positions()).await {
            Ok(positions) => positions,
            Err(e) => {
                // Previous snapshot stays accepted; no partial diff.
                let unavailable = CopyError::GatewayUnavailable(e);
                self.note_master_unavailable(&account, &unavailable.to_string())
                    .await?;
                return Ok(TickOutcome::SkippedDisconnected);
            }
        };

        if !self.master_available {
            info!(account = %account, "Master gateway available again");
            self.master_available = true;
        }

        let prev = self.snapshot.load().await;
        let curr: HashMap<Ticket, Position> =
            listed.into_iter().map(|p| (p.ticket, p)).collect();

        let events = diff_snapshots(&prev, &curr, config.settings.comment_tracking, Utc::now());
        let opened_this_tick: HashSet<Ticket> = events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::Opened(_)))
            .map(|e| e.master_ticket())
            .collect();
        let mut pushed = 0usize;

        for child in &self.children {
            for event in &events {
                child.queue.push(event.clone(), ENQUEUE_PATIENCE).await;
                pushed += 1;
            }

            // Failed opens with retry budget: re-offer while the master
            // position is still open.
            for row in self.store.list_failed_opens(&child.account).await? {
                let ticket = row.master_ticket as Ticket;
                if opened_this_tick.contains(&ticket) {
                    continue;
                }
                if let Some(position) = curr.get(&ticket) {
                    debug!(
                        account = %child.account,
                        ticket,
                        "Re-offering failed open for retry"
                    );
                    child
                        .queue
                        .push(ChangeEvent::Opened(position.clone()), ENQUEUE_PATIENCE)
                        .await;
                    pushed += 1;
                }
            }

            // Failed closes: keep asking until the child position is
            // confirmed flat by the executor.
            for row in self.store.list_failed_closes(&child.account).await? {
                let ticket = row.master_ticket as Ticket;
                if curr.contains_key(&ticket) {
                    continue;
                }
                debug!(
                    account = %child.account,
                    ticket,
                    "Re-offering failed close for retry"
                );
                child
                    .queue
                    .push(
                        ChangeEvent::Closed {
                            master_ticket: ticket,
                            close_price: Decimal::ZERO,
                            close_time: Utc::now(),
                        },
                        ENQUEUE_PATIENCE,
                    )
                    .await;
                pushed += 1;
            }
        }

        self.snapshot.store(curr).await;
        Ok(TickOutcome::Completed { events: pushed })
    }

    /// Record the transition into unavailability exactly once.
    async fn note_master_unavailable(&mut self, account: &str, detail: &str) -> Result<()> {
        if self.master_available {
            warn!(account = %account, detail = %detail, "Master gateway unavailable, skipping ticks");
            self.store
                .record_activity(&ActivityRecord::new(
                    account,
                    ActivityAction::Health,
                    ActivityOutcome::Skipped,
                    None,
                    None,
                    format!("master gateway unavailable: {detail}"),
                ))
                .await?;
            self.master_available = false;
        }
        Ok(())
    }

    /// Poll until shutdown, then close every child queue so executors drain
    /// and exit.
    pub async fn run(mut self) {
        info!(account = %self.gateway.account(), "Starting master watcher");

        while !self.shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();

            match self.tick().await {
                Ok(TickOutcome::Completed { events }) if events > 0 => {
                    debug!(events, "Watcher tick fanned out events");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Watcher tick failed"),
            }

            let interval = self.config.current().await.settings.effective_interval();
            let elapsed = started.elapsed();
            if interval > elapsed {
                tokio::time::sleep(interval - elapsed).await;
            }
        }

        for child in &self.children {
            child.queue.close().await;
        }
        info!("Master watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyConfig;
    use crate::db::MappingStatus;
    use crate::gateway::{ConnectionState, SimGateway};
    use crate::models::Direction;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn position(ticket: Ticket, symbol: &str, minute: u32) -> Position {
        Position {
            ticket,
            symbol: symbol.to_string(),
            direction: Direction::Long,
            volume: dec!(1.0),
            open_price: dec!(1.1000),
            stop_loss: None,
            take_profit: None,
            open_time: Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap(),
            comment: String::new(),
        }
    }

    fn map(positions: Vec<Position>) -> HashMap<Ticket, Position> {
        positions.into_iter().map(|p| (p.ticket, p)).collect()
    }

    #[test]
    fn test_diff_detects_opens_in_open_time_order() {
        let prev = map(vec![]);
        let curr = map(vec![position(2, "GBPUSD", 5), position(1, "EURUSD", 1)]);

        let events = diff_snapshots(&prev, &curr, true, Utc::now());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].master_ticket(), 1);
        assert_eq!(events[1].master_ticket(), 2);
        assert!(matches!(events[0], ChangeEvent::Opened(_)));
    }

    #[test]
    fn test_diff_detects_modification() {
        let prev = map(vec![position(1, "EURUSD", 1)]);
        let mut changed = position(1, "EURUSD", 1);
        changed.volume = dec!(2.0);
        let curr = map(vec![changed]);

        let events = diff_snapshots(&prev, &curr, true, Utc::now());
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChangeEvent::Modified(p, changes) => {
                assert_eq!(p.ticket, 1);
                assert!(changes.volume);
                assert!(!changes.stop_loss);
            }
            other => panic!("expected Modified, got {other:?}"),
        }
    }

    #[test]
    fn test_diff_detects_close_with_last_known_price() {
        let now = Utc::now();
        let prev = map(vec![position(1, "EURUSD", 1)]);
        let curr = map(vec![]);

        let events = diff_snapshots(&prev, &curr, true, now);
        assert_eq!(
            events,
            vec![ChangeEvent::Closed {
                master_ticket: 1,
                close_price: dec!(1.1000),
                close_time: now,
            }]
        );
    }

    #[test]
    fn test_diff_identical_snapshots_is_empty() {
        let snap = map(vec![position(1, "EURUSD", 1), position(2, "GBPUSD", 2)]);
        assert!(diff_snapshots(&snap, &snap, true, Utc::now()).is_empty());
    }

    #[test]
    fn test_diff_reconstructs_transitions_across_ticks() {
        // Three consecutive ticks: open 1, open 2 + modify 1, close 1.
        let t0 = map(vec![]);
        let t1 = map(vec![position(1, "EURUSD", 1)]);
        let mut modified = position(1, "EURUSD", 1);
        modified.take_profit = Some(dec!(1.2000));
        let t2 = map(vec![modified.clone(), position(2, "GBPUSD", 2)]);
        let t3 = map(vec![position(2, "GBPUSD", 2)]);

        let e1 = diff_snapshots(&t0, &t1, true, Utc::now());
        let e2 = diff_snapshots(&t1, &t2, true, Utc::now());
        let e3 = diff_snapshots(&t2, &t3, true, Utc::now());

        assert!(matches!(e1.as_slice(), [ChangeEvent::Opened(p)] if p.ticket == 1));
        assert_eq!(e2.len(), 2);
        assert!(matches!(&e2[0], ChangeEvent::Modified(p, c) if p.ticket == 1 && c.take_profit));
        assert!(matches!(&e2[1], ChangeEvent::Opened(p) if p.ticket == 2));
        assert!(matches!(e3.as_slice(), [ChangeEvent::Closed { master_ticket: 1, .. }]));
    }

    struct TickHarness {
        watcher: MasterWatcher,
        gateway: Arc<SimGateway>,
        queue: Arc<ReplicationQueue>,
        store: Arc<MappingStore>,
    }

    async fn harness() -> TickHarness {
        let gateway = Arc::new(SimGateway::new("master-1"));
        let store = Arc::new(MappingStore::new("sqlite::memory:").await.unwrap());
        let queue = Arc::new(ReplicationQueue::new("child-1", 32));
        let board = HealthBoard::new();
        board.set("master-1", ConnectionState::Connected);

        let watcher = MasterWatcher::new(
            gateway.clone(),
            store.clone(),
            ConfigHandle::from_static(CopyConfig::default()),
            vec![ChildChannel {
                account: "child-1".to_string(),
                queue: queue.clone(),
            }],
            board,
            SnapshotHandle::new(),
            Arc::new(AtomicBool::new(false)),
        );

        TickHarness {
            watcher,
            gateway,
            queue,
            store,
        }
    }

    #[tokio::test]
    async fn test_tick_emits_open_then_close() {
        let mut h = harness().await;
        h.gateway.upsert_position(position(1001, "EURUSD", 1)).await;

        h.watcher.tick().await.unwrap();
        let event = h.queue.pop().await.unwrap();
        assert!(matches!(event, ChangeEvent::Opened(p) if p.ticket == 1001));

        // Steady state: no events.
        h.watcher.tick().await.unwrap();
        assert_eq!(h.queue.len().await, 0);

        h.gateway.remove_position(1001).await;
        h.watcher.tick().await.unwrap();
        let event = h.queue.pop().await.unwrap();
        assert!(matches!(event, ChangeEvent::Closed { master_ticket: 1001, .. }));
    }

    #[tokio::test]
    async fn test_fetch_failure_retains_snapshot() {
        let mut h = harness().await;
        h.gateway.upsert_position(position(1001, "EURUSD", 1)).await;
        h.watcher.tick().await.unwrap();
        h.queue.pop().await.unwrap();

        // Gateway goes dark: tick is skipped, no spurious close.
        h.gateway.set_state(ConnectionState::Disconnected).await;
        let outcome = h.watcher.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::SkippedDisconnected);
        assert_eq!(h.queue.len().await, 0);

        // Back online with the same position: still no events.
        h.gateway.set_state(ConnectionState::Connected).await;
        h.watcher.tick().await.unwrap();
        assert_eq!(h.queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_open_reoffered_while_master_open() {
        let mut h = harness().await;
        h.gateway.upsert_position(position(1001, "EURUSD", 1)).await;
        h.watcher.tick().await.unwrap();
        h.queue.pop().await.unwrap();

        // Simulate an executor that exhausted its retries.
        h.store
            .insert_pending("child-1", 1001, "EURUSD", 1.0, false)
            .await
            .unwrap();
        h.store
            .transition("child-1", 1001, MappingStatus::Failed, None, Some("rejected"))
            .await
            .unwrap();

        h.watcher.tick().await.unwrap();
        let event = h.queue.pop().await.unwrap();
        assert!(matches!(event, ChangeEvent::Opened(p) if p.ticket == 1001));
    }
}
