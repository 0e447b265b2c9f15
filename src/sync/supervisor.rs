//! Connection supervisor: gateway liveness, reconnect with bounded backoff,
//! and the low-frequency reconciliation sweep.
//!
//! The sweep flags drift (orphan positions, stale rows) as activity warnings
//! for operator attention; it never auto-closes on detected drift.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::db::{MappingStatus, MappingStore};
use crate::gateway::{gateway_call, ConnectionState, TerminalGateway};
use crate::models::{ActivityAction, ActivityOutcome, ActivityRecord, Position, Ticket};

use super::retry::reconnect_delay;
use super::watcher::SnapshotHandle;

/// Shared gateway liveness, read by the watcher and executors to gate their
/// activity. Unknown accounts report `Disconnected`.
#[derive(Clone, Default)]
pub struct HealthBoard {
    states: Arc<StdRwLock<HashMap<String, ConnectionState>>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, account: &str, state: ConnectionState) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states.insert(account.to_string(), state);
    }

    pub fn state(&self, account: &str) -> ConnectionState {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states
            .get(account)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self, account: &str) -> bool {
        self.state(account) == ConnectionState::Connected
    }

    /// Prime the board from the gateways' own connection state, so loops
    /// reading it before the supervisor's first liveness poll do not see
    /// every account as disconnected.
    pub async fn seed(&self, gateways: &[Arc<dyn TerminalGateway>]) {
        for gateway in gateways {
            self.set(gateway.account(), gateway.connection_state().await);
        }
    }

    pub fn snapshot(&self) -> Vec<(String, ConnectionState)> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = states
            .iter()
            .map(|(account, state)| (account.clone(), *state))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

struct ReconnectState {
    failures: u32,
    next_attempt: Instant,
}

/// Supervises every gateway of one copier instance.
pub struct ConnectionSupervisor {
    master: Arc<dyn TerminalGateway>,
    children: Vec<Arc<dyn TerminalGateway>>,
    board: HealthBoard,
    store: Arc<MappingStore>,
    master_snapshot: SnapshotHandle,
    liveness_interval: Duration,
    /// Liveness polls between reconciliation sweeps.
    sweep_every: u32,
    shutdown: Arc<AtomicBool>,
    reconnects: HashMap<String, ReconnectState>,
}

impl ConnectionSupervisor {
    pub fn new(
        master: Arc<dyn TerminalGateway>,
        children: Vec<Arc<dyn TerminalGateway>>,
        board: HealthBoard,
        store: Arc<MappingStore>,
        master_snapshot: SnapshotHandle,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            master,
            children,
            board,
            store,
            master_snapshot,
            liveness_interval: Duration::from_secs(1),
            sweep_every: 30,
            shutdown,
            reconnects: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        info!(
            children = self.children.len(),
            "Starting connection supervisor"
        );
        let mut ticks = 0u32;

        while !self.shutdown.load(Ordering::SeqCst) {
            let gateways: Vec<Arc<dyn TerminalGateway>> = std::iter::once(self.master.clone())
                .chain(self.children.iter().cloned())
                .collect();
            for gateway in gateways {
                self.poll_gateway(gateway).await;
            }

            ticks = ticks.wrapping_add(1);
            if ticks % self.sweep_every == 0 {
                if let Err(e) = self.reconcile().await {
                    error!(error = %e, "Reconciliation sweep failed");
                }
            }

            tokio::time::sleep(self.liveness_interval).await;
        }

        info!("Connection supervisor stopped");
    }

    async fn poll_gateway(&mut self, gateway: Arc<dyn TerminalGateway>) {
        let account = gateway.account().to_string();
        let state = gateway.connection_state().await;
        self.board.set(&account, state);

        if state != ConnectionState::Disconnected {
            self.reconnects.remove(&account);
            return;
        }

        let now = Instant::now();
        let entry = self.reconnects.entry(account.clone()).or_insert(ReconnectState {
            failures: 0,
            next_attempt: now,
        });
        if now < entry.next_attempt {
            return;
        }

        self.board.set(&account, ConnectionState::Connecting);
        match gateway_call(gateway.connect()).await {
            Ok(()) => {
                info!(account = %account, "Gateway reconnected");
                self.board.set(&account, ConnectionState::Connected);
                self.reconnects.remove(&account);
            }
            Err(e) => {
                entry.failures += 1;
                let delay = reconnect_delay(entry.failures);
                entry.next_attempt = now + delay;
                self.board.set(&account, ConnectionState::Disconnected);
                warn!(
                    account = %account,
                    failures = entry.failures,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Gateway reconnect failed"
                );
            }
        }
    }

    /// Compare mapping rows against live positions on both sides; flag
    /// orphans as warnings and archive rows confirmed gone on both sides.
    async fn reconcile(&self) -> Result<()> {
        let master_snapshot = self.master_snapshot.load().await;

        for gateway in &self.children {
            let account = gateway.account().to_string();
            if !self.board.is_connected(&account) {
                debug!(account = %account, "Skipping sweep, child disconnected");
                continue;
            }

            let live: HashMap<Ticket, Position> =
                match gateway_call(gateway.list_open_positions()).await {
                    Ok(positions) => positions.into_iter().map(|p| (p.ticket, p)).collect(),
                    Err(e) => {
                        warn!(account = %account, error = %e, "Sweep could not list child positions");
                        continue;
                    }
                };

            let rows = self.store.list_open(&account).await?;
            let closed_rows = self.store.list_closed_unarchived(&account).await?;

            let mapped_child_tickets: HashSet<Ticket> = rows
                .iter()
                .chain(closed_rows.iter())
                .filter_map(|r| r.child_ticket)
                .map(|t| t as Ticket)
                .collect();

            // Child positions nothing maps to.
            for ticket in live.keys() {
                if !mapped_child_tickets.contains(ticket) {
                    self.flag(
                        &account,
                        None,
                        Some(*ticket),
                        format!("child position {ticket} has no master counterpart"),
                    )
                    .await?;
                }
            }

            for row in &rows {
                if row.parsed_status() != Some(MappingStatus::Open) {
                    continue;
                }
                let master_ticket = row.master_ticket as Ticket;
                let child_ticket = row.child_ticket.map(|t| t as Ticket);

                // Open rows pointing at a child position that vanished.
                if let Some(ct) = child_ticket {
                    if !live.contains_key(&ct) {
                        self.flag(
                            &account,
                            Some(master_ticket),
                            Some(ct),
                            format!("mapping references child position {ct} no longer open"),
                        )
                        .await?;
                    }
                }

                // Open rows whose master ticket is gone but no close was
                // ever replicated.
                if !master_snapshot.contains_key(&master_ticket) {
                    self.flag(
                        &account,
                        Some(master_ticket),
                        child_ticket,
                        format!("master ticket {master_ticket} no longer open but mapping still open"),
                    )
                    .await?;
                }
            }

            // Archive closed rows once both sides confirm no trace remains.
            for row in &closed_rows {
                let master_ticket = row.master_ticket as Ticket;
                let child_gone = row
                    .child_ticket
                    .map(|t| !live.contains_key(&(t as Ticket)))
                    .unwrap_or(true);
                if child_gone && !master_snapshot.contains_key(&master_ticket) {
                    debug!(account = %account, ticket = master_ticket, "Archiving closed mapping row");
                    self.store.mark_archived(&account, master_ticket).await?;
                }
            }
        }

        Ok(())
    }

    async fn flag(
        &self,
        account: &str,
        master_ticket: Option<Ticket>,
        child_ticket: Option<Ticket>,
        detail: String,
    ) -> Result<()> {
        warn!(account = %account, detail = %detail, "Reconciliation sweep warning");
        self.store
            .record_activity(&ActivityRecord::new(
                account,
                ActivityAction::Sweep,
                ActivityOutcome::Warning,
                master_ticket,
                child_ticket,
                detail,
            ))
            .await
    }
}
