//! Copier runner: wires one master watcher, a connection supervisor, and one
//! executor per child account, and manages shutdown.
//!
//! Shutdown order matters: the watcher stops polling and closes every child
//! queue, executors drain what is already queued and exit, then the
//! supervisor is joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::config::ConfigHandle;
use crate::db::MappingStore;
use crate::gateway::TerminalGateway;
use crate::sync::{
    ChildChannel, ChildExecutor, ConnectionSupervisor, HealthBoard, MasterWatcher,
    ReplicationQueue, SnapshotHandle,
};

/// Per-child queue depth. Deep enough to ride out a slow broker without
/// triggering the queue's last-resort eviction.
pub const QUEUE_CAPACITY: usize = 256;

/// One running replication instance: one master, N children.
pub struct Copier {
    master: Arc<dyn TerminalGateway>,
    children: Vec<Arc<dyn TerminalGateway>>,
    store: Arc<MappingStore>,
    config: ConfigHandle,
    shutdown: Arc<AtomicBool>,
}

impl Copier {
    pub fn new(
        master: Arc<dyn TerminalGateway>,
        children: Vec<Arc<dyn TerminalGateway>>,
        store: Arc<MappingStore>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            master,
            children,
            store,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until Ctrl+C, then drain and stop.
    pub async fn run(self) -> Result<()> {
        info!(
            master = %self.master.account(),
            children = self.children.len(),
            "Starting copier"
        );

        let board = HealthBoard::new();
        let snapshot = SnapshotHandle::new();

        // The watcher's first tick can run before the supervisor's first
        // liveness poll; seed the board so that tick is not skipped as a
        // spurious disconnect.
        let all_gateways: Vec<Arc<dyn TerminalGateway>> = std::iter::once(self.master.clone())
            .chain(self.children.iter().cloned())
            .collect();
        board.seed(&all_gateways).await;

        let mut channels = Vec::new();
        let mut executor_handles = Vec::new();
        for gateway in &self.children {
            let queue = Arc::new(ReplicationQueue::new(gateway.account(), QUEUE_CAPACITY));
            channels.push(ChildChannel {
                account: gateway.account().to_string(),
                queue: queue.clone(),
            });

            let executor = ChildExecutor::new(
                gateway.clone(),
                self.store.clone(),
                self.config.clone(),
                queue,
                board.clone(),
                self.shutdown.clone(),
            );
            executor_handles.push(tokio::spawn(executor.run()));
        }

        let supervisor = ConnectionSupervisor::new(
            self.master.clone(),
            self.children.clone(),
            board.clone(),
            self.store.clone(),
            snapshot.clone(),
            self.shutdown.clone(),
        );
        let supervisor_handle = tokio::spawn(supervisor.run());

        {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    shutdown.store(true, Ordering::SeqCst);
                }
            });
        }

        let watcher = MasterWatcher::new(
            self.master.clone(),
            self.store.clone(),
            self.config.clone(),
            channels,
            board,
            snapshot,
            self.shutdown.clone(),
        );
        // Runs on this task; on shutdown it closes every child queue so the
        // executors drain and exit.
        watcher.run().await;

        for handle in futures::future::join_all(executor_handles).await {
            if let Err(e) = handle {
                error!(error = %e, "Executor task panicked");
            }
        }
        if let Err(e) = supervisor_handle.await {
            error!(error = %e, "Supervisor task panicked");
        }

        info!("Copier stopped");
        Ok(())
    }
}
