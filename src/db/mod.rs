//! Position mapping store and activity log.
//!
//! SQLite-backed so idempotency survives a process restart: one row per
//! (child account, master ticket), mutated only by that child's executor,
//! read concurrently by the watcher and the reconciliation sweep.
//!
//! Rows move along a fixed lifecycle:
//! pending -> open -> closing -> closed, with failed reachable from
//! pending and closing, and failed -> pending / failed -> closing as the
//! budgeted retry paths. Any other transition quarantines the row.

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::error;

use crate::models::{ActivityRecord, Ticket};

/// Lifecycle state of a mapping row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStatus {
    /// Row created, child order not yet confirmed
    Pending,
    /// Child order confirmed with a ticket
    Open,
    /// Close order in flight
    Closing,
    /// Both sides done
    Closed,
    /// Retries exhausted; eligible for a budgeted retry
    Failed,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Open => "open",
            MappingStatus::Closing => "closing",
            MappingStatus::Closed => "closed",
            MappingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MappingStatus::Pending),
            "open" => Some(MappingStatus::Open),
            "closing" => Some(MappingStatus::Closing),
            "closed" => Some(MappingStatus::Closed),
            "failed" => Some(MappingStatus::Failed),
            _ => None,
        }
    }

    /// Allowed lifecycle edges. `failed -> closing` is the close-retry path
    /// for rows that already hold a child ticket.
    pub fn can_transition(self, to: MappingStatus) -> bool {
        use MappingStatus::*;
        matches!(
            (self, to),
            (Pending, Open)
                | (Pending, Failed)
                | (Open, Closing)
                | (Closing, Closed)
                | (Closing, Failed)
                | (Failed, Pending)
                | (Failed, Closing)
        )
    }
}

/// One durable mapping row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MappingRow {
    pub child_account: String,
    pub master_ticket: i64,
    pub child_ticket: Option<i64>,
    pub status: String,

    // Pair parameters frozen at open time; config drift after open does not
    // change how this row is replayed.
    pub child_symbol: String,
    pub lot_multiplier: f64,
    pub direction_flip: bool,

    pub attempt_count: i64,
    pub retry_budget: i64,
    pub last_attempt_at: Option<String>,
    pub last_error: Option<String>,
    pub quarantined: bool,
    pub archived: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl MappingRow {
    pub fn parsed_status(&self) -> Option<MappingStatus> {
        MappingStatus::parse(&self.status)
    }
}

/// Result of a requested lifecycle transition.
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Row missing, or the edge is not in the lifecycle. An existing row is
    /// quarantined as a side effect.
    Invalid { current: Option<MappingStatus> },
}

/// Stored activity log entry, read back by the status command.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivityRow {
    pub id: String,
    pub timestamp: String,
    pub child_account: String,
    pub master_ticket: Option<i64>,
    pub child_ticket: Option<i64>,
    pub action: String,
    pub outcome: String,
    pub detail: String,
}

/// SQLite-backed store for mapping rows and the activity log.
pub struct MappingStore {
    pool: SqlitePool,
}

impl MappingStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to mapping database")?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_mappings (
                child_account TEXT NOT NULL,
                master_ticket INTEGER NOT NULL,
                child_ticket INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                child_symbol TEXT NOT NULL,
                lot_multiplier REAL NOT NULL,
                direction_flip INTEGER NOT NULL DEFAULT 0,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                retry_budget INTEGER NOT NULL DEFAULT 1,
                last_attempt_at TEXT,
                last_error TEXT,
                quarantined INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (child_account, master_ticket)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                child_account TEXT NOT NULL,
                master_ticket INTEGER,
                child_ticket INTEGER,
                action TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mappings_status ON position_mappings(child_account, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_activity_time ON activity_log(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Mapping rows ====================

    pub async fn get(
        &self,
        child_account: &str,
        master_ticket: Ticket,
    ) -> Result<Option<MappingRow>> {
        sqlx::query_as::<_, MappingRow>(
            "SELECT * FROM position_mappings WHERE child_account = ? AND master_ticket = ?",
        )
        .bind(child_account)
        .bind(master_ticket as i64)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch mapping row")
    }

    /// Create a fresh `pending` row with the resolved pair parameters frozen
    /// in. Errors if the row already exists; callers check `get` first.
    pub async fn insert_pending(
        &self,
        child_account: &str,
        master_ticket: Ticket,
        child_symbol: &str,
        lot_multiplier: f64,
        direction_flip: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO position_mappings
                (child_account, master_ticket, status, child_symbol, lot_multiplier, direction_flip)
            VALUES (?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(child_account)
        .bind(master_ticket as i64)
        .bind(child_symbol)
        .bind(lot_multiplier)
        .bind(direction_flip)
        .execute(&self.pool)
        .await
        .context("Failed to insert pending mapping row")?;

        Ok(())
    }

    /// Apply a lifecycle transition. An edge outside the lifecycle (or a
    /// missing row) is reported as `Invalid` and the row is quarantined; the
    /// caller surfaces it as an invariant violation.
    pub async fn transition(
        &self,
        child_account: &str,
        master_ticket: Ticket,
        to: MappingStatus,
        child_ticket: Option<Ticket>,
        error_detail: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let Some(row) = self.get(child_account, master_ticket).await? else {
            return Ok(TransitionOutcome::Invalid { current: None });
        };

        let current = match row.parsed_status() {
            Some(status) => status,
            None => {
                error!(
                    account = %child_account,
                    ticket = master_ticket,
                    status = %row.status,
                    "Mapping row has unparseable status, quarantining"
                );
                self.quarantine(child_account, master_ticket).await?;
                return Ok(TransitionOutcome::Invalid { current: None });
            }
        };

        if !current.can_transition(to) {
            self.quarantine(child_account, master_ticket).await?;
            return Ok(TransitionOutcome::Invalid {
                current: Some(current),
            });
        }

        sqlx::query(
            r#"
            UPDATE position_mappings SET
                status = ?,
                child_ticket = COALESCE(?, child_ticket),
                last_error = ?,
                updated_at = datetime('now')
            WHERE child_account = ? AND master_ticket = ?
            "#,
        )
        .bind(to.as_str())
        .bind(child_ticket.map(|t| t as i64))
        .bind(error_detail)
        .bind(child_account)
        .bind(master_ticket as i64)
        .execute(&self.pool)
        .await?;

        Ok(TransitionOutcome::Applied)
    }

    /// Bump the attempt counter and stamp the attempt time.
    pub async fn record_attempt(&self, child_account: &str, master_ticket: Ticket) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE position_mappings SET
                attempt_count = attempt_count + 1,
                last_attempt_at = datetime('now'),
                updated_at = datetime('now')
            WHERE child_account = ? AND master_ticket = ?
            "#,
        )
        .bind(child_account)
        .bind(master_ticket as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Take one unit of retry budget. Returns false when none remains, which
    /// ends re-replication of a failed open.
    pub async fn consume_retry_budget(
        &self,
        child_account: &str,
        master_ticket: Ticket,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE position_mappings SET
                retry_budget = retry_budget - 1,
                updated_at = datetime('now')
            WHERE child_account = ? AND master_ticket = ? AND retry_budget > 0
            "#,
        )
        .bind(child_account)
        .bind(master_ticket as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Live rows for reconciliation: pending, open, or closing.
    pub async fn list_open(&self, child_account: &str) -> Result<Vec<MappingRow>> {
        sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT * FROM position_mappings
            WHERE child_account = ? AND archived = 0
              AND status IN ('pending', 'open', 'closing')
            ORDER BY master_ticket
            "#,
        )
        .bind(child_account)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list open mapping rows")
    }

    /// Failed opens (no child ticket yet) with retry budget remaining; the
    /// watcher re-emits these while the master position is still open.
    pub async fn list_failed_opens(&self, child_account: &str) -> Result<Vec<MappingRow>> {
        sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT * FROM position_mappings
            WHERE child_account = ? AND status = 'failed' AND quarantined = 0
              AND child_ticket IS NULL AND retry_budget > 0
            "#,
        )
        .bind(child_account)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list failed opens")
    }

    /// Failed closes (child ticket present); re-emitted until the child
    /// position is confirmed flat.
    pub async fn list_failed_closes(&self, child_account: &str) -> Result<Vec<MappingRow>> {
        sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT * FROM position_mappings
            WHERE child_account = ? AND status = 'failed' AND quarantined = 0
              AND child_ticket IS NOT NULL
            "#,
        )
        .bind(child_account)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list failed closes")
    }

    /// Closed rows awaiting archival.
    pub async fn list_closed_unarchived(&self, child_account: &str) -> Result<Vec<MappingRow>> {
        sqlx::query_as::<_, MappingRow>(
            "SELECT * FROM position_mappings WHERE child_account = ? AND status = 'closed' AND archived = 0",
        )
        .bind(child_account)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list closed rows")
    }

    /// Archive a closed row once a full reconciliation cycle confirms no
    /// trace remains on either side.
    pub async fn mark_archived(&self, child_account: &str, master_ticket: Ticket) -> Result<()> {
        sqlx::query(
            "UPDATE position_mappings SET archived = 1, updated_at = datetime('now') WHERE child_account = ? AND master_ticket = ?",
        )
        .bind(child_account)
        .bind(master_ticket as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fence off a row whose lifecycle went wrong; it is never overwritten
    /// and excluded from retry listings until an operator intervenes.
    pub async fn quarantine(&self, child_account: &str, master_ticket: Ticket) -> Result<()> {
        sqlx::query(
            "UPDATE position_mappings SET quarantined = 1, updated_at = datetime('now') WHERE child_account = ? AND master_ticket = ?",
        )
        .bind(child_account)
        .bind(master_ticket as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Row counts per status, for the status command.
    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM position_mappings WHERE archived = 0 GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ==================== Activity log ====================

    pub async fn record_activity(&self, record: &ActivityRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log
                (id, timestamp, child_account, master_ticket, child_ticket, action, outcome, detail)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.timestamp.to_rfc3339())
        .bind(&record.child_account)
        .bind(record.master_ticket.map(|t| t as i64))
        .bind(record.child_ticket.map(|t| t as i64))
        .bind(record.action.as_str())
        .bind(record.outcome.as_str())
        .bind(&record.detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityRow>> {
        sqlx::query_as::<_, ActivityRow>(
            "SELECT * FROM activity_log ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch activity log")
    }
}
