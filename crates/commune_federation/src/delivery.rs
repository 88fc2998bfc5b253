/*
 * SPDX-FileCopyrightText: 2026 Commune Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::fetch::JobQueue;
use crate::store::{now_ms, FederationDb};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// A delivery is permanently abandoned after this many attempts.
pub const MAX_ATTEMPTS: i64 = 10;

/// Backoff schedule in minutes, indexed by the new attempt count.
/// Front-loaded: fast early retries for transient blips, then long
/// waits. Attempts beyond the table get no scheduled retry; the sweep
/// drives them until the attempt cap marks the row failed.
const RETRY_BACKOFF_MINUTES: [i64; 6] = [5, 15, 60, 180, 720, 1440];

/// How many sweep ticks between runs of the age-based cleanup.
const CLEANUP_EVERY_TICKS: u64 = 60;

const FAILED_RETENTION_MS: i64 = 7 * 24 * 3600 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "delivered" => DeliveryStatus::Delivered,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryRow {
    pub id: i64,
    pub activity_id: String,
    pub inbox_url: String,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub last_attempt_at_ms: Option<i64>,
    pub next_retry_at_ms: Option<i64>,
    pub error_message: Option<String>,
    pub inserted_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    db: FederationDb,
    queue: Arc<dyn JobQueue>,
}

impl DeliveryEngine {
    pub fn new(db: FederationDb, queue: Arc<dyn JobQueue>) -> Self {
        Self { db, queue }
    }

    /// Bulk-insert one pending row per distinct inbox and enqueue one
    /// delivery-attempt job per inserted row. Enqueuing is not
    /// transactional with the insert: a lost or duplicate enqueue is
    /// tolerated, the periodic sweep closes the gap.
    pub async fn create_deliveries(
        &self,
        activity_id: &str,
        inbox_urls: &[String],
    ) -> Result<(u64, Vec<DeliveryRow>)> {
        let rows = tokio::task::spawn_blocking({
            let db = self.db.clone();
            let activity_id = activity_id.to_string();
            let inbox_urls = inbox_urls.to_vec();
            move || -> Result<Vec<DeliveryRow>> {
                let mut conn = db.connect()?;
                let now = now_ms();
                let tx = conn.transaction()?;
                let mut seen = HashSet::new();
                let mut ids = Vec::new();
                for inbox in &inbox_urls {
                    if !seen.insert(inbox.as_str()) {
                        continue;
                    }
                    let changed = tx.execute(
                        r#"
                        INSERT OR IGNORE INTO deliveries (
                          activity_id, inbox_url, status, attempts, inserted_at_ms, updated_at_ms
                        ) VALUES (?1, ?2, 'pending', 0, ?3, ?3)
                        "#,
                        params![activity_id, inbox, now],
                    )?;
                    if changed > 0 {
                        ids.push(tx.last_insert_rowid());
                    }
                }
                tx.commit()?;

                let mut rows = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(row) = get_delivery_row(&conn, id)? {
                        rows.push(row);
                    }
                }
                Ok(rows)
            }
        })
        .await??;

        for row in &rows {
            if let Err(e) = self.queue.enqueue(row.id).await {
                warn!("enqueue delivery {} failed: {e:#}", row.id);
            }
        }
        Ok((rows.len() as u64, rows))
    }

    /// Ids of pending rows whose scheduled retry is due (or never
    /// scheduled) and whose attempt budget remains, oldest-updated first.
    /// Powers the sweep that re-enqueues rows whose job was lost.
    pub async fn get_retryable_delivery_ids(&self, limit: u32) -> Result<Vec<i64>> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<Vec<i64>> {
                let conn = db.connect()?;
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id FROM deliveries
                    WHERE status = 'pending'
                      AND (next_retry_at_ms IS NULL OR next_retry_at_ms <= ?1)
                      AND attempts < ?2
                    ORDER BY updated_at_ms ASC
                    LIMIT ?3
                    "#,
                )?;
                let ids = stmt
                    .query_map(params![now_ms(), MAX_ATTEMPTS, limit], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(ids)
            }
        })
        .await?
    }

    pub async fn get_delivery(&self, id: i64) -> Result<Option<DeliveryRow>> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<Option<DeliveryRow>> {
                let conn = db.connect()?;
                get_delivery_row(&conn, id)
            }
        })
        .await?
    }

    /// pending -> delivered. Safe under double invocation and never
    /// resurrects a failed row.
    pub async fn mark_delivery_delivered(&self, id: i64) -> Result<()> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<()> {
                let conn = db.connect()?;
                let now = now_ms();
                conn.execute(
                    r#"
                    UPDATE deliveries
                    SET status = 'delivered', last_attempt_at_ms = ?2,
                        next_retry_at_ms = NULL, error_message = NULL, updated_at_ms = ?2
                    WHERE id = ?1 AND status = 'pending'
                    "#,
                    params![id, now],
                )?;
                Ok(())
            }
        })
        .await?
    }

    /// Record a failed attempt: bump `attempts`, schedule the next retry
    /// from the backoff table, and mark the row failed once the attempt
    /// cap is reached. The increment runs in SQL so concurrent reports
    /// against the same row never lose an attempt. No-op on rows that
    /// already left `pending`.
    pub async fn mark_delivery_failed(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<Option<DeliveryRow>> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            let error_message = error_message.to_string();
            move || -> Result<Option<DeliveryRow>> {
                let conn = db.connect()?;
                let now = now_ms();
                let changed = conn.execute(
                    r#"
                    UPDATE deliveries
                    SET attempts = attempts + 1, last_attempt_at_ms = ?2,
                        error_message = ?3, updated_at_ms = ?2
                    WHERE id = ?1 AND status = 'pending'
                    "#,
                    params![id, now, error_message],
                )?;
                if changed == 0 {
                    // Missing, or already delivered/failed: report as-is.
                    return get_delivery_row(&conn, id);
                }
                let Some(row) = get_delivery_row(&conn, id)? else {
                    return Ok(None);
                };
                let (status, next_retry_at_ms) = if row.attempts >= MAX_ATTEMPTS {
                    (DeliveryStatus::Failed, None)
                } else {
                    (DeliveryStatus::Pending, next_retry_at(row.attempts, now))
                };
                conn.execute(
                    "UPDATE deliveries SET status = ?2, next_retry_at_ms = ?3 WHERE id = ?1 AND status = 'pending'",
                    params![id, status.as_str(), next_retry_at_ms],
                )?;
                get_delivery_row(&conn, id)
            }
        })
        .await?
    }

    /// Delete failed rows older than 7 days. Pending and delivered rows
    /// are never touched regardless of age.
    pub async fn cleanup_old_deliveries(&self) -> Result<u64> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<u64> {
                let conn = db.connect()?;
                let cutoff = now_ms() - FAILED_RETENTION_MS;
                let deleted = conn.execute(
                    "DELETE FROM deliveries WHERE status = 'failed' AND inserted_at_ms < ?1",
                    params![cutoff],
                )?;
                Ok(deleted as u64)
            }
        })
        .await?
    }

    /// Periodic sweep: re-enqueue retryable rows (self-healing against
    /// lost queue jobs) and run the age-based cleanup on a slower
    /// cadence.
    pub fn start_sweep(&self, mut shutdown: watch::Receiver<bool>, interval: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = tick.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                match engine.get_retryable_delivery_ids(100).await {
                    Ok(ids) => {
                        for id in ids {
                            if let Err(e) = engine.queue.enqueue(id).await {
                                warn!("sweep enqueue delivery {id} failed: {e:#}");
                            }
                        }
                    }
                    Err(e) => warn!("delivery sweep query failed: {e:#}"),
                }

                ticks += 1;
                if ticks % CLEANUP_EVERY_TICKS == 0 {
                    match engine.cleanup_old_deliveries().await {
                        Ok(n) if n > 0 => info!("pruned {n} old failed deliveries"),
                        Ok(_) => {}
                        Err(e) => warn!("delivery cleanup failed: {e:#}"),
                    }
                }
            }
        });
    }
}

fn next_retry_at(new_attempts: i64, now: i64) -> Option<i64> {
    let idx = usize::try_from(new_attempts - 1).ok()?;
    RETRY_BACKOFF_MINUTES
        .get(idx)
        .map(|minutes| now + minutes * 60_000)
}

fn delivery_from_row(r: &Row<'_>) -> rusqlite::Result<DeliveryRow> {
    Ok(DeliveryRow {
        id: r.get(0)?,
        activity_id: r.get(1)?,
        inbox_url: r.get(2)?,
        status: DeliveryStatus::from_str(&r.get::<_, String>(3)?),
        attempts: r.get(4)?,
        last_attempt_at_ms: r.get(5)?,
        next_retry_at_ms: r.get(6)?,
        error_message: r.get(7)?,
        inserted_at_ms: r.get(8)?,
        updated_at_ms: r.get(9)?,
    })
}

fn get_delivery_row(conn: &rusqlite::Connection, id: i64) -> Result<Option<DeliveryRow>> {
    let row = conn
        .query_row(
            r#"
            SELECT id, activity_id, inbox_url, status, attempts, last_attempt_at_ms,
                   next_retry_at_ms, error_message, inserted_at_ms, updated_at_ms
            FROM deliveries WHERE id = ?1
            "#,
            params![id],
            delivery_from_row,
        )
        .optional()?;
    Ok(row)
}
