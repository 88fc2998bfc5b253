/*
 * SPDX-FileCopyrightText: 2026 Commune Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::fetch::KeyManager;
use crate::store::{actor_from_row, now_ms, ActorRow, FederationDb};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct GroupFollowRow {
    pub id: i64,
    pub remote_actor_id: i64,
    pub group_actor_id: i64,
    pub activitypub_id: String,
    pub pending: bool,
    pub inserted_at_ms: i64,
}

/// Tracks remote actors following local Group actors and derives fan-out
/// inbox lists for them.
pub struct GroupFollowRegistry {
    db: FederationDb,
    keys: Arc<dyn KeyManager>,
}

impl GroupFollowRegistry {
    pub fn new(db: FederationDb, keys: Arc<dyn KeyManager>) -> Self {
        Self { db, keys }
    }

    /// Records an inbound Follow. A repeated Follow from the same actor
    /// replaces the stored activity id and pending flag instead of
    /// duplicating the row. When the target is a locally-owned Group the
    /// key manager is invoked first so the Group can sign its responses.
    pub async fn create_follow(
        &self,
        remote_actor_id: i64,
        group_actor_id: i64,
        activitypub_id: &str,
        pending: bool,
    ) -> Result<GroupFollowRow> {
        let db = self.db.clone();
        let group = tokio::task::spawn_blocking(move || db.get_actor_by_id(group_actor_id))
            .await
            .context("join group lookup")??;
        if group.as_ref().is_some_and(ActorRow::is_local_group) {
            self.keys.ensure_keypair(group_actor_id).await?;
        }

        let db = self.db.clone();
        let activitypub_id = activitypub_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            conn.execute(
                r#"
                INSERT INTO group_follows(remote_actor_id, group_actor_id, activitypub_id, pending, inserted_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(remote_actor_id, group_actor_id) DO UPDATE SET
                  activitypub_id=excluded.activitypub_id, pending=excluded.pending
                "#,
                params![remote_actor_id, group_actor_id, activitypub_id, pending as i64, now_ms()],
            )?;
            get_follow(&conn, remote_actor_id, group_actor_id)?
                .context("follow row vanished after upsert")
        })
        .await
        .context("join follow upsert")?
    }

    pub async fn get_follow(
        &self,
        remote_actor_id: i64,
        group_actor_id: i64,
    ) -> Result<Option<GroupFollowRow>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            get_follow(&conn, remote_actor_id, group_actor_id)
        })
        .await
        .context("join follow lookup")?
    }

    /// Removes a follow on Undo-Follow or forced removal. Returns whether
    /// a row existed.
    pub async fn delete_follow(&self, remote_actor_id: i64, group_actor_id: i64) -> Result<bool> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            let changed = conn.execute(
                "DELETE FROM group_follows WHERE remote_actor_id = ?1 AND group_actor_id = ?2",
                params![remote_actor_id, group_actor_id],
            )?;
            Ok(changed > 0)
        })
        .await
        .context("join follow delete")?
    }

    /// Approves a pending follow. Returns whether a pending row existed.
    pub async fn accept_follow(&self, remote_actor_id: i64, group_actor_id: i64) -> Result<bool> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            let changed = conn.execute(
                "UPDATE group_follows SET pending = 0 WHERE remote_actor_id = ?1 AND group_actor_id = ?2 AND pending = 1",
                params![remote_actor_id, group_actor_id],
            )?;
            Ok(changed > 0)
        })
        .await
        .context("join follow accept")?
    }

    /// All approved followers of a Group actor.
    pub async fn list_followers(&self, group_actor_id: i64) -> Result<Vec<ActorRow>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            let sql = format!(
                "SELECT {} FROM actors a \
                 JOIN group_follows gf ON gf.remote_actor_id = a.id \
                 WHERE gf.group_actor_id = ?1 AND gf.pending = 0 \
                 ORDER BY gf.inserted_at_ms ASC, gf.id ASC",
                qualified_actor_columns()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![group_actor_id], actor_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
        .context("join follower list")?
    }

    pub async fn count_followers(&self, group_actor_id: i64) -> Result<i64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            let n = conn.query_row(
                "SELECT COUNT(*) FROM group_follows WHERE group_actor_id = ?1 AND pending = 0",
                params![group_actor_id],
                |r| r.get(0),
            )?;
            Ok(n)
        })
        .await
        .context("join follower count")?
    }

    /// Deduplicated inbox URLs for fanning an activity out to a Group's
    /// approved followers. Each follower contributes its shared inbox when
    /// its actor document advertises one, otherwise its personal inbox;
    /// followers on the same instance collapse to one shared-inbox entry.
    pub async fn follower_inboxes(&self, group_actor_id: i64) -> Result<Vec<String>> {
        let followers = self.list_followers(group_actor_id).await?;
        let mut seen = HashSet::new();
        let mut inboxes = Vec::new();
        for follower in &followers {
            let Some(inbox) = delivery_inbox(follower) else {
                continue;
            };
            if seen.insert(inbox.clone()) {
                inboxes.push(inbox);
            }
        }
        Ok(inboxes)
    }
}

/// Shared inbox from the stored source document (`endpoints.sharedInbox`)
/// when present, the personal inbox otherwise.
fn delivery_inbox(actor: &ActorRow) -> Option<String> {
    let shared = actor
        .metadata
        .as_deref()
        .and_then(|raw| serde_json::from_slice::<Value>(raw).ok())
        .and_then(|doc| {
            doc.get("endpoints")
                .and_then(|e| e.get("sharedInbox"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    shared.or_else(|| actor.inbox_url.clone())
}

fn qualified_actor_columns() -> String {
    "id, uri, username, domain, display_name, summary, avatar_url, header_url, \
     inbox_url, outbox_url, followers_url, following_url, public_key, manually_approves_followers, \
     actor_type, last_fetched_at_ms, published_at_ms, moderators_url, community_id, metadata"
        .split(", ")
        .map(|c| format!("a.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn get_follow(
    conn: &Connection,
    remote_actor_id: i64,
    group_actor_id: i64,
) -> Result<Option<GroupFollowRow>> {
    let row = conn
        .query_row(
            "SELECT id, remote_actor_id, group_actor_id, activitypub_id, pending, inserted_at_ms \
             FROM group_follows WHERE remote_actor_id = ?1 AND group_actor_id = ?2",
            params![remote_actor_id, group_actor_id],
            |r| {
                Ok(GroupFollowRow {
                    id: r.get(0)?,
                    remote_actor_id: r.get(1)?,
                    group_actor_id: r.get(2)?,
                    activitypub_id: r.get(3)?,
                    pending: r.get::<_, i64>(4)? != 0,
                    inserted_at_ms: r.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}
