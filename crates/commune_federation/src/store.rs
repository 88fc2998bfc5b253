/*
 * SPDX-FileCopyrightText: 2026 Commune Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

/// Handle to the federation database. Cheap to clone; every call opens
/// its own connection, callers in async context wrap calls in
/// `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct FederationDb {
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ActorRow {
    pub id: i64,
    pub uri: String,
    pub username: String,
    pub domain: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub avatar_url: Option<String>,
    pub header_url: Option<String>,
    pub inbox_url: Option<String>,
    pub outbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    pub public_key: Option<String>,
    pub manually_approves_followers: bool,
    pub actor_type: String,
    pub last_fetched_at_ms: Option<i64>,
    pub published_at_ms: Option<i64>,
    pub moderators_url: Option<String>,
    pub community_id: Option<i64>,
    /// Raw source document, preserved for forward compatibility.
    pub metadata: Option<Vec<u8>>,
}

impl ActorRow {
    pub fn is_local_group(&self) -> bool {
        self.actor_type == "Group" && self.community_id.is_some()
    }
}

/// Attributes derived from a remote actor document, ready to insert or
/// apply over an existing row.
#[derive(Debug, Clone, Default)]
pub struct NewActor {
    pub uri: String,
    pub username: String,
    pub domain: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub avatar_url: Option<String>,
    pub header_url: Option<String>,
    pub inbox_url: Option<String>,
    pub outbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    pub public_key: Option<String>,
    pub manually_approves_followers: bool,
    pub actor_type: String,
    pub last_fetched_at_ms: Option<i64>,
    pub published_at_ms: Option<i64>,
    pub moderators_url: Option<String>,
    pub community_id: Option<i64>,
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct InstanceRow {
    pub id: i64,
    pub domain: String,
    pub blocked: bool,
    pub reason: Option<String>,
    pub blocked_by_id: Option<i64>,
    pub blocked_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    User,
    Domain,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::User => "user",
            BlockType::Domain => "domain",
        }
    }
}

impl FederationDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let this = Self { path };
        let conn = this.connect()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS actors (
              id INTEGER PRIMARY KEY,
              uri TEXT NOT NULL UNIQUE,
              username TEXT NOT NULL,
              domain TEXT NOT NULL,
              display_name TEXT NULL,
              summary TEXT NULL,
              avatar_url TEXT NULL,
              header_url TEXT NULL,
              inbox_url TEXT NULL,
              outbox_url TEXT NULL,
              followers_url TEXT NULL,
              following_url TEXT NULL,
              public_key TEXT NULL,
              manually_approves_followers INTEGER NOT NULL DEFAULT 0,
              actor_type TEXT NOT NULL DEFAULT 'Person',
              last_fetched_at_ms INTEGER NULL,
              published_at_ms INTEGER NULL,
              moderators_url TEXT NULL,
              community_id INTEGER NULL,
              metadata BLOB NULL,
              inserted_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              UNIQUE(username, domain)
            );
            CREATE INDEX IF NOT EXISTS idx_actors_domain ON actors(domain);

            CREATE TABLE IF NOT EXISTS instances (
              id INTEGER PRIMARY KEY,
              domain TEXT NOT NULL UNIQUE,
              blocked INTEGER NOT NULL DEFAULT 0,
              reason TEXT NULL,
              blocked_by_id INTEGER NULL,
              blocked_at_ms INTEGER NULL,
              inserted_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deliveries (
              id INTEGER PRIMARY KEY,
              activity_id TEXT NOT NULL,
              inbox_url TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              attempts INTEGER NOT NULL DEFAULT 0,
              last_attempt_at_ms INTEGER NULL,
              next_retry_at_ms INTEGER NULL,
              error_message TEXT NULL,
              inserted_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              UNIQUE(activity_id, inbox_url)
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_due ON deliveries(status, next_retry_at_ms);

            CREATE TABLE IF NOT EXISTS group_follows (
              id INTEGER PRIMARY KEY,
              remote_actor_id INTEGER NOT NULL,
              group_actor_id INTEGER NOT NULL,
              activitypub_id TEXT NOT NULL,
              pending INTEGER NOT NULL DEFAULT 0,
              inserted_at_ms INTEGER NOT NULL,
              UNIQUE(remote_actor_id, group_actor_id)
            );
            CREATE INDEX IF NOT EXISTS idx_group_follows_group ON group_follows(group_actor_id, pending);

            CREATE TABLE IF NOT EXISTS user_blocks (
              id INTEGER PRIMARY KEY,
              user_id INTEGER NOT NULL,
              blocked_uri TEXT NOT NULL,
              block_type TEXT NOT NULL,
              inserted_at_ms INTEGER NOT NULL,
              UNIQUE(user_id, blocked_uri, block_type)
            );

            CREATE TABLE IF NOT EXISTS custom_emoji (
              shortcode TEXT NOT NULL,
              domain TEXT NOT NULL,
              image_url TEXT NOT NULL,
              inserted_at_ms INTEGER NOT NULL,
              PRIMARY KEY(shortcode, domain)
            );
            "#,
        )?;
        Ok(this)
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        // Writers from concurrent spawn_blocking calls wait for the WAL
        // write lock instead of surfacing SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn get_actor_by_uri(&self, uri: &str) -> Result<Option<ActorRow>> {
        let conn = self.connect()?;
        get_actor_where(&conn, "uri = ?1", params![uri])
    }

    pub fn get_actor_by_id(&self, id: i64) -> Result<Option<ActorRow>> {
        let conn = self.connect()?;
        get_actor_where(&conn, "id = ?1", params![id])
    }

    pub fn get_actor_by_username_domain(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<ActorRow>> {
        let conn = self.connect()?;
        get_actor_where(&conn, "username = ?1 AND domain = ?2", params![username, domain])
    }

    /// Insert or update an actor record. When `existing_id` is set the row
    /// is updated in place. A unique-constraint violation on insert means a
    /// concurrent resolution (or a canonicalized URI variant) won the race:
    /// re-read by `uri`, then by (`username`, `domain`), and update that
    /// row; if the identity fields themselves conflict, update only the
    /// descriptive fields; if even that fails, return the stale row. Actor
    /// caching never hard-fails on an identity race.
    pub fn upsert_actor(&self, existing_id: Option<i64>, new: &NewActor) -> Result<ActorRow> {
        let conn = self.connect()?;
        if let Some(id) = existing_id {
            update_actor_full(&conn, id, new)?;
            return get_actor_where(&conn, "id = ?1", params![id])?
                .context("actor row vanished after update");
        }

        match insert_actor(&conn, new) {
            Ok(id) => get_actor_where(&conn, "id = ?1", params![id])?
                .context("actor row vanished after insert"),
            Err(e) if is_unique_violation(&e) => {
                let existing = get_actor_where(&conn, "uri = ?1", params![new.uri])?;
                let existing = match existing {
                    Some(row) => row,
                    None => get_actor_where(
                        &conn,
                        "username = ?1 AND domain = ?2",
                        params![new.username, new.domain],
                    )?
                    .ok_or_else(|| anyhow::Error::from(e).context("actor insert conflict"))?,
                };
                match update_actor_full(&conn, existing.id, new) {
                    Ok(()) => {}
                    Err(e2) if is_unique_violation(&e2) => {
                        if update_actor_descriptive(&conn, existing.id, new).is_err() {
                            return Ok(existing);
                        }
                    }
                    Err(_) => return Ok(existing),
                }
                get_actor_where(&conn, "id = ?1", params![existing.id])?
                    .context("actor row vanished during race recovery")
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn ensure_instance(&self, domain: &str) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO instances(domain, inserted_at_ms) VALUES (?1, ?2)",
            params![domain, now_ms()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM instances WHERE domain = ?1",
            params![domain],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn get_instance(&self, domain: &str) -> Result<Option<InstanceRow>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, domain, blocked, reason, blocked_by_id, blocked_at_ms FROM instances WHERE domain = ?1",
                params![domain],
                |r| {
                    Ok(InstanceRow {
                        id: r.get(0)?,
                        domain: r.get(1)?,
                        blocked: r.get::<_, i64>(2)? != 0,
                        reason: r.get(3)?,
                        blocked_by_id: r.get(4)?,
                        blocked_at_ms: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_instance_blocked(
        &self,
        domain: &str,
        reason: Option<&str>,
        blocked_by_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let now = now_ms();
        conn.execute(
            r#"
            INSERT INTO instances(domain, blocked, reason, blocked_by_id, blocked_at_ms, inserted_at_ms)
            VALUES (?1, 1, ?2, ?3, ?4, ?4)
            ON CONFLICT(domain) DO UPDATE SET
              blocked=1, reason=excluded.reason,
              blocked_by_id=excluded.blocked_by_id, blocked_at_ms=excluded.blocked_at_ms
            "#,
            params![domain, reason, blocked_by_id, now],
        )?;
        Ok(())
    }

    pub fn set_instance_unblocked(&self, domain: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE instances SET blocked=0, reason=NULL, blocked_by_id=NULL, blocked_at_ms=NULL WHERE domain = ?1",
            params![domain],
        )?;
        Ok(())
    }

    pub fn is_instance_blocked(&self, domain: &str) -> Result<bool> {
        Ok(self.get_instance(domain)?.map(|i| i.blocked).unwrap_or(false))
    }

    pub fn add_user_block(
        &self,
        user_id: i64,
        blocked_uri: &str,
        block_type: BlockType,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_blocks(user_id, blocked_uri, block_type, inserted_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, blocked_uri, block_type.as_str(), now_ms()],
        )?;
        Ok(())
    }

    pub fn remove_user_block(
        &self,
        user_id: i64,
        blocked_uri: &str,
        block_type: BlockType,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM user_blocks WHERE user_id = ?1 AND blocked_uri = ?2 AND block_type = ?3",
            params![user_id, blocked_uri, block_type.as_str()],
        )?;
        Ok(())
    }

    /// A user-type block matches the actor URI exactly; a domain-type
    /// block matches any actor whose host equals the blocked value.
    pub fn is_uri_blocked_for_user(&self, user_id: i64, actor_uri: &str) -> Result<bool> {
        let conn = self.connect()?;
        let exact: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_blocks WHERE user_id = ?1 AND block_type = 'user' AND blocked_uri = ?2",
            params![user_id, actor_uri],
            |r| r.get(0),
        )?;
        if exact > 0 {
            return Ok(true);
        }
        let Some(host) = actor_uri
            .parse::<http::Uri>()
            .ok()
            .and_then(|u| u.host().map(|h| h.to_string()))
        else {
            return Ok(false);
        };
        let by_domain: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_blocks WHERE user_id = ?1 AND block_type = 'domain' AND blocked_uri = ?2",
            params![user_id, host],
            |r| r.get(0),
        )?;
        Ok(by_domain > 0)
    }

    pub fn upsert_custom_emoji(&self, shortcode: &str, domain: &str, image_url: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO custom_emoji(shortcode, domain, image_url, inserted_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(shortcode, domain) DO UPDATE SET image_url=excluded.image_url
            "#,
            params![shortcode, domain, image_url, now_ms()],
        )?;
        Ok(())
    }

    pub fn list_custom_emoji(&self, domain: &str) -> Result<Vec<(String, String)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT shortcode, image_url FROM custom_emoji WHERE domain = ?1 ORDER BY shortcode",
        )?;
        let rows = stmt.query_map(params![domain], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

const ACTOR_COLUMNS: &str = "id, uri, username, domain, display_name, summary, avatar_url, header_url, \
     inbox_url, outbox_url, followers_url, following_url, public_key, manually_approves_followers, \
     actor_type, last_fetched_at_ms, published_at_ms, moderators_url, community_id, metadata";

pub(crate) fn actor_from_row(r: &Row<'_>) -> rusqlite::Result<ActorRow> {
    Ok(ActorRow {
        id: r.get(0)?,
        uri: r.get(1)?,
        username: r.get(2)?,
        domain: r.get(3)?,
        display_name: r.get(4)?,
        summary: r.get(5)?,
        avatar_url: r.get(6)?,
        header_url: r.get(7)?,
        inbox_url: r.get(8)?,
        outbox_url: r.get(9)?,
        followers_url: r.get(10)?,
        following_url: r.get(11)?,
        public_key: r.get(12)?,
        manually_approves_followers: r.get::<_, i64>(13)? != 0,
        actor_type: r.get(14)?,
        last_fetched_at_ms: r.get(15)?,
        published_at_ms: r.get(16)?,
        moderators_url: r.get(17)?,
        community_id: r.get(18)?,
        metadata: r.get(19)?,
    })
}

fn get_actor_where(
    conn: &Connection,
    predicate: &str,
    args: impl rusqlite::Params,
) -> Result<Option<ActorRow>> {
    let sql = format!("SELECT {ACTOR_COLUMNS} FROM actors WHERE {predicate}");
    Ok(conn.query_row(&sql, args, actor_from_row).optional()?)
}

fn insert_actor(conn: &Connection, new: &NewActor) -> rusqlite::Result<i64> {
    let now = now_ms();
    conn.execute(
        r#"
        INSERT INTO actors (
          uri, username, domain, display_name, summary, avatar_url, header_url,
          inbox_url, outbox_url, followers_url, following_url, public_key,
          manually_approves_followers, actor_type, last_fetched_at_ms, published_at_ms,
          moderators_url, community_id, metadata, inserted_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?20)
        "#,
        params![
            new.uri,
            new.username,
            new.domain,
            new.display_name,
            new.summary,
            new.avatar_url,
            new.header_url,
            new.inbox_url,
            new.outbox_url,
            new.followers_url,
            new.following_url,
            new.public_key,
            new.manually_approves_followers as i64,
            new.actor_type,
            new.last_fetched_at_ms,
            new.published_at_ms,
            new.moderators_url,
            new.community_id,
            new.metadata,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_actor_full(conn: &Connection, id: i64, new: &NewActor) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        UPDATE actors SET
          uri = ?2, username = ?3, domain = ?4, display_name = ?5, summary = ?6,
          avatar_url = ?7, header_url = ?8, inbox_url = ?9, outbox_url = ?10,
          followers_url = ?11, following_url = ?12, public_key = ?13,
          manually_approves_followers = ?14, actor_type = ?15, last_fetched_at_ms = ?16,
          published_at_ms = ?17, moderators_url = ?18, metadata = ?19, updated_at_ms = ?20
        WHERE id = ?1
        "#,
        params![
            id,
            new.uri,
            new.username,
            new.domain,
            new.display_name,
            new.summary,
            new.avatar_url,
            new.header_url,
            new.inbox_url,
            new.outbox_url,
            new.followers_url,
            new.following_url,
            new.public_key,
            new.manually_approves_followers as i64,
            new.actor_type,
            new.last_fetched_at_ms,
            new.published_at_ms,
            new.moderators_url,
            new.metadata,
            now_ms(),
        ],
    )?;
    Ok(())
}

/// Update skipping the identity fields (`uri`, `username`, `domain`), so
/// only descriptive metadata changes when the identities conflict.
fn update_actor_descriptive(conn: &Connection, id: i64, new: &NewActor) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        UPDATE actors SET
          display_name = ?2, summary = ?3, avatar_url = ?4, header_url = ?5,
          inbox_url = ?6, outbox_url = ?7, followers_url = ?8, following_url = ?9,
          public_key = ?10, manually_approves_followers = ?11, actor_type = ?12,
          last_fetched_at_ms = ?13, published_at_ms = ?14, moderators_url = ?15,
          metadata = ?16, updated_at_ms = ?17
        WHERE id = ?1
        "#,
        params![
            id,
            new.display_name,
            new.summary,
            new.avatar_url,
            new.header_url,
            new.inbox_url,
            new.outbox_url,
            new.followers_url,
            new.following_url,
            new.public_key,
            new.manually_approves_followers as i64,
            new.actor_type,
            new.last_fetched_at_ms,
            new.published_at_ms,
            new.moderators_url,
            new.metadata,
            now_ms(),
        ],
    )?;
    Ok(())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
