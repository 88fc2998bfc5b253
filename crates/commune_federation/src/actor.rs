/*
 * SPDX-FileCopyrightText: 2026 Commune Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::fetch::{host_of, ObjectFetcher};
use crate::store::{now_ms, ActorRow, FederationDb, NewActor};
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

/// A cached actor older than this is re-fetched on resolution.
const STALE_AFTER_MS: i64 = 24 * 3600 * 1000;

/// How long a completed resolution stays in the in-process single-flight
/// map. Advisory: the `actors.uri` unique constraint is what makes
/// concurrent inserts correct, this only bounds duplicate outbound
/// fetches during federation bursts.
const FLIGHT_TTL: Duration = Duration::from_secs(10);

type FlightResult = std::result::Result<ActorRow, String>;

struct Flight {
    started: Instant,
    cell: Arc<OnceCell<FlightResult>>,
}

#[derive(Clone)]
pub struct ActorResolver {
    db: FederationDb,
    fetcher: Arc<dyn ObjectFetcher>,
    flights: Arc<Mutex<HashMap<String, Flight>>>,
}

impl ActorResolver {
    pub fn new(db: FederationDb, fetcher: Arc<dyn ObjectFetcher>) -> Self {
        Self {
            db,
            fetcher,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve a remote actor URI to a cached record, fetching and
    /// upserting on miss or staleness. Concurrent callers for the same
    /// key share one fetch. Identity-constraint races are absorbed; only
    /// genuine fetch I/O failure or a malformed document is an error.
    pub async fn resolve(&self, uri: &str) -> Result<ActorRow> {
        let cell = {
            let mut flights = self.flights.lock().await;
            flights.retain(|_, f| !(f.cell.initialized() && f.started.elapsed() > FLIGHT_TTL));
            flights
                .entry(uri.to_string())
                .or_insert_with(|| Flight {
                    started: Instant::now(),
                    cell: Arc::new(OnceCell::new()),
                })
                .cell
                .clone()
        };

        let this = self.clone();
        let key = uri.to_string();
        let res = cell
            .get_or_init(|| async move {
                this.resolve_uncached(&key)
                    .await
                    .map_err(|e| format!("{e:#}"))
            })
            .await
            .clone();
        res.map_err(|e| anyhow!(e))
    }

    async fn resolve_uncached(&self, uri: &str) -> Result<ActorRow> {
        let existing = {
            let db = self.db.clone();
            let uri = uri.to_string();
            tokio::task::spawn_blocking(move || db.get_actor_by_uri(&uri)).await??
        };

        if let Some(row) = &existing {
            if let Some(fetched) = row.last_fetched_at_ms {
                if now_ms().saturating_sub(fetched) < STALE_AFTER_MS {
                    return Ok(row.clone());
                }
            }
            // last_fetched_at null means never confirmed remotely: fetch.
        }

        self.fetch_and_cache(uri, existing).await
    }

    async fn fetch_and_cache(&self, uri: &str, existing: Option<ActorRow>) -> Result<ActorRow> {
        let doc = self.fetcher.fetch_actor(uri).await?;
        let new = parse_actor_document(uri, &doc)?;

        let row = {
            let db = self.db.clone();
            let new = new.clone();
            let existing_id = existing.map(|r| r.id);
            tokio::task::spawn_blocking(move || -> Result<ActorRow> {
                db.ensure_instance(&new.domain)?;
                db.upsert_actor(existing_id, &new)
            })
            .await??
        };

        // Best-effort custom emoji extraction, detached: its failure never
        // affects the caller's result.
        {
            let db = self.db.clone();
            let domain = row.domain.clone();
            tokio::spawn(async move {
                let log_domain = domain.clone();
                let res =
                    tokio::task::spawn_blocking(move || store_custom_emoji(&db, &domain, &doc))
                        .await;
                match res {
                    Ok(Err(e)) => debug!("emoji extraction failed for {log_domain}: {e:#}"),
                    Err(e) => debug!("emoji extraction task failed: {e}"),
                    _ => {}
                }
            });
        }

        Ok(row)
    }
}

/// Derive storable actor attributes from a raw ActivityPub actor
/// document. Field shapes vary across implementations (icon as string vs.
/// object, missing preferredUsername), each extractor accepts every shape
/// seen in the wild.
pub(crate) fn parse_actor_document(requested_uri: &str, doc: &Value) -> Result<NewActor> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(requested_uri);
    let domain = host_of(id).with_context(|| format!("actor document has no host: {id}"))?;
    let username = doc
        .get("preferredUsername")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| last_path_segment(id))
        .with_context(|| format!("cannot derive username for {id}"))?;

    Ok(NewActor {
        uri: id.to_string(),
        username,
        domain,
        display_name: doc.get("name").and_then(Value::as_str).map(str::to_string),
        summary: doc.get("summary").and_then(Value::as_str).map(str::to_string),
        avatar_url: image_url_of(doc.get("icon")),
        header_url: image_url_of(doc.get("image")),
        inbox_url: doc.get("inbox").and_then(Value::as_str).map(str::to_string),
        outbox_url: doc.get("outbox").and_then(Value::as_str).map(str::to_string),
        followers_url: doc.get("followers").and_then(Value::as_str).map(str::to_string),
        following_url: doc.get("following").and_then(Value::as_str).map(str::to_string),
        public_key: doc
            .get("publicKey")
            .and_then(|k| k.get("publicKeyPem"))
            .and_then(Value::as_str)
            .map(str::to_string),
        manually_approves_followers: doc
            .get("manuallyApprovesFollowers")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        actor_type: doc
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Person")
            .to_string(),
        last_fetched_at_ms: Some(now_ms()),
        published_at_ms: doc
            .get("published")
            .and_then(Value::as_str)
            .and_then(parse_timestamp_ms),
        moderators_url: link_url_of(doc.get("moderators"))
            .or_else(|| link_url_of(doc.get("attributedTo"))),
        community_id: None,
        metadata: serde_json::to_vec(doc).ok(),
    })
}

/// `icon`/`image` may be a bare URL string or an object with a `url`
/// field.
fn image_url_of(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn link_url_of(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn last_path_segment(uri: &str) -> Option<String> {
    let parsed: http::Uri = uri.parse().ok()?;
    parsed
        .path()
        .trim_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn parse_timestamp_ms(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    // Some servers emit ISO-8601 without an offset.
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

pub(crate) fn store_custom_emoji(db: &FederationDb, domain: &str, doc: &Value) -> Result<()> {
    let Some(tags) = doc.get("tag").and_then(Value::as_array) else {
        return Ok(());
    };
    for t in tags {
        if t.get("type").and_then(Value::as_str) != Some("Emoji") {
            continue;
        }
        let Some(name) = t.get("name").and_then(Value::as_str) else {
            continue;
        };
        let shortcode = name.trim_matches(':');
        if shortcode.is_empty() {
            continue;
        }
        let Some(image_url) = image_url_of(t.get("icon")) else {
            continue;
        };
        db.upsert_custom_emoji(shortcode, domain, &image_url)?;
    }
    Ok(())
}
