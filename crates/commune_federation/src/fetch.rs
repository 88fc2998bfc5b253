/*
 * SPDX-FileCopyrightText: 2026 Commune Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::http_retry::send_with_retry;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const ACCEPT_ACTIVITY: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// All reply-resolver and fetcher traffic runs under a fixed timeout so a
/// single slow remote instance cannot starve the worker pool.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

/// Fetches remote ActivityPub documents. Non-2xx and malformed JSON are
/// genuine errors here; callers decide whether to degrade or propagate.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch_actor(&self, uri: &str) -> Result<Value>;
    async fn fetch_object(&self, uri: &str) -> Result<Value>;
}

/// Plain authenticated-JSON GET against a remote instance REST endpoint.
#[async_trait]
pub trait JsonApi: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value>;
}

/// Accepts delivery-attempt jobs for asynchronous, at-least-once
/// execution.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, delivery_id: i64) -> Result<()>;
}

/// Ensures a local actor possesses a signing keypair. Key generation
/// itself lives outside this crate.
#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn ensure_keypair(&self, actor_id: i64) -> Result<()>;
}

/// Mastodon-compatible context lookup: descendants of a post, already
/// normalized.
#[async_trait]
pub trait StatusContextApi: Send + Sync {
    async fn fetch_status_context(&self, post_url: &str) -> Result<Vec<NormalizedStatus>>;
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedStatus {
    pub id: String,
    pub uri: String,
    pub url: Option<String>,
    pub content: Option<String>,
    pub account_url: Option<String>,
    pub created_at: Option<String>,
    pub in_reply_to_id: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub favourites_count: i64,
    pub reblogs_count: i64,
    pub replies_count: i64,
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    async fn fetch_activity_json(&self, uri: &str) -> Result<Value> {
        let resp = send_with_retry(|| self.client.get(uri).header(ACCEPT, ACCEPT_ACTIVITY), 3)
            .await
            .with_context(|| format!("fetch: {uri}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("fetch not ok: {uri} ({status})"));
        }
        let v: Value = resp
            .json()
            .await
            .with_context(|| format!("parse json from {uri}"))?;
        Ok(v)
    }
}

#[async_trait]
impl ObjectFetcher for HttpFetcher {
    async fn fetch_actor(&self, uri: &str) -> Result<Value> {
        self.fetch_activity_json(uri).await
    }

    async fn fetch_object(&self, uri: &str) -> Result<Value> {
        self.fetch_activity_json(uri).await
    }
}

#[derive(Clone)]
pub struct HttpJsonApi {
    client: reqwest::Client,
}

impl HttpJsonApi {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JsonApi for HttpJsonApi {
    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .with_context(|| format!("get: {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("get not ok: {url} ({status})"));
        }
        let v: Value = resp
            .json()
            .await
            .with_context(|| format!("parse json from {url}"))?;
        Ok(v)
    }
}

/// Context client for Mastodon-compatible servers: resolves the post on
/// its origin instance via the search API, then pulls the status context
/// and normalizes every descendant. Parent URIs are filled in from the
/// context itself (root, ancestors and descendants) since the REST shape
/// only carries local parent ids.
pub struct MastodonContextClient {
    api: Arc<dyn JsonApi>,
}

impl MastodonContextClient {
    pub fn new(api: Arc<dyn JsonApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl StatusContextApi for MastodonContextClient {
    async fn fetch_status_context(&self, post_url: &str) -> Result<Vec<NormalizedStatus>> {
        let host = host_of(post_url).ok_or_else(|| anyhow!("no host in {post_url}"))?;
        let search_url = format!(
            "https://{host}/api/v2/search?q={}&type=statuses&resolve=true&limit=1",
            urlencoding::encode(post_url)
        );
        let search = self.api.get_json(&search_url).await?;
        let root = search
            .get("statuses")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .ok_or_else(|| anyhow!("post not found on {host}"))?;
        let root_id = root
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("status without id"))?
            .to_string();
        let root_uri = root
            .get("uri")
            .and_then(Value::as_str)
            .unwrap_or(post_url)
            .to_string();

        let context_url = format!("https://{host}/api/v1/statuses/{root_id}/context");
        let context = self.api.get_json(&context_url).await?;
        let ancestors = context
            .get("ancestors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let descendants = context
            .get("descendants")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut uri_by_id: HashMap<String, String> = HashMap::new();
        uri_by_id.insert(root_id, root_uri);
        for s in ancestors.iter().chain(descendants.iter()) {
            if let (Some(id), Some(uri)) = (
                s.get("id").and_then(Value::as_str),
                s.get("uri").and_then(Value::as_str),
            ) {
                uri_by_id.insert(id.to_string(), uri.to_string());
            }
        }

        let mut out = Vec::new();
        for s in &descendants {
            if let Some(mut n) = normalize_status(s) {
                if n.in_reply_to_uri.is_none() {
                    n.in_reply_to_uri = n
                        .in_reply_to_id
                        .as_deref()
                        .and_then(|id| uri_by_id.get(id).cloned());
                }
                out.push(n);
            }
        }
        Ok(out)
    }
}

pub(crate) fn normalize_status(s: &Value) -> Option<NormalizedStatus> {
    let id = s.get("id").and_then(Value::as_str)?.to_string();
    let uri = s
        .get("uri")
        .and_then(Value::as_str)
        .or_else(|| s.get("url").and_then(Value::as_str))?
        .to_string();
    let account = s.get("account");
    Some(NormalizedStatus {
        id,
        uri,
        url: s.get("url").and_then(Value::as_str).map(str::to_string),
        content: s.get("content").and_then(Value::as_str).map(str::to_string),
        account_url: account
            .and_then(|a| a.get("url").and_then(Value::as_str).or_else(|| a.get("uri").and_then(Value::as_str)))
            .map(str::to_string),
        created_at: s.get("created_at").and_then(Value::as_str).map(str::to_string),
        in_reply_to_id: s
            .get("in_reply_to_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        in_reply_to_uri: s
            .get("pleroma")
            .and_then(|p| p.get("in_reply_to_ap_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        favourites_count: s.get("favourites_count").and_then(Value::as_i64).unwrap_or(0),
        reblogs_count: s.get("reblogs_count").and_then(Value::as_i64).unwrap_or(0),
        replies_count: s.get("replies_count").and_then(Value::as_i64).unwrap_or(0),
    })
}

pub(crate) fn host_of(url: &str) -> Option<String> {
    url.parse::<http::Uri>()
        .ok()
        .and_then(|u| u.host().map(|h| h.to_string()))
}
