/*
 * SPDX-FileCopyrightText: 2026 Commune Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::actor::parse_timestamp_ms;
use crate::fetch::{host_of, normalize_status, JsonApi, NormalizedStatus, ObjectFetcher, StatusContextApi};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Reply object types accepted from standard ActivityPub collections.
const REPLY_TYPES: [&str; 3] = ["Note", "Article", "Page"];

/// Flat, normalized representation of one reply, whichever remote API it
/// came from.
#[derive(Debug, Clone, Default)]
pub struct ReplyObject {
    pub id: String,
    pub object_type: String,
    pub url: Option<String>,
    pub content: Option<String>,
    pub attributed_to: Option<String>,
    pub published_ms: Option<i64>,
    pub in_reply_to: Option<String>,
    pub score: Option<i64>,
    pub upvotes: Option<i64>,
    pub downvotes: Option<i64>,
    pub favourites_count: Option<i64>,
    pub boosts_count: Option<i64>,
    pub replies_count: Option<i64>,
}

/// Reconstructs reply lists for remote posts across incompatible remote
/// APIs: standard ActivityPub collections, the Lemmy-family comment API,
/// the Mastodon context API and the Pleroma/Akkoma search+context API,
/// in that order. Best-effort: any failure anywhere degrades to an empty
/// list, never an error.
pub struct ReplyResolver {
    fetcher: Arc<dyn ObjectFetcher>,
    context_api: Arc<dyn StatusContextApi>,
    api: Arc<dyn JsonApi>,
}

impl ReplyResolver {
    pub fn new(
        fetcher: Arc<dyn ObjectFetcher>,
        context_api: Arc<dyn StatusContextApi>,
        api: Arc<dyn JsonApi>,
    ) -> Self {
        Self { fetcher, context_api, api }
    }

    pub async fn resolve_replies(&self, post: &Value, limit: u32) -> Vec<ReplyObject> {
        let post_url = post_url_of(post);
        let post_type = post.get("type").and_then(Value::as_str).unwrap_or("");
        let expected = expected_replies(post);
        let is_community_post = post_type == "Page"
            && post_url
                .as_deref()
                .and_then(parse_community_post_url)
                .is_some();

        if let Some(collection_url) = replies_url_of(post) {
            let mut replies = self.standard_collection(&collection_url, limit).await;
            if !replies.is_empty() {
                replies.truncate(limit as usize);
                return replies;
            }
            // The collection exists but came back empty. If the post
            // itself claims replies, a platform API may still have them.
            if expected > 0 && is_community_post {
                if let Some(url) = post_url.as_deref() {
                    return self.community_then_context(post, url, limit).await;
                }
            }
            if expected > 0 {
                if let Some(url) = post_url.as_deref() {
                    return self.context_then_search(url, limit).await;
                }
            }
            return replies;
        }

        if is_community_post {
            if let Some(url) = post_url.as_deref() {
                return self.community_then_context(post, url, limit).await;
            }
        }
        if expected > 0 {
            if let Some(url) = post_url.as_deref() {
                return self.context_then_search(url, limit).await;
            }
        }
        Vec::new()
    }

    async fn community_then_context(&self, post: &Value, post_url: &str, limit: u32) -> Vec<ReplyObject> {
        let replies = self.community_comments(post, post_url, limit).await;
        if !replies.is_empty() {
            return replies;
        }
        self.context_then_search(post_url, limit).await
    }

    async fn context_then_search(&self, post_url: &str, limit: u32) -> Vec<ReplyObject> {
        let replies = self.mastodon_context(post_url, limit).await;
        if !replies.is_empty() {
            return replies;
        }
        self.pleroma_search_context(post_url, limit).await
    }

    /// Branch 1: the post's own `replies`/`comments` collection.
    async fn standard_collection(&self, collection_url: &str, limit: u32) -> Vec<ReplyObject> {
        let doc = match self.fetcher.fetch_object(collection_url).await {
            Ok(v) => v,
            Err(e) => {
                debug!("replies collection fetch failed: {e:#}");
                return Vec::new();
            }
        };

        let mut items = collection_items(&doc);
        if items.is_empty() {
            items = self.first_page_items(&doc).await;
        }

        let mut out = Vec::new();
        for item in items {
            if out.len() >= limit as usize {
                break;
            }
            let obj = match &item {
                Value::String(uri) => match self.fetcher.fetch_object(uri).await {
                    Ok(v) => v,
                    Err(_) => continue,
                },
                v => unwrap_object(v),
            };
            let ty = obj.get("type").and_then(Value::as_str).unwrap_or("");
            if !REPLY_TYPES.contains(&ty) {
                continue;
            }
            if let Some(reply) = reply_from_ap_object(&obj) {
                out.push(reply);
            }
        }
        out
    }

    async fn first_page_items(&self, collection: &Value) -> Vec<Value> {
        let Some(first) = collection.get("first") else {
            return Vec::new();
        };
        let page = match first {
            Value::String(url) => match self.fetcher.fetch_object(url).await {
                Ok(v) => v,
                Err(_) => return Vec::new(),
            },
            v @ Value::Object(_) => v.clone(),
            _ => return Vec::new(),
        };
        let items = collection_items(&page);
        if !items.is_empty() {
            return items;
        }
        if let Some(next) = page.get("next").and_then(Value::as_str) {
            if let Ok(v) = self.fetcher.fetch_object(next).await {
                return collection_items(&v);
            }
        }
        Vec::new()
    }

    /// Branch 2: the Lemmy/PieFed/Mbin comment API, with the community's
    /// home instance as a second try when the origin has no comments.
    async fn community_comments(&self, post: &Value, post_url: &str, limit: u32) -> Vec<ReplyObject> {
        let Some(host) = host_of(post_url) else {
            return Vec::new();
        };
        let post_id = match parse_community_post_url(post_url) {
            Some((_, id)) => Some(id),
            None => self.resolve_post_id(&host, post_url).await,
        };
        let Some(post_id) = post_id else {
            return Vec::new();
        };

        let mut replies = self.fetch_comment_list(&host, post_id, post_url, limit).await;
        if replies.is_empty() {
            if let Some(home) = audience_host(post) {
                if home != host {
                    if let Some(home_post_id) = self.resolve_post_id(&home, post_url).await {
                        replies = self
                            .fetch_comment_list(&home, home_post_id, post_url, limit)
                            .await;
                    }
                }
            }
        }
        replies
    }

    async fn resolve_post_id(&self, host: &str, post_url: &str) -> Option<u64> {
        let url = format!(
            "https://{host}/api/v3/resolve_object?q={}",
            urlencoding::encode(post_url)
        );
        let v = self.api.get_json(&url).await.ok()?;
        let resp: ResolveObjectResponse = serde_json::from_value(v).ok()?;
        Some(resp.post?.post.id)
    }

    async fn fetch_comment_list(
        &self,
        host: &str,
        post_id: u64,
        post_url: &str,
        limit: u32,
    ) -> Vec<ReplyObject> {
        let url = format!("https://{host}/api/v3/comment/list?post_id={post_id}&limit={limit}&sort=Top");
        let v = match self.api.get_json(&url).await {
            Ok(v) => v,
            Err(e) => {
                debug!("comment list fetch failed: {e:#}");
                return Vec::new();
            }
        };
        let resp: CommentListResponse = match serde_json::from_value(v) {
            Ok(r) => r,
            Err(e) => {
                debug!("comment list shape mismatch on {host}: {e:#}");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for entry in resp.comments.into_iter().take(limit as usize) {
            let Some(comment) = entry.comment else {
                continue;
            };
            let Some(ap_id) = comment.ap_id else {
                continue;
            };
            let counts = entry.counts.unwrap_or_default();
            out.push(ReplyObject {
                id: ap_id.clone(),
                object_type: "Note".to_string(),
                url: Some(ap_id),
                content: comment.content,
                attributed_to: entry.creator.and_then(|c| c.actor_id),
                published_ms: comment.published.as_deref().and_then(parse_timestamp_ms),
                // The materialized `path` only carries local ancestor ids,
                // not AP URIs, so nested comments link to the post itself.
                in_reply_to: Some(post_url.to_string()),
                score: counts.score,
                upvotes: counts.upvotes,
                downvotes: counts.downvotes,
                ..Default::default()
            });
        }
        out
    }

    /// Branch 3: the Mastodon-compatible context API via the normalized
    /// client.
    async fn mastodon_context(&self, post_url: &str, limit: u32) -> Vec<ReplyObject> {
        let statuses = match self.context_api.fetch_status_context(post_url).await {
            Ok(s) => s,
            Err(e) => {
                debug!("status context fetch failed: {e:#}");
                return Vec::new();
            }
        };
        statuses
            .into_iter()
            .take(limit as usize)
            .map(|n| {
                let in_reply_to = match &n.in_reply_to_uri {
                    Some(parent) if parent != post_url => Some(parent.clone()),
                    _ => Some(post_url.to_string()),
                };
                reply_from_status(n, in_reply_to)
            })
            .collect()
    }

    /// Branch 4: Pleroma/Akkoma search+context. Builds a local-id to
    /// canonical-URI lookup over the whole thread so descendant parents
    /// resolve even when the REST shape only carries local ids.
    async fn pleroma_search_context(&self, post_url: &str, limit: u32) -> Vec<ReplyObject> {
        let Some(host) = host_of(post_url) else {
            return Vec::new();
        };
        let search_url = format!(
            "https://{host}/api/v2/search?q={}&type=statuses&resolve=true&limit=1",
            urlencoding::encode(post_url)
        );
        let Ok(search) = self.api.get_json(&search_url).await else {
            return Vec::new();
        };
        let Some(root) = search
            .get("statuses")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
        else {
            return Vec::new();
        };
        let Some(root_id) = root.get("id").and_then(Value::as_str) else {
            return Vec::new();
        };
        let root_uri = root
            .get("uri")
            .and_then(Value::as_str)
            .unwrap_or(post_url)
            .to_string();

        let context_url = format!("https://{host}/api/v1/statuses/{root_id}/context");
        let Ok(context) = self.api.get_json(&context_url).await else {
            return Vec::new();
        };
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
        uri_by_id.insert(root_id.to_string(), root_uri);
        for s in ancestors.iter().chain(descendants.iter()) {
            if let (Some(id), Some(uri)) = (
                s.get("id").and_then(Value::as_str),
                s.get("uri").and_then(Value::as_str),
            ) {
                uri_by_id.insert(id.to_string(), uri.to_string());
            }
        }

        let mut out = Vec::new();
        for d in descendants.iter().take(limit as usize) {
            let Some(n) = normalize_status(d) else {
                continue;
            };
            // Parent priority: direct-URI extension field, then the
            // id lookup, then the root post as a last resort when a
            // parent is known to exist but cannot be resolved.
            let in_reply_to = n
                .in_reply_to_uri
                .clone()
                .or_else(|| {
                    n.in_reply_to_id
                        .as_deref()
                        .and_then(|id| uri_by_id.get(id).cloned())
                })
                .or_else(|| n.in_reply_to_id.as_ref().map(|_| post_url.to_string()));
            out.push(reply_from_status(n, in_reply_to));
        }
        out
    }
}

/// Stable REST shapes of the Lemmy-family endpoints, trimmed to the
/// fields this resolver consumes. Every field is optional so one
/// malformed entry never discards the whole response.
#[derive(Debug, Deserialize)]
struct CommentListResponse {
    #[serde(default)]
    comments: Vec<CommentEntry>,
}

#[derive(Debug, Deserialize)]
struct CommentEntry {
    comment: Option<CommentFields>,
    creator: Option<CommentCreator>,
    counts: Option<CommentCounts>,
}

#[derive(Debug, Deserialize)]
struct CommentFields {
    ap_id: Option<String>,
    content: Option<String>,
    published: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentCreator {
    actor_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CommentCounts {
    score: Option<i64>,
    upvotes: Option<i64>,
    downvotes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ResolveObjectResponse {
    post: Option<ResolvedPostView>,
}

#[derive(Debug, Deserialize)]
struct ResolvedPostView {
    post: ResolvedPost,
}

#[derive(Debug, Deserialize)]
struct ResolvedPost {
    id: u64,
}

fn reply_from_status(n: NormalizedStatus, in_reply_to: Option<String>) -> ReplyObject {
    ReplyObject {
        id: n.uri.clone(),
        object_type: "Note".to_string(),
        url: n.url.or(Some(n.uri)),
        content: n.content,
        attributed_to: n.account_url,
        published_ms: n.created_at.as_deref().and_then(parse_timestamp_ms),
        in_reply_to,
        favourites_count: Some(n.favourites_count),
        boosts_count: Some(n.reblogs_count),
        replies_count: Some(n.replies_count),
        ..Default::default()
    }
}

fn reply_from_ap_object(obj: &Value) -> Option<ReplyObject> {
    let id = obj.get("id").and_then(Value::as_str)?.to_string();
    Some(ReplyObject {
        id: id.clone(),
        object_type: obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Note")
            .to_string(),
        url: link_of(obj.get("url")).or(Some(id)),
        content: obj.get("content").and_then(Value::as_str).map(str::to_string),
        attributed_to: link_of(obj.get("attributedTo")),
        published_ms: obj
            .get("published")
            .and_then(Value::as_str)
            .and_then(parse_timestamp_ms),
        in_reply_to: link_of(obj.get("inReplyTo")),
        ..Default::default()
    })
}

fn unwrap_object(v: &Value) -> Value {
    match v.get("object") {
        Some(inner @ Value::Object(_)) => inner.clone(),
        _ => v.clone(),
    }
}

fn collection_items(doc: &Value) -> Vec<Value> {
    for field in ["orderedItems", "items"] {
        if let Some(items) = doc.get(field).and_then(Value::as_array) {
            if !items.is_empty() {
                return items.clone();
            }
        }
    }
    Vec::new()
}

/// Highest reply count the post itself claims, across the field variants
/// different platforms emit. Unparsable values count as zero.
pub(crate) fn expected_replies(post: &Value) -> i64 {
    let direct = coerce_count(post.get("repliesCount"));
    let replies_total = coerce_count(post.get("replies").and_then(|r| r.get("totalItems")));
    let comments_total = coerce_count(post.get("comments").and_then(|c| c.get("totalItems")));
    direct.max(replies_total).max(comments_total)
}

fn coerce_count(v: Option<&Value>) -> i64 {
    let n = match v {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };
    n.max(0)
}

/// The replies collection URL: `replies` or `comments`, each a bare URL,
/// an object with `id`, or an object with a `first` page reference.
pub(crate) fn replies_url_of(post: &Value) -> Option<String> {
    for field in ["replies", "comments"] {
        let url = match post.get(field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(o)) => o
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| link_of(o.get("first"))),
            _ => None,
        };
        if url.is_some() {
            return url;
        }
    }
    None
}

fn link_of(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| o.get("href").and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn post_url_of(post: &Value) -> Option<String> {
    match post.get("url") {
        Some(Value::Array(a)) => a.iter().find_map(|v| link_of(Some(v))),
        other => link_of(other),
    }
    .or_else(|| post.get("id").and_then(Value::as_str).map(str::to_string))
}

fn audience_host(post: &Value) -> Option<String> {
    link_of(post.get("audience")).as_deref().and_then(host_of)
}

/// Community-software post URL patterns: `/post/<id>` (Lemmy),
/// `/c/<name>/p/<id>` (PieFed), `/m/<name>/p/<id>` and `/m/<name>/t/<id>`
/// (Mbin). Returns the origin domain and the local numeric post id.
pub(crate) fn parse_community_post_url(url: &str) -> Option<(String, u64)> {
    let parsed: http::Uri = url.parse().ok()?;
    let host = parsed.host()?.to_string();
    let segments: Vec<&str> = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let id = match segments.as_slice() {
        ["post", id] => id,
        ["c", _, "p", id] => id,
        ["m", _, "p" | "t", id] => id,
        _ => return None,
    };
    id.parse().ok().map(|id| (host, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockFetcher {
        docs: HashMap<String, Value>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ObjectFetcher for MockFetcher {
        async fn fetch_actor(&self, uri: &str) -> Result<Value> {
            self.fetch_object(uri).await
        }

        async fn fetch_object(&self, uri: &str) -> Result<Value> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.docs
                .get(uri)
                .cloned()
                .ok_or_else(|| anyhow!("fetch not ok: {uri} (404)"))
        }
    }

    #[derive(Default)]
    struct MockApi {
        responses: HashMap<String, Value>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JsonApi for MockApi {
        async fn get_json(&self, url: &str) -> Result<Value> {
            self.calls.lock().unwrap().push(url.to_string());
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow!("get not ok: {url} (404)"))
        }
    }

    #[derive(Default)]
    struct MockContext {
        statuses: Vec<NormalizedStatus>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatusContextApi for MockContext {
        async fn fetch_status_context(&self, _post_url: &str) -> Result<Vec<NormalizedStatus>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.statuses.clone())
        }
    }

    fn resolver(
        fetcher: MockFetcher,
        context: MockContext,
        api: MockApi,
    ) -> (Arc<MockFetcher>, Arc<MockContext>, Arc<MockApi>, ReplyResolver) {
        let fetcher = Arc::new(fetcher);
        let context = Arc::new(context);
        let api = Arc::new(api);
        let r = ReplyResolver::new(fetcher.clone(), context.clone(), api.clone());
        (fetcher, context, api, r)
    }

    #[tokio::test]
    async fn degrades_to_empty_without_any_network_call() {
        let post = json!({
            "id": "https://plain.example/notes/1",
            "type": "Note",
            "url": "https://plain.example/notes/1"
        });
        let (fetcher, context, api, r) = resolver(Default::default(), Default::default(), Default::default());
        let replies = r.resolve_replies(&post, 20).await;
        assert!(replies.is_empty());
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(context.calls.load(Ordering::SeqCst), 0);
        assert!(api.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn standard_collection_accepts_all_item_shapes() {
        let mut fetcher = MockFetcher::default();
        fetcher.docs.insert(
            "https://a.example/notes/1/replies".to_string(),
            json!({
                "type": "Collection",
                "orderedItems": [
                    {"id": "https://a.example/notes/2", "type": "Note", "content": "inline",
                     "attributedTo": "https://a.example/u/bob", "inReplyTo": "https://a.example/notes/1"},
                    {"object": {"id": "https://a.example/notes/3", "type": "Article", "content": "wrapped"}},
                    "https://a.example/notes/4",
                    {"id": "https://a.example/likes/9", "type": "Like"}
                ]
            }),
        );
        fetcher.docs.insert(
            "https://a.example/notes/4".to_string(),
            json!({"id": "https://a.example/notes/4", "type": "Note", "content": "fetched"}),
        );
        let post = json!({
            "id": "https://a.example/notes/1",
            "type": "Note",
            "replies": "https://a.example/notes/1/replies"
        });
        let (_f, _c, _a, r) = resolver(fetcher, Default::default(), Default::default());
        let replies = r.resolve_replies(&post, 20).await;
        let ids: Vec<&str> = replies.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "https://a.example/notes/2",
                "https://a.example/notes/3",
                "https://a.example/notes/4"
            ]
        );
        assert_eq!(replies[0].attributed_to.as_deref(), Some("https://a.example/u/bob"));
        assert_eq!(replies[0].in_reply_to.as_deref(), Some("https://a.example/notes/1"));
    }

    #[tokio::test]
    async fn empty_collection_chases_first_page() {
        let mut fetcher = MockFetcher::default();
        fetcher.docs.insert(
            "https://a.example/notes/1/replies".to_string(),
            json!({"type": "Collection", "first": "https://a.example/notes/1/replies?page=1"}),
        );
        fetcher.docs.insert(
            "https://a.example/notes/1/replies?page=1".to_string(),
            json!({"items": [{"id": "https://a.example/notes/2", "type": "Note"}]}),
        );
        let post = json!({
            "id": "https://a.example/notes/1",
            "type": "Note",
            "replies": {"id": "https://a.example/notes/1/replies"}
        });
        let (_f, _c, _a, r) = resolver(fetcher, Default::default(), Default::default());
        let replies = r.resolve_replies(&post, 20).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, "https://a.example/notes/2");
    }

    #[tokio::test]
    async fn community_post_with_empty_collection_tries_comment_api() {
        let mut fetcher = MockFetcher::default();
        fetcher.docs.insert(
            "https://lemmy.example/post/123/replies".to_string(),
            json!({"type": "Collection", "orderedItems": []}),
        );
        let mut api = MockApi::default();
        api.responses.insert(
            "https://lemmy.example/api/v3/comment/list?post_id=123&limit=20&sort=Top".to_string(),
            json!({
                "comments": [
                    {
                        "comment": {
                            "id": 7,
                            "ap_id": "https://lemmy.example/comment/7",
                            "content": "top comment",
                            "path": "0.7",
                            "published": "2026-02-01T10:00:00Z"
                        },
                        "creator": {"actor_id": "https://lemmy.example/u/carol"},
                        "counts": {"score": 12, "upvotes": 13, "downvotes": 1}
                    },
                    {
                        "comment": {
                            "id": 8,
                            "ap_id": "https://lemmy.example/comment/8",
                            "content": "nested",
                            "path": "0.7.8"
                        },
                        "creator": {"actor_id": "https://lemmy.example/u/dave"},
                        "counts": {"score": 3, "upvotes": 3, "downvotes": 0}
                    }
                ]
            }),
        );
        let post = json!({
            "id": "https://lemmy.example/post/123",
            "type": "Page",
            "url": "https://lemmy.example/post/123",
            "repliesCount": 3,
            "replies": "https://lemmy.example/post/123/replies"
        });
        let (_f, _c, api, r) = resolver(fetcher, Default::default(), api);
        let replies = r.resolve_replies(&post, 20).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, "https://lemmy.example/comment/7");
        assert_eq!(replies[0].score, Some(12));
        assert_eq!(replies[0].upvotes, Some(13));
        assert_eq!(replies[0].attributed_to.as_deref(), Some("https://lemmy.example/u/carol"));
        // Direct and nested comments both link to the post itself.
        assert_eq!(replies[0].in_reply_to.as_deref(), Some("https://lemmy.example/post/123"));
        assert_eq!(replies[1].in_reply_to.as_deref(), Some("https://lemmy.example/post/123"));

        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["https://lemmy.example/api/v3/comment/list?post_id=123&limit=20&sort=Top".to_string()]
        );
    }

    #[tokio::test]
    async fn comment_entries_missing_fields_are_skipped() {
        let mut api = MockApi::default();
        api.responses.insert(
            "https://lemmy.example/api/v3/comment/list?post_id=44&limit=20&sort=Top".to_string(),
            json!({
                "comments": [
                    {"counts": {"score": 5}},
                    {"comment": {"id": 2, "content": "no ap_id"}},
                    {"comment": {"ap_id": "https://lemmy.example/comment/3", "content": "kept"}}
                ]
            }),
        );
        let post = json!({
            "id": "https://lemmy.example/post/44",
            "type": "Page",
            "url": "https://lemmy.example/post/44"
        });
        let (_f, _c, _a, r) = resolver(Default::default(), Default::default(), api);
        let replies = r.resolve_replies(&post, 20).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, "https://lemmy.example/comment/3");
        assert_eq!(replies[0].content.as_deref(), Some("kept"));
        assert!(replies[0].score.is_none());
    }

    #[tokio::test]
    async fn zero_origin_comments_retries_on_home_instance() {
        let mut api = MockApi::default();
        api.responses.insert(
            "https://mirror.example/api/v3/comment/list?post_id=55&limit=10&sort=Top".to_string(),
            json!({"comments": []}),
        );
        api.responses.insert(
            "https://home.example/api/v3/resolve_object?q=https%3A%2F%2Fmirror.example%2Fpost%2F55".to_string(),
            json!({"post": {"post": {"id": 909}}}),
        );
        api.responses.insert(
            "https://home.example/api/v3/comment/list?post_id=909&limit=10&sort=Top".to_string(),
            json!({
                "comments": [{
                    "comment": {"ap_id": "https://home.example/comment/1", "content": "hi", "path": "0.1"},
                    "creator": {"actor_id": "https://home.example/u/erin"},
                    "counts": {"score": 1, "upvotes": 1, "downvotes": 0}
                }]
            }),
        );
        let post = json!({
            "id": "https://mirror.example/post/55",
            "type": "Page",
            "url": "https://mirror.example/post/55",
            "audience": "https://home.example/c/rust"
        });
        let (_f, _c, api, r) = resolver(Default::default(), Default::default(), api);
        let replies = r.resolve_replies(&post, 10).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, "https://home.example/comment/1");

        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "https://mirror.example/api/v3/comment/list?post_id=55&limit=10&sort=Top".to_string(),
                "https://home.example/api/v3/resolve_object?q=https%3A%2F%2Fmirror.example%2Fpost%2F55".to_string(),
                "https://home.example/api/v3/comment/list?post_id=909&limit=10&sort=Top".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn falls_back_to_mastodon_context() {
        let context = MockContext {
            statuses: vec![NormalizedStatus {
                id: "22".to_string(),
                uri: "https://masto.example/users/bob/statuses/22".to_string(),
                content: Some("<p>reply</p>".to_string()),
                account_url: Some("https://masto.example/@bob".to_string()),
                created_at: Some("2026-02-01T10:00:00Z".to_string()),
                in_reply_to_id: Some("21".to_string()),
                favourites_count: 4,
                ..Default::default()
            }],
            ..Default::default()
        };
        let post = json!({
            "id": "https://masto.example/users/alice/statuses/21",
            "type": "Note",
            "url": "https://masto.example/@alice/21",
            "repliesCount": 1
        });
        let (_f, context, _a, r) = resolver(Default::default(), context, Default::default());
        let replies = r.resolve_replies(&post, 20).await;
        assert_eq!(context.calls.load(Ordering::SeqCst), 1);
        assert_eq!(replies.len(), 1);
        // No parent URI supplied: treated as a direct reply to the post.
        assert_eq!(replies[0].in_reply_to.as_deref(), Some("https://masto.example/@alice/21"));
        assert_eq!(replies[0].favourites_count, Some(4));
    }

    #[tokio::test]
    async fn empty_context_falls_through_to_search_api() {
        let mut api = MockApi::default();
        api.responses.insert(
            "https://pleroma.example/api/v2/search?q=https%3A%2F%2Fpleroma.example%2Fobjects%2Fabc&type=statuses&resolve=true&limit=1".to_string(),
            json!({"statuses": [{"id": "100", "uri": "https://pleroma.example/objects/abc"}]}),
        );
        api.responses.insert(
            "https://pleroma.example/api/v1/statuses/100/context".to_string(),
            json!({
                "ancestors": [],
                "descendants": [
                    {
                        "id": "101",
                        "uri": "https://pleroma.example/objects/def",
                        "content": "first",
                        "in_reply_to_id": "100",
                        "account": {"url": "https://pleroma.example/users/frank"}
                    },
                    {
                        "id": "102",
                        "uri": "https://pleroma.example/objects/ghi",
                        "content": "second",
                        "in_reply_to_id": "101"
                    },
                    {
                        "id": "103",
                        "uri": "https://pleroma.example/objects/jkl",
                        "content": "orphan",
                        "in_reply_to_id": "999"
                    }
                ]
            }),
        );
        let post = json!({
            "id": "https://pleroma.example/objects/abc",
            "type": "Note",
            "url": "https://pleroma.example/objects/abc",
            "repliesCount": 3
        });
        let (_f, _c, _a, r) = resolver(Default::default(), Default::default(), api);
        let replies = r.resolve_replies(&post, 20).await;
        assert_eq!(replies.len(), 3);
        // Parent resolved through the id lookup: root, then sibling.
        assert_eq!(replies[0].in_reply_to.as_deref(), Some("https://pleroma.example/objects/abc"));
        assert_eq!(replies[1].in_reply_to.as_deref(), Some("https://pleroma.example/objects/def"));
        // Unresolvable parent id: root post as last resort.
        assert_eq!(replies[2].in_reply_to.as_deref(), Some("https://pleroma.example/objects/abc"));
    }

    #[test]
    fn expected_replies_takes_the_maximum() {
        assert_eq!(
            expected_replies(&json!({
                "repliesCount": 2,
                "replies": {"totalItems": 5},
                "comments": {"totalItems": "3"}
            })),
            5
        );
        assert_eq!(expected_replies(&json!({"repliesCount": "bogus"})), 0);
        assert_eq!(expected_replies(&json!({"repliesCount": -4})), 0);
        assert_eq!(expected_replies(&json!({})), 0);
    }

    #[test]
    fn replies_url_accepts_every_shape() {
        assert_eq!(
            replies_url_of(&json!({"replies": "https://x.example/r"})).as_deref(),
            Some("https://x.example/r")
        );
        assert_eq!(
            replies_url_of(&json!({"replies": {"id": "https://x.example/r"}})).as_deref(),
            Some("https://x.example/r")
        );
        assert_eq!(
            replies_url_of(&json!({"replies": {"first": "https://x.example/r?page=1"}})).as_deref(),
            Some("https://x.example/r?page=1")
        );
        assert_eq!(
            replies_url_of(&json!({"comments": {"id": "https://x.example/c"}})).as_deref(),
            Some("https://x.example/c")
        );
        assert!(replies_url_of(&json!({})).is_none());
    }

    #[test]
    fn community_url_patterns() {
        assert_eq!(
            parse_community_post_url("https://lemmy.example/post/123"),
            Some(("lemmy.example".to_string(), 123))
        );
        assert_eq!(
            parse_community_post_url("https://piefed.example/c/rust/p/55"),
            Some(("piefed.example".to_string(), 55))
        );
        assert_eq!(
            parse_community_post_url("https://mbin.example/m/tech/p/7"),
            Some(("mbin.example".to_string(), 7))
        );
        assert_eq!(
            parse_community_post_url("https://mbin.example/m/tech/t/9"),
            Some(("mbin.example".to_string(), 9))
        );
        assert!(parse_community_post_url("https://masto.example/@alice/1").is_none());
        assert!(parse_community_post_url("https://lemmy.example/post/abc").is_none());
    }
}
