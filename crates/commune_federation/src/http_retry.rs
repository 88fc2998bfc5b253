/*
 * SPDX-FileCopyrightText: 2026 Commune Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

const BACKOFF_START: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const JITTER_MAX_MS: u64 = 200;

/// Transport-level retry for a single logical request. Retries connection
/// errors, 429 and 5xx with exponential backoff plus jitter. This is
/// independent of the delivery-row retry budget: one delivery attempt may
/// internally retry a few times before it counts as failed.
pub async fn send_with_retry<F>(mut build: F, attempts: u32) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = BACKOFF_START;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let last = attempt >= max_attempts;
        match build().send().await {
            Ok(resp) if retryable_status(resp.status()) && !last => {}
            Ok(resp) => return Ok(resp),
            Err(e) if last => return Err(e.into()),
            Err(_) => {}
        }
        let jitter = Duration::from_millis(thread_rng().gen_range(0..=JITTER_MAX_MS));
        tokio::time::sleep(backoff + jitter).await;
        backoff = backoff.saturating_mul(2).min(BACKOFF_CAP);
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
