//! Adapter for legacy cnpmjs.org change feeds.
//!
//! The cursor is a wall-clock millisecond timestamp, which is not
//! unique: many changes can share one timestamp. When a page comes back
//! full with identical first and last timestamps the cursor could not
//! advance past it, so the fetch is retried with a doubled limit until
//! the boundary timestamps differ or the limit cap is hit.

use chrono::{DateTime, Utc};
use mirra_config::Registry;
use mirra_fetch::{classify, SHARED_AGENT};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    error::{FeedError, Result},
    feed::{ChangeFeed, ChangePage, ChangeRecord, INITIAL_SINCE_BACKOFF},
};

const INITIAL_LIMIT: usize = 1000;
const MAX_LIMIT: usize = 16_000;

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    results: Vec<PageEntry>,
}

#[derive(Deserialize)]
struct PageEntry {
    #[serde(alias = "fullname")]
    id: String,
    gmt_modified: serde_json::Value,
}

/// Accepts both an epoch-millisecond number and an RFC 3339 string.
fn parse_modified(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s
            .parse::<DateTime<Utc>>()
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

pub struct CnpmjsonFeed;

impl CnpmjsonFeed {
    fn fetch_page(
        &self,
        registry: &Registry,
        since: &str,
        limit: usize,
    ) -> Result<Vec<(String, i64)>> {
        let url = format!(
            "{}?since={since}&limit={limit}",
            registry.changes_url.trim_end_matches('/')
        );
        debug!("Fetching change page from {url}");
        let mut req = SHARED_AGENT.get(&url);
        if let Some(token) = &registry.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req.call().map_err(|err| classify(err, &url))?;
        let page: Page = resp
            .into_body()
            .read_json()
            .map_err(|err| classify(err, &url))?;

        page.results
            .into_iter()
            .map(|entry| {
                let modified =
                    parse_modified(&entry.gmt_modified).ok_or_else(|| FeedError::MalformedPage {
                        url: url.clone(),
                        reason: format!("unparseable gmt_modified for '{}'", entry.id),
                    })?;
                Ok((entry.id, modified))
            })
            .collect()
    }
}

impl ChangeFeed for CnpmjsonFeed {
    fn initial_since(&self, registry: &Registry) -> Result<String> {
        let _ = registry;
        let backoff_ms = (INITIAL_SINCE_BACKOFF * 1000) as i64;
        Ok((Utc::now().timestamp_millis() - backoff_ms).to_string())
    }

    fn fetch_changes(&self, registry: &Registry, since: &str) -> Result<ChangePage> {
        let mut limit = INITIAL_LIMIT;
        let entries = loop {
            let entries = self.fetch_page(registry, since, limit)?;
            let full = entries.len() >= limit;
            let stuck = match (entries.first(), entries.last()) {
                (Some(first), Some(last)) => first.1 == last.1,
                _ => false,
            };
            if full && stuck {
                if limit >= MAX_LIMIT {
                    warn!(
                        "Change page from {} still uniform at limit {limit}; \
                         advancing anyway",
                        registry.name
                    );
                    break entries;
                }
                limit *= 2;
                continue;
            }
            break entries;
        };

        let boundary = since.to_string();
        let records: Vec<_> = entries
            .into_iter()
            .map(|(fullname, modified)| ChangeRecord {
                sequence: modified.to_string(),
                fullname,
            })
            .filter(|record| record.sequence != boundary)
            .map(Ok)
            .collect();
        Ok(Box::new(records.into_iter()))
    }
}
