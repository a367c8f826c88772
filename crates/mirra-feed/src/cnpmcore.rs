//! Adapter for cnpmcore-style change feeds.
//!
//! Same integer-sequence cursor as the CouchDB family, but the page
//! arrives as one parsed JSON document rather than a stream, so no
//! incremental decoding is needed.

use mirra_config::Registry;
use mirra_fetch::{classify, SHARED_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::Result,
    feed::{ChangeFeed, ChangePage, ChangeRecord, INITIAL_SINCE_BACKOFF},
    npm::fetch_update_seq,
};

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    results: Vec<PageEntry>,
}

#[derive(Deserialize)]
struct PageEntry {
    seq: u64,
    #[serde(alias = "id")]
    fullname: String,
}

pub struct CnpmcoreFeed;

impl ChangeFeed for CnpmcoreFeed {
    fn initial_since(&self, registry: &Registry) -> Result<String> {
        let seq = fetch_update_seq(registry)?;
        Ok(seq.saturating_sub(INITIAL_SINCE_BACKOFF).to_string())
    }

    fn fetch_changes(&self, registry: &Registry, since: &str) -> Result<ChangePage> {
        let url = format!(
            "{}?since={since}",
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

        let boundary = since.to_string();
        let records: Vec<_> = page
            .results
            .into_iter()
            .map(|entry| ChangeRecord {
                sequence: entry.seq.to_string(),
                fullname: entry.fullname,
            })
            .filter(|record| record.sequence != boundary)
            .map(Ok)
            .collect();
        Ok(Box::new(records.into_iter()))
    }
}
