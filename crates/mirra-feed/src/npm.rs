//! Adapter for CouchDB-style `_changes` feeds (registry.npmjs.org).
//!
//! The upstream streams newline-delimited JSON of unbounded length; the
//! response body is decoded incrementally on a reader thread and handed
//! to the consumer through a bounded [`ChangePipe`], so memory stays
//! constant regardless of how far behind the cursor is.

use std::{io::Read as _, sync::Arc, thread};

use mirra_config::Registry;
use mirra_fetch::{classify, SHARED_AGENT};
use tracing::debug;
use ureq::typestate::WithoutBody;
use ureq::RequestBuilder;

use crate::{
    decoder::LineDecoder,
    error::{FeedError, Result},
    feed::{ChangeFeed, ChangePage, ChangeRecord, INITIAL_SINCE_BACKOFF},
    pipe::ChangePipe,
};

const PIPE_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

pub struct NpmFeed;

fn authorized(req: RequestBuilder<WithoutBody>, registry: &Registry) -> RequestBuilder<WithoutBody> {
    match &registry.auth_token {
        Some(token) => req.header("Authorization", &format!("Bearer {token}")),
        None => req,
    }
}

/// Reads the upstream's current sequence from the feed root document.
///
/// Accepts both a bare number and a stringified one; anything else means
/// the endpoint cannot serve as a cursor source.
pub(crate) fn fetch_update_seq(registry: &Registry) -> Result<u64> {
    let url = registry.changes_url.trim_end_matches('/').to_string();
    let resp = authorized(SHARED_AGENT.get(&url), registry)
        .call()
        .map_err(|err| classify(err, &url))?;
    let root: serde_json::Value = resp
        .into_body()
        .read_json()
        .map_err(|err| classify(err, &url))?;

    let seq = match root.get("update_seq") {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    seq.ok_or(FeedError::MissingSequence { url })
}

impl ChangeFeed for NpmFeed {
    fn initial_since(&self, registry: &Registry) -> Result<String> {
        let seq = fetch_update_seq(registry)?;
        Ok(seq.saturating_sub(INITIAL_SINCE_BACKOFF).to_string())
    }

    fn fetch_changes(&self, registry: &Registry, since: &str) -> Result<ChangePage> {
        let url = format!(
            "{}/_changes?since={since}",
            registry.changes_url.trim_end_matches('/')
        );
        debug!("Streaming changes from {url}");
        let resp = authorized(SHARED_AGENT.get(&url), registry)
            .call()
            .map_err(|err| classify(err, &url))?;

        let pipe = Arc::new(ChangePipe::new(PIPE_CAPACITY));
        let producer = pipe.clone();
        let boundary = since.to_string();
        let mut reader = resp.into_body().into_reader();

        thread::spawn(move || {
            let mut decoder = LineDecoder::new();
            let mut buffer = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buffer[..n]);
                        for record in decoder.push(&chunk) {
                            // The upstream may echo the boundary item back.
                            if record.sequence == boundary {
                                continue;
                            }
                            if !producer.push(Ok(record)) {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        producer.push(Err(mirra_fetch::FetchError::from(err).into()));
                        break;
                    }
                }
            }
            producer.close();
        });

        Ok(Box::new(NpmChangesIter { pipe }))
    }
}

/// Pulls decoded records off the pipe, resuming the paused producer
/// after each take.
struct NpmChangesIter {
    pipe: Arc<ChangePipe<Result<ChangeRecord>>>,
}

impl Iterator for NpmChangesIter {
    type Item = Result<ChangeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.pipe.pop();
        self.pipe.drain();
        item
    }
}

impl Drop for NpmChangesIter {
    fn drop(&mut self) {
        // An abandoned page must not leave the producer blocked.
        self.pipe.close();
    }
}
