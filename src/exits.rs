use crate::config::ExitHistoryConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::broadcast, time};

#[derive(Error, Debug)]
pub enum ExitFetchError {
    #[error("Exit fetch request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unexpected exit payload: {0}")]
    BadPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitSource {
    Push,
    Pull,
}

/// One departure event. Identity is the sorted name set plus the epoch
/// value; the same departure delivered over both the push stream and a
/// REST pull collapses into one entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExitLogEntry {
    pub names: Vec<String>,
    pub timestamp: String,
    pub epoch_ms: i64,
    #[serde(skip)]
    source: ExitSource,
}

impl ExitLogEntry {
    fn key(&self) -> String {
        format!("{}|{}", self.names.join(","), self.epoch_ms)
    }
}

/// Merges push-delivered and pull-fetched exit events into a deduplicated
/// history. Push entries (live) and pull entries (bulk history) are capped
/// independently, oldest evicted first.
pub struct ExitEventAggregator {
    config: ExitHistoryConfig,
    entries: Mutex<Vec<ExitLogEntry>>,
}

impl ExitEventAggregator {
    pub fn new(config: ExitHistoryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(Vec::new()),
        })
    }

    /// One entry per push payload, stamped with current wall-clock time.
    pub fn record_push(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut names: Vec<String> = names.to_vec();
        names.sort();
        self.insert(ExitLogEntry {
            names,
            timestamp: now.to_rfc3339(),
            epoch_ms: now.timestamp_millis(),
            source: ExitSource::Push,
        });
    }

    /// One entry per pulled (name, timestamp) pair, keyed by its own
    /// timestamp. A missing or unparseable timestamp falls back to now.
    pub fn record_pulled(&self, name: &str, iso_timestamp: Option<&str>) {
        let (timestamp, epoch_ms) = match iso_timestamp
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        {
            Some(parsed) => (
                iso_timestamp.unwrap_or_default().to_string(),
                parsed.timestamp_millis(),
            ),
            None => {
                let now = Utc::now();
                (now.to_rfc3339(), now.timestamp_millis())
            }
        };
        self.insert(ExitLogEntry {
            names: vec![name.to_string()],
            timestamp,
            epoch_ms,
            source: ExitSource::Pull,
        });
    }

    fn insert(&self, entry: ExitLogEntry) {
        let mut entries = self.entries.lock();
        let key = entry.key();
        if entries.iter().any(|existing| existing.key() == key) {
            return;
        }
        let source = entry.source;
        entries.push(entry);

        let cap = match source {
            ExitSource::Push => self.config.push_cap,
            ExitSource::Pull => self.config.pull_cap,
        };
        let count = entries.iter().filter(|e| e.source == source).count();
        if count > cap {
            // Evict the oldest entry of this class.
            if let Some(oldest) = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.source == source)
                .min_by_key(|(_, e)| e.epoch_ms)
                .map(|(i, _)| i)
            {
                entries.remove(oldest);
            }
        }
    }

    /// Retained history, newest first regardless of insertion order.
    pub fn entries(&self) -> Vec<ExitLogEntry> {
        let mut entries = self.entries.lock().clone();
        entries.sort_by(|a, b| b.epoch_ms.cmp(&a.epoch_ms));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Periodically pulls recent exits from the service's REST surface, plus a
/// full-history pull on shutdown. Both endpoints are idempotent, so fetch
/// failures are logged and retried on the next interval.
pub struct ExitPoller {
    base_url: String,
    client: reqwest::Client,
    aggregator: Arc<ExitEventAggregator>,
    poll_interval: Duration,
}

impl ExitPoller {
    pub fn new(
        base_url: String,
        poll_interval_secs: u64,
        aggregator: Arc<ExitEventAggregator>,
    ) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            aggregator,
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so startup
        // does not race the service coming up.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.fetch_recent().await {
                        tracing::warn!("recent exit pull failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        if let Err(e) = self.fetch_all().await {
            tracing::warn!("final exit pull failed: {}", e);
        }
        tracing::info!("exit poller stopped");
    }

    /// GET /get_exits — departures since the last poll.
    pub async fn fetch_recent(&self) -> Result<(), ExitFetchError> {
        let url = format!("{}/get_exits", self.base_url);
        let payload: serde_json::Value = self.client.get(url).send().await?.json().await?;
        self.ingest(&payload)
    }

    /// GET /get_all_exits — full departure history.
    pub async fn fetch_all(&self) -> Result<(), ExitFetchError> {
        let url = format!("{}/get_all_exits", self.base_url);
        let payload: serde_json::Value = self.client.get(url).send().await?.json().await?;
        self.ingest(&payload)
    }

    fn ingest(&self, payload: &serde_json::Value) -> Result<(), ExitFetchError> {
        for (name, timestamp) in parse_exit_items(payload)? {
            self.aggregator.record_pulled(&name, timestamp.as_deref());
        }
        Ok(())
    }
}

/// The service returns either bare names (recent exits) or
/// [name, isoTimestamp] pairs (full history); accept both shapes.
fn parse_exit_items(
    payload: &serde_json::Value,
) -> Result<Vec<(String, Option<String>)>, ExitFetchError> {
    let items = payload
        .get("exits")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| ExitFetchError::BadPayload("missing `exits` array".into()))?;

    let mut parsed = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::String(name) => parsed.push((name.clone(), None)),
            serde_json::Value::Array(pair) if pair.first().and_then(|n| n.as_str()).is_some() => {
                let name = pair[0].as_str().unwrap_or_default();
                let timestamp = pair.get(1).and_then(|t| t.as_str()).map(str::to_owned);
                parsed.push((name.to_string(), timestamp));
            }
            // One malformed item must not discard the rest of the batch.
            other => {
                tracing::warn!("skipping malformed exit item: {}", other);
            }
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggregator(push_cap: usize, pull_cap: usize) -> Arc<ExitEventAggregator> {
        ExitEventAggregator::new(ExitHistoryConfig {
            push_cap,
            pull_cap,
            poll_interval_secs: 10,
        })
    }

    fn pulled(agg: &ExitEventAggregator, name: &str, iso: &str) {
        agg.record_pulled(name, Some(iso));
    }

    #[test]
    fn test_duplicate_key_collapses() {
        let agg = aggregator(10, 10);
        pulled(&agg, "Alice", "2026-08-29T10:00:00+00:00");
        pulled(&agg, "Alice", "2026-08-29T10:00:00+00:00");
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_same_name_different_timestamp_kept() {
        let agg = aggregator(10, 10);
        pulled(&agg, "Alice", "2026-08-29T10:00:00+00:00");
        pulled(&agg, "Alice", "2026-08-29T10:01:00+00:00");
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn test_push_names_sorted_before_keying() {
        let agg = aggregator(10, 10);
        agg.record_push(&["Bob".into(), "Alice".into()]);
        let entries = agg.entries();
        assert_eq!(entries[0].names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_pull_cap_evicts_oldest_first() {
        let agg = aggregator(10, 2);
        pulled(&agg, "A", "2026-08-29T10:00:00+00:00");
        pulled(&agg, "B", "2026-08-29T10:01:00+00:00");
        pulled(&agg, "C", "2026-08-29T10:02:00+00:00");
        let entries = agg.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].names, vec!["C"]);
        assert_eq!(entries[1].names, vec!["B"]);
    }

    #[test]
    fn test_push_cap_does_not_evict_pull_entries() {
        let agg = aggregator(1, 10);
        pulled(&agg, "Historic", "2026-08-20T10:00:00+00:00");
        agg.record_push(&["Alice".into()]);
        agg.record_push(&["Bob".into()]);
        // Push cap of one drops the older push entry, pull survives.
        let entries = agg.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.names == vec!["Historic"]));
        assert!(entries.iter().any(|e| e.names == vec!["Bob"]));
    }

    #[test]
    fn test_entries_newest_first() {
        let agg = aggregator(10, 10);
        pulled(&agg, "Old", "2026-08-29T09:00:00+00:00");
        pulled(&agg, "New", "2026-08-29T11:00:00+00:00");
        pulled(&agg, "Mid", "2026-08-29T10:00:00+00:00");
        let order: Vec<_> = agg.entries().iter().map(|e| e.names[0].clone()).collect();
        assert_eq!(order, vec!["New", "Mid", "Old"]);
    }

    #[test]
    fn test_empty_push_is_ignored() {
        let agg = aggregator(10, 10);
        agg.record_push(&[]);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_parse_bare_names() {
        let payload = json!({"exits": ["Alice", "Bob"]});
        let items = parse_exit_items(&payload).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], ("Alice".to_string(), None));
    }

    #[test]
    fn test_parse_name_timestamp_pairs() {
        let payload = json!({"exits": [["Alice", "2026-08-29T10:00:00+05:30"]]});
        let items = parse_exit_items(&payload).unwrap();
        assert_eq!(
            items[0],
            (
                "Alice".to_string(),
                Some("2026-08-29T10:00:00+05:30".to_string())
            )
        );
    }

    #[test]
    fn test_parse_rejects_missing_exits() {
        let payload = json!({"something": []});
        assert!(parse_exit_items(&payload).is_err());
    }

    #[test]
    fn test_parse_skips_malformed_items_keeps_valid() {
        let payload = json!({"exits": [
            42,
            ["Alice", "2026-08-29T10:00:00+00:00"],
            [null, "2026-08-29T10:01:00+00:00"],
            "Bob"
        ]});
        let items = parse_exit_items(&payload).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, "Alice");
        assert_eq!(items[1].0, "Bob");
    }
}
