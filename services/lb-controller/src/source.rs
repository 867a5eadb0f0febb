//! Routing-update event sources.
//!
//! A source hands out events in delivery order and redelivers everything
//! after the last acknowledged event on the next fetch.

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lbsync_events::RawEnvelope;
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;

/// At-least-once routing-update subscription.
#[async_trait]
pub trait EventSource: Send {
    /// Next batch of unacknowledged events, oldest first. Empty when caught
    /// up.
    async fn fetch(&mut self) -> Result<Vec<RawEnvelope>>;

    /// Acknowledge `event_id`; it is not delivered again.
    async fn ack(&mut self, event_id: i64) -> Result<()>;

    /// Last acknowledged event id (0 before the first acknowledgement).
    fn acknowledged(&self) -> i64;
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    items: Vec<RawEnvelope>,
    next_after_event_id: i64,
}

pub(crate) fn read_cursor(path: &Path) -> Result<i64> {
    if !path.exists() {
        return Ok(0);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read cursor file {}", path.display()))?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }

    trimmed
        .parse::<i64>()
        .with_context(|| format!("Invalid cursor in {}", path.display()))
}

pub(crate) fn write_cursor(path: &Path, cursor: i64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let tmp: PathBuf = path.with_extension("tmp");
    fs::write(&tmp, cursor.to_string())
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "Failed to move cursor file into place ({} -> {})",
            tmp.display(),
            path.display()
        )
    })?;

    Ok(())
}

/// Polls the routing-update feed over HTTP.
pub struct HttpEventSource {
    client: reqwest::Client,
    base_url: String,
    limit: i64,
    cursor: i64,
    cursor_file: Option<PathBuf>,
}

impl HttpEventSource {
    pub fn new(
        base_url: impl Into<String>,
        limit: i64,
        cursor_file: Option<PathBuf>,
    ) -> Result<Self> {
        let cursor = match &cursor_file {
            Some(path) => read_cursor(path)?,
            None => 0,
        };

        let client = reqwest::Client::builder()
            .user_agent(concat!("lbsync-controller/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            limit,
            cursor,
            cursor_file,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.events_url.clone(),
            config.fetch_limit,
            config.cursor_file.clone(),
        )
    }

    fn advance(&mut self, cursor: i64) -> Result<()> {
        if cursor <= self.cursor {
            return Ok(());
        }
        self.cursor = cursor;
        if let Some(path) = &self.cursor_file {
            write_cursor(path, cursor)?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn fetch(&mut self) -> Result<Vec<RawEnvelope>> {
        let base = self.base_url.trim_end_matches('/');
        let url = format!("{base}/v1/routing/events");

        let resp = self
            .client
            .get(url)
            .query(&[("after_event_id", self.cursor), ("limit", self.limit)])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "events query failed (status={}): {}",
                status,
                body
            ));
        }

        let resp = resp.json::<EventsResponse>().await?;
        debug!(
            cursor = self.cursor,
            count = resp.items.len(),
            next_after_event_id = resp.next_after_event_id,
            "fetched routing events"
        );

        // An empty page may still move the cursor past events the feed has
        // compacted away.
        if resp.items.is_empty() {
            self.advance(resp.next_after_event_id)?;
        }

        Ok(resp.items)
    }

    async fn ack(&mut self, event_id: i64) -> Result<()> {
        self.advance(event_id)
    }

    fn acknowledged(&self) -> i64 {
        self.cursor
    }
}

/// In-process source over a fixed queue of events, for tests and replays.
#[derive(Debug, Default)]
pub struct QueueEventSource {
    events: VecDeque<RawEnvelope>,
    acknowledged: i64,
    acks: Vec<i64>,
    fetches: usize,
}

impl QueueEventSource {
    pub fn new<I>(events: I) -> Self
    where
        I: IntoIterator<Item = RawEnvelope>,
    {
        Self {
            events: events.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, event: RawEnvelope) {
        self.events.push_back(event);
    }

    /// Acknowledged event ids, in acknowledgement order.
    pub fn acks(&self) -> &[i64] {
        &self.acks
    }

    /// Number of `fetch` calls so far.
    pub fn fetches(&self) -> usize {
        self.fetches
    }

    /// Events not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
impl EventSource for QueueEventSource {
    async fn fetch(&mut self) -> Result<Vec<RawEnvelope>> {
        self.fetches += 1;
        Ok(self.events.iter().cloned().collect())
    }

    async fn ack(&mut self, event_id: i64) -> Result<()> {
        self.events.retain(|e| e.event_id > event_id);
        self.acknowledged = self.acknowledged.max(event_id);
        self.acks.push(event_id);
        Ok(())
    }

    fn acknowledged(&self) -> i64 {
        self.acknowledged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cursor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("cursor");

        assert_eq!(read_cursor(&path).unwrap(), 0);
        write_cursor(&path, 42).unwrap();
        assert_eq!(read_cursor(&path).unwrap(), 42);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_invalid_cursor_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor");
        fs::write(&path, "not-a-number").unwrap();
        assert!(read_cursor(&path).is_err());
    }

    #[tokio::test]
    async fn test_queue_redelivers_until_acked() {
        let mut source = QueueEventSource::new([
            RawEnvelope::new(1, json!({})),
            RawEnvelope::new(2, json!({})),
        ]);

        assert_eq!(source.fetch().await.unwrap().len(), 2);
        source.ack(1).await.unwrap();

        let batch = source.fetch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_id, 2);
        assert_eq!(source.acknowledged(), 1);
        assert_eq!(source.fetches(), 2);
    }
}
