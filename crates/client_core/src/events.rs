use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{header::ACCEPT, Client};
use shared::{domain::SyncEvent, protocol::SYNC_EVENT_NAME};
use tracing::{debug, warn};
use url::Url;

pub type SyncEventStream = BoxStream<'static, SyncEvent>;

/// Push channel for channel sync events.
///
/// Dropping the returned stream cancels the subscription.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<SyncEventStream>;
}

pub struct SseEventSource {
    http: Client,
    url: Url,
}

impl SseEventSource {
    pub fn new(events_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), events_url)
    }

    pub fn with_client(http: Client, events_url: &str) -> Result<Self> {
        let url =
            Url::parse(events_url).with_context(|| format!("invalid events url '{events_url}'"))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn subscribe(&self) -> Result<SyncEventStream> {
        let response = self
            .http
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("failed to connect event stream: {}", self.url))?
            .error_for_status()?;

        let body = Box::pin(response.bytes_stream());
        let stream = futures::stream::unfold(
            (body, SseDecoder::default(), VecDeque::new()),
            |(mut body, mut decoder, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (body, decoder, pending)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(err)) => {
                            warn!("events: stream receive failed: {err}");
                            return None;
                        }
                        None => {
                            debug!("events: server closed the stream");
                            return None;
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

/// Incremental `text/event-stream` framing.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feeds raw bytes and returns every sync event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SyncEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SyncEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SyncEvent> {
        let event_name = self.event_name.take();
        let data = std::mem::take(&mut self.data);
        if data.is_empty() {
            return None;
        }

        if let Some(name) = event_name.as_deref() {
            if name != SYNC_EVENT_NAME && name != "message" {
                debug!(event = name, "events: skipping unrelated event");
                return None;
            }
        }

        let payload = data.join("\n");
        match serde_json::from_str::<SyncEvent>(&payload) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!("events: invalid sync event payload: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
