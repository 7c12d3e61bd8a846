//! In-memory collaborators shared by the coordinator tests.

use std::{
    collections::HashMap,
    fmt::Debug,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{Stream, StreamExt};
use shared::domain::{Channel, ChannelId, Message, MessageId, SyncEvent, UserId};
use storage::LocalStore;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    channel_list::ChannelListObserver,
    events::{EventSource, SyncEventStream},
    remote::RemoteClient,
    view::UpdateStream,
};

pub(crate) fn at(day: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 10, minute, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn channel(id: &str, activity: Option<DateTime<Utc>>) -> Channel {
    let mut channel = Channel::new(id, format!("#{id}"));
    channel.last_activity = activity;
    channel.last_message = activity.map(|_| format!("latest in {id}"));
    channel
}

pub(crate) fn message(id: &str, channel_id: &str, author: &str, timestamp: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::new(id),
        channel_id: ChannelId::new(channel_id),
        text: format!("text of {id}"),
        author_id: UserId::new(author),
        author_name: author.to_uppercase(),
        timestamp,
    }
}

pub(crate) fn ids<'a>(channels: impl IntoIterator<Item = &'a Channel>) -> Vec<&'a str> {
    channels.into_iter().map(|c| c.id.as_str()).collect()
}

/// Next update, failing the test instead of hanging.
pub(crate) async fn next_update<T>(updates: &mut UpdateStream<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("timed out waiting for update")
        .expect("update stream ended")
}

pub(crate) async fn assert_quiet<T: Debug>(updates: &mut UpdateStream<T>, wait: Duration) {
    if let Ok(Some(update)) = tokio::time::timeout(wait, updates.next()).await {
        panic!("unexpected update: {update:?}");
    }
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Default)]
struct MemoryState {
    channels: Vec<Channel>,
    messages: HashMap<ChannelId, Vec<Message>>,
}

/// Cache double with counters and a failure switch.
#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
    pub(crate) channel_writes: AtomicUsize,
    pub(crate) message_writes: Mutex<Vec<Vec<MessageId>>>,
}

impl MemoryStore {
    pub(crate) fn with_channels(channels: Vec<Channel>) -> Arc<Self> {
        let store = Self::default();
        store.state.lock().expect("store lock").channels = channels;
        Arc::new(store)
    }

    pub(crate) fn seed_messages(&self, channel_id: &str, messages: Vec<Message>) {
        self.state
            .lock()
            .expect("store lock")
            .messages
            .insert(ChannelId::new(channel_id), messages);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn channels(&self) -> Vec<Channel> {
        self.state.lock().expect("store lock").channels.clone()
    }

    pub(crate) fn messages(&self, channel_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .expect("store lock")
            .messages
            .get(&ChannelId::new(channel_id))
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("disk I/O error"));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.check()?;
        Ok(self.channels())
    }

    async fn upsert_channels(&self, channels: &[Channel]) -> Result<()> {
        self.check()?;
        self.channel_writes.fetch_add(channels.len(), Ordering::SeqCst);
        let mut state = self.state.lock().expect("store lock");
        for channel in channels {
            match state.channels.iter_mut().find(|c| c.id == channel.id) {
                Some(existing) => *existing = channel.clone(),
                None => state.channels.push(channel.clone()),
            }
        }
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .expect("store lock")
            .channels
            .retain(|c| &c.id != channel_id);
        Ok(())
    }

    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<Message>> {
        self.check()?;
        let mut messages = self.messages(channel_id.as_str());
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn upsert_messages(&self, channel_id: &ChannelId, messages: &[Message]) -> Result<()> {
        self.check()?;
        self.message_writes
            .lock()
            .expect("store lock")
            .push(messages.iter().map(|m| m.id.clone()).collect());
        let mut state = self.state.lock().expect("store lock");
        let cached = state.messages.entry(channel_id.clone()).or_default();
        for message in messages {
            if !cached.iter().any(|m| m.id == message.id) {
                cached.push(message.clone());
            }
        }
        Ok(())
    }

    async fn delete_channel_messages(&self, channel_id: &ChannelId) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .expect("store lock")
            .messages
            .remove(channel_id);
        Ok(())
    }
}

#[derive(Default)]
struct RemoteState {
    channels: Vec<Channel>,
    messages: HashMap<ChannelId, Vec<Message>>,
    sent: usize,
}

/// Server double; sends are stamped `srv-N` and become visible to later fetches.
#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<RemoteState>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    pub(crate) message_fetches: AtomicUsize,
}

impl FakeRemote {
    pub(crate) fn with_channels(channels: Vec<Channel>) -> Arc<Self> {
        let remote = Self::default();
        remote.set_channels(channels);
        Arc::new(remote)
    }

    pub(crate) fn set_channels(&self, channels: Vec<Channel>) {
        self.state.lock().expect("remote lock").channels = channels;
    }

    pub(crate) fn set_messages(&self, channel_id: &str, messages: Vec<Message>) {
        self.state
            .lock()
            .expect("remote lock")
            .messages
            .insert(ChannelId::new(channel_id), messages);
    }

    pub(crate) fn push_message(&self, message: Message) {
        self.state
            .lock()
            .expect("remote lock")
            .messages
            .entry(message.channel_id.clone())
            .or_default()
            .push(message);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("remote lock") = Some(delay);
    }

    async fn call(&self) -> Result<()> {
        let delay = *self.delay.lock().expect("remote lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.call().await?;
        Ok(self.state.lock().expect("remote lock").channels.clone())
    }

    async fn create_channel(&self, name: &str, logo_ref: Option<&str>) -> Result<Channel> {
        self.call().await?;
        let mut channel = Channel::new(format!("new-{name}"), name);
        channel.logo_ref = logo_ref.map(str::to_string);
        self.state
            .lock()
            .expect("remote lock")
            .channels
            .push(channel.clone());
        Ok(channel)
    }

    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<()> {
        self.call().await?;
        let mut state = self.state.lock().expect("remote lock");
        state.channels.retain(|c| &c.id != channel_id);
        state.messages.remove(channel_id);
        Ok(())
    }

    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<Message>> {
        self.message_fetches.fetch_add(1, Ordering::SeqCst);
        self.call().await?;
        Ok(self
            .state
            .lock()
            .expect("remote lock")
            .messages
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        text: &str,
        author_id: &UserId,
        author_name: &str,
    ) -> Result<Message> {
        self.call().await?;
        let mut state = self.state.lock().expect("remote lock");
        state.sent += 1;
        let message = Message {
            id: MessageId::new(format!("srv-{}", state.sent)),
            channel_id: channel_id.clone(),
            text: text.to_string(),
            author_id: author_id.clone(),
            author_name: author_name.to_string(),
            timestamp: at(20, state.sent as u32),
        };
        state
            .messages
            .entry(channel_id.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }
}

/// Live-update double that counts open subscriptions.
pub(crate) struct FakeEvents {
    sender: broadcast::Sender<Option<SyncEvent>>,
    active: Arc<AtomicUsize>,
    pub(crate) subscribe_calls: AtomicUsize,
    failing: AtomicBool,
}

impl Default for FakeEvents {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            sender,
            active: Arc::new(AtomicUsize::new(0)),
            subscribe_calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }
}

impl FakeEvents {
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(Some(event));
    }

    /// Ends every open subscription as a dropped connection would.
    pub(crate) fn disconnect(&self) {
        let _ = self.sender.send(None);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

struct CountedStream {
    inner: SyncEventStream,
    active: Arc<AtomicUsize>,
}

impl Stream for CountedStream {
    type Item = SyncEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SyncEvent>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSource for FakeEvents {
    async fn subscribe(&self) -> Result<SyncEventStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("event endpoint unreachable"));
        }

        let inner = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|item| async move { item.ok() })
            .take_while(|item| futures::future::ready(item.is_some()))
            .filter_map(|item| async move { item })
            .boxed();
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(CountedStream {
            inner,
            active: Arc::clone(&self.active),
        }
        .boxed())
    }
}

/// Records the signals a channel coordinator sends to the list.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub(crate) removed: Mutex<Vec<ChannelId>>,
    pub(crate) activity: Mutex<Vec<(ChannelId, MessageId)>>,
}

impl RecordingObserver {
    pub(crate) fn removed(&self) -> Vec<ChannelId> {
        self.removed.lock().expect("observer lock").clone()
    }

    pub(crate) fn activity(&self) -> Vec<(ChannelId, MessageId)> {
        self.activity.lock().expect("observer lock").clone()
    }
}

#[async_trait]
impl ChannelListObserver for RecordingObserver {
    async fn channel_removed(&self, channel_id: &ChannelId) {
        self.removed
            .lock()
            .expect("observer lock")
            .push(channel_id.clone());
    }

    async fn channel_activity(&self, channel_id: &ChannelId, latest: &Message) {
        self.activity
            .lock()
            .expect("observer lock")
            .push((channel_id.clone(), latest.id.clone()));
    }
}
