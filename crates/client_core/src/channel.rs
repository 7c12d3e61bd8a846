use std::{
    collections::HashSet,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::StreamExt;
use shared::domain::{ChannelId, Message, MessageId, SyncEvent, SyncEventKind, UserId};
use storage::LocalStore;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    channel_list::ChannelListObserver,
    error::{SyncError, SyncResult},
    events::{EventSource, SyncEventStream},
    reconcile::reconcile_messages,
    remote::{bounded, RemoteClient},
    session::{SessionUser, SyncOptions},
    view::{
        broadcast_updates, group_by_day, message_row, sort_messages, DayGroup, MessageRow,
        MessageUpdate, UpdateStream,
    },
};

#[derive(Default)]
struct ChannelViewState {
    messages: Vec<Message>,
    known: HashSet<MessageId>,
    removed: bool,
}

/// Keeps one open channel's messages in sync and owns its cached message rows.
///
/// All passes run under the view lock, so a live event that arrives while a
/// pass is in flight waits in the subscription stream instead of reading a
/// half-merged view.
pub struct ChannelSyncCoordinator {
    channel_id: ChannelId,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    events: Arc<dyn EventSource>,
    observer: Arc<dyn ChannelListObserver>,
    identity: watch::Receiver<Option<SessionUser>>,
    options: SyncOptions,
    updates: broadcast::Sender<MessageUpdate>,
    state: Mutex<ChannelViewState>,
    alive: AtomicBool,
}

impl ChannelSyncCoordinator {
    pub fn new(
        channel_id: ChannelId,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        events: Arc<dyn EventSource>,
        observer: Arc<dyn ChannelListObserver>,
        identity: watch::Receiver<Option<SessionUser>>,
        options: SyncOptions,
    ) -> Self {
        let (updates, _) = broadcast::channel(options.update_buffer.max(1));
        Self {
            channel_id,
            store,
            remote,
            events,
            observer,
            identity,
            options,
            updates,
            state: Mutex::new(ChannelViewState::default()),
            alive: AtomicBool::new(true),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Spawns the driving task; the returned stream sees every emission.
    pub fn start(self: &Arc<Self>) -> (UpdateStream<MessageUpdate>, JoinHandle<()>) {
        let receiver = self.updates.subscribe();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move { coordinator.run().await });
        (broadcast_updates(receiver), task)
    }

    /// A new subscriber primed with the current view.
    pub async fn subscribe_primed(&self) -> UpdateStream<MessageUpdate> {
        let receiver = self.updates.subscribe();
        self.emit_snapshot().await;
        broadcast_updates(receiver)
    }

    pub async fn current(&self) -> Vec<DayGroup> {
        let state = self.state.lock().await;
        group_by_day(&state.messages, self.current_user().as_ref(), self.options.day_boundary)
    }

    /// Stops persisting and emitting; passes still in flight become no-ops.
    pub(crate) fn deactivate(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn current_user(&self) -> Option<UserId> {
        self.identity.borrow().as_ref().map(|user| user.id.clone())
    }

    fn emit(&self, update: MessageUpdate) {
        if self.is_alive() {
            let _ = self.updates.send(update);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut identity = self.identity.clone();
        // Passes below already render with the current user.
        let _ = identity.borrow_and_update();

        self.emit_cached().await;
        let mut events = self.subscribe_events().await;
        let _ = self.sync_remote(true).await;

        let mut watching_identity = true;
        loop {
            if !self.is_alive() {
                break;
            }
            tokio::select! {
                next = next_event(&mut events), if events.is_some() => match next {
                    Some(event) => {
                        if self.handle_event(event).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        warn!(channel_id = %self.channel_id, "channel: live updates disconnected");
                        events = None;
                    }
                },
                _ = tokio::time::sleep(self.options.resubscribe_delay), if events.is_none() => {
                    events = self.subscribe_events().await;
                    if events.is_some() {
                        let _ = self.sync_remote(false).await;
                    }
                },
                changed = identity.changed(), if watching_identity => {
                    if changed.is_ok() {
                        self.emit_snapshot().await;
                    } else {
                        watching_identity = false;
                    }
                },
            }
        }
        debug!(channel_id = %self.channel_id, "channel: driver stopped");
    }

    async fn subscribe_events(&self) -> Option<SyncEventStream> {
        match self.events.subscribe().await {
            Ok(stream) => {
                debug!(channel_id = %self.channel_id, "channel: subscribed to live updates");
                Some(stream)
            }
            Err(err) => {
                let err = SyncError::EventStream(format!("{err:#}"));
                warn!(channel_id = %self.channel_id, "channel: {err}");
                self.emit(MessageUpdate::Failed(err.to_string()));
                None
            }
        }
    }

    async fn emit_cached(&self) {
        let cached = match self.store.list_messages(&self.channel_id).await {
            Ok(messages) => messages,
            Err(err) => {
                let err = SyncError::cache("list messages", err);
                warn!(channel_id = %self.channel_id, "channel: {err:#}, treating as empty");
                Vec::new()
            }
        };

        let mut state = self.state.lock().await;
        if !self.is_alive() {
            return;
        }
        for message in cached {
            if message.channel_id == self.channel_id && state.known.insert(message.id.clone()) {
                state.messages.push(message);
            }
        }
        sort_messages(&mut state.messages);
        let snapshot = group_by_day(&state.messages, self.current_user().as_ref(), self.options.day_boundary);
        self.emit(MessageUpdate::Snapshot(snapshot));
    }

    async fn emit_snapshot(&self) {
        let state = self.state.lock().await;
        if state.removed {
            return;
        }
        let snapshot = group_by_day(&state.messages, self.current_user().as_ref(), self.options.day_boundary);
        self.emit(MessageUpdate::Snapshot(snapshot));
    }

    async fn handle_event(&self, event: SyncEvent) -> ControlFlow<()> {
        if event.resource_id != self.channel_id {
            return ControlFlow::Continue(());
        }

        match event.kind {
            SyncEventKind::Add => {
                debug!(channel_id = %self.channel_id, "channel: add event ignored");
            }
            SyncEventKind::Update => {
                let _ = self.sync_remote(false).await;
            }
            SyncEventKind::Delete => {
                self.purge().await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Fetches remote messages and applies the ones not seen yet.
    ///
    /// The first pass emits a full snapshot; later passes emit one `Insert`
    /// per new message. Known ids are never emitted twice.
    async fn sync_remote(&self, initial: bool) -> SyncResult<usize> {
        let fetched = bounded(
            self.options.fetch_timeout,
            "list messages",
            self.remote.list_messages(&self.channel_id),
        )
        .await;

        let mut state = self.state.lock().await;
        if !self.is_alive() || state.removed {
            debug!(channel_id = %self.channel_id, "channel: fetch finished after close, discarding");
            return Ok(0);
        }

        let remote = match fetched {
            Ok(remote) => remote,
            Err(err) => {
                warn!(channel_id = %self.channel_id, "channel: fetch failed, keeping cached view: {err}");
                self.emit(MessageUpdate::Failed(err.to_string()));
                return Err(err);
            }
        };

        let (remote, foreign): (Vec<Message>, Vec<Message>) = remote
            .into_iter()
            .partition(|message| message.channel_id == self.channel_id);
        if !foreign.is_empty() {
            debug!(
                channel_id = %self.channel_id,
                ignored = foreign.len(),
                "channel: ignoring messages addressed to other channels"
            );
        }

        let mut fresh = reconcile_messages(&state.messages, &remote).to_insert;
        sort_messages(&mut fresh);

        if !fresh.is_empty() {
            if let Err(err) = self.store.upsert_messages(&self.channel_id, &fresh).await {
                warn!(channel_id = %self.channel_id, "channel: failed to cache {} messages: {err:#}", fresh.len());
            }
            for message in &fresh {
                state.known.insert(message.id.clone());
                state.messages.push(message.clone());
            }
            sort_messages(&mut state.messages);
        }

        let me = self.current_user();
        if initial {
            let snapshot = group_by_day(&state.messages, me.as_ref(), self.options.day_boundary);
            self.emit(MessageUpdate::Snapshot(snapshot));
        } else {
            for message in &fresh {
                self.emit(MessageUpdate::Insert(message_row(
                    message,
                    me.as_ref(),
                    self.options.day_boundary,
                )));
            }
        }

        let latest = state.messages.last().cloned();
        drop(state);

        if !fresh.is_empty() {
            if let Some(latest) = latest {
                self.observer
                    .channel_activity(&self.channel_id, &latest)
                    .await;
            }
        }

        info!(
            channel_id = %self.channel_id,
            new_messages = fresh.len(),
            initial,
            "channel: messages reconciled"
        );
        Ok(fresh.len())
    }

    async fn purge(&self) {
        let mut state = self.state.lock().await;
        if !self.is_alive() || state.removed {
            return;
        }
        state.removed = true;
        state.messages.clear();
        state.known.clear();

        // Own task: aborting the driver must not cancel the list update.
        let observer = Arc::clone(&self.observer);
        let channel_id = self.channel_id.clone();
        let notify = tokio::spawn(async move { observer.channel_removed(&channel_id).await });

        if let Err(err) = self.store.delete_channel_messages(&self.channel_id).await {
            warn!(channel_id = %self.channel_id, "channel: failed to purge cached messages: {err:#}");
        }
        self.emit(MessageUpdate::Delete(self.channel_id.clone()));
        drop(state);

        if let Err(err) = notify.await {
            warn!(channel_id = %self.channel_id, "channel: removal notice failed: {err}");
        }
        info!(channel_id = %self.channel_id, "channel: deleted remotely, cache purged");
    }

    /// Marks the channel removed by a list pass; the message rows are purged by the caller.
    pub(crate) async fn discard(&self) {
        let mut state = self.state.lock().await;
        if state.removed {
            return;
        }
        state.removed = true;
        state.messages.clear();
        state.known.clear();
        self.emit(MessageUpdate::Delete(self.channel_id.clone()));
    }

    /// Sends remotely, then appends locally and emits an `Insert` right away.
    ///
    /// A server event for the same message later is recognized by id and not
    /// appended again.
    pub async fn send(
        &self,
        text: &str,
        author_id: &UserId,
        author_name: &str,
    ) -> SyncResult<MessageRow> {
        if !self.is_alive() || self.state.lock().await.removed {
            return Err(SyncError::ChannelClosed(self.channel_id.clone()));
        }

        let sent = bounded(
            self.options.fetch_timeout,
            "send message",
            self.remote
                .send_message(&self.channel_id, text, author_id, author_name),
        )
        .await?;

        let mut state = self.state.lock().await;
        let row = message_row(&sent, self.current_user().as_ref(), self.options.day_boundary);
        if !self.is_alive() || state.removed {
            debug!(channel_id = %self.channel_id, message_id = %sent.id, "channel: send finished after close");
            return Ok(row);
        }
        if sent.channel_id != self.channel_id {
            warn!(channel_id = %self.channel_id, message_id = %sent.id, "channel: server placed sent message elsewhere");
            return Ok(row);
        }
        if !state.known.insert(sent.id.clone()) {
            debug!(channel_id = %self.channel_id, message_id = %sent.id, "channel: sent message already observed");
            return Ok(row);
        }

        if let Err(err) = self
            .store
            .upsert_messages(&self.channel_id, std::slice::from_ref(&sent))
            .await
        {
            warn!(channel_id = %self.channel_id, "channel: failed to cache sent message: {err:#}");
        }
        state.messages.push(sent);
        sort_messages(&mut state.messages);
        self.emit(MessageUpdate::Insert(row.clone()));
        let latest = state.messages.last().cloned();
        drop(state);

        if let Some(latest) = latest {
            self.observer
                .channel_activity(&self.channel_id, &latest)
                .await;
        }
        Ok(row)
    }
}

async fn next_event(events: &mut Option<SyncEventStream>) -> Option<SyncEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
