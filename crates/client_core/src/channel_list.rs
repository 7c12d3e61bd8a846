use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::domain::{Channel, ChannelId, Message};
use storage::LocalStore;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::{SyncError, SyncResult},
    reconcile::reconcile_channels,
    remote::{bounded, RemoteClient},
    view::{broadcast_updates, sort_channels, ChannelListUpdate, UpdateStream},
};

/// Signals a channel coordinator sends upward instead of writing channel rows.
#[async_trait]
pub trait ChannelListObserver: Send + Sync {
    /// The server deleted the channel.
    async fn channel_removed(&self, channel_id: &ChannelId);
    /// A message newer than anything seen so far appeared in the channel.
    async fn channel_activity(&self, channel_id: &ChannelId, latest: &Message);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Merged list in display order.
    pub channels: Vec<Channel>,
    pub inserted: usize,
    pub updated: usize,
    pub removed: Vec<ChannelId>,
}

#[derive(Default)]
struct ChannelListState {
    loaded: bool,
    view: Vec<Channel>,
    /// Channels removed by a live event, hidden until the server stops listing them.
    tombstones: HashSet<ChannelId>,
}

/// Sole writer of the cached channel table.
pub struct ChannelListSyncCoordinator {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    fetch_timeout: Duration,
    updates: broadcast::Sender<ChannelListUpdate>,
    state: Mutex<ChannelListState>,
    alive: AtomicBool,
}

impl ChannelListSyncCoordinator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        fetch_timeout: Duration,
        update_buffer: usize,
    ) -> Self {
        let (updates, _) = broadcast::channel(update_buffer.max(1));
        Self {
            store,
            remote,
            fetch_timeout,
            updates,
            state: Mutex::new(ChannelListState::default()),
            alive: AtomicBool::new(true),
        }
    }

    pub fn updates(&self) -> UpdateStream<ChannelListUpdate> {
        broadcast_updates(self.updates.subscribe())
    }

    /// Current merged list without touching the cache or the network.
    pub async fn current(&self) -> Vec<Channel> {
        self.state.lock().await.view.clone()
    }

    pub(crate) fn shut_down(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn emit(&self, update: ChannelListUpdate) {
        if self.is_alive() {
            let _ = self.updates.send(update);
        }
    }

    async fn load_cached(&self) -> Vec<Channel> {
        match self.store.list_channels().await {
            Ok(channels) => channels,
            Err(err) => {
                let err = SyncError::cache("list channels", err);
                warn!("channels: {err:#}, treating as empty");
                Vec::new()
            }
        }
    }

    async fn ensure_loaded(&self, state: &mut ChannelListState) {
        if state.loaded {
            return;
        }
        let mut cached = self.load_cached().await;
        cached.retain(|channel| !state.tombstones.contains(&channel.id));
        sort_channels(&mut cached);
        state.view = cached;
        state.loaded = true;
    }

    /// Cache-first pass: emits the cached list, then the reconciled remote list.
    ///
    /// On a remote failure the cached emission stands, a `Failed` record is
    /// emitted and the error is returned so the caller can offer a retry.
    pub async fn refresh(&self) -> SyncResult<RefreshOutcome> {
        let mut state = self.state.lock().await;

        let emit_cached = async {
            let mut cached = self.load_cached().await;
            cached.retain(|channel| !state.tombstones.contains(&channel.id));
            let mut snapshot = cached.clone();
            sort_channels(&mut snapshot);
            self.emit(ChannelListUpdate::Snapshot(snapshot.clone()));
            (cached, snapshot)
        };
        let fetch = bounded(
            self.fetch_timeout,
            "list channels",
            self.remote.list_channels(),
        );
        let ((cached, cached_snapshot), fetched) = tokio::join!(emit_cached, fetch);

        state.view = cached_snapshot;
        state.loaded = true;

        let remote = match fetched {
            Ok(remote) => remote,
            Err(err) => {
                warn!("channels: refresh failed, keeping cached list: {err}");
                self.emit(ChannelListUpdate::Failed(err.to_string()));
                return Err(err);
            }
        };

        if !self.is_alive() {
            debug!("channels: refresh finished after shutdown, discarding");
            return Ok(RefreshOutcome {
                channels: state.view.clone(),
                inserted: 0,
                updated: 0,
                removed: Vec::new(),
            });
        }

        state
            .tombstones
            .retain(|id| remote.iter().any(|channel| &channel.id == id));
        let remote: Vec<Channel> = remote
            .into_iter()
            .filter(|channel| !state.tombstones.contains(&channel.id))
            .collect();

        let result = reconcile_channels(&cached, &remote);
        let mut writes = result.to_insert.clone();
        writes.extend(result.to_update.iter().cloned());
        if let Err(err) = self.store.upsert_channels(&writes).await {
            warn!("channels: failed to cache {} rows: {err:#}", writes.len());
        }
        let mut removed = Vec::with_capacity(result.to_delete.len());
        for channel in &result.to_delete {
            if let Err(err) = self.store.delete_channel(&channel.id).await {
                warn!(channel_id = %channel.id, "channels: failed to drop cached row: {err:#}");
            }
            if let Err(err) = self.store.delete_channel_messages(&channel.id).await {
                warn!(channel_id = %channel.id, "channels: failed to purge cached messages: {err:#}");
            }
            removed.push(channel.id.clone());
        }

        let inserted = result.to_insert.len();
        let updated = result.to_update.len();
        let mut merged = result.into_merged();
        keep_cached_order(&mut merged, &cached);
        sort_channels(&mut merged);
        state.view = merged.clone();
        self.emit(ChannelListUpdate::Snapshot(merged.clone()));

        info!(
            inserted,
            updated,
            removed = removed.len(),
            total = merged.len(),
            "channels: refresh reconciled"
        );

        Ok(RefreshOutcome {
            channels: merged,
            inserted,
            updated,
            removed,
        })
    }

    /// Creates the channel remotely, then caches it and emits a single `Insert`.
    pub async fn create_channel(&self, name: &str, logo_ref: Option<&str>) -> SyncResult<Channel> {
        let channel = bounded(
            self.fetch_timeout,
            "create channel",
            self.remote.create_channel(name, logo_ref),
        )
        .await?;

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        if let Err(err) = self
            .store
            .upsert_channels(std::slice::from_ref(&channel))
            .await
        {
            warn!(channel_id = %channel.id, "channels: failed to cache created channel: {err:#}");
        }

        match state.view.iter_mut().find(|c| c.id == channel.id) {
            Some(existing) => *existing = channel.clone(),
            None => state.view.push(channel.clone()),
        }
        sort_channels(&mut state.view);
        self.emit(ChannelListUpdate::Insert(channel.clone()));

        info!(channel_id = %channel.id, "channels: created");
        Ok(channel)
    }

    /// Deletes remotely first; the cached row and messages are only dropped once the server agreed.
    pub async fn delete_channel(&self, channel_id: &ChannelId) -> SyncResult<()> {
        bounded(
            self.fetch_timeout,
            "delete channel",
            self.remote.delete_channel(channel_id),
        )
        .await?;

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        self.drop_row(&mut state, channel_id).await;
        if let Err(err) = self.store.delete_channel_messages(channel_id).await {
            warn!(channel_id = %channel_id, "channels: failed to purge cached messages: {err:#}");
        }
        info!(channel_id = %channel_id, "channels: deleted");
        Ok(())
    }

    async fn drop_row(&self, state: &mut ChannelListState, channel_id: &ChannelId) {
        if let Err(err) = self.store.delete_channel(channel_id).await {
            warn!(channel_id = %channel_id, "channels: failed to drop cached row: {err:#}");
        }
        let before = state.view.len();
        state.view.retain(|channel| &channel.id != channel_id);
        if state.view.len() != before {
            self.emit(ChannelListUpdate::Delete(channel_id.clone()));
        } else {
            debug!(channel_id = %channel_id, "channels: removal for unknown channel ignored");
        }
    }
}

/// Known channels keep their cached position, new ones follow in listing order,
/// so activity ties resolve the same way before and after a refresh.
fn keep_cached_order(merged: &mut [Channel], cached: &[Channel]) {
    let position: HashMap<&ChannelId, usize> = cached
        .iter()
        .enumerate()
        .map(|(index, channel)| (&channel.id, index))
        .collect();
    merged.sort_by_key(|channel| position.get(&channel.id).copied().unwrap_or(usize::MAX));
}

#[async_trait]
impl ChannelListObserver for ChannelListSyncCoordinator {
    async fn channel_removed(&self, channel_id: &ChannelId) {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        state.tombstones.insert(channel_id.clone());
        if self.is_alive() {
            self.drop_row(&mut state, channel_id).await;
        }
    }

    async fn channel_activity(&self, channel_id: &ChannelId, latest: &Message) {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        if !self.is_alive() {
            return;
        }

        let Some(channel) = state.view.iter_mut().find(|c| &c.id == channel_id) else {
            debug!(channel_id = %channel_id, "channels: activity for unknown channel ignored");
            return;
        };
        if channel
            .last_activity
            .is_some_and(|seen| seen >= latest.timestamp)
        {
            return;
        }

        channel.last_activity = Some(latest.timestamp);
        channel.last_message = Some(latest.text.clone());
        let updated = channel.clone();
        if let Err(err) = self
            .store
            .upsert_channels(std::slice::from_ref(&updated))
            .await
        {
            warn!(channel_id = %channel_id, "channels: failed to cache activity: {err:#}");
        }

        sort_channels(&mut state.view);
        self.emit(ChannelListUpdate::Snapshot(state.view.clone()));
    }
}

#[cfg(test)]
#[path = "tests/channel_list_tests.rs"]
mod tests;
