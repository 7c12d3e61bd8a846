use std::{sync::Arc, time::Duration};

use anyhow::Result;
use shared::domain::{Channel, ChannelId, UserId};
use storage::{LocalStore, Storage};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    channel::ChannelSyncCoordinator,
    channel_list::ChannelListSyncCoordinator,
    config::{prepare_database_url, Settings},
    error::{SyncError, SyncResult},
    events::{EventSource, SseEventSource},
    remote::{HttpRemoteClient, RemoteClient},
    view::{ChannelListUpdate, DayBoundary, MessageRow, MessageUpdate, UpdateStream},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: UserId,
    pub name: String,
}

impl SessionUser {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub fetch_timeout: Duration,
    pub resubscribe_delay: Duration,
    pub update_buffer: usize,
    pub day_boundary: DayBoundary,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SyncOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            fetch_timeout: settings.fetch_timeout,
            resubscribe_delay: settings.resubscribe_delay,
            update_buffer: settings.update_buffer,
            day_boundary: settings.day_boundary(),
        }
    }
}

struct ActiveChannel {
    coordinator: Arc<ChannelSyncCoordinator>,
    task: JoinHandle<()>,
}

impl ActiveChannel {
    /// Returns once the driving task, and with it the subscription, is gone.
    async fn close(self) {
        self.coordinator.deactivate();
        self.task.abort();
        let _ = self.task.await;
        info!(channel_id = %self.coordinator.channel_id(), "session: channel closed");
    }
}

/// Entry point for the presentation layer; holds at most one open channel.
pub struct SyncSession {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    events: Arc<dyn EventSource>,
    channels: Arc<ChannelListSyncCoordinator>,
    identity: watch::Sender<Option<SessionUser>>,
    options: SyncOptions,
    active: Mutex<Option<ActiveChannel>>,
}

impl SyncSession {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        events: Arc<dyn EventSource>,
        options: SyncOptions,
    ) -> Self {
        let channels = Arc::new(ChannelListSyncCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            options.fetch_timeout,
            options.update_buffer,
        ));
        let (identity, _) = watch::channel(None);
        Self {
            store,
            remote,
            events,
            channels,
            identity,
            options,
            active: Mutex::new(None),
        }
    }

    /// Wires the SQLite cache and the HTTP/SSE collaborators from settings.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let storage = Storage::new(&prepare_database_url(&settings.database_url)).await?;
        let remote = HttpRemoteClient::new(&settings.server_url)?;
        let events = SseEventSource::new(&settings.events_url())?;
        let session = Self::new(
            Arc::new(storage),
            Arc::new(remote),
            Arc::new(events),
            SyncOptions::from(settings),
        );
        if let Some(user_id) = settings.user_id.clone() {
            let name = settings.user_name.clone().unwrap_or_else(|| user_id.clone());
            session.set_user(SessionUser::new(user_id, name));
        }
        Ok(session)
    }

    /// Current merged channel list without touching the cache or the network.
    pub async fn current_channels(&self) -> Vec<Channel> {
        self.channels.current().await
    }

    pub fn channel_updates(&self) -> UpdateStream<ChannelListUpdate> {
        self.channels.updates()
    }

    /// Publishes the resolved user; the open channel re-emits with revised attribution.
    pub fn set_user(&self, user: SessionUser) {
        info!(user_id = %user.id, "session: user resolved");
        self.identity.send_replace(Some(user));
    }

    pub fn user(&self) -> Option<SessionUser> {
        self.identity.borrow().clone()
    }

    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.coordinator.channel_id().clone())
    }

    pub async fn refresh_channels(&self) -> SyncResult<Vec<Channel>> {
        let outcome = self.channels.refresh().await?;
        self.purge_removed(&outcome.removed).await;
        Ok(outcome.channels)
    }

    pub async fn create_channel(&self, name: &str, logo_ref: Option<&str>) -> SyncResult<Channel> {
        self.channels.create_channel(name, logo_ref).await
    }

    pub async fn delete_channel(&self, channel_id: &ChannelId) -> SyncResult<()> {
        self.channels.delete_channel(channel_id).await?;
        self.purge_removed(std::slice::from_ref(channel_id)).await;
        Ok(())
    }

    /// Closes a removed open channel, then purges again so no late driver write survives.
    async fn purge_removed(&self, removed: &[ChannelId]) {
        if removed.is_empty() {
            return;
        }

        let mut active = self.active.lock().await;
        for channel_id in removed {
            let is_open = active
                .as_ref()
                .is_some_and(|open| open.coordinator.channel_id() == channel_id);
            if is_open {
                if let Some(open) = active.take() {
                    open.coordinator.discard().await;
                    open.close().await;
                }
            }
            if let Err(err) = self.store.delete_channel_messages(channel_id).await {
                warn!(channel_id = %channel_id, "session: failed to purge messages of removed channel: {err:#}");
            }
        }
    }

    /// Opens `channel_id`, closing any other open channel first.
    ///
    /// Opening the channel that is already open returns another subscription
    /// primed with the current view.
    pub async fn open(&self, channel_id: ChannelId) -> UpdateStream<MessageUpdate> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if current.coordinator.channel_id() == &channel_id && !current.task.is_finished() {
                return current.coordinator.subscribe_primed().await;
            }
        }

        if let Some(previous) = active.take() {
            previous.close().await;
        }

        let coordinator = Arc::new(ChannelSyncCoordinator::new(
            channel_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            Arc::clone(&self.events),
            self.channels.clone(),
            self.identity.subscribe(),
            self.options,
        ));
        let (updates, task) = coordinator.start();
        *active = Some(ActiveChannel { coordinator, task });
        info!(channel_id = %channel_id, "session: channel opened");
        updates
    }

    pub async fn close(&self) {
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            active.close().await;
        }
    }

    /// Sends `text` to the open channel as the session user.
    pub async fn send(&self, text: &str) -> SyncResult<MessageRow> {
        let user = self.user().ok_or(SyncError::IdentityUnresolved)?;
        let coordinator = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.coordinator))
            .ok_or(SyncError::NoOpenChannel)?;
        coordinator.send(text, &user.id, &user.name).await
    }

    pub async fn shutdown(&self) {
        self.channels.shut_down();
        self.close().await;
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.channels.shut_down();
        if let Some(active) = self.active.get_mut().take() {
            active.coordinator.deactivate();
            active.task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
