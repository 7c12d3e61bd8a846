//! Offline-first sync engine: keeps a local cache of channels and messages
//! consistent with the chat service and streams UI-facing updates.

pub mod channel;
pub mod channel_list;
pub mod config;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod view;

pub use channel::ChannelSyncCoordinator;
pub use channel_list::{ChannelListObserver, ChannelListSyncCoordinator, RefreshOutcome};
pub use config::{load_settings, Settings};
pub use error::{SyncError, SyncResult};
pub use events::{EventSource, SseEventSource, SyncEventStream};
pub use reconcile::{reconcile, reconcile_channels, reconcile_messages, ReconcileResult};
pub use remote::{HttpRemoteClient, RemoteClient};
pub use session::{SessionUser, SyncOptions, SyncSession};
pub use view::{ChannelListUpdate, DayBoundary, DayGroup, MessageRow, MessageUpdate, UpdateStream};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
