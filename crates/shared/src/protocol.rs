use serde::{Deserialize, Serialize};

use crate::domain::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    pub author_id: UserId,
    pub author_name: String,
}

/// Name of the SSE `event:` field the service uses for channel sync events.
pub const SYNC_EVENT_NAME: &str = "sync";
