//! UI-facing records and the ordering rules of the merged views.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use futures::{stream::BoxStream, StreamExt};
use shared::domain::{Channel, ChannelId, Message, UserId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

/// Where one calendar day ends for message grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DayBoundary {
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl DayBoundary {
    pub fn day_of(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Local => timestamp.with_timezone(&Local).date_naive(),
            Self::Fixed(offset) => timestamp.with_timezone(offset).date_naive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub message: Message,
    pub day: NaiveDate,
    /// Authored by the session user; `false` while the user is unresolved.
    pub mine: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup {
    pub day: NaiveDate,
    pub rows: Vec<MessageRow>,
}

impl DayGroup {
    pub fn message_ids(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|row| row.message.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelListUpdate {
    /// Full list in display order.
    Snapshot(Vec<Channel>),
    Insert(Channel),
    Delete(ChannelId),
    /// The pass could not reach the server; the last snapshot stands.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageUpdate {
    Snapshot(Vec<DayGroup>),
    Insert(MessageRow),
    /// The channel was removed and its messages purged.
    Delete(ChannelId),
    Failed(String),
}

pub type UpdateStream<T> = BoxStream<'static, T>;

pub(crate) fn broadcast_updates<T>(receiver: broadcast::Receiver<T>) -> UpdateStream<T>
where
    T: Clone + Send + 'static,
{
    BroadcastStream::new(receiver)
        .filter_map(|item| async move {
            match item {
                Ok(update) => Some(update),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "view: subscriber lagged behind, updates dropped");
                    None
                }
            }
        })
        .boxed()
}

fn activity_order(a: &Channel, b: &Channel) -> Ordering {
    match (a.last_activity, b.last_activity) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Newest activity first, idle channels last; ties keep their current order.
pub fn sort_channels(channels: &mut [Channel]) {
    channels.sort_by(activity_order);
}

/// Ascending by timestamp; ties keep their current order.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}

pub fn message_row(message: &Message, me: Option<&UserId>, days: DayBoundary) -> MessageRow {
    MessageRow {
        message: message.clone(),
        day: days.day_of(message.timestamp),
        mine: message.is_authored_by(me),
    }
}

/// Groups time-ordered messages by calendar day.
pub fn group_by_day(messages: &[Message], me: Option<&UserId>, days: DayBoundary) -> Vec<DayGroup> {
    let mut ordered: Vec<&Message> = messages.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let mut groups: Vec<DayGroup> = Vec::new();
    for message in ordered {
        let row = message_row(message, me, days);
        match groups.last_mut() {
            Some(group) if group.day == row.day => group.rows.push(row),
            _ => groups.push(DayGroup {
                day: row.day,
                rows: vec![row],
            }),
        }
    }
    groups
}
