//! Key-based diffing of a cached collection against a freshly fetched one.
//!
//! Entities are paired by key through a map, never by position: the two
//! inputs come from different sources and may differ in order and length.

use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
};

use shared::domain::{Channel, ChannelId, Message, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged<T> {
    pub entity: T,
    /// The key was not present in the cached input.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult<T> {
    pub to_insert: Vec<T>,
    /// Remote copies of entities whose cached copy is stale.
    pub to_update: Vec<T>,
    pub to_delete: Vec<T>,
    /// Remote entities in remote order; remote wins on conflict.
    pub merged: Vec<Merged<T>>,
}

impl<T> ReconcileResult<T> {
    /// True when applying the result would not touch the cache.
    pub fn is_noop(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn into_merged(self) -> Vec<T> {
        self.merged.into_iter().map(|m| m.entity).collect()
    }
}

/// Computes the mutations that bring `cached` in line with `remote`.
///
/// If a key occurs more than once in an input, its last occurrence wins.
pub fn reconcile<T, K, FK, FC>(
    cached: &[T],
    remote: &[T],
    key: FK,
    changed: FC,
) -> ReconcileResult<T>
where
    T: Clone,
    K: Eq + Hash,
    FK: Fn(&T) -> K,
    FC: Fn(&T, &T) -> bool,
{
    let cached_by_key: HashMap<K, &T> = cached.iter().map(|item| (key(item), item)).collect();
    let last_remote_index: HashMap<K, usize> = remote
        .iter()
        .enumerate()
        .map(|(index, item)| (key(item), index))
        .collect();

    let mut to_insert = Vec::new();
    let mut to_update = Vec::new();
    let mut merged = Vec::with_capacity(last_remote_index.len());

    for (index, item) in remote.iter().enumerate() {
        let item_key = key(item);
        if last_remote_index.get(&item_key) != Some(&index) {
            continue;
        }

        let created = match cached_by_key.get(&item_key) {
            None => {
                to_insert.push(item.clone());
                true
            }
            Some(existing) => {
                if changed(existing, item) {
                    to_update.push(item.clone());
                }
                false
            }
        };
        merged.push(Merged {
            entity: item.clone(),
            created,
        });
    }

    let mut deleted_keys = HashSet::new();
    let mut to_delete = Vec::new();
    for item in cached.iter().rev() {
        let item_key = key(item);
        if last_remote_index.contains_key(&item_key) {
            continue;
        }
        if deleted_keys.insert(item_key) {
            to_delete.push(item.clone());
        }
    }
    to_delete.reverse();

    ReconcileResult {
        to_insert,
        to_update,
        to_delete,
        merged,
    }
}

/// Channels change when any cached field differs: name, logo, `last_activity`
/// or `last_message`.
pub fn reconcile_channels(cached: &[Channel], remote: &[Channel]) -> ReconcileResult<Channel> {
    reconcile(cached, remote, channel_key, |old, new| old != new)
}

/// Messages are immutable, so only insertions are ever reported as changes.
pub fn reconcile_messages(cached: &[Message], remote: &[Message]) -> ReconcileResult<Message> {
    reconcile(cached, remote, message_key, |_, _| false)
}

pub fn channel_key(channel: &Channel) -> ChannelId {
    channel.id.clone()
}

pub fn message_key(message: &Message) -> MessageId {
    message.id.clone()
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
