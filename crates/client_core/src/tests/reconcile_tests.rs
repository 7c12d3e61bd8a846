use chrono::{DateTime, TimeZone, Utc};
use shared::domain::UserId;

use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Row {
    id: &'static str,
    v: u32,
}

fn row(id: &'static str, v: u32) -> Row {
    Row { id, v }
}

fn rows(result: &[Row]) -> Vec<&'static str> {
    result.iter().map(|r| r.id).collect()
}

fn diff(cached: &[Row], remote: &[Row]) -> ReconcileResult<Row> {
    reconcile(cached, remote, |r| r.id, |old, new| old.v != new.v)
}

fn at(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, month, day, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

#[test]
fn pairs_by_key_not_by_position() {
    let result = diff(&[row("a", 1)], &[row("b", 1)]);

    assert_eq!(rows(&result.to_insert), vec!["b"]);
    assert_eq!(rows(&result.to_delete), vec!["a"]);
    assert!(result.to_update.is_empty());
}

#[test]
fn mispairing_after_a_delete_is_impossible() {
    // Same length, different order, one entity swapped out.
    let cached = vec![row("a", 1), row("b", 1), row("c", 1)];
    let remote = vec![row("c", 2), row("a", 1), row("d", 1)];

    let result = diff(&cached, &remote);

    assert_eq!(rows(&result.to_insert), vec!["d"]);
    assert_eq!(rows(&result.to_update), vec!["c"]);
    assert_eq!(result.to_update[0].v, 2);
    assert_eq!(rows(&result.to_delete), vec!["b"]);
}

#[test]
fn merged_view_is_remote_order_with_creation_flags() {
    let result = diff(&[row("a", 1), row("b", 1)], &[row("b", 5), row("z", 1), row("a", 1)]);

    let merged: Vec<(&str, u32, bool)> = result
        .merged
        .iter()
        .map(|m| (m.entity.id, m.entity.v, m.created))
        .collect();
    assert_eq!(merged, vec![("b", 5, false), ("z", 1, true), ("a", 1, false)]);
}

#[test]
fn reconciliation_is_idempotent() {
    let cached = vec![row("a", 1), row("b", 2), row("gone", 1)];
    let remote = vec![row("b", 3), row("c", 1), row("a", 1)];

    let first = diff(&cached, &remote);
    assert!(!first.is_noop());

    let applied = first.into_merged();
    let second = diff(&applied, &remote);
    assert!(second.is_noop());
    assert_eq!(second.into_merged(), remote);
}

#[test]
fn result_does_not_depend_on_input_order() {
    let cached = vec![row("a", 1), row("b", 1), row("c", 1)];
    let remote = vec![row("b", 2), row("d", 1)];

    let forward = diff(&cached, &remote);
    let mut cached_rev = cached.clone();
    cached_rev.reverse();
    let mut remote_rev = remote.clone();
    remote_rev.reverse();
    let backward = diff(&cached_rev, &remote_rev);

    let mut deleted_forward = rows(&forward.to_delete);
    let mut deleted_backward = rows(&backward.to_delete);
    deleted_forward.sort();
    deleted_backward.sort();
    assert_eq!(deleted_forward, deleted_backward);
    assert_eq!(rows(&forward.to_insert), rows(&backward.to_insert));
    assert_eq!(rows(&forward.to_update), rows(&backward.to_update));
}

#[test]
fn duplicate_keys_collapse_to_last_occurrence() {
    let result = diff(&[row("a", 1), row("a", 2)], &[row("a", 2), row("b", 1), row("a", 3)]);

    assert_eq!(rows(&result.to_insert), vec!["b"]);
    assert_eq!(result.to_update, vec![row("a", 3)]);
    let merged: Vec<&str> = result.merged.iter().map(|m| m.entity.id).collect();
    assert_eq!(merged, vec!["b", "a"]);
}

#[test]
fn empty_inputs_are_total() {
    let everything_new = diff(&[], &[row("a", 1)]);
    assert_eq!(rows(&everything_new.to_insert), vec!["a"]);

    let everything_gone = diff(&[row("a", 1)], &[]);
    assert_eq!(rows(&everything_gone.to_delete), vec!["a"]);
    assert!(everything_gone.merged.is_empty());

    assert!(diff(&[], &[]).is_noop());
}

#[test]
fn channel_activity_changes_are_updates() {
    let mut cached = Channel::new("c1", "general");
    cached.last_message = Some("hi".into());
    cached.last_activity = Some(at(1, 1));

    let mut same = cached.clone();
    let unchanged = reconcile_channels(std::slice::from_ref(&cached), std::slice::from_ref(&same));
    assert!(unchanged.is_noop());

    same.last_activity = Some(at(2, 1));
    same.last_message = Some("newer".into());
    let bumped = reconcile_channels(std::slice::from_ref(&cached), std::slice::from_ref(&same));
    assert_eq!(bumped.to_update, vec![same.clone()]);

    let mut cleared = cached.clone();
    cleared.last_message = Some(String::new());
    let emptied = reconcile_channels(std::slice::from_ref(&cached), std::slice::from_ref(&cleared));
    assert_eq!(emptied.to_update.len(), 1, "empty text is not the same as the old text");
}

#[test]
fn renamed_channels_are_updates() {
    let cached = Channel::new("c1", "general");
    let mut renamed = cached.clone();
    renamed.name = "announcements".into();
    renamed.logo_ref = Some("megaphone.png".into());

    let result = reconcile_channels(&[cached], std::slice::from_ref(&renamed));

    assert_eq!(result.to_update, vec![renamed]);
    assert!(result.to_insert.is_empty());
}

#[test]
fn messages_are_never_updated() {
    let message = Message {
        id: MessageId::new("m1"),
        channel_id: ChannelId::new("c1"),
        text: "original".into(),
        author_id: UserId::new("u1"),
        author_name: "Alice".into(),
        timestamp: at(1, 1),
    };
    let mut edited = message.clone();
    edited.text = "edited remotely".into();
    let mut fresh = message.clone();
    fresh.id = MessageId::new("m2");

    let result = reconcile_messages(&[message], &[edited, fresh]);

    assert!(result.to_update.is_empty());
    assert_eq!(result.to_insert.len(), 1);
    assert_eq!(result.to_insert[0].id.as_str(), "m2");
}
