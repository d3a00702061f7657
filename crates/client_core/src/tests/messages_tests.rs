use super::*;
use chrono::{Duration, TimeZone};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::seconds(seconds)
}

fn draft(author: &str, body: &str) -> Draft {
    Draft {
        author_id: UserId::from(author),
        author_name: author.to_uppercase(),
        body: body.to_string(),
        channel_id: Some(ChannelId::from("general")),
        recipient_id: None,
        reply_to: None,
    }
}

fn confirmed(id: &str, author: &str, body: &str, sent_at: DateTime<Utc>) -> ChatMessage {
    ChatMessage::from(MessageRow {
        id: MessageId::from(id),
        content: body.to_string(),
        channel_id: Some(ChannelId::from("general")),
        recipient_id: None,
        user_id: UserId::from(author),
        username: None,
        sent_at,
        reply_to_id: None,
        pinned: false,
        pinned_at: None,
        pinned_by: None,
        pinned_by_username: None,
        edited_at: None,
    })
}

fn ids(log: &MessageLog) -> Vec<&str> {
    log.messages().iter().map(|m| m.id.as_str()).collect()
}

#[test]
fn replace_all_sorts_by_sent_at_and_drops_repeated_ids() {
    let mut log = MessageLog::default();
    log.replace_all([
        confirmed("m2", "bob", "second", at(5)),
        confirmed("m1", "alice", "first", at(1)),
        confirmed("m2", "bob", "second", at(5)),
    ]);
    assert_eq!(ids(&log), vec!["m1", "m2"]);
}

#[test]
fn echo_promotes_optimistic_entry_in_place() {
    let mut log = MessageLog::default();
    log.replace_all([confirmed("m0", "bob", "earlier", at(0))]);

    let temp = log.push_optimistic(draft("alice", "hi"), at(1));
    assert_eq!(temp.as_str(), "temp-1");
    assert_eq!(ids(&log), vec!["m0", "temp-1"]);
    assert_eq!(log.messages()[1].delivery, DeliveryState::Pending);

    let outcome = log.merge_incoming(confirmed("real-42", "alice", "hi", at(3)));
    assert_eq!(
        outcome,
        MergeOutcome::Promoted {
            pending_id: temp,
            index: 1
        }
    );
    assert_eq!(ids(&log), vec!["m0", "real-42"]);
    assert_eq!(log.messages()[1].delivery, DeliveryState::Confirmed);
    assert_eq!(log.messages()[1].author_name.as_deref(), Some("ALICE"));
    assert_eq!(log.pending_count(), 0);
}

#[test]
fn promotion_keeps_position_when_others_arrived_meanwhile() {
    let mut log = MessageLog::default();
    log.push_optimistic(draft("alice", "hi"), at(0));
    log.merge_incoming(confirmed("b1", "bob", "hey", at(1)));

    log.merge_incoming(confirmed("a1", "alice", "hi", at(2)));
    assert_eq!(ids(&log), vec!["a1", "b1"]);
}

#[test]
fn merging_the_same_message_twice_is_a_no_op() {
    let mut log = MessageLog::default();
    let message = confirmed("m1", "bob", "hello", at(0));

    assert_eq!(
        log.merge_incoming(message.clone()),
        MergeOutcome::Appended { index: 0 }
    );
    let snapshot = log.messages().to_vec();
    assert_eq!(log.merge_incoming(message), MergeOutcome::Duplicate);
    assert_eq!(log.messages(), snapshot.as_slice());
}

#[test]
fn echo_outside_window_is_appended() {
    let mut log = MessageLog::default();
    log.push_optimistic(draft("alice", "hi"), at(0));

    let outcome = log.merge_incoming(confirmed("late", "alice", "hi", at(10)));
    assert_eq!(outcome, MergeOutcome::Appended { index: 1 });
    assert_eq!(ids(&log), vec!["temp-1", "late"]);
}

#[test]
fn different_body_or_author_is_not_promoted() {
    let mut log = MessageLog::default();
    log.push_optimistic(draft("alice", "hi"), at(0));

    log.merge_incoming(confirmed("x", "alice", "hi!", at(1)));
    log.merge_incoming(confirmed("y", "bob", "hi", at(1)));
    assert_eq!(ids(&log), vec!["temp-1", "x", "y"]);
    assert_eq!(log.pending_count(), 1);
}

#[test]
fn identical_bodies_promote_in_send_order() {
    let mut log = MessageLog::default();
    let first = log.push_optimistic(draft("alice", "ok"), at(0));
    let second = log.push_optimistic(draft("alice", "ok"), at(1));

    let outcome = log.merge_incoming(confirmed("r1", "alice", "ok", at(2)));
    assert_eq!(
        outcome,
        MergeOutcome::Promoted {
            pending_id: first,
            index: 0
        }
    );
    let outcome = log.merge_incoming(confirmed("r2", "alice", "ok", at(2)));
    assert_eq!(
        outcome,
        MergeOutcome::Promoted {
            pending_id: second,
            index: 1
        }
    );
    assert_eq!(ids(&log), vec!["r1", "r2"]);
}

#[test]
fn failed_entry_retries_at_the_tail_and_can_still_be_promoted() {
    let mut log = MessageLog::default();
    let temp = log.push_optimistic(draft("alice", "hi"), at(0));
    log.merge_incoming(confirmed("b1", "bob", "hey", at(1)));

    assert!(log.mark_failed(&temp));
    assert_eq!(log.messages()[0].delivery, DeliveryState::Failed);
    assert!(!log.mark_failed(&MessageId::from("b1")));

    let resend = log.begin_retry(&temp, at(60)).expect("retryable");
    assert_eq!(resend.sent_at, at(60));
    assert_eq!(ids(&log), vec!["b1", "temp-1"]);
    assert!(log.begin_retry(&temp, at(61)).is_none());

    log.merge_incoming(confirmed("a1", "alice", "hi", at(61)));
    assert_eq!(ids(&log), vec!["b1", "a1"]);
}

#[test]
fn sequence_keeps_increasing_after_clear() {
    let mut log = MessageLog::default();
    log.push_optimistic(draft("alice", "one"), at(0));
    log.clear();
    let id = log.push_optimistic(draft("alice", "two"), at(1));
    assert_eq!(id.as_str(), "temp-2");
}

#[test]
fn edit_and_remove_update_lookup_state() {
    let mut log = MessageLog::default();
    log.replace_all([confirmed("m1", "alice", "draft", at(0))]);
    let id = MessageId::from("m1");

    assert!(log.apply_edit(&id, "final".into(), at(5)));
    let edited = log.get(&id).expect("message");
    assert_eq!(edited.body, "final");
    assert_eq!(edited.edited_at, Some(at(5)));

    let removed = log.remove(&id).expect("removed");
    assert_eq!(removed.body, "final");
    assert!(!log.contains(&id));
    assert!(log.is_empty());
    assert!(log.remove(&id).is_none());
}

#[test]
fn edits_skip_unconfirmed_entries() {
    let mut log = MessageLog::default();
    let pending = log.push_optimistic(draft("alice", "typo"), at(0));

    assert!(!log.apply_edit(&pending, "fixed".into(), at(1)));
    let entry = log.get(&pending).expect("pending entry");
    assert_eq!(entry.body, "typo");
    assert_eq!(entry.edited_at, None);

    // Still promotable under its original body.
    let outcome = log.merge_incoming(confirmed("m1", "alice", "typo", at(1)));
    assert!(matches!(outcome, MergeOutcome::Promoted { .. }));
    assert_eq!(ids(&log), vec!["m1"]);
}

#[test]
fn pinned_rows_convert_with_pin_metadata() {
    let mut row = MessageRow {
        id: MessageId::from("m1"),
        content: "rules".into(),
        channel_id: Some(ChannelId::from("general")),
        recipient_id: None,
        user_id: UserId::from("admin"),
        username: Some("Admin".into()),
        sent_at: at(0),
        reply_to_id: None,
        pinned: true,
        pinned_at: Some(at(30)),
        pinned_by: Some(UserId::from("mod")),
        pinned_by_username: Some("Mod".into()),
        edited_at: None,
    };
    let message = ChatMessage::from(row.clone());
    assert!(message.is_pinned());
    assert_eq!(message.pin.as_ref().map(|p| p.pinned_at), Some(at(30)));

    row.pinned = false;
    assert!(!ChatMessage::from(row).is_pinned());
}
