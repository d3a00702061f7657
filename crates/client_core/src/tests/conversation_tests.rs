use super::*;
use chrono::TimeZone;

const LEGACY: &str = "General";

fn channel(id: &str, name: &str) -> Conversation {
    Conversation::Channel(ChannelSummary {
        channel_id: ChannelId::from(id),
        name: name.to_string(),
        description: None,
    })
}

fn direct(local: &str, peer: &str) -> Conversation {
    Conversation::Direct(DirectPair::new(UserId::from(local), UserId::from(peer)))
}

fn row(user: &str, channel: Option<&str>, recipient: Option<&str>) -> MessageRow {
    MessageRow {
        id: MessageId::from("m"),
        content: "x".into(),
        channel_id: channel.map(ChannelId::from),
        recipient_id: recipient.map(UserId::from),
        user_id: UserId::from(user),
        username: None,
        sent_at: Utc
            .with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
            .single()
            .expect("timestamp"),
        reply_to_id: None,
        pinned: false,
        pinned_at: None,
        pinned_by: None,
        pinned_by_username: None,
        edited_at: None,
    }
}

#[test]
fn legacy_channel_history_includes_untagged_public_rows() {
    let query = history_query(&channel("general", "General"), LEGACY);
    assert_eq!(query.table, Table::Messages);
    assert!(query.filter.matches(&json!({ "channel_id": "general" })));
    assert!(query
        .filter
        .matches(&json!({ "channel_id": null, "recipient_id": null })));
    assert!(!query
        .filter
        .matches(&json!({ "channel_id": null, "recipient_id": "bob" })));

    let regular = history_query(&channel("random", "Random"), LEGACY);
    assert!(!regular
        .filter
        .matches(&json!({ "channel_id": null, "recipient_id": null })));
}

#[test]
fn direct_history_matches_both_directions_only() {
    let query = history_query(&direct("alice", "bob"), LEGACY);
    assert!(query
        .filter
        .matches(&json!({ "user_id": "alice", "recipient_id": "bob" })));
    assert!(query
        .filter
        .matches(&json!({ "user_id": "bob", "recipient_id": "alice" })));
    assert!(!query
        .filter
        .matches(&json!({ "user_id": "carol", "recipient_id": "alice" })));
    assert!(!query
        .filter
        .matches(&json!({ "user_id": "alice", "recipient_id": "alice" })));
}

#[test]
fn announcements_read_active_alerts() {
    let query = history_query(&Conversation::Announcements, LEGACY);
    assert_eq!(query.table, Table::GlobalAlerts);
    assert!(query.filter.matches(&json!({ "is_active": true })));
    assert!(!query.filter.matches(&json!({ "is_active": false })));
    assert!(pinned_query(&Conversation::Announcements).is_none());
}

#[test]
fn legacy_channel_listens_on_two_feeds() {
    assert_eq!(realtime_sources(&channel("general", "General"), LEGACY).len(), 2);
    assert_eq!(realtime_sources(&channel("random", "Random"), LEGACY).len(), 1);

    let sources = realtime_sources(&direct("alice", "bob"), LEGACY);
    assert_eq!(sources.len(), 1);
    assert!(sources[0].1.matches(&json!({ "recipient_id": "bob" })));
    assert!(sources[0].1.matches(&json!({ "recipient_id": "alice" })));
}

#[test]
fn realtime_rows_are_checked_against_the_conversation() {
    let general = channel("general", "General");
    assert!(accepts(&general, &row("bob", Some("general"), None), LEGACY));
    assert!(accepts(&general, &row("bob", None, None), LEGACY));
    assert!(!accepts(&general, &row("bob", None, Some("alice")), LEGACY));
    assert!(!accepts(&general, &row("bob", Some("random"), None), LEGACY));

    let random = channel("random", "Random");
    assert!(!accepts(&random, &row("bob", None, None), LEGACY));

    let dm = direct("alice", "bob");
    assert!(accepts(&dm, &row("bob", None, Some("alice")), LEGACY));
    assert!(accepts(&dm, &row("alice", None, Some("bob")), LEGACY));
    assert!(!accepts(&dm, &row("carol", None, Some("alice")), LEGACY));
    assert!(!accepts(&dm, &row("bob", None, None), LEGACY));
}

#[test]
fn pinned_query_orders_newest_first() {
    let query = pinned_query(&channel("general", "General")).expect("query");
    let order = query.order.expect("order");
    assert_eq!(order.column, "pinned_at");
    assert_eq!(order.direction, Direction::Descending);
    assert!(query
        .filter
        .matches(&json!({ "channel_id": "general", "pinned": true })));
    assert!(!query
        .filter
        .matches(&json!({ "channel_id": "general", "pinned": false })));
}
