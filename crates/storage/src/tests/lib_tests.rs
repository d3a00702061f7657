use super::*;
use serde_json::json;

fn message(id: &str, channel: &str, sent_at: &str) -> Value {
    json!({
        "id": id,
        "content": format!("body {id}"),
        "channel_id": channel,
        "recipient_id": null,
        "user_id": "alice",
        "sent_at": sent_at,
    })
}

#[tokio::test]
async fn query_filters_orders_and_limits() {
    let store = MemoryStore::new();
    store.seed(
        Table::Messages,
        [
            message("m-3", "general", "2024-05-01T10:00:03Z"),
            message("m-1", "general", "2024-05-01T10:00:01Z"),
            message("m-x", "random", "2024-05-01T10:00:00Z"),
            message("m-2", "general", "2024-05-01T10:00:02.250Z"),
        ],
    );

    let rows = store
        .query(
            Query::new(Table::Messages)
                .filter(Filter::eq("channel_id", "general"))
                .order_by("sent_at", Direction::Ascending)
                .limit(2),
        )
        .await
        .expect("query");

    let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["m-1", "m-2"]);
}

#[tokio::test]
async fn insert_assigns_id_and_timestamp() {
    let store = MemoryStore::new();
    let row = store
        .insert(
            Table::Messages,
            json!({ "content": "hi", "user_id": "alice", "channel_id": "general" }),
        )
        .await
        .expect("insert");
    assert!(row["id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(row["sent_at"].is_string());
}

#[tokio::test]
async fn duplicate_reaction_insert_is_a_conflict() {
    let store = MemoryStore::new();
    let reaction = json!({ "message_id": "m-1", "user_id": "alice", "emoji": "👍" });
    store
        .insert(Table::MessageReactions, reaction.clone())
        .await
        .expect("first insert");
    let err = store
        .insert(Table::MessageReactions, reaction)
        .await
        .expect_err("second insert must conflict");
    assert!(err.is_conflict());
    assert_eq!(store.rows(Table::MessageReactions).len(), 1);
}

#[tokio::test]
async fn upsert_updates_matching_row_in_place() {
    let store = MemoryStore::new();
    store
        .upsert(
            Table::OnlineMembers,
            json!({ "user_id": "alice", "is_online": true }),
            &["user_id"],
        )
        .await
        .expect("first upsert");
    store
        .upsert(
            Table::OnlineMembers,
            json!({ "user_id": "alice", "is_online": false }),
            &["user_id"],
        )
        .await
        .expect("second upsert");

    let rows = store.rows(Table::OnlineMembers);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["is_online"], json!(false));
}

#[tokio::test]
async fn update_and_delete_report_affected_rows() {
    let store = MemoryStore::new();
    store.seed(
        Table::Messages,
        [
            message("m-1", "general", "2024-05-01T10:00:01Z"),
            message("m-2", "general", "2024-05-01T10:00:02Z"),
        ],
    );

    let updated = store
        .update(
            Table::Messages,
            json!({ "pinned": true }),
            Filter::eq("id", "m-1"),
        )
        .await
        .expect("update");
    assert_eq!(updated, 1);

    let deleted = store
        .delete(Table::Messages, Filter::eq("channel_id", "general"))
        .await
        .expect("delete");
    assert_eq!(deleted, 2);
    assert!(store.rows(Table::Messages).is_empty());
}

#[tokio::test]
async fn subscriptions_receive_matching_inserts_only() {
    let store = MemoryStore::new();
    let mut general = store
        .subscribe(Table::Messages, Filter::eq("channel_id", "general"))
        .await
        .expect("subscribe");

    store
        .insert(Table::Messages, json!({ "content": "elsewhere", "user_id": "bob", "channel_id": "random" }))
        .await
        .expect("insert random");
    let inserted = store
        .insert(Table::Messages, json!({ "content": "hello", "user_id": "bob", "channel_id": "general" }))
        .await
        .expect("insert general");

    let delivered = general.recv().await.expect("event");
    assert_eq!(delivered, inserted);
}

#[tokio::test]
async fn duplicate_delivery_sends_each_insert_twice() {
    let store = MemoryStore::new();
    store.set_duplicate_delivery(true);
    let mut subscription = store
        .subscribe(Table::Messages, Filter::All)
        .await
        .expect("subscribe");

    store
        .insert(Table::Messages, json!({ "content": "hello", "user_id": "bob" }))
        .await
        .expect("insert");

    let first = subscription.recv().await.expect("first copy");
    let second = subscription.recv().await.expect("second copy");
    assert_eq!(first, second);
}

#[tokio::test]
async fn cancelled_subscriptions_are_pruned() {
    let store = MemoryStore::new();
    let subscription = store
        .subscribe(Table::Messages, Filter::All)
        .await
        .expect("subscribe");
    assert_eq!(store.active_subscriptions(), 1);
    subscription.cancel();
    assert_eq!(store.active_subscriptions(), 0);
}

#[tokio::test]
async fn one_shot_fault_fails_a_single_call() {
    let store = MemoryStore::new();
    store.inject_fault_once(
        Table::Messages,
        Operation::Query,
        GatewayError::transport("connection reset"),
    );

    let err = store
        .query(Query::new(Table::Messages))
        .await
        .expect_err("first query fails");
    assert_eq!(err.code, shared::error::ErrorCode::Transport);
    store
        .query(Query::new(Table::Messages))
        .await
        .expect("second query succeeds");
}

#[tokio::test]
async fn presence_snapshot_tracks_and_releases_members() {
    let store = MemoryStore::new();
    let alice = store
        .join_presence("online-users", "alice")
        .await
        .expect("alice joins");
    let bob = store
        .join_presence("online-users", "bob")
        .await
        .expect("bob joins");
    let mut events = bob.subscribe_events();

    alice
        .track(json!({ "user_id": "alice" }))
        .await
        .expect("track");
    assert_eq!(events.recv().await.expect("sync"), PresenceEvent::Sync);
    assert!(bob.snapshot().contains_key("alice"));

    alice.leave().await.expect("leave");
    assert!(!bob.snapshot().contains_key("alice"));
    assert!(alice.broadcast("typing", json!({})).await.is_err());
}

#[tokio::test]
async fn broadcasts_reach_other_handles_on_the_topic() {
    let store = MemoryStore::new();
    let alice = store
        .join_presence("typing:channel:general", "alice")
        .await
        .expect("alice joins");
    let bob = store
        .join_presence("typing:channel:general", "bob")
        .await
        .expect("bob joins");
    let mut events = bob.subscribe_events();

    alice
        .broadcast("typing", json!({ "username": "Alice" }))
        .await
        .expect("broadcast");

    match events.recv().await.expect("event") {
        PresenceEvent::Broadcast { event, payload } => {
            assert_eq!(event, "typing");
            assert_eq!(payload["username"], "Alice");
        }
        other => panic!("unexpected event {other:?}"),
    }
}
