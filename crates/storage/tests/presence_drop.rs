use gateway::{PresenceEvent, RemoteStore};
use serde_json::json;
use storage::MemoryStore;

#[tokio::test]
async fn dropped_member_disappears_from_roster_without_leave() {
    let store = MemoryStore::new();
    let alice = store
        .join_presence("online-users", "alice")
        .await
        .expect("alice joins");
    let observer = store
        .join_presence("online-users", "observer")
        .await
        .expect("observer joins");
    alice
        .track(json!({ "user_id": "alice" }))
        .await
        .expect("track");

    let mut events = observer.subscribe_events();
    store.drop_presence_member("online-users", "alice");

    assert_eq!(events.recv().await.expect("sync"), PresenceEvent::Sync);
    assert!(observer.snapshot().is_empty());
}
