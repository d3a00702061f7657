use super::*;
use shared::domain::{ChannelId, ChannelSummary, Role, UserId, UserProfile};
use storage::MemoryStore;
use tokio::time::sleep;

const IDLE: Duration = Duration::from_secs(2);
const EXPIRY: Duration = Duration::from_secs(3);

fn session(id: &str) -> Session {
    Session::new(UserProfile {
        user_id: UserId::from(id),
        username: id.to_uppercase(),
        role: Role::User,
        avatar_url: None,
    })
}

fn general() -> Conversation {
    Conversation::Channel(ChannelSummary {
        channel_id: ChannelId::from("general"),
        name: "General".into(),
        description: None,
    })
}

async fn join(store: &MemoryStore, id: &str) -> TypingCoordinator {
    let (events, _) = broadcast::channel(16);
    TypingCoordinator::join(store, session(id), &general(), IDLE, EXPIRY, events)
        .await
        .expect("join typing channel")
}

#[test]
fn claim_expires_three_seconds_after_last_refresh() {
    let start = Instant::now();
    let mut set = TypingSet::default();

    assert!(set.observe_typing("bob", start, EXPIRY));
    assert!(!set.observe_typing("bob", start + Duration::from_secs(2), EXPIRY));

    assert_eq!(set.visible(start + Duration::from_millis(3100)), vec!["bob"]);
    assert!(!set.expire(start + Duration::from_millis(4900)));
    assert!(set.expire(start + Duration::from_millis(5100)));
    assert!(set.visible(start + Duration::from_millis(5100)).is_empty());
}

#[test]
fn stop_event_removes_claim_immediately() {
    let start = Instant::now();
    let mut set = TypingSet::default();
    set.observe_typing("bob", start, EXPIRY);
    set.observe_typing("carol", start, EXPIRY);

    assert!(set.observe_stop("bob"));
    assert!(!set.observe_stop("bob"));
    assert_eq!(set.visible(start), vec!["carol"]);
    assert_eq!(set.next_deadline(), Some(start + EXPIRY));
}

#[test]
fn local_idle_timer_fires_once() {
    let start = Instant::now();
    let mut local = LocalTyping::default();
    local.keystroke(start, IDLE);
    local.keystroke(start + Duration::from_secs(1), IDLE);

    assert!(!local.take_due(start + Duration::from_secs(2)));
    assert!(local.take_due(start + Duration::from_secs(3)));
    assert!(!local.take_due(start + Duration::from_secs(4)));
    assert!(!local.is_active());
}

#[tokio::test(start_paused = true)]
async fn remote_claim_disappears_without_refresh() {
    let store = MemoryStore::new();
    let bob = join(&store, "bob").await;

    // A peer that vanishes without ever sending stop_typing.
    let carol = store
        .join_presence(&typing_topic(&general()), "carol")
        .await
        .expect("join");
    carol
        .broadcast(
            TYPING_EVENT,
            serde_json::json!({ "user_id": "carol", "username": "CAROL" }),
        )
        .await
        .expect("broadcast");

    sleep(Duration::from_millis(10)).await;
    assert_eq!(bob.typing_users(), vec!["CAROL"]);

    sleep(Duration::from_millis(3100)).await;
    assert!(bob.typing_users().is_empty());
    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn own_broadcasts_are_not_shown() {
    let store = MemoryStore::new();
    let alice = join(&store, "alice").await;

    alice.keystroke().await.expect("keystroke");
    sleep(Duration::from_millis(10)).await;
    assert!(alice.typing_users().is_empty());
    alice.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_sender_broadcasts_stop_before_expiry() {
    let store = MemoryStore::new();
    let alice = join(&store, "alice").await;
    let bob = join(&store, "bob").await;

    alice.keystroke().await.expect("keystroke");
    sleep(Duration::from_millis(10)).await;
    assert_eq!(bob.typing_users(), vec!["ALICE"]);

    sleep(Duration::from_millis(2200)).await;
    assert!(bob.typing_users().is_empty());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_keystrokes_keep_claim_alive() {
    let store = MemoryStore::new();
    let alice = join(&store, "alice").await;
    let bob = join(&store, "bob").await;

    for _ in 0..4 {
        alice.keystroke().await.expect("keystroke");
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(bob.typing_users(), vec!["ALICE"]);
    }

    alice.shutdown().await;
    bob.shutdown().await;
}
