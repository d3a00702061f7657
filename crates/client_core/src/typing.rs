//! Ephemeral typing indicators for one conversation, carried over a broadcast channel.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use gateway::{PresenceChannel, PresenceEvent, RemoteStore};
use serde_json::Value;
use shared::{
    domain::Conversation,
    protocol::{decode_row, encode_row, TypingPayload},
};
use tokio::{
    sync::{broadcast, Notify},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, warn};

use crate::{error::ChatResult, session::Session, ClientEvent};

pub const TYPING_EVENT: &str = "typing";
pub const STOP_TYPING_EVENT: &str = "stop_typing";

pub fn typing_topic(conversation: &Conversation) -> String {
    format!("typing:{}", conversation.key())
}

#[derive(Debug, Clone)]
struct TypingClaim {
    username: String,
    expires_at: Instant,
}

/// Remote users currently typing, in the order they started.
#[derive(Debug, Clone, Default)]
pub struct TypingSet {
    claims: Vec<TypingClaim>,
}

impl TypingSet {
    /// Adds or refreshes a claim. Returns true when `username` was not already visible.
    pub fn observe_typing(&mut self, username: &str, now: Instant, expiry: Duration) -> bool {
        let expires_at = now + expiry;
        if let Some(claim) = self.claims.iter_mut().find(|c| c.username == username) {
            let was_visible = claim.expires_at > now;
            claim.expires_at = expires_at;
            return !was_visible;
        }
        self.claims.push(TypingClaim {
            username: username.to_string(),
            expires_at,
        });
        true
    }

    pub fn observe_stop(&mut self, username: &str) -> bool {
        let before = self.claims.len();
        self.claims.retain(|c| c.username != username);
        before != self.claims.len()
    }

    /// Drops claims that were not refreshed in time. Returns true when any were dropped.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.claims.len();
        self.claims.retain(|c| c.expires_at > now);
        before != self.claims.len()
    }

    pub fn visible(&self, now: Instant) -> Vec<String> {
        self.claims
            .iter()
            .filter(|c| c.expires_at > now)
            .map(|c| c.username.clone())
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.claims.iter().map(|c| c.expires_at).min()
    }

    pub fn clear(&mut self) {
        self.claims.clear();
    }
}

/// Idle timer for the local user's own typing signal.
#[derive(Debug, Clone, Default)]
pub struct LocalTyping {
    stop_at: Option<Instant>,
}

impl LocalTyping {
    pub fn keystroke(&mut self, now: Instant, idle: Duration) {
        self.stop_at = Some(now + idle);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.stop_at
    }

    pub fn is_active(&self) -> bool {
        self.stop_at.is_some()
    }

    /// True once when the idle deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.stop_at {
            Some(at) if at <= now => {
                self.stop_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) -> bool {
        self.stop_at.take().is_some()
    }
}

#[derive(Default)]
struct TypingState {
    remote: TypingSet,
    local: LocalTyping,
}

struct TypingShared {
    state: Mutex<TypingState>,
    wake: Notify,
    idle: Duration,
    expiry: Duration,
    events: broadcast::Sender<ClientEvent>,
}

impl TypingShared {
    fn lock(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, users: Vec<String>) {
        let _ = self.events.send(ClientEvent::TypingChanged { users });
    }
}

/// Sending side of a joined typing channel. Cheap to clone, so callers can broadcast
/// without holding any view lock.
#[derive(Clone)]
pub struct TypingSignal {
    session: Session,
    channel: Arc<dyn PresenceChannel>,
    shared: Arc<TypingShared>,
}

impl TypingSignal {
    /// Announces that the local user is typing and restarts the idle timer.
    pub async fn keystroke(&self) -> ChatResult<()> {
        self.channel
            .broadcast(TYPING_EVENT, payload_for(&self.session)?)
            .await?;
        self.shared
            .lock()
            .local
            .keystroke(Instant::now(), self.shared.idle);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Sends `stop_typing` right away, as when a message is submitted.
    pub async fn stop(&self) -> ChatResult<()> {
        if !self.shared.lock().local.reset() {
            return Ok(());
        }
        broadcast_stop(&self.session, self.channel.as_ref()).await
    }
}

/// Joined typing channel for the active conversation plus the task that ages claims out.
pub struct TypingCoordinator {
    signal: TypingSignal,
    task: JoinHandle<()>,
}

impl TypingCoordinator {
    pub async fn join(
        gateway: &dyn RemoteStore,
        session: Session,
        conversation: &Conversation,
        idle: Duration,
        expiry: Duration,
        events: broadcast::Sender<ClientEvent>,
    ) -> ChatResult<Self> {
        let topic = typing_topic(conversation);
        let channel = gateway
            .join_presence(&topic, session.user_id().as_str())
            .await?;
        let rx = channel.subscribe_events();
        let shared = Arc::new(TypingShared {
            state: Mutex::new(TypingState::default()),
            wake: Notify::new(),
            idle,
            expiry,
            events,
        });
        let task = tokio::spawn(run_typing_loop(
            session.clone(),
            Arc::clone(&channel),
            Arc::clone(&shared),
            rx,
        ));
        debug!(%topic, "joined typing channel");
        Ok(Self {
            signal: TypingSignal {
                session,
                channel,
                shared,
            },
            task,
        })
    }

    pub fn topic(&self) -> &str {
        self.signal.channel.topic()
    }

    pub fn signal(&self) -> TypingSignal {
        self.signal.clone()
    }

    pub async fn keystroke(&self) -> ChatResult<()> {
        self.signal.keystroke().await
    }

    pub async fn stop(&self) -> ChatResult<()> {
        self.signal.stop().await
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.signal.shared.lock().remote.visible(Instant::now())
    }

    pub async fn shutdown(self) {
        self.task.abort();
        if let Err(error) = self.signal.stop().await {
            debug!(%error, "stop_typing on shutdown failed");
        }
        self.signal.shared.lock().remote.clear();
        let channel = &self.signal.channel;
        if let Err(error) = channel.leave().await {
            warn!(%error, topic = channel.topic(), "leaving typing channel failed");
        }
    }
}

fn payload_for(session: &Session) -> ChatResult<Value> {
    Ok(encode_row(&TypingPayload {
        user_id: session.user_id().clone(),
        username: session.username().to_string(),
    })?)
}

async fn broadcast_stop(session: &Session, channel: &dyn PresenceChannel) -> ChatResult<()> {
    channel
        .broadcast(STOP_TYPING_EVENT, payload_for(session)?)
        .await?;
    Ok(())
}

async fn run_typing_loop(
    session: Session,
    channel: Arc<dyn PresenceChannel>,
    shared: Arc<TypingShared>,
    mut rx: broadcast::Receiver<PresenceEvent>,
) {
    loop {
        let deadline = {
            let state = shared.lock();
            match (state.remote.next_deadline(), state.local.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        };
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            event = rx.recv() => match event {
                Ok(PresenceEvent::Broadcast { event, payload }) => {
                    apply_remote_event(&session, &shared, &event, payload);
                }
                Ok(PresenceEvent::Sync) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "typing listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = timer => {
                let now = Instant::now();
                let (expired, stop_due, visible) = {
                    let mut state = shared.lock();
                    let expired = state.remote.expire(now);
                    let stop_due = state.local.take_due(now);
                    (expired, stop_due, state.remote.visible(now))
                };
                if expired {
                    shared.publish(visible);
                }
                if stop_due {
                    if let Err(error) = broadcast_stop(&session, channel.as_ref()).await {
                        warn!(%error, "idle stop_typing broadcast failed");
                    }
                }
            }
            _ = shared.wake.notified() => {}
        }
    }
}

fn apply_remote_event(session: &Session, shared: &TypingShared, event: &str, payload: Value) {
    let payload: TypingPayload = match decode_row(payload) {
        Ok(payload) => payload,
        Err(error) => {
            debug!(%error, event, "ignoring malformed typing payload");
            return;
        }
    };
    if &payload.user_id == session.user_id() {
        return;
    }

    let now = Instant::now();
    let (changed, visible) = {
        let mut state = shared.lock();
        let changed = match event {
            TYPING_EVENT => state
                .remote
                .observe_typing(&payload.username, now, shared.expiry),
            STOP_TYPING_EVENT => state.remote.observe_stop(&payload.username),
            _ => false,
        };
        (changed, state.remote.visible(now))
    };
    if changed {
        shared.publish(visible);
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
