//! Who is online: a shared presence channel for the live roster, mirrored into the
//! `online_members` table for "recently online" listings.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gateway::{PresenceChannel, PresenceEvent, RemoteStore, RemoteStoreExt};
use serde_json::json;
use shared::{
    domain::{UserId, UserProfile},
    protocol::{decode_row, encode_row, OnlineMemberRow, PresenceMeta, Table},
    query::{Direction, Filter, Query},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings, directory::AuthorDirectory, error::ChatResult, session::Session,
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Offline,
    Announcing,
    Online,
}

/// A durable member row counts as recently online only when flagged online and seen inside `window`.
pub fn is_recently_online(row: &OnlineMemberRow, now: DateTime<Utc>, window: chrono::Duration) -> bool {
    row.is_online
        && row
            .last_seen
            .is_some_and(|seen| now - seen < window)
}

pub fn filter_recently_online(
    rows: impl IntoIterator<Item = OnlineMemberRow>,
    now: DateTime<Utc>,
    window: chrono::Duration,
    exclude: Option<&UserId>,
) -> Vec<OnlineMemberRow> {
    rows.into_iter()
        .filter(|row| exclude != Some(&row.user_id))
        .filter(|row| is_recently_online(row, now, window))
        .collect()
}

struct PresenceInner {
    state: PresenceState,
    channel: Option<Arc<dyn PresenceChannel>>,
    sync_task: Option<JoinHandle<()>>,
}

pub struct PresenceCoordinator {
    session: Session,
    gateway: Arc<dyn RemoteStore>,
    directory: Arc<AuthorDirectory>,
    settings: ClientSettings,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<PresenceInner>,
    roster: Arc<RwLock<Vec<UserProfile>>>,
}

impl PresenceCoordinator {
    pub fn new(
        session: Session,
        gateway: Arc<dyn RemoteStore>,
        directory: Arc<AuthorDirectory>,
        settings: ClientSettings,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            session,
            gateway,
            directory,
            settings,
            events,
            inner: Mutex::new(PresenceInner {
                state: PresenceState::Offline,
                channel: None,
                sync_task: None,
            }),
            roster: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn state(&self) -> PresenceState {
        self.inner.lock().await.state
    }

    /// Users currently tracked on the presence channel, sorted by username.
    pub async fn online_users(&self) -> Vec<UserProfile> {
        self.roster.read().await.clone()
    }

    /// Joins the presence channel, tracks this session and marks it online. No-op when already joined.
    pub async fn go_online(&self) -> ChatResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != PresenceState::Offline {
            return Ok(());
        }
        inner.state = PresenceState::Announcing;

        let channel = match self
            .gateway
            .join_presence(&self.settings.presence_channel, self.session.user_id().as_str())
            .await
        {
            Ok(channel) => channel,
            Err(error) => {
                inner.state = PresenceState::Offline;
                return Err(error.into());
            }
        };

        let rx = channel.subscribe_events();
        let sync_task = tokio::spawn(run_roster_sync(
            Arc::clone(&channel),
            Arc::clone(&self.directory),
            Arc::clone(&self.roster),
            self.events.clone(),
            rx,
        ));

        let now = Utc::now();
        let meta = PresenceMeta {
            user_id: self.session.user_id().clone(),
            username: self.session.username().to_string(),
            online_at: now,
        };
        let tracked = match encode_row(&meta) {
            Ok(meta) => channel.track(meta).await,
            Err(error) => Err(error),
        };
        if let Err(error) = tracked {
            sync_task.abort();
            if let Err(leave_error) = channel.leave().await {
                debug!(error = %leave_error, "leave after failed track");
            }
            inner.state = PresenceState::Offline;
            return Err(error.into());
        }

        let member = OnlineMemberRow {
            user_id: self.session.user_id().clone(),
            username: Some(self.session.username().to_string()),
            is_online: true,
            last_seen: Some(now),
        };
        match encode_row(&member) {
            Ok(record) => {
                if let Err(error) = self
                    .gateway
                    .upsert(Table::OnlineMembers, record, &["user_id"])
                    .await
                {
                    warn!(%error, "marking member online failed");
                }
            }
            Err(error) => warn!(%error, "encoding online member failed"),
        }

        inner.channel = Some(channel);
        inner.sync_task = Some(sync_task);
        inner.state = PresenceState::Online;
        info!(user_id = %self.session.user_id(), "presence online");
        Ok(())
    }

    /// Best-effort teardown: every failure is logged and the session still ends offline.
    pub async fn go_offline(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == PresenceState::Offline {
            return;
        }

        let patch = json!({
            "is_online": false,
            "last_seen": Utc::now(),
        });
        if let Err(error) = self
            .gateway
            .update(
                Table::OnlineMembers,
                patch,
                Filter::eq("user_id", self.session.user_id().as_str()),
            )
            .await
        {
            warn!(%error, "marking member offline failed");
        }

        if let Some(task) = inner.sync_task.take() {
            task.abort();
        }
        if let Some(channel) = inner.channel.take() {
            if let Err(error) = channel.leave().await {
                warn!(%error, "leaving presence channel failed");
            }
        }
        self.roster.write().await.clear();
        inner.state = PresenceState::Offline;
        info!(user_id = %self.session.user_id(), "presence offline");
    }

    /// Members flagged online and seen within the freshness window, excluding this session.
    pub async fn recently_online(&self) -> ChatResult<Vec<OnlineMemberRow>> {
        let query = Query::new(Table::OnlineMembers)
            .filter(Filter::eq("is_online", true))
            .order_by("last_seen", Direction::Descending);
        let rows = self.gateway.query_as::<OnlineMemberRow>(query).await?;
        Ok(filter_recently_online(
            rows,
            Utc::now(),
            self.settings.presence_freshness(),
            Some(self.session.user_id()),
        ))
    }
}

async fn run_roster_sync(
    channel: Arc<dyn PresenceChannel>,
    directory: Arc<AuthorDirectory>,
    roster: Arc<RwLock<Vec<UserProfile>>>,
    events: broadcast::Sender<ClientEvent>,
    mut rx: broadcast::Receiver<PresenceEvent>,
) {
    refresh_roster(channel.as_ref(), &directory, &roster, &events).await;
    loop {
        match rx.recv().await {
            Ok(PresenceEvent::Sync) => {
                refresh_roster(channel.as_ref(), &directory, &roster, &events).await;
            }
            Ok(PresenceEvent::Broadcast { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "presence listener lagged; resyncing");
                refresh_roster(channel.as_ref(), &directory, &roster, &events).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Rebuilds the roster from the channel snapshot; it is replaced wholesale, never patched.
async fn refresh_roster(
    channel: &dyn PresenceChannel,
    directory: &AuthorDirectory,
    roster: &RwLock<Vec<UserProfile>>,
    events: &broadcast::Sender<ClientEvent>,
) {
    let snapshot = channel.snapshot();
    let ids: Vec<UserId> = snapshot.keys().map(|key| UserId::new(key.as_str())).collect();
    let mut profiles = directory.resolve(ids.iter().cloned()).await;

    let mut users: Vec<UserProfile> = snapshot
        .into_iter()
        .filter_map(|(key, metas)| {
            let user_id = UserId::new(key);
            if let Some(profile) = profiles.remove(&user_id) {
                return Some(profile);
            }
            let meta: PresenceMeta = metas
                .into_iter()
                .find_map(|meta| decode_row(meta).ok())?;
            Some(UserProfile {
                user_id,
                username: meta.username,
                role: Default::default(),
                avatar_url: None,
            })
        })
        .collect();
    users.sort_by(|a, b| a.username.cmp(&b.username));

    *roster.write().await = users.clone();
    let _ = events.send(ClientEvent::RosterUpdated { users });
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
