//! The chat client facade: owns the active conversation view and routes every
//! mutation through the reconciliation log before it reaches the store.

use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::StreamExt;
use gateway::{merge_subscriptions, RemoteStore, RemoteStoreExt, Subscription};
use serde_json::{json, Value};
use shared::{
    domain::{ChannelId, ChannelSummary, Conversation, DirectPair, MessageId, UserId, UserProfile},
    protocol::{
        decode_row, encode_row, AnnouncementRow, ChannelRow, MessageRow, NewMessage,
        OnlineMemberRow, ReactionRow, Table,
    },
    query::{Direction, Filter, Query},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientSettings,
    directory::{usernames, AuthorDirectory},
    error::{ChatError, ChatResult},
    messages::{ChatMessage, Draft, MergeOutcome, MessageLog, PinInfo},
    permissions::{can_delete, can_edit, can_pin, can_post_announcement},
    pins::PinnedSet,
    presence::PresenceCoordinator,
    reactions::{fold_reaction_rows, toggle_reaction, ReactionToggle, Reactor},
    session::Session,
    typing::TypingCoordinator,
    ClientEvent,
};

/// Display name for entries of the announcements feed.
pub const ANNOUNCEMENTS_AUTHOR: &str = "Announcements";

fn legacy_channel_filter(channel_id: &ChannelId) -> Filter {
    Filter::or([
        Filter::eq("channel_id", channel_id.as_str()),
        Filter::and([Filter::is_null("channel_id"), Filter::is_null("recipient_id")]),
    ])
}

fn direct_filter(pair: &DirectPair) -> Filter {
    Filter::or([
        Filter::and([
            Filter::eq("user_id", pair.local.as_str()),
            Filter::eq("recipient_id", pair.peer.as_str()),
        ]),
        Filter::and([
            Filter::eq("user_id", pair.peer.as_str()),
            Filter::eq("recipient_id", pair.local.as_str()),
        ]),
    ])
}

fn is_legacy(channel: &ChannelSummary, legacy_channel_name: &str) -> bool {
    channel.name == legacy_channel_name
}

/// Full history of a conversation, oldest first.
pub fn history_query(conversation: &Conversation, legacy_channel_name: &str) -> Query {
    match conversation {
        Conversation::Channel(channel) => {
            let filter = if is_legacy(channel, legacy_channel_name) {
                legacy_channel_filter(&channel.channel_id)
            } else {
                Filter::eq("channel_id", channel.channel_id.as_str())
            };
            Query::new(Table::Messages)
                .filter(filter)
                .order_by("sent_at", Direction::Ascending)
        }
        Conversation::Direct(pair) => Query::new(Table::Messages)
            .filter(direct_filter(pair))
            .order_by("sent_at", Direction::Ascending),
        Conversation::Announcements => Query::new(Table::GlobalAlerts)
            .filter(Filter::eq("is_active", true))
            .order_by("created_at", Direction::Ascending),
    }
}

pub fn pinned_query(conversation: &Conversation) -> Option<Query> {
    let scope = match conversation {
        Conversation::Channel(channel) => Filter::eq("channel_id", channel.channel_id.as_str()),
        Conversation::Direct(pair) => direct_filter(pair),
        Conversation::Announcements => return None,
    };
    Some(
        Query::new(Table::Messages)
            .filter(Filter::and([scope, Filter::eq("pinned", true)]))
            .order_by("pinned_at", Direction::Descending),
    )
}

/// Insert feeds that together cover a conversation. Rows still pass through [`accepts`].
pub fn realtime_sources(
    conversation: &Conversation,
    legacy_channel_name: &str,
) -> Vec<(Table, Filter)> {
    match conversation {
        Conversation::Channel(channel) => {
            let mut sources = vec![(
                Table::Messages,
                Filter::eq("channel_id", channel.channel_id.as_str()),
            )];
            if is_legacy(channel, legacy_channel_name) {
                sources.push((Table::Messages, Filter::is_null("channel_id")));
            }
            sources
        }
        Conversation::Direct(pair) => vec![(
            Table::Messages,
            Filter::is_in("recipient_id", [pair.local.as_str(), pair.peer.as_str()]),
        )],
        Conversation::Announcements => {
            vec![(Table::GlobalAlerts, Filter::eq("is_active", true))]
        }
    }
}

/// Whether a realtime message row belongs in `conversation`.
pub fn accepts(conversation: &Conversation, row: &MessageRow, legacy_channel_name: &str) -> bool {
    match conversation {
        Conversation::Channel(channel) => match &row.channel_id {
            Some(channel_id) => channel_id == &channel.channel_id,
            None => row.recipient_id.is_none() && is_legacy(channel, legacy_channel_name),
        },
        Conversation::Direct(pair) => row
            .recipient_id
            .as_ref()
            .is_some_and(|recipient| pair.contains(&row.user_id, recipient)),
        Conversation::Announcements => false,
    }
}

fn addressing(conversation: &Conversation) -> Option<(Option<ChannelId>, Option<UserId>)> {
    match conversation {
        Conversation::Channel(channel) => Some((Some(channel.channel_id.clone()), None)),
        Conversation::Direct(pair) => Some((None, Some(pair.peer.clone()))),
        Conversation::Announcements => None,
    }
}

/// Whether a locally composed entry was addressed to `conversation`.
fn addressed_to(conversation: &Conversation, message: &ChatMessage) -> bool {
    addressing(conversation).is_some_and(|(channel_id, recipient_id)| {
        message.channel_id == channel_id && message.recipient_id == recipient_id
    })
}

struct ViewState {
    /// Bumped whenever a new view is installed.
    epoch: u64,
    /// Latest selection request; older loads are discarded.
    requested: u64,
    active: Option<Conversation>,
    log: MessageLog,
    pins: PinnedSet,
    feed: Option<JoinHandle<()>>,
    typing: Option<TypingCoordinator>,
    closed: bool,
}

impl ViewState {
    fn active(&self) -> ChatResult<&Conversation> {
        if self.closed {
            return Err(ChatError::SessionClosed);
        }
        self.active.as_ref().ok_or(ChatError::NoActiveConversation)
    }

    fn confirmed(&self, id: &MessageId) -> ChatResult<&ChatMessage> {
        let message = self
            .log
            .get(id)
            .ok_or_else(|| ChatError::MessageNotFound(id.clone()))?;
        if !message.is_confirmed() {
            return Err(ChatError::Unconfirmed(id.clone()));
        }
        Ok(message)
    }
}

pub struct ChatClient {
    session: Session,
    gateway: Arc<dyn RemoteStore>,
    settings: ClientSettings,
    directory: Arc<AuthorDirectory>,
    presence: PresenceCoordinator,
    events: broadcast::Sender<ClientEvent>,
    view: Mutex<ViewState>,
}

impl ChatClient {
    pub fn new(
        session: Session,
        gateway: Arc<dyn RemoteStore>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.realtime_buffer.max(1));
        let directory = Arc::new(AuthorDirectory::with_known(
            Arc::clone(&gateway),
            [session.profile().clone()],
        ));
        let presence = PresenceCoordinator::new(
            session.clone(),
            Arc::clone(&gateway),
            Arc::clone(&directory),
            settings.clone(),
            events.clone(),
        );
        Arc::new(Self {
            view: Mutex::new(ViewState {
                epoch: 0,
                requested: 0,
                active: None,
                log: MessageLog::new(settings.promotion_window()),
                pins: PinnedSet::default(),
                feed: None,
                typing: None,
                closed: false,
            }),
            session,
            gateway,
            settings,
            directory,
            presence,
            events,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn presence(&self) -> &PresenceCoordinator {
        &self.presence
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub async fn active_conversation(&self) -> Option<Conversation> {
        self.view.lock().await.active.clone()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.view.lock().await.log.messages().to_vec()
    }

    pub async fn message(&self, id: &MessageId) -> Option<ChatMessage> {
        self.view.lock().await.log.get(id).cloned()
    }

    pub async fn pinned(&self) -> Vec<ChatMessage> {
        self.view.lock().await.pins.entries().to_vec()
    }

    pub async fn typing_users(&self) -> Vec<String> {
        self.view
            .lock()
            .await
            .typing
            .as_ref()
            .map(TypingCoordinator::typing_users)
            .unwrap_or_default()
    }

    pub async fn online_users(&self) -> Vec<UserProfile> {
        self.presence.online_users().await
    }

    pub async fn recently_online(&self) -> ChatResult<Vec<OnlineMemberRow>> {
        self.presence.recently_online().await
    }

    /// The announcements feed followed by the stored channels sorted by name.
    pub async fn list_channels(&self) -> ChatResult<Vec<ChannelSummary>> {
        let query = Query::new(Table::Channels).order_by("name", Direction::Ascending);
        let rows = self
            .gateway
            .query_as::<ChannelRow>(query)
            .await
            .inspect_err(|error| error!(%error, "channel listing failed"))?;

        let announcements = ChannelSummary {
            channel_id: ChannelId::new(self.settings.announcements_channel_id.as_str()),
            name: ANNOUNCEMENTS_AUTHOR.to_string(),
            description: Some("Server-wide notices".to_string()),
        };
        Ok(std::iter::once(announcements)
            .chain(rows.into_iter().map(Into::into))
            .collect())
    }

    pub fn conversation_for(&self, channel: ChannelSummary) -> Conversation {
        if channel.channel_id.as_str() == self.settings.announcements_channel_id {
            Conversation::Announcements
        } else {
            Conversation::Channel(channel)
        }
    }

    pub fn direct_with(&self, peer: UserId) -> Conversation {
        Conversation::Direct(DirectPair::new(self.session.user_id().clone(), peer))
    }

    /// The legacy default channel when listed, otherwise the first regular channel.
    pub fn default_conversation(&self, channels: &[ChannelSummary]) -> Option<Conversation> {
        let regular = || {
            channels
                .iter()
                .filter(|c| c.channel_id.as_str() != self.settings.announcements_channel_id)
        };
        regular()
            .find(|c| c.name == self.settings.legacy_channel_name)
            .or_else(|| regular().next())
            .or_else(|| channels.first())
            .cloned()
            .map(|channel| self.conversation_for(channel))
    }

    /// Switches the view to `conversation`. The current view stays in place until the new
    /// history is loaded; a failed load leaves it untouched and returns the error. Feeds and
    /// typing of the previous conversation are torn down once the new view is installed,
    /// and loads that finish after a newer selection are discarded.
    pub async fn select_conversation(self: &Arc<Self>, conversation: Conversation) -> ChatResult<()> {
        let ticket = {
            let mut view = self.view.lock().await;
            if view.closed {
                return Err(ChatError::SessionClosed);
            }
            view.requested += 1;
            view.requested
        };
        debug!(%conversation, ticket, "loading conversation");

        if let Err(error) = self.presence.go_online().await {
            warn!(%error, "presence unavailable");
        }

        // Open feeds before loading so nothing inserted during the load is missed;
        // overlap with the loaded history is absorbed by the id dedupe.
        let subscriptions = self
            .open_subscriptions(&conversation)
            .await
            .inspect_err(|error| error!(%error, %conversation, "realtime subscription failed"))?;
        let history = match self.load_history(&conversation).await {
            Ok(history) => history,
            Err(error) => {
                error!(%error, %conversation, "history fetch failed; keeping the current view");
                for subscription in subscriptions {
                    subscription.cancel();
                }
                self.emit(ClientEvent::Error {
                    message: error.to_string(),
                });
                return Err(error);
            }
        };
        let pinned = self.load_pinned(&conversation).await;
        let typing = match &conversation {
            Conversation::Announcements => None,
            _ => match TypingCoordinator::join(
                self.gateway.as_ref(),
                self.session.clone(),
                &conversation,
                self.settings.typing_idle(),
                self.settings.typing_expiry(),
                self.events.clone(),
            )
            .await
            {
                Ok(typing) => Some(typing),
                Err(error) => {
                    warn!(%error, "typing indicators unavailable");
                    None
                }
            },
        };

        let mut view = self.view.lock().await;
        if view.requested != ticket || view.closed {
            drop(view);
            debug!(%conversation, ticket, "discarding stale conversation load");
            for subscription in subscriptions {
                subscription.cancel();
            }
            if let Some(typing) = typing {
                typing.shutdown().await;
            }
            return Ok(());
        }

        // Sends made while the load was in flight stay visible.
        let unsent: Vec<ChatMessage> = view
            .log
            .messages()
            .iter()
            .filter(|m| !m.is_confirmed() && addressed_to(&conversation, m))
            .cloned()
            .collect();
        view.epoch += 1;
        let epoch = view.epoch;
        view.active = Some(conversation.clone());
        view.log.replace_all(history);
        for message in unsent {
            view.log.restore_unconfirmed(message);
        }
        match pinned {
            Ok(pinned) => view.pins.replace(pinned),
            Err(error) => {
                warn!(%error, %conversation, "pinned message fetch failed");
                view.pins.clear();
            }
        }
        let old_typing = std::mem::replace(&mut view.typing, typing);
        let old_feed = view
            .feed
            .replace(self.spawn_feed(epoch, conversation.clone(), subscriptions));
        let count = view.log.len();
        let pinned = view.pins.len();
        drop(view);

        if let Some(feed) = old_feed {
            feed.abort();
        }
        if let Some(typing) = old_typing {
            typing.shutdown().await;
        }
        info!(%conversation, epoch, messages = count, "conversation selected");
        self.emit(ClientEvent::ConversationSelected {
            conversation: conversation.clone(),
        });
        self.emit(ClientEvent::PinsChanged { pinned });
        self.emit(ClientEvent::HistoryLoaded {
            conversation: conversation.key(),
            messages: count,
        });
        Ok(())
    }

    /// Re-fetches history for the active conversation; on failure the current view is kept.
    pub async fn reload_history(&self) -> ChatResult<()> {
        let (epoch, conversation) = {
            let view = self.view.lock().await;
            (view.epoch, view.active()?.clone())
        };
        let messages = self
            .load_history(&conversation)
            .await
            .inspect_err(|error| error!(%error, %conversation, "history reload failed"))?;

        let mut view = self.view.lock().await;
        if view.epoch == epoch {
            // Keep optimistic entries that the reload cannot know about yet.
            let local: Vec<ChatMessage> = view
                .log
                .messages()
                .iter()
                .filter(|m| !m.is_confirmed())
                .cloned()
                .collect();
            view.log.replace_all(messages);
            for message in local {
                view.log.restore_unconfirmed(message);
            }
            self.emit(ClientEvent::HistoryLoaded {
                conversation: conversation.key(),
                messages: view.log.len(),
            });
        }
        Ok(())
    }

    async fn open_subscriptions(&self, conversation: &Conversation) -> ChatResult<Vec<Subscription>> {
        let mut subscriptions = Vec::new();
        for (table, filter) in realtime_sources(conversation, &self.settings.legacy_channel_name) {
            match self.gateway.subscribe(table, filter).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(error) => {
                    for subscription in subscriptions {
                        subscription.cancel();
                    }
                    return Err(error.into());
                }
            }
        }
        Ok(subscriptions)
    }

    async fn load_history(&self, conversation: &Conversation) -> ChatResult<Vec<ChatMessage>> {
        let query = history_query(conversation, &self.settings.legacy_channel_name);
        if let Conversation::Announcements = conversation {
            let rows = self.gateway.query_as::<AnnouncementRow>(query).await?;
            return Ok(rows
                .into_iter()
                .map(|row| ChatMessage::from_announcement(row, ANNOUNCEMENTS_AUTHOR))
                .collect());
        }

        let rows = self.gateway.query_as::<MessageRow>(query).await?;
        let reactions = if rows.is_empty() {
            Vec::new()
        } else {
            let ids = rows.iter().map(|row| row.id.as_str());
            let query = Query::new(Table::MessageReactions).filter(Filter::is_in("message_id", ids));
            match self.gateway.query_as::<ReactionRow>(query).await {
                Ok(reactions) => reactions,
                Err(error) => {
                    warn!(%error, "reaction fetch failed; showing messages without reactions");
                    Vec::new()
                }
            }
        };

        let people = self
            .directory
            .resolve(
                rows.iter()
                    .map(|row| row.user_id.clone())
                    .chain(reactions.iter().map(|r| r.user_id.clone())),
            )
            .await;
        let mut folded = fold_reaction_rows(reactions, &usernames(&people));

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut message = ChatMessage::from(row);
                if message.author_name.is_none() {
                    message.author_name = people
                        .get(&message.author_id)
                        .map(|profile| profile.username.clone());
                }
                message.reactions = folded.remove(&message.id).unwrap_or_default();
                message
            })
            .collect())
    }

    async fn load_pinned(&self, conversation: &Conversation) -> ChatResult<Vec<ChatMessage>> {
        let Some(query) = pinned_query(conversation) else {
            return Ok(Vec::new());
        };
        let rows = self.gateway.query_as::<MessageRow>(query).await?;
        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }

    fn spawn_feed(
        self: &Arc<Self>,
        epoch: u64,
        conversation: Conversation,
        subscriptions: Vec<Subscription>,
    ) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        let mut feed = merge_subscriptions(subscriptions);
        tokio::spawn(async move {
            while let Some(raw) = feed.next().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.apply_realtime(epoch, &conversation, raw).await;
            }
            debug!(%conversation, "realtime feed closed");
        })
    }

    async fn apply_realtime(&self, epoch: u64, conversation: &Conversation, raw: Value) {
        let Some(message) = self.decode_realtime(conversation, raw).await else {
            return;
        };
        let mut view = self.view.lock().await;
        if view.epoch != epoch {
            return;
        }
        let id = message.id.clone();
        let outcome = view.log.merge_incoming(message);
        if outcome != MergeOutcome::Duplicate {
            debug!(%id, ?outcome, "realtime message merged");
            self.emit(ClientEvent::MessageMerged { id, outcome });
        }
    }

    async fn decode_realtime(&self, conversation: &Conversation, raw: Value) -> Option<ChatMessage> {
        if let Conversation::Announcements = conversation {
            return match decode_row::<AnnouncementRow>(raw) {
                Ok(row) if row.is_active => {
                    Some(ChatMessage::from_announcement(row, ANNOUNCEMENTS_AUTHOR))
                }
                Ok(_) => None,
                Err(error) => {
                    warn!(%error, "dropping malformed announcement");
                    None
                }
            };
        }

        let row = match decode_row::<MessageRow>(raw) {
            Ok(row) => row,
            Err(error) => {
                warn!(%error, "dropping malformed realtime message");
                return None;
            }
        };
        if !accepts(conversation, &row, &self.settings.legacy_channel_name) {
            return None;
        }
        let mut message = ChatMessage::from(row);
        if message.author_name.is_none() {
            message.author_name = self
                .directory
                .resolve_one(&message.author_id)
                .await
                .map(|profile| profile.username);
        }
        Some(message)
    }

    /// Shows the message immediately under a `temp-N` id and inserts it. The entry is
    /// promoted when the realtime echo arrives; a rejected insert tags it as failed.
    pub async fn send_message(&self, body: &str, reply_to: Option<MessageId>) -> ChatResult<MessageId> {
        if body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let now = Utc::now();
        let (id, record, typing) = {
            let mut view = self.view.lock().await;
            let conversation = view.active()?.clone();
            let Some((channel_id, recipient_id)) = addressing(&conversation) else {
                drop(view);
                return self.post_announcement(body).await;
            };
            let draft = Draft {
                author_id: self.session.user_id().clone(),
                author_name: self.session.username().to_string(),
                body: body.to_string(),
                channel_id: channel_id.clone(),
                recipient_id: recipient_id.clone(),
                reply_to: reply_to.clone(),
            };
            let id = view.log.push_optimistic(draft, now);
            let record = NewMessage {
                content: body.to_string(),
                channel_id,
                recipient_id,
                user_id: self.session.user_id().clone(),
                username: self.session.username().to_string(),
                sent_at: now,
                reply_to_id: reply_to,
            };
            (id, record, view.typing.as_ref().map(TypingCoordinator::signal))
        };
        self.emit(ClientEvent::MessageQueued { id: id.clone() });
        if let Some(typing) = typing {
            if let Err(error) = typing.stop().await {
                debug!(%error, "stop_typing before send failed");
            }
        }
        self.submit(&id, &record).await?;
        Ok(id)
    }

    /// Resends a failed entry; it moves to the end of the view as pending again.
    pub async fn retry_send(&self, id: &MessageId) -> ChatResult<()> {
        let record = {
            let mut view = self.view.lock().await;
            view.active()?;
            let message = view
                .log
                .begin_retry(id, Utc::now())
                .ok_or_else(|| ChatError::NotRetryable(id.clone()))?;
            let record = NewMessage {
                content: message.body,
                channel_id: message.channel_id,
                recipient_id: message.recipient_id,
                user_id: message.author_id,
                username: message
                    .author_name
                    .unwrap_or_else(|| self.session.username().to_string()),
                sent_at: message.sent_at,
                reply_to_id: message.reply_to,
            };
            record
        };
        info!(%id, "retrying failed message");
        self.emit(ClientEvent::MessageQueued { id: id.clone() });
        self.submit(id, &record).await
    }

    /// Temp ids are never reused, so a failure is tagged on whichever view holds the entry.
    async fn submit(&self, id: &MessageId, record: &NewMessage) -> ChatResult<()> {
        let result = match encode_row(record) {
            Ok(row) => self.gateway.insert(Table::Messages, row).await.map(|_| ()),
            Err(error) => Err(error),
        };
        let Err(error) = result else {
            return Ok(());
        };

        error!(%error, %id, "message insert failed");
        let mut view = self.view.lock().await;
        if view.log.mark_failed(id) {
            self.emit(ClientEvent::MessageFailed {
                id: id.clone(),
                reason: error.to_string(),
            });
        }
        Err(error.into())
    }

    async fn post_announcement(&self, body: &str) -> ChatResult<MessageId> {
        let role = self.session.role();
        if !can_post_announcement(role) {
            return Err(ChatError::Forbidden {
                role: role.as_str(),
                action: "post announcements",
            });
        }
        let record = json!({
            "message": body,
            "type": "info",
            "is_active": true,
        });
        let row: AnnouncementRow = self
            .gateway
            .insert_as(Table::GlobalAlerts, &record)
            .await
            .inspect_err(|error| error!(%error, "announcement insert failed"))?;
        let id = MessageId::new(row.id.as_str());

        let mut view = self.view.lock().await;
        if matches!(view.active, Some(Conversation::Announcements)) {
            let outcome = view
                .log
                .merge_incoming(ChatMessage::from_announcement(row, ANNOUNCEMENTS_AUTHOR));
            if outcome != MergeOutcome::Duplicate {
                self.emit(ClientEvent::MessageMerged {
                    id: id.clone(),
                    outcome,
                });
            }
        }
        info!(%id, "announcement posted");
        Ok(id)
    }

    /// Author-only edit, applied locally first. A failed update is reported, not rolled back.
    pub async fn edit_message(&self, id: &MessageId, body: &str) -> ChatResult<()> {
        if body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let edited_at = Utc::now();
        {
            let mut view = self.view.lock().await;
            view.active()?;
            let message = view.confirmed(id)?;
            if !can_edit(self.session.user_id(), &message.author_id) {
                return Err(ChatError::Forbidden {
                    role: self.session.role().as_str(),
                    action: "edit another user's message",
                });
            }
            view.log.apply_edit(id, body.to_string(), edited_at);
            if let Some(updated) = view.log.get(id).cloned() {
                view.pins.refresh(&updated);
            }
        }
        self.emit(ClientEvent::MessageUpdated { id: id.clone() });

        let patch = json!({ "content": body, "edited_at": edited_at });
        self.gateway
            .update(Table::Messages, patch, Filter::eq("id", id.as_str()))
            .await
            .inspect_err(|error| error!(%error, %id, "message edit failed"))?;
        Ok(())
    }

    pub async fn can_delete(&self, id: &MessageId) -> bool {
        let (author_id, announcements) = {
            let view = self.view.lock().await;
            let Some(message) = view.log.get(id) else {
                return false;
            };
            (
                message.author_id.clone(),
                matches!(view.active, Some(Conversation::Announcements)),
            )
        };
        if announcements {
            return can_post_announcement(self.session.role());
        }
        let author_role = self.directory.role_of(&author_id).await;
        can_delete(self.session.user_id(), self.session.role(), &author_id, author_role)
    }

    /// Removes a message once the store confirms the delete; the view is untouched on failure.
    pub async fn delete_message(&self, id: &MessageId) -> ChatResult<()> {
        let table = {
            let view = self.view.lock().await;
            let table = match view.active()? {
                Conversation::Announcements => Table::GlobalAlerts,
                _ => Table::Messages,
            };
            view.confirmed(id)?;
            table
        };
        if !self.can_delete(id).await {
            return Err(ChatError::Forbidden {
                role: self.session.role().as_str(),
                action: "delete this message",
            });
        }

        self.gateway
            .delete(table, Filter::eq("id", id.as_str()))
            .await
            .inspect_err(|error| error!(%error, %id, "message delete failed"))?;

        let mut view = self.view.lock().await;
        let removed = view.log.remove(id).is_some();
        let unpinned = view.pins.unpin(id);
        if removed {
            info!(%id, "message deleted");
            self.emit(ClientEvent::MessageRemoved { id: id.clone() });
        }
        if unpinned {
            self.emit(ClientEvent::PinsChanged {
                pinned: view.pins.len(),
            });
        }
        Ok(())
    }

    /// Flips the local user's reaction. A duplicate-key rejection from the store means the
    /// reaction already exists remotely and is ignored.
    pub async fn toggle_reaction(&self, id: &MessageId, emoji: &str) -> ChatResult<ReactionToggle> {
        let outcome = {
            let mut view = self.view.lock().await;
            view.active()?;
            view.confirmed(id)?;
            let reactor = Reactor {
                user_id: self.session.user_id().clone(),
                username: self.session.username().to_string(),
            };
            let aggregates = view
                .log
                .reactions_mut(id)
                .ok_or_else(|| ChatError::MessageNotFound(id.clone()))?;
            toggle_reaction(aggregates, emoji, reactor)
        };
        self.emit(ClientEvent::ReactionsChanged {
            message_id: id.clone(),
        });

        match outcome {
            ReactionToggle::Added => {
                let row = encode_row(&ReactionRow {
                    message_id: id.clone(),
                    user_id: self.session.user_id().clone(),
                    emoji: emoji.to_string(),
                })?;
                match self.gateway.insert(Table::MessageReactions, row).await {
                    Ok(_) => {}
                    Err(error) if error.is_conflict() => {
                        debug!(%id, emoji, "reaction already stored");
                    }
                    Err(error) => {
                        error!(%error, %id, emoji, "reaction insert failed");
                        return Err(error.into());
                    }
                }
            }
            ReactionToggle::Removed => {
                let filter = Filter::and([
                    Filter::eq("message_id", id.as_str()),
                    Filter::eq("user_id", self.session.user_id().as_str()),
                    Filter::eq("emoji", emoji),
                ]);
                self.gateway
                    .delete(Table::MessageReactions, filter)
                    .await
                    .inspect_err(|error| error!(%error, %id, emoji, "reaction delete failed"))?;
            }
        }
        Ok(outcome)
    }

    pub async fn pin_message(&self, id: &MessageId) -> ChatResult<()> {
        self.set_pinned(id, true).await
    }

    pub async fn unpin_message(&self, id: &MessageId) -> ChatResult<()> {
        self.set_pinned(id, false).await
    }

    pub async fn toggle_pin(&self, id: &MessageId) -> ChatResult<bool> {
        let pinned = {
            let view = self.view.lock().await;
            view.confirmed(id)?.is_pinned()
        };
        self.set_pinned(id, !pinned).await?;
        Ok(!pinned)
    }

    async fn set_pinned(&self, id: &MessageId, pinned: bool) -> ChatResult<()> {
        let role = self.session.role();
        if !can_pin(role) {
            return Err(ChatError::Forbidden {
                role: role.as_str(),
                action: "pin messages",
            });
        }
        let now = Utc::now();
        {
            let mut view = self.view.lock().await;
            if let Conversation::Announcements = view.active()? {
                return Err(ChatError::Forbidden {
                    role: role.as_str(),
                    action: "pin announcements",
                });
            }
            view.confirmed(id)?;
            let pin = pinned.then(|| PinInfo {
                pinned_at: now,
                pinned_by: Some(self.session.user_id().clone()),
                pinned_by_username: Some(self.session.username().to_string()),
            });
            view.log.set_pin(id, pin);
            match view.log.get(id).cloned() {
                Some(message) if pinned => view.pins.pin(message),
                _ => {
                    view.pins.unpin(id);
                }
            }
            self.emit(ClientEvent::PinsChanged {
                pinned: view.pins.len(),
            });
        }

        let patch = if pinned {
            json!({
                "pinned": true,
                "pinned_at": now,
                "pinned_by": self.session.user_id(),
                "pinned_by_username": self.session.username(),
            })
        } else {
            json!({
                "pinned": false,
                "pinned_at": null,
                "pinned_by": null,
                "pinned_by_username": null,
            })
        };
        self.gateway
            .update(Table::Messages, patch, Filter::eq("id", id.as_str()))
            .await
            .inspect_err(|error| error!(%error, %id, pinned, "pin update failed"))?;
        Ok(())
    }

    /// Signals a keystroke in the active conversation.
    pub async fn notify_typing(&self) -> ChatResult<()> {
        let typing = {
            let view = self.view.lock().await;
            view.active()?;
            view.typing.as_ref().map(TypingCoordinator::signal)
        };
        match typing {
            Some(typing) => typing.keystroke().await,
            None => Ok(()),
        }
    }

    /// Tears down the conversation view and presence. The client rejects further work afterwards.
    pub async fn shutdown(&self) {
        let (feed, typing) = {
            let mut view = self.view.lock().await;
            if view.closed {
                return;
            }
            view.closed = true;
            view.epoch += 1;
            view.active = None;
            view.log.clear();
            view.pins.clear();
            (view.feed.take(), view.typing.take())
        };
        if let Some(feed) = feed {
            feed.abort();
        }
        if let Some(typing) = typing {
            typing.shutdown().await;
        }
        self.presence.go_offline().await;
        info!(user_id = %self.session.user_id(), "chat client shut down");
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
