//! Room chat: ordered message log, replies, mentions and reactions.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    dao::{
        models::{NewMessage, ReactionsWrite},
        paths::{CollectionPath, DocPath},
        store::{
            CollectionQuery, CollectionSnapshot, Document, ListenerHandle, ServerTimestamp,
            SetOptions, to_fields,
        },
    },
    error::ServiceError,
    services::{events::RoomEvent, presence::PresenceTracker},
    state::{
        SharedContext,
        chat::{
            Message, MessageBody, Reactions, ReplyPreview, author_label, resolve_mentions,
            suggest_mentions, toggle_reaction,
        },
        presence::Member,
    },
};

/// Message composed by the local user.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    /// Content to send.
    pub body: MessageBody,
    /// Id of the message being replied to.
    pub reply_to: Option<String>,
}

#[derive(Deserialize)]
struct ReactionsOnly {
    #[serde(default)]
    reactions: Reactions,
}

/// Append-only chat log of the current room.
#[derive(Clone)]
pub struct MessageStream {
    inner: Arc<MessageInner>,
}

struct MessageInner {
    context: SharedContext,
    presence: PresenceTracker,
    room_id: Mutex<Option<String>>,
    messages: RwLock<Vec<Message>>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl MessageStream {
    /// Stream resolving mentions against the roster of `presence`.
    pub fn new(context: SharedContext, presence: PresenceTracker) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                context,
                presence,
                room_id: Mutex::new(None),
                messages: RwLock::new(Vec::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Follow the most recent messages of `room_id`, oldest first.
    pub async fn subscribe(&self, room_id: &str) {
        self.unsubscribe().await;
        *self.inner.room_id.lock().await = Some(room_id.to_string());

        let query = CollectionQuery::new(CollectionPath::messages(room_id))
            .order_by("createdAt")
            .limit_to_last(self.inner.context.config.message_limit);
        let mut subscription = self.inner.context.store.subscribe_collection(query);
        let stream = self.clone();
        let room_id = room_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery) = subscription.next().await {
                match delivery {
                    Ok(snapshot) => stream.apply(snapshot).await,
                    Err(err) => {
                        warn!(room_id = %room_id, error = %err, "message listener failed");
                        stream.inner.context.events.error("Failed to load messages.");
                        break;
                    }
                }
            }
        });
        *self.inner.listener.lock().await = Some(ListenerHandle::new(task));
    }

    /// Stop following messages and forget the loaded log.
    pub async fn unsubscribe(&self) {
        if let Some(mut handle) = self.inner.listener.lock().await.take() {
            handle.unsubscribe();
        }
        *self.inner.room_id.lock().await = None;
        self.inner.messages.write().await.clear();
    }

    /// Loaded messages, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.messages.read().await.clone()
    }

    async fn apply(&self, snapshot: CollectionSnapshot) {
        let messages: Vec<Message> = snapshot.docs.iter().filter_map(decode_message).collect();
        *self.inner.messages.write().await = messages.clone();
        self.inner
            .context
            .events
            .publish(RoomEvent::MessagesChanged { messages });
    }

    async fn require_room(&self) -> Result<(String, String), ServiceError> {
        let Some(room_id) = self.inner.room_id.lock().await.clone() else {
            return Err(ServiceError::InvalidState("Join a room to chat.".into()));
        };
        let Some(uid) = self.inner.context.uid() else {
            return Err(ServiceError::Unauthorized("Sign in to chat in this room.".into()));
        };
        Ok((room_id, uid))
    }

    /// Append a message to the room log, returning its id.
    ///
    /// Replies embed a preview of their target as it reads right now.
    pub async fn post_message(&self, draft: MessageDraft) -> Result<String, ServiceError> {
        let body = validate_body(draft.body)?;
        let (room_id, uid) = self.require_room().await?;
        let context = &self.inner.context;

        let mentions = match &body {
            MessageBody::Text { text } => {
                let roster = self.inner.presence.members().await;
                resolve_mentions(text, &roster)
            }
            _ => Vec::new(),
        };
        let reply_to = match draft.reply_to {
            Some(target) => Some(self.reply_preview(&room_id, &target).await?),
            None => None,
        };
        let user_name = context
            .identity
            .current()
            .map(|identity| author_label(identity.display_name.as_deref(), identity.email.as_deref()))
            .unwrap_or_else(|| author_label(None, None));

        let payload = to_fields(&NewMessage {
            body: &body,
            mentions,
            user_id: &uid,
            user_name,
            created_at: ServerTimestamp,
            reactions: Reactions::new(),
            reply_to,
        })?;
        let id = context
            .store
            .add_document(&CollectionPath::messages(&room_id), payload)
            .await
            .inspect_err(|err| {
                warn!(room_id = %room_id, error = %err, "failed to send message");
                context.events.error(send_failure(&body));
            })?;

        debug!(room_id = %room_id, message_id = %id, uid = %uid, "message sent");
        Ok(id)
    }

    async fn reply_preview(&self, room_id: &str, target: &str) -> Result<ReplyPreview, ServiceError> {
        let max_chars = self.inner.context.config.reply_snippet_chars;
        let loaded = self
            .inner
            .messages
            .read()
            .await
            .iter()
            .find(|message| message.id == target)
            .map(|message| message.reply_preview(max_chars));
        if let Some(preview) = loaded {
            return Ok(preview);
        }

        let document = self
            .inner
            .context
            .store
            .get_document(&DocPath::message(room_id, target))
            .await?;
        document
            .as_ref()
            .and_then(decode_message)
            .map(|message| message.reply_preview(max_chars))
            .ok_or_else(|| ServiceError::NotFound(format!("message `{target}` not found")))
    }

    /// Add or remove the caller's `emoji` reaction on a message, returning
    /// whether the reaction is now present.
    ///
    /// Only the `reactions` field is written back. Two users toggling the same
    /// emoji concurrently may lose one update.
    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<bool, ServiceError> {
        if emoji.trim().is_empty() {
            return Err(ServiceError::InvalidInput("emoji must not be empty".into()));
        }
        let (room_id, uid) = self.require_room().await?;
        let context = &self.inner.context;
        let path = DocPath::message(&room_id, message_id);

        let Some(document) = context.store.get_document(&path).await? else {
            return Err(ServiceError::NotFound(format!("message `{message_id}` not found")));
        };
        let mut reactions = document.decode::<ReactionsOnly>()?.reactions;
        let added = toggle_reaction(&mut reactions, emoji, &uid);

        let payload = to_fields(&ReactionsWrite {
            reactions: &reactions,
        })?;
        context
            .store
            .set_document(&path, payload, SetOptions::merge())
            .await
            .inspect_err(|err| {
                warn!(path = %path, error = %err, "failed to update reaction");
                context.events.error("Failed to update reaction.");
            })?;

        info!(message_id, emoji, uid = %uid, added, "reaction toggled");
        Ok(added)
    }

    /// Roster members matching `prefix` for the mention picker.
    pub async fn suggest_mentions(&self, prefix: &str) -> Vec<Member> {
        let roster = self.inner.presence.members().await;
        let self_uid = self.inner.context.uid();
        suggest_mentions(&roster, prefix, self_uid.as_deref())
            .into_iter()
            .cloned()
            .collect()
    }
}

fn decode_message(document: &Document) -> Option<Message> {
    match document.decode::<Message>() {
        Ok(mut message) => {
            message.id = document.id().to_string();
            Some(message)
        }
        Err(err) => {
            warn!(error = %err, "skipping malformed message");
            None
        }
    }
}

fn validate_body(body: MessageBody) -> Result<MessageBody, ServiceError> {
    match body {
        MessageBody::Text { text } => {
            let text = text.trim();
            if text.is_empty() {
                return Err(ServiceError::InvalidInput("message text must not be empty".into()));
            }
            Ok(MessageBody::Text {
                text: text.to_string(),
            })
        }
        MessageBody::Gif { gif_url } if gif_url.trim().is_empty() => {
            Err(ServiceError::InvalidInput("gif url must not be empty".into()))
        }
        MessageBody::Sticker { sticker_url } if sticker_url.trim().is_empty() => {
            Err(ServiceError::InvalidInput("sticker url must not be empty".into()))
        }
        other => Ok(other),
    }
}

fn send_failure(body: &MessageBody) -> &'static str {
    match body {
        MessageBody::Text { .. } => "Failed to send message.",
        MessageBody::Gif { .. } => "Failed to send GIF.",
        MessageBody::Sticker { .. } => "Failed to send sticker.",
    }
}
