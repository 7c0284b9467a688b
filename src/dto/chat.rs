use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    dto::{format_millis, validation::validate_emoji},
    services::messages::MessageDraft,
    state::chat::{Message, MessageBody},
};

const MAX_TEXT_CHARS: usize = 2_000;

/// Chat message to post.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    /// Text, GIF or sticker body.
    #[serde(flatten)]
    pub body: MessageBody,
    /// Id of the message being replied to.
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl Validate for PostMessageRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        match &self.body {
            MessageBody::Text { text } if text.chars().count() > MAX_TEXT_CHARS => {
                let mut err = ValidationError::new("text_length");
                err.message =
                    Some(format!("Messages are limited to {MAX_TEXT_CHARS} characters").into());
                errors.add("text", err);
            }
            MessageBody::Gif { gif_url: link } | MessageBody::Sticker { sticker_url: link } => {
                if url::Url::parse(link).is_err() {
                    let mut err = ValidationError::new("url");
                    err.message = Some("Media link must be an absolute URL".into());
                    errors.add("url", err);
                }
            }
            MessageBody::Text { .. } => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl From<PostMessageRequest> for MessageDraft {
    fn from(request: PostMessageRequest) -> Self {
        MessageDraft {
            body: request.body,
            reply_to: request.reply_to.filter(|id| !id.trim().is_empty()),
        }
    }
}

/// Emoji reaction to toggle.
#[derive(Debug, Deserialize, Validate)]
pub struct ReactionRequest {
    #[validate(custom(function = "validate_emoji"))]
    /// Reaction emoji.
    pub emoji: String,
}

/// Query string of the mention suggestion route.
#[derive(Debug, Default, Deserialize)]
pub struct MentionQuery {
    /// Text typed after `@`.
    #[serde(default)]
    pub prefix: String,
}

/// Chat message as rendered by clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    /// Stored message.
    #[serde(flatten)]
    pub message: Message,
    /// `createdAt` rendered as RFC 3339, once the server time is known.
    pub created_at_iso: Option<String>,
}

impl From<Message> for MessageView {
    fn from(message: Message) -> Self {
        let created_at_iso = message.created_at.and_then(format_millis);
        Self {
            message,
            created_at_iso,
        }
    }
}

/// Id of a freshly posted message.
#[derive(Debug, Serialize)]
pub struct PostedMessage {
    /// Message id.
    pub id: String,
}

/// Result of a reaction toggle.
#[derive(Debug, Serialize)]
pub struct ReactionToggled {
    /// Whether the caller now has this reaction on the message.
    pub reacted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_request_accepts_each_body_kind() {
        let text: PostMessageRequest =
            serde_json::from_str(r#"{"type":"text","text":"hi @ada","replyTo":"m1"}"#).unwrap();
        assert!(text.validate().is_ok());
        let draft = MessageDraft::from(text);
        assert_eq!(draft.reply_to.as_deref(), Some("m1"));

        let gif: PostMessageRequest =
            serde_json::from_str(r#"{"type":"gif","gifUrl":"https://media.example/a.gif"}"#)
                .unwrap();
        assert!(gif.validate().is_ok());
    }

    #[test]
    fn post_request_rejects_relative_media_links() {
        let sticker: PostMessageRequest =
            serde_json::from_str(r#"{"type":"sticker","stickerUrl":"stickers/cat.webp"}"#).unwrap();
        assert!(sticker.validate().is_err());
    }

    #[test]
    fn post_request_rejects_overlong_text() {
        let request = PostMessageRequest {
            body: MessageBody::Text {
                text: "x".repeat(MAX_TEXT_CHARS + 1),
            },
            reply_to: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn blank_reply_target_is_ignored() {
        let request: PostMessageRequest =
            serde_json::from_str(r#"{"type":"text","text":"hi","replyTo":" "}"#).unwrap();
        assert_eq!(MessageDraft::from(request).reply_to, None);
    }
}
