use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::state::presence::Member;

/// Author label used when a message carries neither name nor email.
pub const ANONYMOUS: &str = "Anon";
const ELLIPSIS: char = '…';

/// Content of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    /// Plain text.
    Text {
        /// Message text.
        text: String,
    },
    /// Animated GIF picked from the GIF search.
    Gif {
        /// Hosted GIF location.
        #[serde(rename = "gifUrl")]
        gif_url: String,
    },
    /// Sticker picked from the sticker tray.
    Sticker {
        /// Hosted sticker location.
        #[serde(rename = "stickerUrl")]
        sticker_url: String,
    },
}

impl MessageBody {
    /// Short content shown in reply previews.
    pub fn snippet(&self, max_chars: usize) -> String {
        match self {
            MessageBody::Text { text } => truncate(text, max_chars),
            MessageBody::Gif { .. } => "GIF".to_string(),
            MessageBody::Sticker { .. } => "Sticker".to_string(),
        }
    }

    /// Copy of the body suitable for embedding in a reply preview.
    pub fn preview(&self, max_chars: usize) -> Self {
        match self {
            MessageBody::Text { text } => MessageBody::Text {
                text: truncate(text, max_chars),
            },
            other => other.clone(),
        }
    }
}

/// Truncate `text` to `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push(ELLIPSIS);
    out
}

/// Member mentioned by a message, resolved at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    /// Uid of the mentioned member.
    pub user_id: String,
    /// Name the member had when mentioned.
    #[serde(default)]
    pub name: Option<String>,
}

/// Denormalized copy of the message being replied to, frozen at reply time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    /// Id of the original message.
    pub id: String,
    /// Author label of the original message.
    #[serde(default = "anonymous")]
    pub user_name: String,
    /// Original content (text shortened).
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Emoji → set of reacting uids. Empty entries are never kept.
pub type Reactions = IndexMap<String, IndexSet<String>>;

/// Add `uid` to the reactors of `emoji` if absent, remove it otherwise.
///
/// Returns whether the reaction is now set. Emptied entries are pruned.
pub fn toggle_reaction(reactions: &mut Reactions, emoji: &str, uid: &str) -> bool {
    let added = match reactions.get_mut(emoji) {
        Some(users) => {
            if users.shift_remove(uid) {
                false
            } else {
                users.insert(uid.to_string());
                true
            }
        }
        None => {
            reactions.insert(emoji.to_string(), IndexSet::from([uid.to_string()]));
            true
        }
    };
    reactions.retain(|_, users| !users.is_empty());
    added
}

/// Chat message as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Document id; filled from the path, not the payload.
    #[serde(default)]
    pub id: String,
    /// Content.
    #[serde(flatten)]
    pub body: MessageBody,
    /// Mentions resolved when the message was sent.
    #[serde(default)]
    pub mentions: Vec<Mention>,
    /// Uid of the author.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Author label.
    #[serde(default = "anonymous")]
    pub user_name: String,
    /// Server time of creation in epoch millis.
    #[serde(default)]
    pub created_at: Option<i64>,
    /// Reactions by emoji.
    #[serde(default)]
    pub reactions: Reactions,
    /// Preview of the replied-to message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

impl Message {
    /// Reply preview of this message as seen at this instant.
    pub fn reply_preview(&self, max_chars: usize) -> ReplyPreview {
        ReplyPreview {
            id: self.id.clone(),
            user_name: self.user_name.clone(),
            body: self.body.preview(max_chars),
        }
    }
}

fn anonymous() -> String {
    ANONYMOUS.to_string()
}

/// Author label stored on a message: display name, then email, then "Anon".
pub fn author_label(display_name: Option<&str>, email: Option<&str>) -> String {
    display_name
        .filter(|name| !name.is_empty())
        .or(email.filter(|email| !email.is_empty()))
        .unwrap_or(ANONYMOUS)
        .to_string()
}

/// Distinct `@token` runs of `text`, in order of first appearance.
pub fn mention_tokens(text: &str) -> Vec<&str> {
    let mut tokens = IndexSet::new();
    for (index, _) in text.match_indices('@') {
        let rest = &text[index + 1..];
        let end = rest
            .find(|c: char| c == '@' || c.is_whitespace())
            .unwrap_or(rest.len());
        if end > 0 {
            tokens.insert(&rest[..end]);
        }
    }
    tokens.into_iter().collect()
}

/// Resolve the mentions of `text` against `roster`.
///
/// A token matches a member whose first name or full name equals it exactly.
/// Unresolved tokens are dropped.
pub fn resolve_mentions(text: &str, roster: &[Member]) -> Vec<Mention> {
    mention_tokens(text)
        .into_iter()
        .filter_map(|token| {
            roster.iter().find(|member| {
                let name = member.name.as_deref().unwrap_or_default();
                let first = name.split(' ').next().unwrap_or_default();
                first == token || name == token
            })
        })
        .map(|member| Mention {
            user_id: member.id.clone(),
            name: member.name.clone(),
        })
        .collect()
}

/// Members (other than `self_uid`) whose name starts with `prefix`, ignoring case.
pub fn suggest_mentions<'a>(
    roster: &'a [Member],
    prefix: &str,
    self_uid: Option<&str>,
) -> Vec<&'a Member> {
    let query = prefix.to_lowercase();
    roster
        .iter()
        .filter(|member| Some(member.id.as_str()) != self_uid)
        .filter(|member| {
            member
                .name
                .as_deref()
                .unwrap_or_default()
                .to_lowercase()
                .starts_with(&query)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn member(id: &str, name: &str) -> Member {
        Member {
            id: id.to_string(),
            name: Some(name.to_string()),
            email: None,
            last_seen_ms: None,
            online: false,
        }
    }

    #[test]
    fn toggling_twice_restores_original_reactions() {
        let mut reactions = Reactions::new();
        reactions.insert("🔥".into(), IndexSet::from(["bob".to_string()]));
        let original = reactions.clone();

        assert!(toggle_reaction(&mut reactions, "👍", "alice"));
        assert!(!toggle_reaction(&mut reactions, "👍", "alice"));
        assert_eq!(reactions, original);

        assert!(!toggle_reaction(&mut reactions, "🔥", "bob"));
        assert!(reactions.is_empty());
    }

    #[test]
    fn second_reactor_joins_an_existing_emoji() {
        let mut reactions = Reactions::new();
        assert!(toggle_reaction(&mut reactions, "👍", "alice"));
        assert!(toggle_reaction(&mut reactions, "👍", "bob"));
        assert_eq!(reactions["👍"].len(), 2);

        assert!(!toggle_reaction(&mut reactions, "👍", "alice"));
        assert_eq!(reactions["👍"], IndexSet::from(["bob".to_string()]));
    }

    #[test]
    fn mentions_resolve_first_or_full_name_case_sensitively() {
        let roster = vec![member("u1", "Ada Lovelace"), member("u2", "Bob")];
        let mentions = resolve_mentions("hi @Ada and @bob and @Bob @Ada @ghost", &roster);

        let ids: Vec<_> = mentions.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
        assert_eq!(mentions[0].name.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn mention_tokens_stop_at_whitespace_and_at_sign() {
        assert_eq!(mention_tokens("@a@b @ c @a"), vec!["a", "b"]);
    }

    #[test]
    fn suggestions_skip_self_and_ignore_case() {
        let roster = vec![member("me", "Adam"), member("u1", "ada"), member("u2", "Bob")];
        let ids: Vec<_> = suggest_mentions(&roster, "AD", Some("me"))
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["u1"]);
    }

    #[test]
    fn reply_preview_shortens_text_and_labels_media() {
        let text = MessageBody::Text {
            text: "a".repeat(40),
        };
        assert_eq!(text.snippet(30), format!("{}…", "a".repeat(30)));
        assert_eq!(
            MessageBody::Gif {
                gif_url: "https://g/x.gif".into()
            }
            .snippet(30),
            "GIF"
        );
        assert_eq!(truncate("short", 30), "short");
    }

    #[test]
    fn messages_decode_tagged_bodies_and_ignore_legacy_nulls() {
        let message: Message = serde_json::from_value(json!({
            "type": "sticker",
            "text": null,
            "gifUrl": null,
            "stickerUrl": "https://s/1.png",
            "userName": "Ada",
            "reactions": {"👍": ["u1"]},
            "replyTo": {"id": "m0", "userName": "Bob", "type": "text", "text": "hey"}
        }))
        .unwrap();

        assert_eq!(
            message.body,
            MessageBody::Sticker {
                sticker_url: "https://s/1.png".into()
            }
        );
        assert_eq!(message.reactions["👍"].len(), 1);
        assert_eq!(message.reply_to.unwrap().body.snippet(30), "hey");
    }

    #[test]
    fn author_label_falls_back_to_email_then_anon() {
        assert_eq!(author_label(Some("Ada"), Some("a@x")), "Ada");
        assert_eq!(author_label(None, Some("a@x")), "a@x");
        assert_eq!(author_label(None, None), "Anon");
    }
}
