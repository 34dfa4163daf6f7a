use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId as TgChatId, MessageId as TgMessageId, ReactionType};
use teloxide::{ApiError, RequestError};
use tracing::debug;

use super::{ChatId, MessageId, PlatformSession, ReactionError};

/// API error descriptions that mean the chat will never accept our reaction
const FORBIDDEN_MARKERS: &[&str] = &[
    "REACTION_INVALID",
    "REACTIONS_TOO_MANY",
    "CHAT_ADMIN_REQUIRED",
    "CHANNEL_PRIVATE",
    "CHAT_WRITE_FORBIDDEN",
    "MESSAGE_ID_INVALID",
    "MSG_ID_INVALID",
    "NOT ENOUGH RIGHTS",
    "MESSAGE NOT FOUND",
    "CHAT NOT FOUND",
    "FORBIDDEN",
];

/// API error descriptions of server-side hiccups
const TRANSIENT_MARKERS: &[&str] = &[
    "INTERNAL SERVER ERROR",
    "BAD GATEWAY",
    "GATEWAY TIMEOUT",
    "TIMEOUT",
    "RPC_CALL_FAIL",
];

/// Session backed by a teloxide `Bot`
pub struct TelegramSession {
    bot: Bot,
}

impl TelegramSession {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl PlatformSession for TelegramSession {
    async fn send_reaction(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        reaction: &str,
    ) -> Result<(), ReactionError> {
        debug!("set_message_reaction chat {} message {}", chat_id, message_id);
        self.bot
            .set_message_reaction(TgChatId(chat_id), TgMessageId(message_id))
            .reaction(vec![ReactionType::Emoji {
                emoji: reaction.to_string(),
            }])
            .await
            .map(|_| ())
            .map_err(classify_request_error)
    }

    async fn allowed_reactions(&self, chat_id: ChatId) -> anyhow::Result<Option<Vec<String>>> {
        let chat = self
            .bot
            .get_chat(TgChatId(chat_id))
            .await
            .with_context(|| format!("Failed to get chat {}", chat_id))?;
        Ok(emoji_reactions(chat.available_reactions()))
    }

    async fn whoami(&self) -> Result<String, ReactionError> {
        let me = self.bot.get_me().await.map_err(classify_request_error)?;
        Ok(match &me.user.username {
            Some(username) => format!("{} (@{})", me.user.first_name, username),
            None => me.user.first_name.clone(),
        })
    }
}

/// Emoji a chat accepts; `None` when the chat sets no restriction.
/// Custom and paid reactions are never matched by a configured emoji.
fn emoji_reactions(available: Option<&[ReactionType]>) -> Option<Vec<String>> {
    available.map(|reactions| {
        reactions
            .iter()
            .filter_map(|reaction| reaction.emoji().cloned())
            .collect()
    })
}

/// Map a teloxide error onto the dispatcher's retry taxonomy
pub fn classify_request_error(err: RequestError) -> ReactionError {
    match err {
        RequestError::RetryAfter(secs) => ReactionError::Throttled {
            retry_after: secs.duration(),
        },
        RequestError::Network(e) => ReactionError::Transient {
            reason: e.to_string(),
        },
        RequestError::Io(e) => ReactionError::Transient {
            reason: e.to_string(),
        },
        RequestError::MigrateToChatId(new_id) => ReactionError::Forbidden {
            reason: format!("chat migrated to {}", new_id),
        },
        RequestError::Api(api) => classify_api_error(api),
        other => ReactionError::Unknown {
            reason: other.to_string(),
        },
    }
}

fn classify_api_error(api: ApiError) -> ReactionError {
    match api {
        ApiError::InvalidToken => ReactionError::Fatal {
            reason: api.to_string(),
        },
        ApiError::BotBlocked | ApiError::ChatNotFound | ApiError::MessageIdInvalid => {
            ReactionError::Forbidden {
                reason: api.to_string(),
            }
        }
        ApiError::Unknown(description) => classify_description(&description),
        other => classify_description(&other.to_string()),
    }
}

/// Classify a raw API error description
pub fn classify_description(description: &str) -> ReactionError {
    let upper = description.to_ascii_uppercase();

    if upper.contains("UNAUTHORIZED") || upper.contains("AUTH_KEY") {
        return ReactionError::Fatal {
            reason: description.to_string(),
        };
    }

    if let Some(seconds) = flood_wait_seconds(&upper) {
        return ReactionError::Throttled {
            retry_after: Duration::from_secs(seconds),
        };
    }

    if TRANSIENT_MARKERS.iter().any(|m| upper.contains(m)) {
        return ReactionError::Transient {
            reason: description.to_string(),
        };
    }

    if FORBIDDEN_MARKERS.iter().any(|m| upper.contains(m)) {
        return ReactionError::Forbidden {
            reason: description.to_string(),
        };
    }

    ReactionError::Unknown {
        reason: description.to_string(),
    }
}

/// Extract N from `FLOOD_WAIT_N` style descriptions
fn flood_wait_seconds(upper: &str) -> Option<u64> {
    let start = upper.find("FLOOD_WAIT_")? + "FLOOD_WAIT_".len();
    let digits: String = upper[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
