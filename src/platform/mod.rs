pub mod feed;
#[cfg(test)]
pub mod mock;
pub mod telegram;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// Platform chat identifier (channels carry the `-100` prefix)
pub type ChatId = i64;

/// Platform message identifier, unique within a chat
pub type MessageId = i32;

/// A raw update as delivered by the session bridge.
///
/// Only read-state variants carry information the engine acts on; everything
/// else is kept as a named variant so it can be dropped explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawUpdate {
    /// The user read a channel or supergroup up to `max_id`
    ChannelRead {
        chat_id: ChatId,
        max_id: MessageId,
        #[serde(default)]
        broadcast: Option<bool>,
    },
    /// The user read a private chat or basic group up to `max_id`
    ChatRead { chat_id: ChatId, max_id: MessageId },
    /// Read watermark of a dialog as seen when the session connected
    DialogSnapshot {
        chat_id: ChatId,
        read_max_id: MessageId,
    },
    /// Someone else read the user's outgoing messages
    OutboxRead { chat_id: ChatId, max_id: MessageId },
    Typing,
    Presence,
    #[serde(other)]
    Unrecognized,
}

/// Failure of a single reaction request, classified for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionError {
    /// Flood wait: no requests accepted before `retry_after` elapses
    Throttled { retry_after: Duration },
    /// The chat does not accept this reaction from us (permanent)
    Forbidden { reason: String },
    /// Network or protocol hiccup, worth retrying
    Transient { reason: String },
    /// Anything the adapter could not classify
    Unknown { reason: String },
    /// Session-level failure, e.g. authorization revoked
    Fatal { reason: String },
}

impl fmt::Display for ReactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactionError::Throttled { retry_after } => {
                write!(f, "throttled, retry after {}s", retry_after.as_secs_f64())
            }
            ReactionError::Forbidden { reason } => write!(f, "forbidden: {}", reason),
            ReactionError::Transient { reason } => write!(f, "transient error: {}", reason),
            ReactionError::Unknown { reason } => write!(f, "unclassified error: {}", reason),
            ReactionError::Fatal { reason } => write!(f, "session failure: {}", reason),
        }
    }
}

impl std::error::Error for ReactionError {}

/// The live, already-authenticated platform session.
///
/// Only `send_reaction` is mandatory; the lookups default to "unknown" so an
/// adapter without history or reaction introspection still works.
#[async_trait]
pub trait PlatformSession: Send + Sync {
    /// Put `reaction` on the message
    async fn send_reaction(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        reaction: &str,
    ) -> Result<(), ReactionError>;

    /// Reactions the chat permits. `None` means all are allowed or unknown.
    async fn allowed_reactions(&self, _chat_id: ChatId) -> anyhow::Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// Whether the message already carries one of our reactions
    async fn has_own_reaction(
        &self,
        _chat_id: ChatId,
        _message_id: MessageId,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Ids of the messages in `(after, up_to]`, ascending.
    /// `None` when the session cannot enumerate history.
    async fn message_ids_between(
        &self,
        _chat_id: ChatId,
        _after: MessageId,
        _up_to: MessageId,
    ) -> anyhow::Result<Option<Vec<MessageId>>> {
        Ok(None)
    }

    /// Display name of the logged in account
    async fn whoami(&self) -> Result<String, ReactionError>;
}
