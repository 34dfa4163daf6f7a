use std::collections::HashMap;

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::{ChatId, MessageId, RawUpdate, ReadEvent};

/// Which messages a read notification covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionMode {
    /// Every message between the previous and the new watermark
    #[default]
    Range,
    /// Only the watermark message itself
    Latest,
}

#[derive(Debug, Clone)]
pub struct NormalizerOptions {
    pub mode: ReactionMode,
    /// Upper bound on ids emitted for one update; the newest are kept
    pub max_range: usize,
    /// Drop reads in chats explicitly marked as non-broadcast
    pub broadcast_only: bool,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            mode: ReactionMode::Range,
            max_range: 100,
            broadcast_only: false,
        }
    }
}

/// Turns raw updates into read events, tracking one watermark per chat.
pub struct Normalizer {
    options: NormalizerOptions,
    watermarks: HashMap<ChatId, MessageId>,
}

impl Normalizer {
    pub fn new(options: NormalizerOptions) -> Self {
        Self {
            options,
            watermarks: HashMap::new(),
        }
    }

    /// Record the watermark a chat had when the session connected
    pub fn seed(&mut self, chat_id: ChatId, watermark: MessageId) {
        let entry = self.watermarks.entry(chat_id).or_insert(watermark);
        *entry = (*entry).max(watermark);
    }

    #[cfg(test)]
    pub fn watermark(&self, chat_id: ChatId) -> Option<MessageId> {
        self.watermarks.get(&chat_id).copied()
    }

    pub fn normalize(&mut self, update: RawUpdate) -> Option<ReadEvent> {
        match update {
            RawUpdate::ChannelRead {
                chat_id,
                max_id,
                broadcast,
            } => {
                let event = self.advance(chat_id, max_id)?;
                if self.options.broadcast_only && broadcast == Some(false) {
                    debug!("Ignoring read in non-broadcast chat {}", chat_id);
                    return None;
                }
                Some(event)
            }
            RawUpdate::ChatRead { chat_id, max_id } => {
                let event = self.advance(chat_id, max_id)?;
                if self.options.broadcast_only {
                    return None;
                }
                Some(event)
            }
            RawUpdate::DialogSnapshot {
                chat_id,
                read_max_id,
            } => {
                self.seed(chat_id, read_max_id);
                None
            }
            RawUpdate::OutboxRead { .. }
            | RawUpdate::Typing
            | RawUpdate::Presence
            | RawUpdate::Unrecognized => None,
        }
    }

    /// Move the chat's watermark forward and describe what became read
    fn advance(&mut self, chat_id: ChatId, new_watermark: MessageId) -> Option<ReadEvent> {
        if new_watermark <= 0 {
            return None;
        }

        let previous = self.watermarks.get(&chat_id).copied();
        if previous.is_some_and(|prev| new_watermark <= prev) {
            return None;
        }
        self.watermarks.insert(chat_id, new_watermark);

        let message_ids = match (self.options.mode, previous) {
            (ReactionMode::Range, Some(prev)) => {
                let span = MessageId::try_from(self.options.max_range).unwrap_or(MessageId::MAX);
                let first = (prev + 1).max(new_watermark.saturating_sub(span).saturating_add(1));
                if first > prev + 1 {
                    debug!(
                        "Chat {}: capping read range ({}, {}] to the newest {} messages",
                        chat_id, prev, new_watermark, self.options.max_range
                    );
                }
                (first..=new_watermark).collect()
            }
            _ => vec![new_watermark],
        };

        Some(ReadEvent {
            chat_id,
            message_ids,
            previous_watermark: previous,
            observed_at: Utc::now(),
        })
    }
}
