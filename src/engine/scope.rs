use std::collections::HashSet;

use super::ChatId;

/// Which chats the engine acts on. Resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatScope {
    All,
    Chats(HashSet<ChatId>),
}

impl ChatScope {
    /// Build from the configured watch list; unset or empty means every chat
    pub fn from_watch_list(watch_chats: Option<&[ChatId]>) -> Self {
        match watch_chats {
            Some(ids) if !ids.is_empty() => ChatScope::Chats(ids.iter().copied().collect()),
            _ => ChatScope::All,
        }
    }

    pub fn is_in_scope(&self, chat_id: ChatId) -> bool {
        match self {
            ChatScope::All => true,
            ChatScope::Chats(ids) => ids.contains(&chat_id),
        }
    }
}

impl std::fmt::Display for ChatScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatScope::All => write!(f, "all chats"),
            ChatScope::Chats(ids) => {
                let mut ids: Vec<_> = ids.iter().collect();
                ids.sort();
                write!(f, "{:?}", ids)
            }
        }
    }
}
