use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ChatId, MessageId, PlatformSession, ReactionError};

/// One recorded `send_reaction` call
#[derive(Debug, Clone)]
pub struct SentReaction {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub reaction: String,
    pub at: Instant,
}

/// Scripted in-memory session for engine tests.
///
/// Calls succeed unless a failure was queued for the message or the chat.
#[derive(Default)]
pub struct MockSession {
    sent: Mutex<Vec<SentReaction>>,
    message_failures: Mutex<HashMap<(ChatId, MessageId), VecDeque<ReactionError>>>,
    chat_failures: Mutex<HashMap<ChatId, ReactionError>>,
    allowed: Mutex<HashMap<ChatId, Vec<String>>>,
    already_reacted: Mutex<HashSet<(ChatId, MessageId)>>,
    history: Mutex<HashMap<ChatId, Vec<MessageId>>>,
    allowed_lookups: Mutex<u32>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue failures returned by successive sends for one message
    pub async fn fail_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        errors: Vec<ReactionError>,
    ) {
        self.message_failures
            .lock()
            .await
            .entry((chat_id, message_id))
            .or_default()
            .extend(errors);
    }

    /// Every send into `chat_id` fails with `error`
    pub async fn fail_chat(&self, chat_id: ChatId, error: ReactionError) {
        self.chat_failures.lock().await.insert(chat_id, error);
    }

    pub async fn allow_only(&self, chat_id: ChatId, reactions: &[&str]) {
        self.allowed
            .lock()
            .await
            .insert(chat_id, reactions.iter().map(|r| r.to_string()).collect());
    }

    pub async fn mark_reacted(&self, chat_id: ChatId, message_id: MessageId) {
        self.already_reacted.lock().await.insert((chat_id, message_id));
    }

    pub async fn set_history(&self, chat_id: ChatId, ids: Vec<MessageId>) {
        self.history.lock().await.insert(chat_id, ids);
    }

    pub async fn sent(&self) -> Vec<SentReaction> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_ids(&self) -> Vec<(ChatId, MessageId)> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|s| (s.chat_id, s.message_id))
            .collect()
    }

    pub async fn allowed_lookups(&self) -> u32 {
        *self.allowed_lookups.lock().await
    }
}

#[async_trait]
impl PlatformSession for MockSession {
    async fn send_reaction(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        reaction: &str,
    ) -> Result<(), ReactionError> {
        self.sent.lock().await.push(SentReaction {
            chat_id,
            message_id,
            reaction: reaction.to_string(),
            at: Instant::now(),
        });

        if let Some(err) = self.chat_failures.lock().await.get(&chat_id) {
            return Err(err.clone());
        }

        let mut failures = self.message_failures.lock().await;
        match failures
            .get_mut(&(chat_id, message_id))
            .and_then(|queue| queue.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn allowed_reactions(&self, chat_id: ChatId) -> anyhow::Result<Option<Vec<String>>> {
        *self.allowed_lookups.lock().await += 1;
        Ok(self.allowed.lock().await.get(&chat_id).cloned())
    }

    async fn has_own_reaction(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> anyhow::Result<bool> {
        Ok(self
            .already_reacted
            .lock()
            .await
            .contains(&(chat_id, message_id)))
    }

    async fn message_ids_between(
        &self,
        chat_id: ChatId,
        after: MessageId,
        up_to: MessageId,
    ) -> anyhow::Result<Option<Vec<MessageId>>> {
        Ok(self.history.lock().await.get(&chat_id).map(|ids| {
            ids.iter()
                .copied()
                .filter(|id| *id > after && *id <= up_to)
                .collect()
        }))
    }

    async fn whoami(&self) -> Result<String, ReactionError> {
        Ok("mock".to_string())
    }
}
