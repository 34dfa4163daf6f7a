use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::governor::RateGovernor;
use super::ledger::DedupLedger;
use super::{shutdown_requested, ChatId, DispatchTask, EngineStats, RetryPolicy};
use crate::platform::{PlatformSession, ReactionError};

/// Why a message was given up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Forbidden(String),
    ReactionNotAllowed,
    RetriesExhausted(String),
}

/// What one dispatch attempt ended in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    AlreadyReacted,
    Skipped(SkipReason),
    Retrying,
}

/// Single worker that owns the dispatch queue. One request in flight at a
/// time; pacing and flood waits are account-wide.
pub struct Dispatcher {
    session: Arc<dyn PlatformSession>,
    ledger: Arc<DedupLedger>,
    stats: Arc<EngineStats>,
    governor: RateGovernor,
    reaction: String,
    retry: RetryPolicy,
    queue: VecDeque<DispatchTask>,
    /// Allowed reactions per chat, `None` = anything goes
    allowed_cache: HashMap<ChatId, Option<Vec<String>>>,
}

impl Dispatcher {
    pub fn new(
        session: Arc<dyn PlatformSession>,
        ledger: Arc<DedupLedger>,
        stats: Arc<EngineStats>,
        reaction: String,
        min_delay: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            session,
            ledger,
            stats,
            governor: RateGovernor::new(min_delay),
            reaction,
            retry,
            queue: VecDeque::new(),
            allowed_cache: HashMap::new(),
        }
    }

    /// Consume admitted tasks until the intake closes and the queue is empty,
    /// or until shutdown. Returns an error only for session-level failures.
    pub async fn run(
        mut self,
        mut intake: mpsc::UnboundedReceiver<DispatchTask>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut intake_open = true;

        let result = loop {
            while intake_open {
                match intake.try_recv() {
                    Ok(task) => self.queue.push_back(task),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => intake_open = false,
                }
            }

            let task = match self.queue.pop_front() {
                Some(task) => task,
                None if !intake_open => break Ok(()),
                None => tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => break Ok(()),
                    next = intake.recv() => match next {
                        Some(task) => task,
                        None => {
                            intake_open = false;
                            continue;
                        }
                    },
                },
            };

            let ready = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => false,
                _ = self.wait_turn(&task) => true,
            };
            if !ready {
                self.ledger.release(task.chat_id, task.message_id).await;
                break Ok(());
            }

            if let Err(e) = self.dispatch(task).await {
                break Err(e);
            }
        };

        let mut abandoned = 0usize;
        while let Some(task) = self.queue.pop_front() {
            self.ledger.release(task.chat_id, task.message_id).await;
            abandoned += 1;
        }
        intake.close();
        while let Ok(task) = intake.try_recv() {
            self.ledger.release(task.chat_id, task.message_id).await;
            abandoned += 1;
        }
        if abandoned > 0 {
            info!("Released {} queued reactions", abandoned);
        }

        result
    }

    async fn wait_turn(&mut self, task: &DispatchTask) {
        if let Some(not_before) = task.not_before {
            if not_before > Instant::now() {
                sleep_until(not_before).await;
            }
        }
        self.governor.gate().await;
    }

    /// Run one attempt for `task` and settle its ledger entry or requeue it
    async fn dispatch(&mut self, mut task: DispatchTask) -> Result<Outcome> {
        let (chat_id, message_id) = (task.chat_id, task.message_id);

        let already = match self.session.has_own_reaction(chat_id, message_id).await {
            Ok(already) => already,
            Err(e) => {
                debug!("Could not check reactions on {}/{}: {:#}", chat_id, message_id, e);
                false
            }
        };
        if already {
            return Ok(self.settle(&task, Outcome::AlreadyReacted).await);
        }

        if !self.reaction_allowed(chat_id).await {
            let outcome = Outcome::Skipped(SkipReason::ReactionNotAllowed);
            return Ok(self.settle(&task, outcome).await);
        }

        let result = self
            .session
            .send_reaction(chat_id, message_id, &self.reaction)
            .await;
        let outcome = match result {
            Ok(()) => Outcome::Committed,
            Err(ReactionError::Throttled { retry_after }) => {
                warn!(
                    "Rate limited, waiting {}s (chat {} message {})",
                    retry_after.as_secs_f64(),
                    chat_id,
                    message_id
                );
                self.governor.record_throttle(retry_after);
                task.attempt += 1;
                self.stats.record_retry();
                self.queue.push_front(task);
                return Ok(Outcome::Retrying);
            }
            Err(ReactionError::Forbidden { reason }) => {
                self.allowed_cache.remove(&chat_id);
                Outcome::Skipped(SkipReason::Forbidden(reason))
            }
            Err(err @ (ReactionError::Transient { .. } | ReactionError::Unknown { .. })) => {
                task.transient_failures += 1;
                if task.transient_failures >= self.retry.max_transient_attempts {
                    Outcome::Skipped(SkipReason::RetriesExhausted(err.to_string()))
                } else {
                    debug!(
                        "Chat {} message {} attempt {} failed: {}",
                        chat_id, message_id, task.attempt, err
                    );
                    task.attempt += 1;
                    task.not_before = Some(Instant::now() + self.retry.transient_delay);
                    self.stats.record_retry();
                    self.queue.push_back(task);
                    return Ok(Outcome::Retrying);
                }
            }
            Err(err @ ReactionError::Fatal { .. }) => {
                self.ledger.release(chat_id, message_id).await;
                return Err(anyhow::Error::new(err).context(format!(
                    "Session failed while reacting to chat {} message {}",
                    chat_id, message_id
                )));
            }
        };

        Ok(self.settle(&task, outcome).await)
    }

    /// Commit a terminal outcome and report it
    async fn settle(&self, task: &DispatchTask, outcome: Outcome) -> Outcome {
        let (chat_id, message_id) = (task.chat_id, task.message_id);
        self.ledger.commit(chat_id, message_id).await;

        let queued_ms = (Utc::now() - task.enqueued_at).num_milliseconds();
        match &outcome {
            Outcome::Committed => {
                self.stats.record_committed();
                info!(
                    chat_id,
                    message_id,
                    outcome = "committed",
                    attempt = task.attempt,
                    queued_ms,
                    "{} chat {} message {}",
                    self.reaction,
                    chat_id,
                    message_id
                );
            }
            Outcome::AlreadyReacted => {
                self.stats.record_committed();
                info!(
                    chat_id,
                    message_id,
                    outcome = "already_reacted",
                    "Chat {} message {} already has our reaction",
                    chat_id,
                    message_id
                );
            }
            Outcome::Skipped(SkipReason::Forbidden(reason)) => {
                self.stats.record_skipped();
                warn!(
                    chat_id,
                    message_id,
                    outcome = "forbidden",
                    "Chat {} message {} does not accept reactions: {}",
                    chat_id,
                    message_id,
                    reason
                );
            }
            Outcome::Skipped(SkipReason::ReactionNotAllowed) => {
                self.stats.record_skipped();
                warn!(
                    chat_id,
                    message_id,
                    outcome = "reaction_not_allowed",
                    "{} is not allowed in chat {}, skipping message {}",
                    self.reaction,
                    chat_id,
                    message_id
                );
            }
            Outcome::Skipped(SkipReason::RetriesExhausted(last_error)) => {
                self.stats.record_skipped();
                warn!(
                    chat_id,
                    message_id,
                    outcome = "retries_exhausted",
                    attempt = task.attempt,
                    "Giving up on chat {} message {} after {} failures: {}",
                    chat_id,
                    message_id,
                    task.transient_failures,
                    last_error
                );
            }
            Outcome::Retrying => {}
        }
        outcome
    }

    async fn reaction_allowed(&mut self, chat_id: ChatId) -> bool {
        if !self.allowed_cache.contains_key(&chat_id) {
            let allowed = match self.session.allowed_reactions(chat_id).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    debug!("Could not get allowed reactions for {}: {:#}", chat_id, e);
                    None
                }
            };
            self.allowed_cache.insert(chat_id, allowed);
        }

        match self.allowed_cache.get(&chat_id) {
            Some(Some(allowed)) => allowed.iter().any(|r| r == &self.reaction),
            _ => true,
        }
    }
}
