pub mod dispatcher;
pub mod governor;
pub mod ledger;
pub mod normalizer;
pub mod scope;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

pub use crate::platform::{ChatId, MessageId, RawUpdate};
use crate::platform::PlatformSession;

use self::dispatcher::Dispatcher;
use self::ledger::DedupLedger;
use self::normalizer::{Normalizer, NormalizerOptions, ReactionMode};
use self::scope::ChatScope;

/// Messages of one chat that became read with a single notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    pub chat_id: ChatId,
    /// Ascending
    pub message_ids: Vec<MessageId>,
    /// Watermark before this notification, if one was known
    pub previous_watermark: Option<MessageId>,
    pub observed_at: DateTime<Utc>,
}

/// One admitted `(chat, message)` pair owned by the dispatcher
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    /// 1 for the first try, bumped on every requeue
    pub attempt: u32,
    /// Transient or unclassified failures so far; throttling does not count
    pub transient_failures: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest start of the next try
    pub not_before: Option<Instant>,
}

impl DispatchTask {
    pub fn new(chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            chat_id,
            message_id,
            attempt: 1,
            transient_failures: 0,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Transient failures tolerated before a message is skipped
    pub max_transient_attempts: u32,
    /// Pause before a transient failure is retried
    pub transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_attempts: 3,
            transient_delay: Duration::from_secs(2),
        }
    }
}

/// Everything the engine needs from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub reaction: String,
    pub min_delay: Duration,
    pub scope: ChatScope,
    pub normalizer: NormalizerOptions,
    pub retry: RetryPolicy,
    pub ledger_capacity: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reaction: "⭐".to_string(),
            min_delay: Duration::from_secs(1),
            scope: ChatScope::All,
            normalizer: NormalizerOptions::default(),
            retry: RetryPolicy::default(),
            ledger_capacity: None,
        }
    }
}

/// Counters shared between the pipeline stages and the status report
#[derive(Debug, Default)]
pub struct EngineStats {
    admitted: AtomicU64,
    duplicates: AtomicU64,
    out_of_scope: AtomicU64,
    committed: AtomicU64,
    skipped: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub duplicates: u64,
    pub out_of_scope: u64,
    pub committed: u64,
    pub skipped: u64,
    pub retries: u64,
}

impl EngineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        Self::bump(&self.admitted);
    }

    pub fn record_duplicate(&self) {
        Self::bump(&self.duplicates);
    }

    pub fn record_out_of_scope(&self) {
        Self::bump(&self.out_of_scope);
    }

    pub fn record_committed(&self) {
        Self::bump(&self.committed);
    }

    pub fn record_skipped(&self) {
        Self::bump(&self.skipped);
    }

    pub fn record_retry(&self) {
        Self::bump(&self.retries);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            out_of_scope: self.out_of_scope.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "admitted={} committed={} skipped={} retries={} duplicates={} out_of_scope={}",
            self.admitted,
            self.committed,
            self.skipped,
            self.retries,
            self.duplicates,
            self.out_of_scope
        )
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is
/// dropped without requesting it.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Normalize, filter and admit raw updates into the dispatch queue.
struct Admission {
    normalizer: Normalizer,
    mode: ReactionMode,
    scope: ChatScope,
    ledger: Arc<DedupLedger>,
    session: Arc<dyn PlatformSession>,
    stats: Arc<EngineStats>,
}

impl Admission {
    async fn run(
        mut self,
        mut updates: mpsc::Receiver<RawUpdate>,
        tasks: mpsc::UnboundedSender<DispatchTask>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let update = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    debug!("Admission stopped by shutdown");
                    break;
                }
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => {
                        info!("Update stream closed");
                        break;
                    }
                },
            };

            if !self.admit(update, &tasks).await {
                break;
            }
        }
    }

    /// Returns false once the dispatcher is gone
    async fn admit(
        &mut self,
        update: RawUpdate,
        tasks: &mpsc::UnboundedSender<DispatchTask>,
    ) -> bool {
        let Some(event) = self.normalizer.normalize(update) else {
            return true;
        };

        if !self.scope.is_in_scope(event.chat_id) {
            debug!("Chat {} is out of scope", event.chat_id);
            self.stats.record_out_of_scope();
            return true;
        }

        let chat_id = event.chat_id;
        debug!(
            "Chat {}: {} message(s) read, observed {}",
            chat_id,
            event.message_ids.len(),
            event.observed_at.format("%H:%M:%S%.3f")
        );
        for message_id in self.resolve(event).await {
            if !self.ledger.try_admit(chat_id, message_id).await {
                debug!("Chat {} message {} already handled", chat_id, message_id);
                self.stats.record_duplicate();
                continue;
            }

            if tasks.send(DispatchTask::new(chat_id, message_id)).is_err() {
                self.ledger.release(chat_id, message_id).await;
                return false;
            }
            self.stats.record_admitted();
        }
        true
    }

    /// Replace a synthetic id range with real history when the session can
    /// enumerate it
    async fn resolve(&self, event: ReadEvent) -> Vec<MessageId> {
        if event.message_ids.is_empty()
            || self.mode != ReactionMode::Range
            || event.previous_watermark.is_none()
        {
            return event.message_ids;
        }
        let first = event.message_ids[0];
        let last = event.message_ids[event.message_ids.len() - 1];

        match self
            .session
            .message_ids_between(event.chat_id, first - 1, last)
            .await
        {
            Ok(Some(mut ids)) => {
                ids.retain(|id| (first..=last).contains(id));
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            Ok(None) => event.message_ids,
            Err(e) => {
                debug!("History lookup failed for chat {}: {:#}", event.chat_id, e);
                event.message_ids
            }
        }
    }
}

/// The reaction engine: admission pipeline plus a single dispatcher.
pub struct Engine {
    settings: EngineSettings,
    session: Arc<dyn PlatformSession>,
    ledger: Arc<DedupLedger>,
    stats: Arc<EngineStats>,
    seeds: Vec<(ChatId, MessageId)>,
}

impl Engine {
    pub fn new(settings: EngineSettings, session: Arc<dyn PlatformSession>) -> Self {
        let ledger = Arc::new(DedupLedger::new(settings.ledger_capacity));
        Self {
            settings,
            session,
            ledger,
            stats: Arc::new(EngineStats::default()),
            seeds: Vec::new(),
        }
    }

    /// Record a connection-time read watermark for a chat
    #[cfg(test)]
    pub fn seed_watermark(&mut self, chat_id: ChatId, watermark: MessageId) {
        self.seeds.push((chat_id, watermark));
    }

    pub fn ledger(&self) -> Arc<DedupLedger> {
        self.ledger.clone()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    /// Run until the update stream ends and the queue is drained, or until
    /// shutdown is requested. Only session-level failures are returned.
    pub async fn run(
        self,
        updates: mpsc::Receiver<RawUpdate>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut normalizer = Normalizer::new(self.settings.normalizer.clone());
        for (chat_id, watermark) in &self.seeds {
            normalizer.seed(*chat_id, *watermark);
        }

        info!(
            "Reacting with {} in {}, {:.1}s between reactions",
            self.settings.reaction,
            self.settings.scope,
            self.settings.min_delay.as_secs_f64()
        );

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let admission = Admission {
            normalizer,
            mode: self.settings.normalizer.mode,
            scope: self.settings.scope.clone(),
            ledger: self.ledger.clone(),
            session: self.session.clone(),
            stats: self.stats.clone(),
        };
        let admission_handle = tokio::spawn(admission.run(updates, task_tx, shutdown.clone()));

        let dispatcher = Dispatcher::new(
            self.session.clone(),
            self.ledger.clone(),
            self.stats.clone(),
            self.settings.reaction.clone(),
            self.settings.min_delay,
            self.settings.retry.clone(),
        );
        let result = dispatcher.run(task_rx, shutdown).await;

        admission_handle.abort();
        info!("Engine stopped: {}", self.stats.snapshot());
        result
    }
}
