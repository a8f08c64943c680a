//! Background worker that answers pending user messages.
//!
//! Each tick fetches a small batch of unprocessed user messages (oldest
//! first), claims the ones this process is not already handling, asks the
//! [`ResponseGenerator`] for a reply and stores it as an assistant message
//! pointing back at the original. Failures are logged per message and never
//! stop the batch or the loop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheSweepJob, ResponseCache};
use crate::error::Result;
use crate::interfaces::generator::ResponseGenerator;
use crate::interfaces::scheduler::ScheduledJob;
use crate::ledger::{Message, MessageDraft, MessageStore};
use crate::scheduler::Scheduler;

mod concise;

pub use concise::ConcisePolicy;

/// When a claimed message is marked processed relative to generating its
/// reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkPolicy {
    /// Mark first, then generate. A crash or failure mid-generation loses the
    /// reply but can never produce a second one.
    #[default]
    BeforeGenerate,
    /// Store the reply first, then mark. Failed generations are retried on
    /// later ticks up to `max_attempts`; an existing reply short-circuits the
    /// retry so a message is still answered at most once.
    AfterGenerate,
}

#[derive(Debug, Clone)]
pub struct ChatProcessorConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub context_limit: usize,
    pub mark_policy: MarkPolicy,
    pub max_attempts: u32,
    pub concise: ConcisePolicy,
}

impl Default for ChatProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 5,
            context_limit: 5,
            mark_policy: MarkPolicy::BeforeGenerate,
            max_attempts: 3,
            concise: ConcisePolicy::default(),
        }
    }
}

/// Counts for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fetched: usize,
    pub replied: usize,
    pub without_reply: usize,
    pub failed: usize,
    pub deferred: usize,
    pub skipped: usize,
}

enum Outcome {
    Replied,
    NoReply,
    Failed,
    /// Left pending for a later tick.
    Deferred,
}

#[derive(Debug, Default)]
struct ClaimState {
    in_flight: HashSet<i32>,
    seen: HashSet<i32>,
    attempts: HashMap<i32, u32>,
}

pub struct ChatProcessor {
    store: Arc<MessageStore>,
    generator: Arc<dyn ResponseGenerator>,
    config: ChatProcessorConfig,
    claims: Mutex<ClaimState>,
}

impl ChatProcessor {
    pub fn new(
        store: Arc<MessageStore>,
        generator: Arc<dyn ResponseGenerator>,
        config: ChatProcessorConfig,
    ) -> Self {
        Self {
            store,
            generator,
            config,
            claims: Mutex::new(ClaimState::default()),
        }
    }

    pub fn config(&self) -> &ChatProcessorConfig {
        &self.config
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_claims().in_flight.len()
    }

    pub fn seen_count(&self) -> usize {
        self.lock_claims().seen.len()
    }

    /// Forgets every claim. Only safe once no tick is running.
    pub fn reset_claims(&self) {
        let mut claims = self.lock_claims();
        claims.in_flight.clear();
        claims.seen.clear();
        claims.attempts.clear();
    }

    /// Runs one poll cycle. A failed batch fetch is returned as an error and
    /// simply retried on the next tick; everything after that is handled per
    /// message.
    pub async fn tick(&self) -> Result<TickReport> {
        let batch = self
            .store
            .get_unprocessed(None, self.config.batch_size)
            .await?;
        let mut report = TickReport {
            fetched: batch.len(),
            ..TickReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }
        debug!(count = batch.len(), "processing pending messages");

        for message in batch {
            if !self.try_claim(message.id) {
                report.skipped += 1;
                continue;
            }
            let outcome = match self.config.mark_policy {
                MarkPolicy::BeforeGenerate => self.answer_marking_first(&message).await,
                MarkPolicy::AfterGenerate => self.answer_marking_last(&message).await,
            };
            let settled = !matches!(outcome, Outcome::Deferred);
            match outcome {
                Outcome::Replied => report.replied += 1,
                Outcome::NoReply => report.without_reply += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Deferred => report.deferred += 1,
            }
            self.release(message.id, settled);
        }

        Ok(report)
    }

    async fn answer_marking_first(&self, message: &Message) -> Outcome {
        match self.store.claim_pending(message.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = message.id, "message already claimed elsewhere");
                return Outcome::NoReply;
            }
            Err(err) => {
                warn!(message_id = message.id, error = %err, "could not mark message processed");
                return Outcome::Deferred;
            }
        }

        match self.generate_reply(message).await {
            Ok(Some(reply)) => self.store_reply(message, &reply).await,
            Ok(None) => Outcome::NoReply,
            Err(err) => {
                warn!(
                    message_id = message.id,
                    conversation_id = %message.conversation_id,
                    error = %err,
                    "reply generation failed; message stays processed without a reply"
                );
                Outcome::Failed
            }
        }
    }

    async fn answer_marking_last(&self, message: &Message) -> Outcome {
        match self.store.has_reply(message.id).await {
            Ok(true) => {
                debug!(message_id = message.id, "reply already stored; marking processed");
                return self.mark_after_reply(message, Outcome::NoReply).await;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(message_id = message.id, error = %err, "reply lookup failed");
                return Outcome::Deferred;
            }
        }

        match self.generate_reply(message).await {
            Ok(Some(reply)) => {
                let outcome = self.store_reply(message, &reply).await;
                if matches!(outcome, Outcome::Failed) {
                    return self.retry_or_give_up(message).await;
                }
                self.mark_after_reply(message, outcome).await
            }
            Ok(None) => self.mark_after_reply(message, Outcome::NoReply).await,
            Err(err) => {
                warn!(
                    message_id = message.id,
                    conversation_id = %message.conversation_id,
                    error = %err,
                    "reply generation failed"
                );
                self.retry_or_give_up(message).await
            }
        }
    }

    async fn retry_or_give_up(&self, message: &Message) -> Outcome {
        let attempts = self.record_attempt(message.id);
        if attempts < self.config.max_attempts {
            debug!(message_id = message.id, attempts, "will retry on a later tick");
            return Outcome::Deferred;
        }
        warn!(
            message_id = message.id,
            attempts, "giving up; message marked processed without a reply"
        );
        self.mark_after_reply(message, Outcome::Failed).await
    }

    async fn mark_after_reply(&self, message: &Message, outcome: Outcome) -> Outcome {
        match self.store.mark_processed(message.id).await {
            Ok(_) => outcome,
            Err(err) => {
                warn!(message_id = message.id, error = %err, "could not mark message processed");
                Outcome::Deferred
            }
        }
    }

    /// Context is read right before generation, so under
    /// [`MarkPolicy::BeforeGenerate`] it already includes the message being
    /// answered. Blank replies count as "nothing to say".
    async fn generate_reply(&self, message: &Message) -> Result<Option<String>> {
        let context = self
            .store
            .get_context(&message.conversation_id, self.config.context_limit)
            .await?;
        let reply = self
            .generator
            .generate(&message.content, &context, &message.conversation_id)
            .await?;
        if reply.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(self.config.concise.apply(&reply)))
    }

    async fn store_reply(&self, message: &Message, reply: &str) -> Outcome {
        let draft = MessageDraft::assistant(reply)
            .in_conversation(message.conversation_id.clone())
            .replying_to(message.id);
        match self.store.add_message(draft).await {
            Ok(Some(inserted)) => {
                info!(
                    message_id = message.id,
                    reply_id = inserted.id,
                    conversation_id = %message.conversation_id,
                    generator = self.generator.name(),
                    "reply stored"
                );
                Outcome::Replied
            }
            Ok(None) => {
                debug!(message_id = message.id, "duplicate reply suppressed");
                Outcome::NoReply
            }
            Err(err) => {
                warn!(message_id = message.id, error = %err, "could not store reply");
                Outcome::Failed
            }
        }
    }

    fn try_claim(&self, id: i32) -> bool {
        let mut claims = self.lock_claims();
        if claims.in_flight.contains(&id) || claims.seen.contains(&id) {
            return false;
        }
        claims.in_flight.insert(id);
        true
    }

    fn release(&self, id: i32, settled: bool) {
        let mut claims = self.lock_claims();
        claims.in_flight.remove(&id);
        if settled {
            claims.seen.insert(id);
            claims.attempts.remove(&id);
        }
    }

    fn record_attempt(&self, id: i32) -> u32 {
        let mut claims = self.lock_claims();
        let attempts = claims.attempts.entry(id).or_insert(0);
        *attempts += 1;
        *attempts
    }

    // A poisoned lock only means another tick panicked mid-update; the sets
    // are still usable.
    fn lock_claims(&self) -> MutexGuard<'_, ClaimState> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ScheduledJob for ChatProcessor {
    fn name(&self) -> &str {
        "chat_processor"
    }

    fn interval(&self) -> Duration {
        self.config.poll_interval
    }

    async fn run(&self) -> Result<()> {
        let report = self.tick().await?;
        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                replied = report.replied,
                failed = report.failed,
                deferred = report.deferred,
                skipped = report.skipped,
                "tick finished"
            );
        }
        Ok(())
    }
}

/// Owns the scheduler that drives a [`ChatProcessor`] and, optionally, the
/// cache sweep.
pub struct ChatWorker {
    processor: Arc<ChatProcessor>,
    scheduler: Scheduler,
}

impl ChatWorker {
    pub fn new(processor: Arc<ChatProcessor>) -> Self {
        let mut scheduler = Scheduler::new();
        scheduler.register_job(processor.clone());
        Self {
            processor,
            scheduler,
        }
    }

    pub fn with_cache_sweep(mut self, cache: Arc<ResponseCache>, interval: Duration) -> Self {
        self.scheduler
            .register_job(Arc::new(CacheSweepJob::new(cache, interval)));
        self
    }

    pub fn processor(&self) -> &Arc<ChatProcessor> {
        &self.processor
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn start(&mut self) {
        if self.scheduler.is_running() {
            return;
        }
        info!(
            jobs = ?self.scheduler.job_names(),
            poll_interval_ms = self.processor.config().poll_interval.as_millis() as u64,
            "chat worker starting"
        );
        self.scheduler.start();
    }

    /// Lets the current tick finish, then clears in-flight and seen claims.
    pub async fn stop(&mut self) {
        self.scheduler.stop().await;
        self.processor.reset_claims();
        info!("chat worker stopped");
    }
}
