use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use vesper::error::{Result, VesperError};
use vesper::interfaces::generator::ResponseGenerator;
use vesper::ledger::{ContextTurn, Message, MessageDraft, MessageStore, Role};
use vesper::processor::{ChatProcessor, ChatProcessorConfig, ChatWorker, MarkPolicy};

/// Replies with a fixed string after an optional delay, failing the first
/// `failures` calls.
struct StubGenerator {
    reply: String,
    delay: Duration,
    failures: usize,
    calls: AtomicUsize,
    contexts: Mutex<Vec<Vec<ContextTurn>>>,
}

impl StubGenerator {
    fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            delay: Duration::ZERO,
            failures: 0,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing_first(mut self, failures: usize) -> Self {
        self.failures = failures;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for StubGenerator {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate(
        &self,
        _query: &str,
        context: &[ContextTurn],
        _conversation_id: &str,
    ) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.failures {
            return Err(VesperError::Generation("backend unavailable".to_string()));
        }
        Ok(self.reply.clone())
    }
}

async fn open_store(dir: &tempfile::TempDir) -> Arc<MessageStore> {
    let db_path = dir.path().join("processor.db");
    Arc::new(MessageStore::new(db_path.to_string_lossy()).await.unwrap())
}

fn replies_to(messages: &[Message], parent: i32) -> usize {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant && m.parent_message_id == Some(parent))
        .count()
}

#[tokio::test]
async fn one_tick_answers_hello() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let generator = Arc::new(StubGenerator::replying("Hi there"));
    let processor = ChatProcessor::new(
        store.clone(),
        generator.clone(),
        ChatProcessorConfig::default(),
    );

    store
        .add_message(MessageDraft::user("Hello").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();

    let report = processor.tick().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.replied, 1);

    let context = store.get_context("c1", 5).await.unwrap();
    assert_eq!(
        context,
        vec![
            ContextTurn::new(Role::User, "Hello"),
            ContextTurn::new(Role::Assistant, "Hi there"),
        ]
    );

    // Marked before generating, so the generator saw the message itself.
    let seen = generator.contexts.lock().unwrap().clone();
    assert_eq!(seen, vec![vec![ContextTurn::new(Role::User, "Hello")]]);

    // Nothing left to do.
    let idle = processor.tick().await.unwrap();
    assert_eq!(idle.fetched, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_ticks_reply_at_most_once() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let generator = Arc::new(StubGenerator::replying("ok").slow(Duration::from_millis(100)));
    let processor = Arc::new(ChatProcessor::new(
        store.clone(),
        generator.clone(),
        ChatProcessorConfig::default(),
    ));

    // Separate conversations, so identical replies are not deduplicated.
    let mut ids = Vec::new();
    for i in 0..3 {
        let inserted = store
            .add_message(MessageDraft::user(format!("question {i}")).in_conversation(format!("c{i}")))
            .await
            .unwrap()
            .unwrap();
        ids.push((inserted.id, inserted.conversation_id));
    }

    let first = tokio::spawn({
        let processor = processor.clone();
        async move { processor.tick().await.unwrap() }
    });
    let second = tokio::spawn({
        let processor = processor.clone();
        async move { processor.tick().await.unwrap() }
    });
    let (first, second) = (first.await.unwrap(), second.await.unwrap());
    assert_eq!(first.replied + second.replied, 3);

    // A second processor with its own claim sets must not answer again.
    let other = ChatProcessor::new(
        store.clone(),
        generator.clone(),
        ChatProcessorConfig::default(),
    );
    other.tick().await.unwrap();

    for (id, conversation_id) in ids {
        let history = store.get_conversation_messages(&conversation_id).await.unwrap();
        assert_eq!(replies_to(&history, id), 1, "message {id}");
    }
    assert_eq!(generator.calls(), 3);
    assert_eq!(processor.in_flight_count(), 0);
    assert_eq!(processor.seen_count(), 3);
}

#[tokio::test]
async fn failed_generation_leaves_message_processed_without_reply() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let generator = Arc::new(StubGenerator::replying("never").failing_first(usize::MAX));
    let processor = ChatProcessor::new(
        store.clone(),
        generator.clone(),
        ChatProcessorConfig::default(),
    );

    let broken = store
        .add_message(MessageDraft::user("will fail").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();

    let report = processor.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let message = store.get_message(broken.id).await.unwrap().unwrap();
    assert!(message.processed);
    assert!(!store.has_reply(broken.id).await.unwrap());

    // No retry.
    processor.tick().await.unwrap();
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn one_failure_does_not_stop_the_batch() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let generator = Arc::new(StubGenerator::replying("answer").failing_first(1));
    let processor = ChatProcessor::new(
        store.clone(),
        generator.clone(),
        ChatProcessorConfig::default(),
    );

    let first = store
        .add_message(MessageDraft::user("one").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();
    let second = store
        .add_message(MessageDraft::user("two").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();

    let report = processor.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.replied, 1);
    assert!(!store.has_reply(first.id).await.unwrap());
    assert!(store.has_reply(second.id).await.unwrap());
}

#[tokio::test]
async fn after_generate_policy_retries_then_gives_up() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let config = ChatProcessorConfig {
        mark_policy: MarkPolicy::AfterGenerate,
        max_attempts: 2,
        ..ChatProcessorConfig::default()
    };

    let flaky = Arc::new(StubGenerator::replying("second time lucky").failing_first(1));
    let processor = ChatProcessor::new(store.clone(), flaky.clone(), config.clone());
    let retried = store
        .add_message(MessageDraft::user("retry me").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();

    let report = processor.tick().await.unwrap();
    assert_eq!(report.deferred, 1);
    let pending = store.get_message(retried.id).await.unwrap().unwrap();
    assert!(!pending.processed);

    let report = processor.tick().await.unwrap();
    assert_eq!(report.replied, 1);
    assert!(store.get_message(retried.id).await.unwrap().unwrap().processed);
    assert!(store.has_reply(retried.id).await.unwrap());

    let broken = Arc::new(StubGenerator::replying("never").failing_first(usize::MAX));
    let processor = ChatProcessor::new(store.clone(), broken.clone(), config);
    let doomed = store
        .add_message(MessageDraft::user("doomed").in_conversation("c2"))
        .await
        .unwrap()
        .unwrap();
    processor.tick().await.unwrap();
    processor.tick().await.unwrap();
    processor.tick().await.unwrap();
    assert_eq!(broken.calls(), 2);
    assert!(store.get_message(doomed.id).await.unwrap().unwrap().processed);
    assert!(!store.has_reply(doomed.id).await.unwrap());
}

#[tokio::test]
async fn after_generate_policy_skips_messages_already_answered() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let generator = Arc::new(StubGenerator::replying("fresh"));
    let processor = ChatProcessor::new(
        store.clone(),
        generator.clone(),
        ChatProcessorConfig {
            mark_policy: MarkPolicy::AfterGenerate,
            ..ChatProcessorConfig::default()
        },
    );

    // A reply stored by a run that crashed before marking.
    let user = store
        .add_message(MessageDraft::user("asked before").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();
    store
        .add_message(
            MessageDraft::assistant("earlier answer")
                .in_conversation("c1")
                .replying_to(user.id),
        )
        .await
        .unwrap()
        .unwrap();

    processor.tick().await.unwrap();
    assert_eq!(generator.calls(), 0);
    let history = store.get_conversation_messages("c1").await.unwrap();
    assert_eq!(replies_to(&history, user.id), 1);
    assert!(store.get_message(user.id).await.unwrap().unwrap().processed);
}

#[tokio::test]
async fn long_replies_are_made_concise() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let generator = Arc::new(StubGenerator::replying("l1\n\nl2\nl3\nl4\nl5\nl6"));
    let processor = ChatProcessor::new(store.clone(), generator, ChatProcessorConfig::default());

    store
        .add_message(MessageDraft::user("talk a lot").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();
    processor.tick().await.unwrap();

    let context = store.get_context("c1", 5).await.unwrap();
    assert_eq!(context[1].content, "l1\nl2\nl3\nl4.");
}

#[tokio::test]
async fn blank_replies_are_not_stored() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let processor = ChatProcessor::new(
        store.clone(),
        Arc::new(StubGenerator::replying("   ")),
        ChatProcessorConfig::default(),
    );
    let user = store
        .add_message(MessageDraft::user("say nothing").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();

    let report = processor.tick().await.unwrap();
    assert_eq!(report.without_reply, 1);
    assert!(!store.has_reply(user.id).await.unwrap());
}

#[tokio::test]
async fn worker_polls_until_stopped_and_clears_claims() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir).await;
    let generator = Arc::new(StubGenerator::replying("pong"));
    let processor = Arc::new(ChatProcessor::new(
        store.clone(),
        generator.clone(),
        ChatProcessorConfig {
            poll_interval: Duration::from_millis(20),
            ..ChatProcessorConfig::default()
        },
    ));
    let mut worker = ChatWorker::new(processor.clone());
    worker.start();
    assert!(worker.is_running());

    let user = store
        .add_message(MessageDraft::user("ping").in_conversation("c1"))
        .await
        .unwrap()
        .unwrap();

    let mut answered = false;
    for _ in 0..100 {
        if store.has_reply(user.id).await.unwrap() {
            answered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(answered, "worker never replied");

    worker.stop().await;
    assert!(!worker.is_running());
    assert_eq!(processor.seen_count(), 0);
    assert_eq!(processor.in_flight_count(), 0);
}
