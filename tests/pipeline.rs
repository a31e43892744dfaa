use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mail_triage::auth::token_manager::{CredentialSource, StaticCredential};
use mail_triage::domain::email::{
    ContextMessage, EmailRecord, EmailStats, MessageBody, Priority, RawMessage,
};
use mail_triage::error::{Error, Result};
use mail_triage::llm::adapter::{Assistant, GENERIC_REPLY};
use mail_triage::mail::provider::MailboxProvider;
use mail_triage::pipeline::{DiscardReason, Outcome, Pipeline};
use mail_triage::store::repo::EmailRepository;
use mail_triage::store::sqlite::SqliteRepo;

fn message(id: &str, sender: &str, subject: &str, body: &str) -> RawMessage {
    RawMessage {
        id: id.into(),
        sender: sender.into(),
        sender_name: "Sender".into(),
        subject: subject.into(),
        body: MessageBody::plain(body),
        received_at: "2024-05-01T09:00:00Z".into(),
        conversation_id: format!("conv-{id}"),
        is_read: false,
        has_attachments: false,
        importance: Some("normal".into()),
    }
}

fn context(sender: &str, body: &str) -> ContextMessage {
    ContextMessage {
        sender: sender.into(),
        subject: "thread".into(),
        body: body.into(),
        timestamp: "2024-05-01T08:00:00Z".into(),
    }
}

#[derive(Default)]
struct FakeProvider {
    messages: Vec<RawMessage>,
    /// None makes owner resolution fail.
    owner: Option<String>,
    replied: Vec<String>,
    /// Most recent first, like the real provider.
    thread: Vec<ContextMessage>,
    provider_down: bool,
    full_body: Option<String>,
    sent: Mutex<Vec<(String, String)>>,
    windows: Mutex<Vec<Option<DateTime<Utc>>>>,
    owner_lookups: AtomicUsize,
}

impl FakeProvider {
    fn down(&self) -> Result<()> {
        if self.provider_down {
            Err(Error::ProviderUnavailable("timeout".into()))
        } else {
            Ok(())
        }
    }
}

impl MailboxProvider for FakeProvider {
    fn list_recent_messages(
        &self,
        _credential: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        self.windows.lock().unwrap().push(since);
        self.down()?;
        Ok(self.messages.iter().take(limit).cloned().collect())
    }

    fn get_message_by_id(&self, _credential: &str, id: &str) -> Result<Option<RawMessage>> {
        self.down()?;
        Ok(self.full_body.as_ref().map(|b| message(id, "a@b.com", "s", b)))
    }

    fn conversation_context(&self, _credential: &str, _id: &str) -> Result<Vec<ContextMessage>> {
        self.down()?;
        Ok(self.thread.clone())
    }

    fn has_owner_replied(&self, _credential: &str, id: &str) -> Result<bool> {
        self.down()?;
        Ok(self.replied.iter().any(|r| r == id))
    }

    fn send_reply(&self, _credential: &str, original_id: &str, text: &str) -> Result<bool> {
        self.down()?;
        self.sent
            .lock()
            .unwrap()
            .push((original_id.to_string(), text.to_string()));
        Ok(true)
    }

    fn resolve_owner_address(&self, _credential: &str) -> Result<String> {
        self.owner_lookups.fetch_add(1, Ordering::SeqCst);
        self.owner
            .clone()
            .ok_or_else(|| Error::ProviderUnavailable("me endpoint failed".into()))
    }
}

/// `None` fields make the matching operation return an error.
struct FakeAssistant {
    relevant: Option<bool>,
    summary: Option<String>,
    reply: Option<String>,
    classify_calls: AtomicUsize,
    reply_contexts: Mutex<Vec<Vec<ContextMessage>>>,
}

impl FakeAssistant {
    fn working() -> Self {
        Self {
            relevant: Some(true),
            summary: Some("• Needs an answer".into()),
            reply: Some("Hi,\n\nSure.\n\nBest regards".into()),
            classify_calls: AtomicUsize::new(0),
            reply_contexts: Mutex::new(Vec::new()),
        }
    }

    fn broken() -> Self {
        Self {
            relevant: None,
            summary: None,
            reply: None,
            ..Self::working()
        }
    }
}

fn unavailable<T>() -> Result<T> {
    Err(Error::ModelUnavailable("connection refused".into()))
}

impl Assistant for FakeAssistant {
    fn classify_relevance(&self, _body: &str, _subject: &str) -> Result<bool> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        self.relevant.map_or_else(unavailable, Ok)
    }

    fn summarize(&self, _body: &str, _subject: &str) -> Result<String> {
        self.summary.clone().map_or_else(unavailable, Ok)
    }

    fn generate_reply(
        &self,
        _body: &str,
        _subject: &str,
        context: &[ContextMessage],
    ) -> Result<String> {
        self.reply_contexts.lock().unwrap().push(context.to_vec());
        self.reply.clone().map_or_else(unavailable, Ok)
    }

    fn enhance_reply(&self, original: &str, extra_context: &str) -> Result<String> {
        if self.reply.is_none() {
            return unavailable();
        }
        Ok(format!("{original} ({extra_context})"))
    }

    fn check_health(&self) -> bool {
        self.reply.is_some()
    }
}

struct NoCredential;

impl CredentialSource for NoCredential {
    fn valid_credential(&self) -> Result<String> {
        Err(Error::Unauthenticated)
    }
}

/// Delegates reads, refuses every write.
struct ReadOnlyStore(SqliteRepo);

impl EmailRepository for ReadOnlyStore {
    fn upsert(&self, _record: &EmailRecord) -> Result<()> {
        Err(Error::StoreCorrupt("disk full".into()))
    }
    fn get_by_id(&self, id: &str) -> Result<Option<EmailRecord>> {
        self.0.get_by_id(id)
    }
    fn list_recent(&self, limit: usize) -> Result<Vec<EmailRecord>> {
        self.0.list_recent(limit)
    }
    fn list_by_priority(&self, priority: Priority) -> Result<Vec<EmailRecord>> {
        self.0.list_by_priority(priority)
    }
    fn list_unreplied(&self) -> Result<Vec<EmailRecord>> {
        self.0.list_unreplied()
    }
    fn mark_replied(&self, id: &str) -> Result<bool> {
        self.0.mark_replied(id)
    }
    fn update_draft(&self, id: &str, draft: &str) -> Result<bool> {
        self.0.update_draft(id, draft)
    }
    fn stats(&self) -> Result<EmailStats> {
        self.0.stats()
    }
    fn search(&self, query: &str, limit: usize) -> Result<Vec<EmailRecord>> {
        self.0.search(query, limit)
    }
    fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.0.last_sync_time()
    }
    fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.0.set_last_sync_time(at)
    }
    fn prune_older_than(&self, days: u32) -> Result<usize> {
        self.0.prune_older_than(days)
    }
}

struct Harness {
    provider: Arc<FakeProvider>,
    assistant: Arc<FakeAssistant>,
    store: Arc<SqliteRepo>,
    pipeline: Pipeline,
}

fn harness(provider: FakeProvider, assistant: FakeAssistant) -> Harness {
    let provider = Arc::new(provider);
    let assistant = Arc::new(assistant);
    let store = Arc::new(SqliteRepo::open_in_memory().unwrap());
    let pipeline = Pipeline::new(
        provider.clone(),
        assistant.clone(),
        store.clone(),
        Arc::new(StaticCredential("token".into())),
    );
    Harness {
        provider,
        assistant,
        store,
        pipeline,
    }
}

fn owned_by_me() -> FakeProvider {
    FakeProvider {
        owner: Some("me@corp.com".into()),
        ..FakeProvider::default()
    }
}

fn persisted(outcome: Outcome) -> EmailRecord {
    match outcome {
        Outcome::Persisted(r) => r,
        other => panic!("expected Persisted, got {other:?}"),
    }
}

#[test]
fn reingesting_same_id_is_idempotent() {
    let h = harness(owned_by_me(), FakeAssistant::working());
    let msg = message("m1", "alice@corp.com", "Plan", "Can we meet?");

    let first = persisted(h.pipeline.process_message(&msg).unwrap());
    let second = h.pipeline.process_message(&msg).unwrap();

    assert_eq!(second, Outcome::Existing(first.clone()));
    assert_eq!(h.store.list_recent(10).unwrap(), vec![first]);
    assert_eq!(h.assistant.classify_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn own_messages_are_never_persisted() {
    let h = harness(owned_by_me(), FakeAssistant::working());
    let msg = message("m1", "Me@Corp.com", "RE: Plan", "Sure thing");

    let outcome = h.pipeline.process_message(&msg).unwrap();

    assert_eq!(outcome, Outcome::Discarded(DiscardReason::SelfSent));
    assert!(h.store.get_by_id("m1").unwrap().is_none());
}

#[test]
fn owner_lookup_is_cached() {
    let h = harness(owned_by_me(), FakeAssistant::working());
    for id in ["a", "b", "c"] {
        h.pipeline
            .process_message(&message(id, "x@corp.com", "s", "b"))
            .unwrap();
    }
    assert_eq!(h.provider.owner_lookups.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_owner_is_not_fatal() {
    let h = harness(FakeProvider::default(), FakeAssistant::working());
    let outcome = h
        .pipeline
        .process_message(&message("m1", "alice@corp.com", "Plan", "Hi"))
        .unwrap();
    assert!(matches!(outcome, Outcome::Persisted(_)));
}

#[test]
fn assistant_rejection_discards() {
    let assistant = FakeAssistant {
        relevant: Some(false),
        ..FakeAssistant::working()
    };
    let h = harness(owned_by_me(), assistant);
    let outcome = h
        .pipeline
        .process_message(&message("m1", "promo@shop.com", "Sale", "50% off"))
        .unwrap();
    assert_eq!(outcome, Outcome::Discarded(DiscardReason::NotRelevant));
    assert_eq!(h.store.stats().unwrap().total, 0);
}

#[test]
fn rules_decide_when_assistant_errors() {
    let h = harness(owned_by_me(), FakeAssistant::broken());

    let spam = message(
        "spam",
        "promo@shop.com",
        "Winner",
        "You have won! Click to claim your reward. Buy now.",
    );
    assert_eq!(
        h.pipeline.process_message(&spam).unwrap(),
        Outcome::Discarded(DiscardReason::NotRelevant)
    );

    let interview = message(
        "job",
        "hr@corp.com",
        "Next steps",
        "You have won an interview slot! Click to claim it. Buy now.",
    );
    assert!(matches!(
        h.pipeline.process_message(&interview).unwrap(),
        Outcome::Persisted(_)
    ));
}

#[test]
fn broken_assistant_uses_fallback_texts() {
    let h = harness(owned_by_me(), FakeAssistant::broken());
    let record = persisted(
        h.pipeline
            .process_message(&message("m1", "bob@corp.com", "Lunch", "Are you free?"))
            .unwrap(),
    );
    assert_eq!(record.summary, "• Email from bob@corp.com\n• Subject: Lunch");
    assert_eq!(record.draft_reply, GENERIC_REPLY);
}

#[test]
fn long_body_is_truncated() {
    let h = harness(owned_by_me(), FakeAssistant::working());
    let body = "a".repeat(600);
    let record = persisted(
        h.pipeline
            .process_message(&message("m1", "bob@corp.com", "Long", &body))
            .unwrap(),
    );
    assert_eq!(record.body.chars().count(), 503);
    assert_eq!(record.body, format!("{}...", "a".repeat(500)));
}

#[test]
fn replied_thread_gets_no_draft() {
    let provider = FakeProvider {
        replied: vec!["m1".into()],
        ..owned_by_me()
    };
    let h = harness(provider, FakeAssistant::working());
    let record = persisted(
        h.pipeline
            .process_message(&message("m1", "bob@corp.com", "Done", "All set"))
            .unwrap(),
    );
    assert!(record.has_reply);
    assert_eq!(record.draft_reply, "");
    assert!(h.assistant.reply_contexts.lock().unwrap().is_empty());
}

#[test]
fn provider_failures_fall_back() {
    let provider = FakeProvider {
        provider_down: true,
        ..owned_by_me()
    };
    let h = harness(provider, FakeAssistant::working());
    let record = persisted(
        h.pipeline
            .process_message(&message("m1", "bob@corp.com", "Q", "Question?"))
            .unwrap(),
    );
    assert!(!record.has_reply);
    assert!(!record.draft_reply.is_empty());

    // empty thread still hands the message itself to the assistant
    let contexts = h.assistant.reply_contexts.lock().unwrap();
    assert_eq!(contexts[0].len(), 1);
    assert_eq!(contexts[0][0].sender, "bob@corp.com");
}

#[test]
fn thread_context_is_oldest_first() {
    let provider = FakeProvider {
        thread: vec![
            context("carol@corp.com", "third"),
            context("bob@corp.com", "second"),
            context("alice@corp.com", "first"),
        ],
        ..owned_by_me()
    };
    let h = harness(provider, FakeAssistant::working());
    h.pipeline
        .process_message(&message("m1", "carol@corp.com", "Thread", "third"))
        .unwrap();

    let contexts = h.assistant.reply_contexts.lock().unwrap();
    let bodies: Vec<_> = contexts[0].iter().map(|c| c.body.as_str()).collect();
    assert_eq!(bodies, ["first", "second", "third"]);
}

#[test]
fn urgent_subject_is_high_priority() {
    let h = harness(owned_by_me(), FakeAssistant::working());
    let record = persisted(
        h.pipeline
            .process_message(&message("m1", "ops@corp.com", "URGENT: outage", "Help"))
            .unwrap(),
    );
    assert_eq!(record.priority, Priority::High);
}

#[test]
fn sync_counts_outcomes_and_advances_marker() {
    let provider = FakeProvider {
        messages: vec![
            message("a", "alice@corp.com", "Plan", "Meet?"),
            message("b", "me@corp.com", "RE: Plan", "Yes"),
            message("c", "bob@corp.com", "Lunch", "Pizza?"),
        ],
        ..owned_by_me()
    };
    let h = harness(provider, FakeAssistant::working());

    let before = Utc::now();
    let report = h.pipeline.sync_recent().unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.persisted, 2);
    assert_eq!(report.discarded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.processed(), 3);
    assert!(h.store.last_sync_time().unwrap().unwrap() >= before - Duration::seconds(1));

    let again = h.pipeline.sync_recent().unwrap();
    assert_eq!(again.existing, 2);
    assert_eq!(again.persisted, 0);
}

#[test]
fn total_fetch_failure_is_an_error() {
    let provider = FakeProvider {
        provider_down: true,
        ..owned_by_me()
    };
    let h = harness(provider, FakeAssistant::working());
    assert!(matches!(
        h.pipeline.sync_recent(),
        Err(Error::ProviderUnavailable(_))
    ));
    assert_eq!(h.store.last_sync_time().unwrap(), None);
}

#[test]
fn missing_credential_requires_login() {
    let pipeline = Pipeline::new(
        Arc::new(owned_by_me()),
        Arc::new(FakeAssistant::working()),
        Arc::new(SqliteRepo::open_in_memory().unwrap()),
        Arc::new(NoCredential),
    );
    let err = pipeline.sync_recent().unwrap_err();
    assert!(err.needs_reauth());
}

#[test]
fn marker_stays_when_every_message_fails() {
    let provider = Arc::new(FakeProvider {
        messages: vec![message("a", "alice@corp.com", "Plan", "Meet?")],
        ..owned_by_me()
    });
    let store = Arc::new(ReadOnlyStore(SqliteRepo::open_in_memory().unwrap()));
    let pipeline = Pipeline::new(
        provider,
        Arc::new(FakeAssistant::working()),
        store.clone(),
        Arc::new(StaticCredential("token".into())),
    );

    let report = pipeline.sync_recent().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(store.last_sync_time().unwrap(), None);
}

#[test]
fn background_poll_starts_from_marker() {
    let h = harness(owned_by_me(), FakeAssistant::working());

    let before = Utc::now();
    h.pipeline.sync_since_last_sync().unwrap();
    let marker = h.store.last_sync_time().unwrap().unwrap();
    h.pipeline.sync_since_last_sync().unwrap();

    let windows = h.provider.windows.lock().unwrap();
    let first = windows[0].unwrap();
    assert!(first <= before - Duration::minutes(9));
    assert!(first >= before - Duration::minutes(11));
    assert_eq!(windows[1], Some(marker));
}

#[test]
fn send_reply_marks_record() {
    let h = harness(owned_by_me(), FakeAssistant::working());
    h.pipeline
        .process_message(&message("m1", "bob@corp.com", "Q", "Question?"))
        .unwrap();

    assert!(matches!(
        h.pipeline.send_reply("m1", "   "),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        h.pipeline.send_reply("nope", "hello"),
        Err(Error::NotFound(_))
    ));

    assert!(h.pipeline.send_reply("m1", "Yes, Friday works.").unwrap());
    assert!(h.store.get_by_id("m1").unwrap().unwrap().has_reply);
    assert_eq!(
        h.provider.sent.lock().unwrap().as_slice(),
        [("m1".to_string(), "Yes, Friday works.".to_string())]
    );
}

#[test]
fn regenerate_and_enhance_update_draft() {
    let h = harness(owned_by_me(), FakeAssistant::working());
    h.pipeline
        .process_message(&message("m1", "bob@corp.com", "Q", "Question?"))
        .unwrap();
    h.store.update_draft("m1", "old").unwrap();

    let regenerated = h.pipeline.regenerate_draft("m1").unwrap();
    assert_eq!(regenerated, "Hi,\n\nSure.\n\nBest regards");

    let enhanced = h.pipeline.enhance_draft("m1", "mention Friday").unwrap();
    assert!(enhanced.ends_with("(mention Friday)"));
    assert_eq!(h.store.get_by_id("m1").unwrap().unwrap().draft_reply, enhanced);
}

#[test]
fn enhance_without_draft_is_rejected() {
    let provider = FakeProvider {
        replied: vec!["m1".into()],
        ..owned_by_me()
    };
    let h = harness(provider, FakeAssistant::working());
    h.pipeline
        .process_message(&message("m1", "bob@corp.com", "Q", "Question?"))
        .unwrap();
    assert!(matches!(
        h.pipeline.enhance_draft("m1", "x"),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn detail_includes_full_body_when_available() {
    let long = "b".repeat(900);
    let provider = FakeProvider {
        full_body: Some(long.clone()),
        ..owned_by_me()
    };
    let h = harness(provider, FakeAssistant::working());
    h.pipeline
        .process_message(&message("m1", "bob@corp.com", "Q", &long))
        .unwrap();

    let detail = h.pipeline.message_detail("m1").unwrap();
    assert_eq!(detail.full_body.as_deref(), Some(long.as_str()));
    assert_eq!(detail.record.body.chars().count(), 503);
}
