//! Per-message processing and batch sync.
//!
//! Each step of [`Pipeline::process_message`] has a fallback, so a slow or
//! broken collaborator degrades one field of the record instead of losing
//! the message. Only store failures abort a message.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};

use crate::auth::token_manager::CredentialSource;
use crate::config::SyncConfig;
use crate::domain::email::{ContextMessage, EmailRecord, RawMessage};
use crate::error::{Error, Result};
use crate::llm::adapter::{Assistant, GENERIC_REPLY};
use crate::mail::decoders::truncate_body;
use crate::mail::provider::MailboxProvider;
use crate::rules::RuleSet;
use crate::store::repo::EmailRepository;

/// How far back a background poll looks when no sync has run yet.
const FIRST_POLL_WINDOW_MINS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Sent by the mailbox owner.
    SelfSent,
    NotRelevant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Already stored; nothing was recomputed.
    Existing(EmailRecord),
    Persisted(EmailRecord),
    Discarded(DiscardReason),
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub fetched: usize,
    pub persisted: usize,
    pub existing: usize,
    pub discarded: usize,
    pub failed: usize,
    /// Newly persisted records, in fetch order.
    pub records: Vec<EmailRecord>,
}

impl SyncReport {
    pub fn processed(&self) -> usize {
        self.persisted + self.existing + self.discarded
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Existing(_) => self.existing += 1,
            Outcome::Persisted(r) => {
                self.persisted += 1;
                self.records.push(r);
            }
            Outcome::Discarded(_) => self.discarded += 1,
        }
    }
}

/// A stored record plus the full message body, when the provider has it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDetail {
    pub record: EmailRecord,
    pub full_body: Option<String>,
}

pub struct Pipeline {
    provider: Arc<dyn MailboxProvider>,
    assistant: Arc<dyn Assistant>,
    store: Arc<dyn EmailRepository>,
    credentials: Arc<dyn CredentialSource>,
    rules: RuleSet,
    sync: SyncConfig,
    owner: Mutex<Option<String>>,
}

impl Pipeline {
    pub fn new(
        provider: Arc<dyn MailboxProvider>,
        assistant: Arc<dyn Assistant>,
        store: Arc<dyn EmailRepository>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            provider,
            assistant,
            store,
            credentials,
            rules: RuleSet::default(),
            sync: SyncConfig::default(),
            owner: Mutex::new(None),
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_sync_config(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn store(&self) -> &Arc<dyn EmailRepository> {
        &self.store
    }

    pub fn assistant(&self) -> &Arc<dyn Assistant> {
        &self.assistant
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync
    }

    /// Every provider call gets a freshly validated credential.
    fn with_credential<T>(&self, f: impl FnOnce(&str) -> Result<T>) -> Result<T> {
        let credential = self.credentials.valid_credential()?;
        f(&credential)
    }

    /// Lowercased owner address. Cached once resolved; failures are not cached.
    fn owner_address(&self) -> Option<String> {
        if let Ok(cached) = self.owner.lock() {
            if cached.is_some() {
                return cached.clone();
            }
        }

        match self.with_credential(|c| self.provider.resolve_owner_address(c)) {
            Ok(addr) => {
                let addr = addr.trim().to_lowercase();
                if let Ok(mut cached) = self.owner.lock() {
                    *cached = Some(addr.clone());
                }
                Some(addr)
            }
            Err(e) => {
                warn!("could not resolve mailbox owner, assuming not self-sent: {e}");
                None
            }
        }
    }

    fn is_relevant(&self, body: &str, subject: &str) -> bool {
        match self.assistant.classify_relevance(body, subject) {
            Ok(relevant) => relevant,
            Err(e) => {
                warn!("assistant classification failed, using rules: {e}");
                self.rules.is_relevant(body, subject)
            }
        }
    }

    fn summarize(&self, msg: &RawMessage, body: &str) -> String {
        match self.assistant.summarize(body, &msg.subject) {
            Ok(s) if !s.trim().is_empty() => s,
            Ok(_) => fallback_summary(msg),
            Err(e) => {
                warn!("summary failed for {}: {e}", msg.id);
                fallback_summary(msg)
            }
        }
    }

    fn owner_replied(&self, id: &str) -> bool {
        self.with_credential(|c| self.provider.has_owner_replied(c, id))
            .unwrap_or_else(|e| {
                warn!("reply check failed for {id}, assuming unreplied: {e}");
                false
            })
    }

    /// Thread history oldest first, ending with the message itself.
    fn reply_context(&self, id: &str, own: ContextMessage) -> Vec<ContextMessage> {
        let mut context = self
            .with_credential(|c| self.provider.conversation_context(c, id))
            .unwrap_or_else(|e| {
                warn!("conversation context unavailable for {id}: {e}");
                Vec::new()
            });
        context.reverse();
        if context.is_empty() {
            context.push(own);
        }
        context
    }

    fn draft(&self, id: &str, body: &str, subject: &str, own: ContextMessage) -> String {
        let context = self.reply_context(id, own);
        match self.assistant.generate_reply(body, subject, &context) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => GENERIC_REPLY.to_string(),
            Err(e) => {
                warn!("draft generation failed for {id}: {e}");
                GENERIC_REPLY.to_string()
            }
        }
    }

    /// Runs one message through dedup, self-filter, relevance, summary,
    /// reply detection and drafting, then persists it.
    pub fn process_message(&self, msg: &RawMessage) -> Result<Outcome> {
        if let Some(existing) = self.store.get_by_id(&msg.id)? {
            debug!("{} already processed", msg.id);
            return Ok(Outcome::Existing(existing));
        }

        if let Some(owner) = self.owner_address() {
            if msg.sender.trim().eq_ignore_ascii_case(&owner) {
                debug!("{} was sent by the mailbox owner; skipping", msg.id);
                return Ok(Outcome::Discarded(DiscardReason::SelfSent));
            }
        }

        let body = msg.text();
        if !self.is_relevant(&body, &msg.subject) {
            debug!("{} judged not relevant", msg.id);
            return Ok(Outcome::Discarded(DiscardReason::NotRelevant));
        }

        let summary = self.summarize(msg, &body);
        let has_reply = self.owner_replied(&msg.id);
        let draft_reply = if has_reply {
            String::new()
        } else {
            let own = ContextMessage {
                sender: msg.sender.clone(),
                subject: msg.subject.clone(),
                body: body.clone(),
                timestamp: msg.received_at.clone(),
            };
            self.draft(&msg.id, &body, &msg.subject, own)
        };

        let record = EmailRecord {
            id: msg.id.clone(),
            sender: msg.sender.clone(),
            sender_name: msg.sender_name.clone(),
            subject: msg.subject.clone(),
            body: truncate_body(&body),
            timestamp: msg.received_at.clone(),
            summary,
            has_reply,
            draft_reply,
            is_relevant: true,
            conversation_id: msg.conversation_id.clone(),
            priority: self.rules.priority(&msg.subject, msg.importance.as_deref()),
            processed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        self.store.upsert(&record)?;
        debug!("persisted {} ({})", record.id, record.priority);
        Ok(Outcome::Persisted(record))
    }

    /// User-triggered sync over the configured lookback window.
    pub fn sync_recent(&self) -> Result<SyncReport> {
        let since = Utc::now() - Duration::days(self.sync.lookback_days);
        self.sync_window(Some(since), self.sync.limit)
    }

    /// Background poll: everything since the last completed sync.
    pub fn sync_since_last_sync(&self) -> Result<SyncReport> {
        let since = match self.store.last_sync_time()? {
            Some(t) => t,
            None => Utc::now() - Duration::minutes(FIRST_POLL_WINDOW_MINS),
        };
        self.sync_window(Some(since), self.sync.background_limit)
    }

    /// Fetches, processes each message in isolation, then advances the
    /// sync marker unless every fetched message failed.
    pub fn sync_window(&self, since: Option<DateTime<Utc>>, limit: usize) -> Result<SyncReport> {
        let started = Utc::now();
        let messages =
            self.with_credential(|c| self.provider.list_recent_messages(c, since, limit))?;

        let mut report = SyncReport {
            fetched: messages.len(),
            ..SyncReport::default()
        };
        for msg in &messages {
            match self.process_message(msg) {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!("processing {} failed: {e}", msg.id);
                    report.failed += 1;
                }
            }
        }

        if report.fetched == 0 || report.failed < report.fetched {
            self.store.set_last_sync_time(started)?;
        } else {
            warn!("all {} fetched messages failed; sync marker not advanced", report.fetched);
        }

        info!(
            "sync: processed {} of {} fetched ({} new, {} existing, {} discarded, {} failed)",
            report.processed(),
            report.fetched,
            report.persisted,
            report.existing,
            report.discarded,
            report.failed
        );
        Ok(report)
    }

    fn stored(&self, id: &str) -> Result<EmailRecord> {
        self.store
            .get_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("email {id}")))
    }

    /// Sends `text` as a reply to a stored email and marks it replied on success.
    pub fn send_reply(&self, id: &str, text: &str) -> Result<bool> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("reply text is empty".into()));
        }
        let record = self.stored(id)?;
        let sent = self.with_credential(|c| self.provider.send_reply(c, &record.id, text))?;
        if sent {
            self.store.mark_replied(&record.id)?;
            info!("reply sent for {}", record.id);
        } else {
            warn!("provider did not accept reply for {}", record.id);
        }
        Ok(sent)
    }

    /// Drafts a new reply for a stored email and saves it.
    pub fn regenerate_draft(&self, id: &str) -> Result<String> {
        let record = self.stored(id)?;
        let own = ContextMessage {
            sender: record.sender.clone(),
            subject: record.subject.clone(),
            body: record.body.clone(),
            timestamp: record.timestamp.clone(),
        };
        let draft = self.draft(&record.id, &record.body, &record.subject, own);
        self.store.update_draft(&record.id, &draft)?;
        Ok(draft)
    }

    /// Rewrites the stored draft with extra guidance and saves the result.
    pub fn enhance_draft(&self, id: &str, extra_context: &str) -> Result<String> {
        let record = self.stored(id)?;
        if record.draft_reply.trim().is_empty() {
            return Err(Error::InvalidInput(format!("email {id} has no draft")));
        }
        let enhanced = self
            .assistant
            .enhance_reply(&record.draft_reply, extra_context)
            .unwrap_or_else(|e| {
                warn!("enhance failed for {id}, keeping draft: {e}");
                record.draft_reply.clone()
            });
        self.store.update_draft(&record.id, &enhanced)?;
        Ok(enhanced)
    }

    /// Stored record plus the untruncated body fetched from the provider.
    pub fn message_detail(&self, id: &str) -> Result<MessageDetail> {
        let record = self.stored(id)?;
        let full_body = match self.with_credential(|c| self.provider.get_message_by_id(c, id)) {
            Ok(msg) => msg.map(|m| m.text()),
            Err(e) => {
                warn!("full body unavailable for {id}: {e}");
                None
            }
        };
        Ok(MessageDetail { record, full_body })
    }
}

fn fallback_summary(msg: &RawMessage) -> String {
    format!("• Email from {}\n• Subject: {}", msg.sender, msg.subject)
}
