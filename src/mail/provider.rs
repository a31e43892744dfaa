use chrono::{DateTime, Utc};

use crate::domain::email::{ContextMessage, RawMessage};
use crate::error::Result;

/// Most entries `conversation_context` returns.
pub const CONTEXT_LIMIT: usize = 5;

/// The remote mailbox. Every call takes the access credential explicitly.
pub trait MailboxProvider: Send + Sync {
    /// Newest first, at most `limit`, received at or after `since` when given.
    fn list_recent_messages(
        &self,
        credential: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawMessage>>;

    fn get_message_by_id(&self, credential: &str, id: &str) -> Result<Option<RawMessage>>;

    /// Recent history of the message's thread, most recent first, capped at 5.
    fn conversation_context(&self, credential: &str, id: &str) -> Result<Vec<ContextMessage>>;

    /// Whether the mailbox owner sent anything in this thread after the message.
    fn has_owner_replied(&self, credential: &str, id: &str) -> Result<bool>;

    /// Native reply first; a fresh "RE:" message to the sender if that is rejected.
    fn send_reply(&self, credential: &str, original_id: &str, text: &str) -> Result<bool>;

    fn resolve_owner_address(&self, credential: &str) -> Result<String>;
}

/// "RE: subject", without stacking prefixes.
pub fn reply_subject(subject: &str) -> String {
    let prefixed = subject
        .trim_start()
        .get(..3)
        .is_some_and(|p| p.eq_ignore_ascii_case("re:"));
    if prefixed {
        subject.to_string()
    } else {
        format!("RE: {subject}")
    }
}
