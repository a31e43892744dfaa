use chrono::{DateTime, Utc};

use crate::domain::email::{EmailRecord, EmailStats, Priority};
use crate::error::Result;

/// Persistence for processed emails. Every call is atomic and short-lived.
///
/// Reads only ever return relevant records.
pub trait EmailRepository: Send + Sync {
    /// Full-row replace keyed by id.
    fn upsert(&self, record: &EmailRecord) -> Result<()>;

    fn get_by_id(&self, id: &str) -> Result<Option<EmailRecord>>;

    /// Newest first.
    fn list_recent(&self, limit: usize) -> Result<Vec<EmailRecord>>;
    fn list_by_priority(&self, priority: Priority) -> Result<Vec<EmailRecord>>;
    fn list_unreplied(&self) -> Result<Vec<EmailRecord>>;

    /// False when no record has this id.
    fn mark_replied(&self, id: &str) -> Result<bool>;
    fn update_draft(&self, id: &str, draft: &str) -> Result<bool>;

    fn stats(&self) -> Result<EmailStats>;

    /// Case-insensitive substring match on subject, sender and body.
    fn search(&self, query: &str, limit: usize) -> Result<Vec<EmailRecord>>;

    fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>>;
    fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<()>;

    /// Deletes records received more than `days` ago; returns how many.
    fn prune_older_than(&self, days: u32) -> Result<usize>;
}
