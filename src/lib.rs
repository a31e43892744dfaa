//! Mailbox triage: fetch recent mail, drop noise, summarize what matters and
//! keep a reply draft ready for everything still unanswered.

pub mod auth;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod rules;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
