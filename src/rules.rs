//! Deterministic relevance decision used when the assistant itself errors,
//! plus the subject-based priority heuristic.
//!
//! The keyword lists are data: the built-in table can be replaced by a TOML
//! file (`rules_path` in the config) with the same field names.

use log::debug;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::domain::email::Priority;
use crate::error::{Error, Result};

const ALWAYS_RELEVANT: &[&str] = &[
    "meeting", "schedule", "appointment", "deadline", "urgent", "important", "project",
    "task", "deliverable", "client", "customer", "interview", "conference", "proposal",
    "contract", "invoice", "payment", "account", "password", "security", "verification",
    "confirm", "approval", "leave", "vacation", "sick", "request", "application", "feedback",
    "review", "update", "notification", "alert", "reminder", "follow up", "discussion",
    "question", "inquiry", "support", "help", "issue", "problem", "solution", "opportunity",
    "collaboration", "partnership",
];

const SPAM_PHRASES: &[&str] = &[
    "click here to unsubscribe",
    "you have won",
    "congratulations you have been selected",
    "limited time offer expires",
    "act now or lose out",
    "make money fast",
    "work from home opportunity",
    "get rich quick",
    "no obligation",
    "call now",
    "order now",
    "buy now",
    "subscribe now",
    "click to claim",
    "final notice",
    "this is not spam",
];

const PROMOTIONAL_PATTERNS: &[&str] = &[
    r"unsubscribe.*here",
    r"click.*to.*stop.*receiving",
    r"you.*received.*this.*email.*because",
    r"promotional.*email",
    r"marketing.*email",
];

const PERSONAL_INDICATORS: &[&str] = &["dear", "hi", "hello", "thank you", "regards", "sincerely"];

const URGENCY_KEYWORDS: &[&str] = &["urgent", "asap", "immediate", "critical", "emergency"];

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// The on-disk shape of the rule table. Missing fields take the built-in lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleTable {
    pub always_relevant: Vec<String>,
    pub spam_phrases: Vec<String>,
    pub spam_threshold: usize,
    pub promotional_patterns: Vec<String>,
    pub promotional_threshold: usize,
    pub personal_indicators: Vec<String>,
    pub urgency_keywords: Vec<String>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            always_relevant: owned(ALWAYS_RELEVANT),
            spam_phrases: owned(SPAM_PHRASES),
            spam_threshold: 2,
            promotional_patterns: owned(PROMOTIONAL_PATTERNS),
            promotional_threshold: 2,
            personal_indicators: owned(PERSONAL_INDICATORS),
            urgency_keywords: owned(URGENCY_KEYWORDS),
        }
    }
}

/// Why the rules reached their verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    KeywordMatch,
    SpamPhrases(usize),
    Promotional(usize),
    QuotedCorrespondence,
    Default,
}

impl Verdict {
    pub fn is_relevant(self) -> bool {
        !matches!(self, Verdict::SpamPhrases(_) | Verdict::Promotional(_))
    }
}

/// A compiled [`RuleTable`].
#[derive(Debug, Clone)]
pub struct RuleSet {
    table: RuleTable,
    promotional: Vec<Regex>,
    /// Any personal indicator as a whole word; `None` for an empty list.
    personal: Option<Regex>,
}

impl Default for RuleSet {
    fn default() -> Self {
        // built-in patterns are known to compile
        Self::from_table(RuleTable::default()).unwrap_or_else(|_| Self {
            table: RuleTable::default(),
            promotional: Vec::new(),
            personal: None,
        })
    }
}

impl RuleSet {
    pub fn from_table(mut table: RuleTable) -> Result<Self> {
        let promotional = table
            .promotional_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .build()
                    .map_err(|e| Error::Config(format!("bad promotional pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        for list in [
            &mut table.always_relevant,
            &mut table.spam_phrases,
            &mut table.personal_indicators,
            &mut table.urgency_keywords,
        ] {
            for w in list.iter_mut() {
                *w = w.to_lowercase();
            }
        }

        let personal = personal_matcher(&table.personal_indicators)?;

        Ok(Self {
            table,
            promotional,
            personal,
        })
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let table: RuleTable = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_table(table)
    }

    /// Built-in table unless a path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(p),
            None => Ok(Self::default()),
        }
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    /// First matching rule wins.
    pub fn evaluate(&self, body: &str, subject: &str) -> Verdict {
        let body_lc = body.to_lowercase();
        let subject_lc = subject.to_lowercase();
        let haystack = format!("{subject_lc} {body_lc}");

        if self
            .table
            .always_relevant
            .iter()
            .any(|k| haystack.contains(k.as_str()))
        {
            return Verdict::KeywordMatch;
        }

        let spam = self
            .table
            .spam_phrases
            .iter()
            .filter(|p| haystack.contains(p.as_str()))
            .count();
        if spam >= self.table.spam_threshold {
            return Verdict::SpamPhrases(spam);
        }

        let promo = self
            .promotional
            .iter()
            .filter(|re| re.is_match(&haystack))
            .count();
        let personal = self.personal.as_ref().is_some_and(|re| re.is_match(&body_lc));
        if promo >= self.table.promotional_threshold && !personal {
            return Verdict::Promotional(promo);
        }

        if body.contains('@') {
            return Verdict::QuotedCorrespondence;
        }
        Verdict::Default
    }

    pub fn is_relevant(&self, body: &str, subject: &str) -> bool {
        let verdict = self.evaluate(body, subject);
        debug!("rules verdict {verdict:?}");
        verdict.is_relevant()
    }

    /// High on an urgency keyword in the subject, else the provider's hint.
    pub fn priority(&self, subject: &str, importance: Option<&str>) -> Priority {
        let subject_lc = subject.to_lowercase();
        if self
            .table
            .urgency_keywords
            .iter()
            .any(|k| subject_lc.contains(k.as_str()))
        {
            return Priority::High;
        }
        importance.map(Priority::parse).unwrap_or_default()
    }
}

fn personal_matcher(words: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = words
        .iter()
        .filter(|w| !w.is_empty())
        .map(|w| regex::escape(w))
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    RegexBuilder::new(&format!(r"\b(?:{})\b", alternatives.join("|")))
        .case_insensitive(true)
        .build()
        .map(Some)
        .map_err(|e| Error::Config(format!("bad personal indicators: {e}")))
}
