//! Prompt templates and response cleanup around a [`LanguageModel`].
//!
//! The adapter treats the model as an unreliable oracle: every backend
//! failure degrades to a fixed, conservative answer instead of an error.

use log::{debug, warn};

use crate::domain::email::ContextMessage;
use crate::error::Result;
use crate::llm::{LanguageModel, SamplingOptions};
use crate::mail::decoders::prefix_chars;

pub const GENERIC_REPLY: &str =
    "Thank you for your email. I'll review this and get back to you soon.\n\nBest regards";

const CLASSIFY_SYSTEM: &str = "You decide whether an email deserves the recipient's attention. \
Be very conservative about rejecting anything.\n\
Answer NOT_RELEVANT only for clear junk: obvious spam or scams, lottery or prize notices, \
mass marketing with unsubscribe links, automated retail promotions, phishing, purely \
promotional newsletters.\n\
Answer RELEVANT for personal messages however short, work matters (interviews, leave \
requests, project updates), account and security notices, meeting invitations, client \
or customer communication, service notices from legitimate companies, and anything \
that may need a response.\n\
If unsure, answer RELEVANT.\n\
Reply with exactly one word: RELEVANT or NOT_RELEVANT.";

const SUMMARY_SYSTEM: &str = "You summarize emails as short bullet points.\n\
- one to three bullets\n\
- key facts and action items, deadlines and requests first\n\
- say whether a response is needed\n\
- one short plain sentence per bullet";

const REPLY_SYSTEM: &str = "You draft replies on behalf of the person who received the email.\n\
- write as the recipient answering the sender, never as the sender\n\
- one or two sentences, natural and professional\n\
- answer questions directly; acknowledge updates and thank the sender\n\
- open with a greeting that uses the sender's name and end with a professional closing";

const ENHANCE_SYSTEM: &str =
    "Improve this email reply: make it more natural and professional while keeping its meaning.";

const CLASSIFY_BODY_CHARS: usize = 500;
const REPLY_BODY_CHARS: usize = 800;
const RECAP_BODY_CHARS: usize = 100;
const GREETING_WINDOW: usize = 50;
const CLOSING_WINDOW: usize = 100;

const GREETING_WORDS: [&str; 6] = ["hi", "hello", "hey", "dear", "greetings", "thanks"];
const CLOSING_WORDS: [&str; 6] = ["regards", "best", "thanks", "thank you", "sincerely", "cheers"];

/// What the pipeline needs from the language model, already parsed.
pub trait Assistant: Send + Sync {
    fn classify_relevance(&self, body: &str, subject: &str) -> Result<bool>;

    fn summarize(&self, body: &str, subject: &str) -> Result<String>;

    /// `context` is ordered oldest first; its last entry is the message itself.
    fn generate_reply(&self, body: &str, subject: &str, context: &[ContextMessage])
    -> Result<String>;

    fn enhance_reply(&self, original: &str, extra_context: &str) -> Result<String>;

    fn check_health(&self) -> bool;
}

pub struct Adapter<M> {
    model: M,
    options: SamplingOptions,
    owner_name: Option<String>,
}

impl<M: LanguageModel> Adapter<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            options: SamplingOptions::default(),
            owner_name: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature;
        self
    }

    /// Signs drafted replies with this name.
    pub fn with_owner_name(mut self, owner_name: Option<String>) -> Self {
        self.owner_name = owner_name.filter(|n| !n.trim().is_empty());
        self
    }

    fn ask(&self, prompt: &str, system: &str) -> Option<String> {
        match self.model.generate(prompt, system, &self.options) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("model request failed: {e}");
                None
            }
        }
    }

    fn reply_system(&self) -> String {
        match &self.owner_name {
            Some(name) => format!(
                "{REPLY_SYSTEM}\n- the recipient is {name}; sign the reply as {name}"
            ),
            None => REPLY_SYSTEM.to_string(),
        }
    }

    fn closing(&self) -> String {
        match &self.owner_name {
            Some(name) => format!("Best regards,\n{name}"),
            None => "Best regards".to_string(),
        }
    }
}

impl<M: LanguageModel> Assistant for Adapter<M> {
    fn classify_relevance(&self, body: &str, subject: &str) -> Result<bool> {
        let prompt = format!(
            "Email subject: {subject}\n\nEmail content (first {CLASSIFY_BODY_CHARS} chars): {}\n\nClassification:",
            prefix_chars(body, CLASSIFY_BODY_CHARS)
        );
        let relevant = match self.ask(&prompt, CLASSIFY_SYSTEM) {
            Some(answer) => parse_relevance(&answer),
            None => {
                debug!("classification unavailable; keeping '{}'", prefix_chars(subject, 30));
                true
            }
        };
        Ok(relevant)
    }

    fn summarize(&self, body: &str, subject: &str) -> Result<String> {
        let prompt = format!(
            "Subject: {subject}\n\nEmail content: {body}\n\nBullet-point summary:"
        );
        let summary = self
            .ask(&prompt, SUMMARY_SYSTEM)
            .map(|raw| format_bullets(&raw))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| fallback_summary(subject));
        Ok(summary)
    }

    fn generate_reply(
        &self,
        body: &str,
        subject: &str,
        context: &[ContextMessage],
    ) -> Result<String> {
        let name = context
            .last()
            .and_then(|m| guess_first_name(&m.sender))
            .unwrap_or_else(|| "there".to_string());

        let prompt = format!(
            "Original email subject: {subject}\n\nOriginal email content: {}{}\n\nWrite the reply as the recipient of this email:",
            prefix_chars(body, REPLY_BODY_CHARS),
            recap_block(context)
        );

        let reply = match self.ask(&prompt, &self.reply_system()) {
            Some(raw) => polish_reply(&raw, &name, &self.closing()),
            None => GENERIC_REPLY.to_string(),
        };
        Ok(reply)
    }

    fn enhance_reply(&self, original: &str, extra_context: &str) -> Result<String> {
        let prompt = format!(
            "Original reply: {original}\n\nAdditional context: {extra_context}\n\nImproved reply:"
        );
        Ok(self
            .ask(&prompt, ENHANCE_SYSTEM)
            .unwrap_or_else(|| original.to_string()))
    }

    fn check_health(&self) -> bool {
        self.model.health_check()
    }
}

/// NOT_RELEVANT wins over RELEVANT; anything else counts as relevant.
pub fn parse_relevance(answer: &str) -> bool {
    let normalized = answer.trim().to_uppercase();
    if normalized.contains("NOT_RELEVANT") || normalized.contains("NOT RELEVANT") {
        false
    } else {
        // RELEVANT, or no recognizable token at all
        true
    }
}

fn has_bullet(line: &str) -> bool {
    line.starts_with('•') || line.starts_with('-') || line.starts_with('*')
}

pub fn format_bullets(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            if has_bullet(l) {
                l.to_string()
            } else {
                format!("• {l}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn fallback_summary(subject: &str) -> String {
    let subject = subject.trim();
    let subject = if subject.is_empty() { "(no subject)" } else { subject };
    format!("• Email about \"{subject}\" - content review needed")
}

/// "john.doe@x.com" → "John". None when there is no usable local part.
pub fn guess_first_name(address: &str) -> Option<String> {
    let (local, _) = address.split_once('@')?;
    let first = local
        .split(['.', '_', '-', '+'])
        .find(|s| s.chars().any(char::is_alphabetic))?;
    let mut chars = first.chars();
    let head = chars.next()?;
    Some(head.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect())
}

/// Numbered recap of every context entry except the last (the message itself).
pub fn recap_block(context: &[ContextMessage]) -> String {
    if context.len() < 2 {
        return String::new();
    }
    let mut out = String::from("\n\nConversation context (previous messages):\n");
    for (i, msg) in context[..context.len() - 1].iter().enumerate() {
        out.push_str(&format!(
            "{}. From {}: {}...\n",
            i + 1,
            msg.sender,
            prefix_chars(&msg.body, RECAP_BODY_CHARS)
        ));
    }
    out
}

fn has_greeting(text: &str) -> bool {
    let head = prefix_chars(text, GREETING_WINDOW).to_lowercase();
    head.contains("thank you")
        || head
            .split(|c: char| !c.is_alphanumeric())
            .any(|w| GREETING_WORDS.contains(&w))
}

fn has_closing(text: &str) -> bool {
    let count = text.chars().count();
    let tail: String = text
        .chars()
        .skip(count.saturating_sub(CLOSING_WINDOW))
        .collect::<String>()
        .to_lowercase();
    CLOSING_WORDS.iter().any(|w| tail.contains(w))
}

/// Strip echoed artifacts, then make sure there's a greeting and a closing.
pub fn polish_reply(raw: &str, name: &str, closing: &str) -> String {
    let mut reply = raw
        .lines()
        .filter(|l| !l.trim_start().starts_with("Subject:"))
        .collect::<Vec<_>>()
        .join("\n")
        .replace("Dear recipient", &format!("Hi {name}"))
        .trim()
        .to_string();

    if !has_greeting(&reply) {
        reply = format!("Hi {name},\n\n{reply}");
    }
    if !has_closing(&reply) {
        reply = format!("{reply}\n\n{closing}");
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// Replays canned answers and records every prompt it was sent.
    struct ScriptedModel {
        answer: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn answering(answer: &str) -> Self {
            Self {
                answer: Some(answer.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn down() -> Self {
            Self {
                answer: None,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl LanguageModel for ScriptedModel {
        fn health_check(&self) -> bool {
            self.answer.is_some()
        }

        fn generate(&self, prompt: &str, _system: &str, _o: &SamplingOptions) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answer
                .clone()
                .ok_or_else(|| Error::ModelUnavailable("connection refused".into()))
        }
    }

    fn ctx(sender: &str, body: &str) -> ContextMessage {
        ContextMessage {
            sender: sender.into(),
            subject: "s".into(),
            body: body.into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn relevance_tokens() {
        assert!(!parse_relevance("not_relevant"));
        assert!(!parse_relevance("  This is NOT RELEVANT. "));
        assert!(parse_relevance("RELEVANT"));
        assert!(parse_relevance("I am not sure"));
        assert!(parse_relevance(""));
    }

    #[test]
    fn classification_defaults_to_relevant_when_backend_down() {
        let adapter = Adapter::new(ScriptedModel::down());
        assert!(adapter.classify_relevance("win money", "prize").unwrap());
    }

    #[test]
    fn classification_follows_backend_answer() {
        let adapter = Adapter::new(ScriptedModel::answering("NOT_RELEVANT"));
        assert!(!adapter.classify_relevance("buy now", "sale").unwrap());
    }

    #[test]
    fn summary_lines_get_bullets() {
        let adapter = Adapter::new(ScriptedModel::answering(
            "Budget approved\n\n- Send invoice by Friday\n• No reply needed",
        ));
        let summary = adapter.summarize("...", "Budget").unwrap();
        assert_eq!(
            summary,
            "• Budget approved\n- Send invoice by Friday\n• No reply needed"
        );
    }

    #[test]
    fn summary_fallback_mentions_subject() {
        let adapter = Adapter::new(ScriptedModel::down());
        let summary = adapter.summarize("body", "Quarterly review").unwrap();
        assert!(!summary.is_empty());
        assert!(summary.contains("Quarterly review"));
    }

    #[test]
    fn recap_excludes_last_entry() {
        let model = ScriptedModel::answering("Hi Carol,\n\nNoted, thanks!\n\nBest regards");
        let adapter = Adapter::new(model);
        let context = vec![
            ctx("alice@corp.com", "first message"),
            ctx("bob@corp.com", "second message"),
            ctx("carol@corp.com", "the message itself"),
        ];
        adapter.generate_reply("the message itself", "Plan", &context).unwrap();

        let prompts = adapter.model.prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert!(prompt.contains("1. From alice@corp.com: first message..."));
        assert!(prompt.contains("2. From bob@corp.com: second message..."));
        assert!(!prompt.contains("3. From"));
        assert!(!prompt.contains("From carol@corp.com"));
    }

    #[test]
    fn single_entry_context_has_no_recap() {
        assert_eq!(recap_block(&[ctx("a@b.com", "x")]), "");
        assert_eq!(recap_block(&[]), "");
    }

    #[test]
    fn reply_gets_greeting_and_closing() {
        let adapter = Adapter::new(ScriptedModel::answering("Subject: Re: Plan\nSounds good, see you then."));
        let context = vec![ctx("john.doe@corp.com", "meet at 3?")];
        let reply = adapter.generate_reply("meet at 3?", "Plan", &context).unwrap();
        assert_eq!(reply, "Hi John,\n\nSounds good, see you then.\n\nBest regards");
    }

    #[test]
    fn existing_greeting_and_closing_are_kept() {
        let reply = polish_reply("Hello Ann,\n\nWill do.\n\nThanks", "Ann", "Best regards");
        assert_eq!(reply, "Hello Ann,\n\nWill do.\n\nThanks");
    }

    #[test]
    fn dear_recipient_is_rewritten() {
        let reply = polish_reply("Dear recipient, noted.\n\nRegards", "Sam", "Best regards");
        assert_eq!(reply, "Hi Sam, noted.\n\nRegards");
    }

    #[test]
    fn owner_name_signs_closing() {
        let adapter = Adapter::new(ScriptedModel::answering("Got it."))
            .with_owner_name(Some("Dana Smith".into()));
        let reply = adapter.generate_reply("b", "s", &[]).unwrap();
        assert_eq!(reply, "Hi there,\n\nGot it.\n\nBest regards,\nDana Smith");
    }

    #[test]
    fn reply_fallback_is_generic() {
        let adapter = Adapter::new(ScriptedModel::down());
        assert_eq!(adapter.generate_reply("b", "s", &[]).unwrap(), GENERIC_REPLY);
    }

    #[test]
    fn enhance_returns_input_on_failure() {
        let adapter = Adapter::new(ScriptedModel::down());
        assert_eq!(adapter.enhance_reply("keep me", "ctx").unwrap(), "keep me");
    }

    #[test]
    fn first_name_guess() {
        assert_eq!(guess_first_name("john.doe@x.com").as_deref(), Some("John"));
        assert_eq!(guess_first_name("MARY@x.com").as_deref(), Some("Mary"));
        assert_eq!(guess_first_name("123@x.com"), None);
        assert_eq!(guess_first_name("no-address"), None);
    }

    #[test]
    fn health_delegates_to_backend() {
        assert!(Adapter::new(ScriptedModel::answering("x")).check_health());
        assert!(!Adapter::new(ScriptedModel::down()).check_health());
    }
}
