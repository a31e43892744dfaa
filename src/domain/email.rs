use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type EmailId = String;

/// Line width handed to the markup renderer.
const MARKUP_WIDTH: usize = 120;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Lenient conversion from provider/storage strings. Unknown → medium.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Priority::Low,
            "high" | "urgent" => Priority::High,
            _ => Priority::Medium,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Plain,
    Markup,
}

impl ContentType {
    /// Unknown content types are treated as plain text.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("html") {
            ContentType::Markup
        } else {
            ContentType::Plain
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub content: String,
    pub content_type: ContentType,
}

impl MessageBody {
    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: ContentType::Plain,
        }
    }

    pub fn markup(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: ContentType::Markup,
        }
    }

    pub fn to_text(&self) -> String {
        match self.content_type {
            ContentType::Plain => self.content.clone(),
            ContentType::Markup => render_markup(&self.content),
        }
    }
}

fn render_markup(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), MARKUP_WIDTH) {
        Ok(text) => text
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string(),
        Err(e) => {
            warn!("markup body could not be rendered, keeping it raw: {e}");
            html.to_string()
        }
    }
}

/// A message as delivered by the mailbox provider, before any processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: EmailId,
    pub sender: String,
    pub sender_name: String,
    pub subject: String,
    pub body: MessageBody,
    /// ISO-8601 receipt time.
    pub received_at: String,
    pub conversation_id: String,
    pub is_read: bool,
    pub has_attachments: bool,
    /// Free-form importance hint from the provider (e.g. "normal").
    pub importance: Option<String>,
}

impl RawMessage {
    pub fn text(&self) -> String {
        self.body.to_text()
    }
}

/// One entry of a thread's recent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub timestamp: String,
}

/// The persisted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    pub id: EmailId,
    pub sender: String,
    pub sender_name: String,
    pub subject: String,
    pub body: String,
    pub timestamp: String,
    pub summary: String,
    pub has_reply: bool,
    pub draft_reply: String,
    pub is_relevant: bool,
    pub conversation_id: String,
    pub priority: Priority,
    pub processed_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityBreakdown {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
}

impl PriorityBreakdown {
    pub fn add(&mut self, priority: Priority, count: i64) {
        match priority {
            Priority::Low => self.low += count,
            Priority::Medium => self.medium += count,
            Priority::High => self.high += count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderCount {
    pub sender: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailStats {
    pub total: i64,
    pub unreplied: i64,
    pub replied: i64,
    pub last_24h: i64,
    /// Percentage of relevant records with a reply, one decimal place.
    pub reply_rate: f64,
    pub by_priority: PriorityBreakdown,
    pub top_senders: Vec<SenderCount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parse_is_lenient() {
        assert_eq!(Priority::parse("HIGH"), Priority::High);
        assert_eq!(Priority::parse("low"), Priority::Low);
        assert_eq!(Priority::parse("normal"), Priority::Medium);
        assert_eq!(Priority::parse("whatever"), Priority::Medium);
    }

    #[test]
    fn unknown_content_type_is_plain() {
        assert_eq!(ContentType::parse("HTML"), ContentType::Markup);
        assert_eq!(ContentType::parse("Text"), ContentType::Plain);
        assert_eq!(ContentType::parse("application/rtf"), ContentType::Plain);
    }

    #[test]
    fn markup_body_reduces_to_text() {
        let body = MessageBody::markup("<p>Tom &amp; Jerry</p>");
        assert_eq!(body.to_text(), "Tom & Jerry");
    }

    #[test]
    fn markup_drops_style_and_script_content() {
        let body = MessageBody::markup(
            "<html><head><style>.promo { color: red; }</style>\
             <script>var x = 1;</script></head><body><p>Hi Bob</p></body></html>",
        );
        let text = body.to_text();
        assert!(text.contains("Hi Bob"), "{text}");
        assert!(!text.contains(".promo"), "{text}");
        assert!(!text.contains("var x"), "{text}");
    }

    #[test]
    fn markup_paragraphs_stay_apart() {
        let body = MessageBody::markup("<p>Hi&nbsp;Bob,</p><p>5 &lt; 6 &amp;&amp; it&#39;s fine</p>");
        let text = body.to_text();
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        assert_eq!(lines.len(), 2, "{text}");
        assert!(lines[1].contains("5 < 6 && it's fine"), "{text}");
    }

    #[test]
    fn record_serializes_camel_case() {
        let rec = EmailRecord {
            id: "a".into(),
            sender: "s@x.com".into(),
            sender_name: "S".into(),
            subject: "hi".into(),
            body: "b".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            summary: "• x".into(),
            has_reply: false,
            draft_reply: String::new(),
            is_relevant: true,
            conversation_id: "c".into(),
            priority: Priority::High,
            processed_at: "2024-01-01T00:00:01Z".into(),
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["senderName"], "S");
        assert_eq!(v["hasReply"], false);
        assert_eq!(v["priority"], "high");
    }
}
