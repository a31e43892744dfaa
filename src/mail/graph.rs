use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

use crate::domain::email::{ContentType, ContextMessage, MessageBody, RawMessage};
use crate::error::{Error, Result};
use crate::mail::decoders::truncate_chars;
use crate::mail::provider::{CONTEXT_LIMIT, MailboxProvider, reply_subject};

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MESSAGE_FIELDS: &str =
    "id,sender,from,subject,body,receivedDateTime,isRead,hasAttachments,conversationId,importance";
const CONTEXT_BODY_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAddress {
    address: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphAddress,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    sender: Option<GraphRecipient>,
    from: Option<GraphRecipient>,
    subject: Option<String>,
    body: Option<GraphBody>,
    received_date_time: Option<String>,
    conversation_id: Option<String>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    has_attachments: bool,
    importance: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    mail: Option<String>,
    user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedDraft {
    id: String,
}

impl GraphMessage {
    fn sender(&self) -> Option<&GraphAddress> {
        self.sender
            .as_ref()
            .or(self.from.as_ref())
            .map(|r| &r.email_address)
    }

    fn sender_address(&self) -> String {
        self.sender()
            .and_then(|a| a.address.clone())
            .unwrap_or_default()
    }

    fn into_raw(self) -> RawMessage {
        let sender = self.sender_address();
        let sender_name = self
            .sender()
            .and_then(|a| a.name.clone())
            .unwrap_or_default();
        let body = self
            .body
            .map(|b| MessageBody {
                content: b.content.unwrap_or_default(),
                content_type: ContentType::parse(b.content_type.as_deref().unwrap_or("text")),
            })
            .unwrap_or_else(|| MessageBody::plain(""));

        RawMessage {
            id: self.id,
            sender,
            sender_name,
            subject: self.subject.unwrap_or_default(),
            body,
            received_at: self.received_date_time.unwrap_or_default(),
            conversation_id: self.conversation_id.unwrap_or_default(),
            is_read: self.is_read,
            has_attachments: self.has_attachments,
            importance: self.importance,
        }
    }
}

/// Microsoft Graph mailbox over blocking HTTP.
pub struct GraphClient {
    http: Client,
    base_url: String,
}

impl GraphClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(GRAPH_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send()?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(Error::ProviderUnavailable(format!("{status}: {text}")));
        }
        resp.json::<T>()
            .map_err(|e| Error::MalformedResponse(e.to_string()))
    }

    fn conversation_messages(
        &self,
        credential: &str,
        conversation_id: &str,
        fields: &str,
    ) -> Result<Vec<GraphMessage>> {
        let filter = format!("conversationId eq '{}'", odata_escape(conversation_id));
        let req = self
            .http
            .get(self.url("/me/messages"))
            .bearer_auth(credential)
            .query(&[("$filter", filter.as_str()), ("$select", fields)]);
        let mut messages = self.fetch::<ListResponse<GraphMessage>>(req)?.value;
        // ISO-8601 from the same source sorts lexicographically.
        messages.sort_by(|a, b| b.received_date_time.cmp(&a.received_date_time));
        Ok(messages)
    }

    fn try_native_reply(&self, credential: &str, original_id: &str, text: &str) -> Result<bool> {
        let resp = self
            .http
            .post(self.url(&format!("/me/messages/{original_id}/createReply")))
            .bearer_auth(credential)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()?;
        if resp.status() != StatusCode::CREATED {
            debug!("createReply rejected with {}", resp.status());
            return Ok(false);
        }
        let draft: CreatedDraft = resp
            .json()
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;

        let patched = self
            .http
            .patch(self.url(&format!("/me/messages/{}", draft.id)))
            .bearer_auth(credential)
            .json(&json!({ "body": { "contentType": "Text", "content": text } }))
            .send()?;
        if !patched.status().is_success() {
            warn!("failed to fill reply draft: {}", patched.status());
            return Ok(false);
        }

        let sent = self
            .http
            .post(self.url(&format!("/me/messages/{}/send", draft.id)))
            .bearer_auth(credential)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()?;
        Ok(sent.status() == StatusCode::ACCEPTED)
    }

    fn send_new_message(&self, credential: &str, original: &RawMessage, text: &str) -> Result<bool> {
        let payload = json!({
            "message": {
                "subject": reply_subject(&original.subject),
                "body": { "contentType": "Text", "content": text },
                "toRecipients": [{
                    "emailAddress": { "address": original.sender, "name": original.sender_name }
                }],
                "internetMessageHeaders": [{
                    "name": "X-In-Reply-To-Id",
                    "value": original.id
                }]
            }
        });
        let resp = self
            .http
            .post(self.url("/me/sendMail"))
            .bearer_auth(credential)
            .json(&payload)
            .send()?;
        if resp.status() != StatusCode::ACCEPTED {
            warn!("sendMail failed: {}", resp.status());
            return Ok(false);
        }
        Ok(true)
    }
}

impl MailboxProvider for GraphClient {
    fn list_recent_messages(
        &self,
        credential: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        let top = limit.to_string();
        let mut query = vec![
            ("$top", top),
            ("$orderby", "receivedDateTime desc".to_string()),
            ("$select", MESSAGE_FIELDS.to_string()),
        ];
        if let Some(since) = since {
            query.push((
                "$filter",
                format!(
                    "receivedDateTime ge {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            ));
        }

        let req = self
            .http
            .get(self.url("/me/messages"))
            .bearer_auth(credential)
            .query(&query);
        let messages = self.fetch::<ListResponse<GraphMessage>>(req)?.value;
        debug!("fetched {} messages", messages.len());
        Ok(messages.into_iter().map(GraphMessage::into_raw).collect())
    }

    fn get_message_by_id(&self, credential: &str, id: &str) -> Result<Option<RawMessage>> {
        let resp = self
            .http
            .get(self.url(&format!("/me/messages/{id}")))
            .bearer_auth(credential)
            .query(&[("$select", MESSAGE_FIELDS)])
            .send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "get message {id}: {}",
                resp.status()
            )));
        }
        let msg: GraphMessage = resp
            .json()
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        Ok(Some(msg.into_raw()))
    }

    fn conversation_context(&self, credential: &str, id: &str) -> Result<Vec<ContextMessage>> {
        let Some(msg) = self.get_message_by_id(credential, id)? else {
            return Ok(Vec::new());
        };
        let thread = self.conversation_messages(
            credential,
            &msg.conversation_id,
            "id,sender,from,subject,body,receivedDateTime",
        )?;

        Ok(thread
            .into_iter()
            .take(CONTEXT_LIMIT)
            .map(|m| {
                let raw = m.into_raw();
                ContextMessage {
                    body: truncate_chars(&raw.text(), CONTEXT_BODY_CHARS),
                    sender: raw.sender,
                    subject: raw.subject,
                    timestamp: raw.received_at,
                }
            })
            .collect())
    }

    fn has_owner_replied(&self, credential: &str, id: &str) -> Result<bool> {
        let Some(msg) = self.get_message_by_id(credential, id)? else {
            return Ok(false);
        };
        let owner = self.resolve_owner_address(credential)?;
        let thread = self.conversation_messages(
            credential,
            &msg.conversation_id,
            "id,sender,from,receivedDateTime",
        )?;

        Ok(thread.iter().any(|m| {
            m.id != msg.id
                && m.sender_address().eq_ignore_ascii_case(&owner)
                && m.received_date_time.as_deref().unwrap_or("") >= msg.received_at.as_str()
        }))
    }

    fn send_reply(&self, credential: &str, original_id: &str, text: &str) -> Result<bool> {
        let Some(original) = self.get_message_by_id(credential, original_id)? else {
            warn!("cannot reply: message {original_id} not found");
            return Ok(false);
        };

        if self.try_native_reply(credential, original_id, text)? {
            return Ok(true);
        }
        debug!("native reply unavailable; sending a new message to {}", original.sender);
        self.send_new_message(credential, &original, text)
    }

    fn resolve_owner_address(&self, credential: &str) -> Result<String> {
        let req = self
            .http
            .get(self.url("/me"))
            .bearer_auth(credential)
            .query(&[("$select", "mail,userPrincipalName")]);
        let me: GraphUser = self.fetch(req)?;
        me.mail
            .or(me.user_principal_name)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .ok_or_else(|| Error::MalformedResponse("profile has no mail address".into()))
    }
}

fn odata_escape(s: &str) -> String {
    s.replace('\'', "''")
}
