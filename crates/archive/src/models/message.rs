//! Message model representing one archived message of a thread

use super::{AttachmentId, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a message (provider message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// A raw message header, kept in provider order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Decoded body content of a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub text: Option<String>,
    pub html: Option<String>,
}

/// A single archived message within a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    /// Provider message ID
    pub id: MessageId,
    /// ID of the thread this message belongs to
    pub thread_id: ThreadId,
    /// All headers, in provider order
    pub headers: Vec<Header>,
    pub from: EmailAddress,
    pub subject: String,
    /// Provider snippet of the body
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    /// Provider label IDs (e.g., "INBOX", "SENT", "Label_12")
    pub label_ids: Vec<String>,
    pub body: MessageBody,
    /// Archive IDs of the message's attachments, in part order
    pub attachment_refs: Vec<AttachmentId>,
}

impl ThreadMessage {
    /// Create a new message builder
    pub fn builder(id: MessageId, thread_id: ThreadId) -> ThreadMessageBuilder {
        ThreadMessageBuilder::new(id, thread_id)
    }

    /// Look up a header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Builder for creating ThreadMessage instances
pub struct ThreadMessageBuilder {
    id: MessageId,
    thread_id: ThreadId,
    headers: Vec<Header>,
    from: Option<EmailAddress>,
    subject: String,
    snippet: String,
    received_at: Option<DateTime<Utc>>,
    label_ids: Vec<String>,
    body: MessageBody,
    attachment_refs: Vec<AttachmentId>,
}

impl ThreadMessageBuilder {
    fn new(id: MessageId, thread_id: ThreadId) -> Self {
        Self {
            id,
            thread_id,
            headers: Vec::new(),
            from: None,
            subject: String::new(),
            snippet: String::new(),
            received_at: None,
            label_ids: Vec::new(),
            body: MessageBody::default(),
            attachment_refs: Vec::new(),
        }
    }

    pub fn headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.from = Some(from);
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn label_ids(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    pub fn body_text(mut self, text: Option<String>) -> Self {
        self.body.text = text;
        self
    }

    pub fn body_html(mut self, html: Option<String>) -> Self {
        self.body.html = html;
        self
    }

    pub fn attachment_refs(mut self, refs: Vec<AttachmentId>) -> Self {
        self.attachment_refs = refs;
        self
    }

    pub fn build(self) -> ThreadMessage {
        ThreadMessage {
            id: self.id,
            thread_id: self.thread_id,
            headers: self.headers,
            from: self
                .from
                .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com")),
            subject: self.subject,
            snippet: self.snippet,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            label_ids: self.label_ids,
            body: self.body,
            attachment_refs: self.attachment_refs,
        }
    }
}
