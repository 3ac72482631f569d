//! Thread model representing an archived conversation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique identifier for a thread (provider thread ID, unique per owner)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A thread represents a conversation containing one or more messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    /// Provider thread ID
    pub id: ThreadId,
    /// Subject line of the thread (from the first message)
    pub subject: String,
    /// Preview text (snippet) of the latest message
    pub snippet: String,
    /// Union of the labels carried by the thread's messages
    pub labels: BTreeSet<String>,
    /// Timestamp of the most recent message in the thread
    pub last_message_at: DateTime<Utc>,
    /// Number of messages in the thread
    pub message_count: usize,
    /// Display name of the thread sender (from first message)
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Email address of the thread sender (from first message)
    #[serde(default)]
    pub sender_email: String,
}

impl Thread {
    /// Create a thread with no labels and no sender
    pub fn new(
        id: ThreadId,
        subject: impl Into<String>,
        snippet: impl Into<String>,
        last_message_at: DateTime<Utc>,
        message_count: usize,
    ) -> Self {
        Self {
            id,
            subject: subject.into(),
            snippet: snippet.into(),
            labels: BTreeSet::new(),
            last_message_at,
            message_count,
            sender_name: None,
            sender_email: String::new(),
        }
    }

    /// Builder method to set the label set
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set the sender
    pub fn with_sender(mut self, name: Option<String>, email: impl Into<String>) -> Self {
        self.sender_name = name;
        self.sender_email = email.into();
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}
