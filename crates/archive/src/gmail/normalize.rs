//! Gmail API response normalization
//!
//! Converts Gmail API responses to provider contract types.

use base64::prelude::*;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

use super::api::{GmailMessage, GmailThread, MessagePart};
use crate::error::{ArchiveError, ProviderFailure, Result};
use crate::models::{Header, MessageBody, MessageId, ThreadId};
use crate::provider::{AttachmentSource, RemoteAttachment, RemoteMessage, RemoteThread};

/// Normalize a Gmail thread with its messages
pub fn normalize_thread(thread: GmailThread) -> Result<RemoteThread> {
    let messages = thread
        .messages
        .unwrap_or_default()
        .into_iter()
        .map(normalize_message)
        .collect::<Result<Vec<_>>>()?;

    Ok(RemoteThread {
        id: ThreadId::new(thread.id),
        messages,
    })
}

/// Normalize a single Gmail message
fn normalize_message(gmail_msg: GmailMessage) -> Result<RemoteMessage> {
    let payload = gmail_msg.payload.as_ref().ok_or_else(|| {
        ArchiveError::provider(
            ProviderFailure::Malformed,
            format!("message {} has no payload", gmail_msg.id),
        )
    })?;

    let headers = payload
        .headers
        .as_ref()
        .map(|hs| {
            hs.iter()
                .map(|h| Header::new(h.name.clone(), h.value.clone()))
                .collect()
        })
        .unwrap_or_default();

    // Internal date is milliseconds since epoch
    let internal_date: i64 = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);
    let received_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .unwrap_or_else(Utc::now);

    let body = MessageBody {
        text: find_body(payload, "text/plain"),
        html: find_body(payload, "text/html"),
    };

    let mut attachments = Vec::new();
    collect_attachments(payload, &mut attachments);

    Ok(RemoteMessage {
        id: MessageId::new(gmail_msg.id),
        thread_id: ThreadId::new(gmail_msg.thread_id),
        headers,
        snippet: decode_html_entities(&gmail_msg.snippet),
        received_at,
        label_ids: gmail_msg.label_ids.unwrap_or_default(),
        body,
        attachments,
    })
}

/// Depth-first search for the first non-attachment part of the given MIME type
fn find_body(part: &MessagePart, mime: &str) -> Option<String> {
    let is_attachment = part.filename.as_deref().is_some_and(|f| !f.is_empty());

    if !is_attachment
        && part.mime_type.as_deref().is_some_and(|m| m.starts_with(mime))
        && let Some(body) = &part.body
        && let Some(data) = &body.data
        && let Some(text) = decode_base64_body(data)
    {
        return Some(text);
    }

    part.parts
        .as_ref()?
        .iter()
        .find_map(|nested| find_body(nested, mime))
}

/// Collect every part carrying a filename as an attachment reference
fn collect_attachments(part: &MessagePart, out: &mut Vec<RemoteAttachment>) {
    if let Some(filename) = part.filename.as_deref().filter(|f| !f.is_empty())
        && let Some(body) = &part.body
    {
        let source = match (&body.attachment_id, &body.data) {
            (Some(id), _) => Some(AttachmentSource::Remote(id.clone())),
            (None, Some(data)) => decode_base64_bytes(data).map(AttachmentSource::Embedded),
            (None, None) => None,
        };

        if let Some(source) = source {
            let mut headers: BTreeMap<String, String> = part
                .headers
                .as_ref()
                .map(|hs| hs.iter().map(|h| (h.name.clone(), h.value.clone())).collect())
                .unwrap_or_default();
            if let Some(mime) = &part.mime_type
                && !headers.keys().any(|k| k.eq_ignore_ascii_case("Content-Type"))
            {
                headers.insert("Content-Type".to_string(), mime.clone());
            }

            let part_id = part
                .part_id
                .clone()
                .unwrap_or_else(|| out.len().to_string());
            out.push(RemoteAttachment {
                part_id,
                filename: filename.to_string(),
                headers,
                size: body.size.unwrap_or(0),
                source,
            });
        }
    }

    if let Some(parts) = &part.parts {
        for nested in parts {
            collect_attachments(nested, out);
        }
    }
}

/// Decode base64-encoded binary data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
pub fn decode_base64_bytes(data: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders.iter().find_map(|decoder| decoder.decode(data).ok())
}

/// Decode base64-encoded body text
fn decode_base64_body(data: &str) -> Option<String> {
    decode_base64_bytes(data).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
