//! Gmail API HTTP client
//!
//! Implements [`MailProvider`] over the Gmail REST API.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::api::{AttachmentResponse, GmailThread, ListThreadsResponse};
use super::normalize::{decode_base64_bytes, normalize_thread};
use super::TokenProvider;
use crate::error::{ArchiveError, ProviderFailure, Result};
use crate::models::{MessageId, ThreadId};
use crate::provider::{AttachmentPayload, MailProvider, RemoteThread, ThreadPage};

/// Largest response body accepted (attachments arrive base64 encoded)
const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

/// Gmail API client
pub struct GmailClient {
    agent: ureq::Agent,
    tokens: Arc<dyn TokenProvider>,
    page_size: usize,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Create a new Gmail client
    ///
    /// # Arguments
    /// * `tokens` - Source of access tokens per owner
    /// * `timeout` - Deadline applied to every HTTP call
    /// * `page_size` - Threads requested per list call (1-500)
    pub fn new(tokens: Arc<dyn TokenProvider>, timeout: Duration, page_size: usize) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();

        Self {
            agent: config.into(),
            tokens,
            page_size: page_size.clamp(1, 500),
        }
    }

    fn user_url(owner: &str, path: &str) -> String {
        format!(
            "{}/users/{}/{}",
            Self::BASE_URL,
            urlencoding::encode(owner),
            path
        )
    }

    /// Perform an authenticated GET and decode the JSON response
    fn get_json<T: DeserializeOwned>(
        &self,
        owner: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let access_token = self.tokens.access_token(owner)?;

        let mut request = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {}", access_token));
        for (key, value) in query {
            request = request.query(*key, *value);
        }

        let mut response = request.call().map_err(|e| map_http_error(url, e))?;

        response
            .body_mut()
            .with_config()
            .limit(MAX_RESPONSE_BYTES)
            .read_json()
            .map_err(|e| {
                ArchiveError::provider(
                    ProviderFailure::Malformed,
                    format!("failed to parse response from {}: {}", url, e),
                )
            })
    }
}

impl MailProvider for GmailClient {
    fn list_threads(
        &self,
        owner: &str,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<ThreadPage> {
        let url = Self::user_url(owner, "threads");
        let max_results = self.page_size.to_string();

        let mut params = vec![("maxResults", max_results.as_str())];
        if !query.is_empty() {
            params.push(("q", query));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let list: ListThreadsResponse = self.get_json(owner, &url, &params)?;
        log::debug!(
            "[GMAIL] Listed {} threads for {} (estimate {:?})",
            list.threads.as_ref().map_or(0, Vec::len),
            owner,
            list.result_size_estimate
        );

        Ok(ThreadPage {
            threads: list
                .threads
                .unwrap_or_default()
                .into_iter()
                .map(|t| ThreadId::new(t.id))
                .collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    fn get_thread(&self, owner: &str, thread_id: &ThreadId) -> Result<RemoteThread> {
        let url = Self::user_url(
            owner,
            &format!("threads/{}", urlencoding::encode(thread_id.as_str())),
        );
        let thread: GmailThread = self.get_json(owner, &url, &[("format", "full")])?;
        normalize_thread(thread)
    }

    fn get_attachment(
        &self,
        owner: &str,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<AttachmentPayload> {
        let url = Self::user_url(
            owner,
            &format!(
                "messages/{}/attachments/{}",
                urlencoding::encode(message_id.as_str()),
                urlencoding::encode(attachment_id)
            ),
        );
        let response: AttachmentResponse = self.get_json(owner, &url, &[])?;

        let data = decode_base64_bytes(&response.data).ok_or_else(|| {
            ArchiveError::provider(
                ProviderFailure::Malformed,
                format!("attachment {} is not valid base64", attachment_id),
            )
        })?;

        let size = response.size.unwrap_or(data.len() as u64);
        Ok(AttachmentPayload { data, size })
    }
}

/// Classify a ureq failure into the provider error taxonomy
fn map_http_error(url: &str, error: ureq::Error) -> ArchiveError {
    match error {
        ureq::Error::StatusCode(status @ (401 | 403)) => ArchiveError::provider(
            ProviderFailure::Auth,
            format!("{} rejected credentials ({})", url, status),
        ),
        ureq::Error::StatusCode(429) => {
            ArchiveError::provider(ProviderFailure::RateLimited, format!("{} rate limited", url))
        }
        ureq::Error::StatusCode(status) => ArchiveError::provider(
            ProviderFailure::Network,
            format!("{} returned HTTP {}", url, status),
        ),
        other => ArchiveError::provider(
            ProviderFailure::Network,
            format!("request to {} failed: {}", url, other),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::StaticToken;

    #[test]
    fn test_user_url_encodes_owner() {
        assert_eq!(
            GmailClient::user_url("a+b@example.com", "threads"),
            "https://gmail.googleapis.com/gmail/v1/users/a%2Bb%40example.com/threads"
        );
    }

    #[test]
    fn test_page_size_is_clamped() {
        let client = GmailClient::new(
            Arc::new(StaticToken::new("t")),
            Duration::from_secs(1),
            10_000,
        );
        assert_eq!(client.page_size, 500);
    }

    #[test]
    fn test_status_classification() {
        let err = map_http_error("u", ureq::Error::StatusCode(401));
        assert!(matches!(
            err,
            ArchiveError::Provider {
                kind: ProviderFailure::Auth,
                ..
            }
        ));

        let err = map_http_error("u", ureq::Error::StatusCode(429));
        assert!(matches!(
            err,
            ArchiveError::Provider {
                kind: ProviderFailure::RateLimited,
                ..
            }
        ));

        let err = map_http_error("u", ureq::Error::StatusCode(500));
        assert!(matches!(
            err,
            ArchiveError::Provider {
                kind: ProviderFailure::Network,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_token_fails_before_network() {
        let client = GmailClient::new(
            Arc::new(StaticToken::new("")),
            Duration::from_secs(1),
            100,
        );
        let err = client.list_threads("me", "", None).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Provider {
                kind: ProviderFailure::Auth,
                ..
            }
        ));
    }
}
