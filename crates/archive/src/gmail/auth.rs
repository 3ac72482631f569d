//! Access tokens for the Gmail API
//!
//! Obtaining and refreshing OAuth tokens belongs to the credential layer;
//! this module only reads the token it produced.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ArchiveError, ProviderFailure, Result};

/// Source of bearer tokens for an owner's mailbox
pub trait TokenProvider: Send + Sync {
    /// A currently valid access token for `owner`
    fn access_token(&self, owner: &str) -> Result<String>;
}

/// A fixed token, e.g. passed on the command line
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn access_token(&self, _owner: &str) -> Result<String> {
        if self.0.is_empty() {
            return Err(ArchiveError::provider(
                ProviderFailure::Auth,
                "no access token configured",
            ));
        }
        Ok(self.0.clone())
    }
}

/// Stored token data written by the credential layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds)
    pub expires_at: Option<i64>,
}

impl StoredToken {
    /// Whether the token is still usable (with a 5 minute buffer)
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > Utc::now().timestamp() + 300,
            None => true,
        }
    }
}

/// Reads `{owner}.token.json` files from a directory
///
/// The owner is URL-encoded in the file name, so it can never name a path
/// outside the directory.
pub struct TokenFile {
    dir: PathBuf,
}

impl TokenFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Token directory inside the Mailvault config directory
    pub fn in_config_dir() -> Option<Self> {
        config::config_path("tokens").map(Self::new)
    }

    /// Token file of `owner`
    pub fn path_for(&self, owner: &str) -> PathBuf {
        self.dir.join(format!("{}.token.json", urlencoding::encode(owner)))
    }
}

impl TokenProvider for TokenFile {
    fn access_token(&self, owner: &str) -> Result<String> {
        let path = self.path_for(owner);
        let token: StoredToken = config::load_json_file(&path).map_err(|e| {
            ArchiveError::provider(ProviderFailure::Auth, format!("{:#}", e))
        })?;

        if !token.is_valid() {
            return Err(ArchiveError::provider(
                ProviderFailure::Auth,
                format!("access token for {} has expired", owner),
            ));
        }

        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token() {
        assert_eq!(StaticToken::new("abc").access_token("me").unwrap(), "abc");
        assert!(StaticToken::new("").access_token("me").is_err());
    }

    #[test]
    fn test_token_file_valid() {
        let dir = tempfile::tempdir().unwrap();
        let token = StoredToken {
            access_token: "ya29.token".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now().timestamp() + 3600),
        };
        let tokens = TokenFile::new(dir.path());
        config::save_json_file(&tokens.path_for("user@example.com"), &token).unwrap();

        assert_eq!(tokens.access_token("user@example.com").unwrap(), "ya29.token");
    }

    #[test]
    fn test_token_file_expired_is_provider_error() {
        let dir = tempfile::tempdir().unwrap();
        let token = StoredToken {
            access_token: "old".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now().timestamp() - 10),
        };
        let tokens = TokenFile::new(dir.path());
        config::save_json_file(&tokens.path_for("user@example.com"), &token).unwrap();

        let err = tokens
            .access_token("user@example.com")
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Provider {
                kind: ProviderFailure::Auth,
                ..
            }
        ));
    }

    #[test]
    fn test_token_file_missing_is_provider_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TokenFile::new(dir.path()).access_token("nobody").unwrap_err();
        assert!(matches!(err, ArchiveError::Provider { .. }));
    }

    #[test]
    fn test_owner_cannot_leave_token_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("tokens");
        std::fs::create_dir(&dir).unwrap();
        let outside = StoredToken {
            access_token: "not-yours".to_string(),
            refresh_token: None,
            expires_at: None,
        };
        config::save_json_file(&root.path().join("x.token.json"), &outside).unwrap();

        let tokens = TokenFile::new(&dir);
        assert!(tokens.access_token("../x").is_err());
        assert_eq!(tokens.path_for("../x").parent(), Some(dir.as_path()));
        assert_eq!(
            tokens.path_for("user@example.com").file_name().unwrap(),
            "user%40example.com.token.json"
        );
    }
}
