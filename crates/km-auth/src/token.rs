use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A bearer token with its lifetime metadata, as cached per scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthToken {
    pub access_token: String,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}

impl AuthToken {
    pub fn new(
        access_token: impl Into<String>,
        token_type: impl Into<String>,
        expires_in: Duration,
    ) -> Self {
        let issued_at = Utc::now();
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            issued_at,
            expires_at: issued_at
                + ChronoDuration::from_std(expires_in).unwrap_or(ChronoDuration::zero()),
            refresh_token: None,
            scope: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Whether the token is inside the refresh-ahead window.
    pub fn should_refresh(&self, lead: Duration) -> bool {
        let lead = ChronoDuration::from_std(lead).unwrap_or(ChronoDuration::zero());
        Utc::now() >= self.expires_at - lead
    }

    /// The `Authorization` header value for this token.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_expired() {
        let token = AuthToken::new("abc", "Bearer", Duration::from_secs(3600));
        assert!(!token.is_expired());
        assert!(!token.should_refresh(Duration::from_secs(300)));
        assert_eq!(token.header_value(), "Bearer abc");
    }

    #[test]
    fn token_in_refresh_window() {
        let token = AuthToken::new("abc", "Bearer", Duration::from_secs(60));
        assert!(!token.is_expired());
        assert!(token.should_refresh(Duration::from_secs(300)));
    }

    #[test]
    fn zero_lifetime_token_is_expired() {
        let token = AuthToken::new("abc", "Bearer", Duration::ZERO);
        assert!(token.is_expired());
    }
}
