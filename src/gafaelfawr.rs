use once_cell::sync::Lazy;
use regex::Regex;

use crate::constants::USERNAME_REGEX;
use crate::errors::{ControllerError, GafaelfawrError, Result};
use crate::models::lab::UserInfo;

static USERNAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(USERNAME_REGEX).unwrap());

/// An authenticated user: identity information plus the delegated token the
/// lab is provisioned with.
#[derive(Debug, Clone)]
pub struct GafaelfawrUser {
    pub token: String,
    pub info: UserInfo,
}

/// Client for the Gafaelfawr identity service.
///
/// Only one call matters to the controller: resolving a delegated token to
/// the user it belongs to, with their UID, groups, and quota.
#[derive(Clone)]
pub struct GafaelfawrClient {
    client: reqwest::Client,
    base_url: String,
}

impl GafaelfawrClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        GafaelfawrClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve a token to the user it was issued to.
    pub async fn get_user_info(&self, token: &str) -> Result<GafaelfawrUser> {
        let url = format!("{}/auth/api/v1/user-info", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await
            .map_err(GafaelfawrError::Request)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(GafaelfawrError::InvalidToken.into());
        }

        // Keep the raw body on parse failures so the alert sink can include
        // whatever the identity service actually said.
        let raw = response.text().await.map_err(GafaelfawrError::Request)?;
        let info: UserInfo = serde_json::from_str(&raw).map_err(|e| {
            GafaelfawrError::ParseFailure { error: e.to_string(), raw: raw.clone() }
        })?;
        if !USERNAME_PATTERN.is_match(&info.username) {
            return Err(ControllerError::PermissionDenied);
        }
        Ok(GafaelfawrUser { token: token.to_string(), info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_pattern() {
        for valid in ["rachel", "some-user", "a2z", "x9y"] {
            assert!(USERNAME_PATTERN.is_match(valid), "{valid} should be valid");
        }
        for invalid in ["Rachel", "user_name", "-leading", "trailing-", "1234", ""] {
            assert!(!USERNAME_PATTERN.is_match(invalid), "{invalid} should be invalid");
        }
    }
}
