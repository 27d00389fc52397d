pub mod source;

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::RwLock;
use url::Url;

use crate::config::DockerSourceConfig;
use crate::errors::RegistryError;
use crate::models::docker::DockerCredentialStore;

/// Media types accepted when resolving a tag to a digest.
const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json,",
    "application/vnd.docker.distribution.manifest.list.v2+json,",
    "application/vnd.oci.image.manifest.v1+json,",
    "application/vnd.oci.image.index.v1+json",
);

/// Architectures whose suffixed tags duplicate a base tag.
const ARCHITECTURES: [&str; 2] = ["arm64", "amd64"];

static LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\s*<(?P<target>[^>]+)>;\s*rel="(?P<type>[^"]+)""#).unwrap());
static CHALLENGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?P<key>\w+)="(?P<value>[^"]*)""#).unwrap());

/// Drop architecture-specific tags (`<base>-<arch>`) whose base tag is also
/// present.
pub fn filter_arch_tags(tags: &[String]) -> Vec<String> {
    let tag_set: HashSet<&str> = tags.iter().map(String::as_str).collect();
    tags.iter()
        .filter(|tag| {
            let arch = ARCHITECTURES.iter().find_map(|a| tag.strip_suffix(&format!("-{a}")));
            match arch {
                Some(base) => !tag_set.contains(base),
                None => true,
            }
        })
        .cloned()
        .collect()
}

/// Extract the `rel="next"` target from a `Link` header, if any.
pub fn parse_next_link_header(link: &str) -> Option<String> {
    let captures = LINK_REGEX.captures(link)?;
    if &captures["type"] != "next" {
        return None;
    }
    Some(captures["target"].to_string())
}

/// Resolve a possibly-relative next link against the registry host. GHCR,
/// for one, returns host-relative links.
pub fn next_url(link_url: &str, registry: &str) -> String {
    if let Ok(parsed) = Url::parse(link_url)
        && parsed.host_str().is_some()
    {
        return link_url.to_string();
    }
    if link_url.starts_with('/') {
        format!("https://{registry}{link_url}")
    } else {
        format!("https://{registry}/{link_url}")
    }
}

/// Client for the Docker registry v2 API.
///
/// Handles per-host authentication (HTTP Basic, upgraded to bearer tokens
/// when the registry issues a challenge) with bearer-token memoization, tag
/// listing with pagination, and digest resolution.
pub struct DockerRegistryClient {
    client: reqwest::Client,
    credentials: DockerCredentialStore,
    tokens: RwLock<HashMap<String, String>>,
}

impl DockerRegistryClient {
    pub fn new(client: reqwest::Client, credentials: DockerCredentialStore) -> Self {
        DockerRegistryClient { client, credentials, tokens: RwLock::new(HashMap::new()) }
    }

    /// List tags for the configured registry and repository.
    ///
    /// Follows `Link: <...>; rel="next"` pagination. A registry that serves
    /// the same page forever (it happens) is detected by tag overlap with
    /// pages already seen; the loop logs an error and returns the union of
    /// unique tags gathered so far.
    pub async fn list_tags(&self, config: &DockerSourceConfig) -> Result<Vec<String>, RegistryError> {
        let mut url =
            format!("https://{}/v2/{}/tags/list", config.registry, config.repository);
        let mut all_tags: HashSet<String> = HashSet::new();
        loop {
            let response = self.get(&config.registry, &url, None).await?;
            let link = response
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| RegistryError::new(format!("Cannot parse tag list: {e}"), "GET", &url))?;
            let tags: Vec<String> = body
                .get("tags")
                .and_then(|t| t.as_array())
                .map(|tags| {
                    tags.iter().filter_map(|t| t.as_str().map(str::to_string)).collect()
                })
                .ok_or_else(|| {
                    RegistryError::new("Tag list response has no tags", "GET", &url)
                })?;

            let filtered = filter_arch_tags(&tags);
            debug!(
                registry = config.registry.as_str(),
                repository = config.repository.as_str(),
                count = filtered.len(),
                "Listed image tags"
            );
            let current: HashSet<String> = filtered.into_iter().collect();
            let duplicates: Vec<&String> = current.intersection(&all_tags).collect();
            if !duplicates.is_empty() {
                error!(
                    count = duplicates.len(),
                    "Duplicate tags in registry listing, bailing out of tag-reading loop"
                );
                all_tags.extend(current);
                break;
            }
            all_tags.extend(current);

            let Some(link) = link else { break };
            let Some(target) = parse_next_link_header(&link) else { break };
            url = next_url(&target, &config.registry);
        }
        Ok(all_tags.into_iter().collect())
    }

    /// Resolve a tag to its digest via the manifest endpoint.
    pub async fn get_image_digest(
        &self,
        config: &DockerSourceConfig,
        tag: &str,
    ) -> Result<String, RegistryError> {
        let url = format!(
            "https://{}/v2/{}/manifests/{tag}",
            config.registry, config.repository
        );
        let response = self.get(&config.registry, &url, Some(MANIFEST_ACCEPT)).await?;
        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RegistryError::new("No digest in manifest response", "GET", &url))
    }

    /// Issue an authenticated GET, retrying once through a bearer-token
    /// challenge on 401.
    async fn get(
        &self,
        registry: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let response = self.send(registry, url, accept).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            self.authenticate(registry, url, challenge.as_deref()).await?;
            let response = self.send(registry, url, accept).await?;
            return self.check_status(response, url);
        }
        self.check_status(response, url)
    }

    async fn send(
        &self,
        registry: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        if let Some(token) = self.tokens.read().await.get(registry) {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        } else if let Some(credentials) = self.credentials.get(registry) {
            request = request.header(reqwest::header::AUTHORIZATION, credentials.authorization());
        }
        request
            .send()
            .await
            .map_err(|e| RegistryError::new(format!("Request failed: {e}"), "GET", url))
    }

    fn check_status(
        &self,
        response: reqwest::Response,
        url: &str,
    ) -> Result<reqwest::Response, RegistryError> {
        if !response.status().is_success() {
            let message = format!("Registry returned status {}", response.status());
            return Err(RegistryError::new(message, "GET", url));
        }
        Ok(response)
    }

    /// Obtain and memoize a bearer token from a `WWW-Authenticate`
    /// challenge.
    async fn authenticate(
        &self,
        registry: &str,
        url: &str,
        challenge: Option<&str>,
    ) -> Result<(), RegistryError> {
        let challenge = challenge
            .ok_or_else(|| RegistryError::new("401 with no authentication challenge", "GET", url))?;
        if !challenge.trim_start().to_lowercase().starts_with("bearer") {
            // Basic auth: credentials are already sent on every request, so
            // a 401 here is just a bad password.
            return Err(RegistryError::new("Registry rejected credentials", "GET", url));
        }

        let mut parameters: HashMap<String, String> = HashMap::new();
        for captures in CHALLENGE_REGEX.captures_iter(challenge) {
            parameters.insert(captures["key"].to_string(), captures["value"].to_string());
        }
        let realm = parameters
            .get("realm")
            .ok_or_else(|| RegistryError::new("Challenge has no realm", "GET", url))?;

        let mut token_url = Url::parse(realm)
            .map_err(|e| RegistryError::new(format!("Invalid challenge realm: {e}"), "GET", realm))?;
        for key in ["service", "scope"] {
            if let Some(value) = parameters.get(key) {
                token_url.query_pairs_mut().append_pair(key, value);
            }
        }

        let mut request = self.client.get(token_url.clone());
        if let Some(credentials) = self.credentials.get(registry) {
            request = request.header(reqwest::header::AUTHORIZATION, credentials.authorization());
        }
        let response = request.send().await.map_err(|e| {
            RegistryError::new(format!("Token request failed: {e}"), "GET", token_url.as_str())
        })?;
        let body: serde_json::Value = response.json().await.map_err(|e| {
            RegistryError::new(format!("Cannot parse token response: {e}"), "GET", token_url.as_str())
        })?;
        let token = body
            .get("token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| RegistryError::new("No token in response", "GET", token_url.as_str()))?;
        self.tokens.write().await.insert(registry.to_string(), token.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_arch_tags() {
        let tags: Vec<String> = ["w_2077_44", "w_2077_44-amd64", "w_2077_44-arm64", "w_2077_43-arm64"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        // Suffixed tags with a base are dropped; orphans are kept.
        assert_eq!(filter_arch_tags(&tags), ["w_2077_44", "w_2077_43-arm64"]);
    }

    #[test]
    fn test_parse_next_link_header() {
        let link = r#"</v2/library/sketchbook/tags/list?n=100&last=x>; rel="next""#;
        assert_eq!(
            parse_next_link_header(link).as_deref(),
            Some("/v2/library/sketchbook/tags/list?n=100&last=x")
        );
        let link = r#"<https://example.com/page2>; rel="prev""#;
        assert_eq!(parse_next_link_header(link), None);
        assert_eq!(parse_next_link_header("nonsense"), None);
    }

    #[test]
    fn test_next_url() {
        assert_eq!(
            next_url("https://other.example.com/page2", "lighthouse.ceres"),
            "https://other.example.com/page2"
        );
        assert_eq!(
            next_url("/v2/tags/list?last=x", "lighthouse.ceres"),
            "https://lighthouse.ceres/v2/tags/list?last=x"
        );
        assert_eq!(
            next_url("v2/tags/list?last=x", "lighthouse.ceres"),
            "https://lighthouse.ceres/v2/tags/list?last=x"
        );
    }
}
