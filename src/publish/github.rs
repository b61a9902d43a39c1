//! Minimal GitHub REST client: make sure a repository exists.

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::PublishError;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

#[derive(Clone)]
pub struct GitHubApi {
    client: Client,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for GitHubApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubApi")
            .field("api_base", &self.api_base)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize)]
struct CreateRepo<'a> {
    name: &'a str,
    private: bool,
}

/// Strip the URL from a reqwest error so nothing request-specific leaks.
fn http_error(e: reqwest::Error) -> PublishError {
    PublishError::Http(e.without_url().to_string())
}

impl GitHubApi {
    pub fn new(client: Client, api_base: &str, token: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(ACCEPT, "application/vnd.github+json")
    }

    async fn api_error(what: &str, response: reqwest::Response) -> PublishError {
        let status = response.status().as_u16();
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_default();
        PublishError::Api {
            status,
            what: what.to_string(),
            message,
        }
    }

    /// Create `owner/name` under the authenticated user unless it exists.
    /// Returns whether it was created.
    pub async fn ensure_repo(&self, owner: &str, name: &str) -> Result<bool, PublishError> {
        let what = format!("{}/{}", owner, name);
        let response = self
            .request(reqwest::Method::GET, &format!("/repos/{}/{}", owner, name))
            .send()
            .await
            .map_err(http_error)?;

        match response.status() {
            StatusCode::OK => return Ok(false),
            StatusCode::NOT_FOUND => {}
            _ => return Err(Self::api_error(&what, response).await),
        }

        tracing::info!(repo = %what, "Creating GitHub repository");
        let response = self
            .request(reqwest::Method::POST, "/user/repos")
            .json(&CreateRepo {
                name,
                private: false,
            })
            .send()
            .await
            .map_err(http_error)?;

        if response.status().is_success() {
            Ok(true)
        } else {
            Err(Self::api_error(&what, response).await)
        }
    }
}
