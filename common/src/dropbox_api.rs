//! Dropbox file upload and shared-link creation.

use crate::client_api::{build_http_client, check_status, json_or_empty, retry_request};
use crate::upload_pipeline::ObjectStore;
use crate::{RetryPolicy, is_placeholder};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

pub const DROPBOX_API_URL: &str = "https://api.dropboxapi.com/2";
pub const DROPBOX_CONTENT_URL: &str = "https://content.dropboxapi.com/2";

pub struct DropboxClient {
    client: Client,
    api_url: String,
    content_url: String,
    token: String,
    policy: RetryPolicy,
}

impl DropboxClient {
    /// # Errors
    ///
    /// Returns an error if the access token is unset.
    pub fn new(token: &str) -> Result<Self> {
        Self::with_urls(DROPBOX_API_URL, DROPBOX_CONTENT_URL, token)
    }

    /// Create a client against explicit RPC and content endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the access token is unset.
    pub fn with_urls(api_url: &str, content_url: &str, token: &str) -> Result<Self> {
        if is_placeholder(token) {
            bail!("Dropbox access token is not set.");
        }
        Ok(Self {
            client: build_http_client()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            content_url: content_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            policy: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn bearer(&self) -> Result<HeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", self.token))
            .context("Access token contains invalid header characters")
    }

    /// Call an RPC endpoint. Returns the status alongside the body so callers
    /// can inspect endpoint-specific 409 errors.
    async fn rpc(&self, endpoint: &str, body: Option<&Value>) -> Result<(StatusCode, Value)> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.bearer()?);
        let url = format!("{}{endpoint}", self.api_url);
        debug!("POST {url}");

        retry_request(
            || {
                let mut req = self.client.post(&url).headers(headers.clone());
                if let Some(body) = body {
                    req = req.json(body);
                }
                req.send()
            },
            |response| async move {
                let status = response.status();
                if status == StatusCode::CONFLICT {
                    return Ok((status, json_or_empty(response).await?));
                }
                let response = check_status(response).await?;
                Ok((status, json_or_empty(response).await?))
            },
            self.policy,
        )
        .await
        .with_context(|| format!("Dropbox call {endpoint} failed"))
    }

    /// Check the token by fetching the current account, returning its display name.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is rejected.
    pub async fn verify_connection(&self) -> Result<String> {
        let (_, account) = self.rpc("/users/get_current_account", None).await?;
        let name = account["name"]["display_name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        info!("Successfully connected to Dropbox account: {name}");
        Ok(name)
    }

    /// Upload a file, overwriting anything already at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload is refused.
    pub async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.bearer()?);
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        let arg = json!({ "path": path, "mode": "overwrite", "mute": true });
        headers.insert(
            "Dropbox-API-Arg",
            HeaderValue::from_str(&arg.to_string()).context("Upload path is not a valid header")?,
        );
        let url = format!("{}/files/upload", self.content_url);

        retry_request(
            || {
                self.client
                    .post(&url)
                    .headers(headers.clone())
                    .body(bytes.clone())
                    .send()
            },
            |response| async move {
                check_status(response).await?;
                Ok(())
            },
            self.policy,
        )
        .await
        .with_context(|| format!("Failed to upload {path}"))
    }

    /// Create a public link for `path`, reusing the existing one if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if no link can be created or found.
    pub async fn shared_link(&self, path: &str) -> Result<String> {
        let (status, value) = self
            .rpc(
                "/sharing/create_shared_link_with_settings",
                Some(&json!({ "path": path })),
            )
            .await?;

        if status != StatusCode::CONFLICT {
            return value["url"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("Shared link response had no url: {value}"));
        }

        let error = &value["error"];
        if error[".tag"] != "shared_link_already_exists" {
            bail!("Could not create shared link for {path}: {value}");
        }
        if let Some(url) = error["shared_link_already_exists"]["metadata"]["url"].as_str() {
            return Ok(url.to_string());
        }

        let (_, listed) = self
            .rpc(
                "/sharing/list_shared_links",
                Some(&json!({ "path": path, "direct_only": true })),
            )
            .await?;
        listed["links"][0]["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No existing shared link found for {path}"))
    }
}

/// A Dropbox folder that uploaded PDFs are written to.
pub struct DropboxFolder {
    client: DropboxClient,
    folder: String,
}

impl DropboxFolder {
    #[must_use]
    pub fn new(client: DropboxClient, folder: &str) -> Self {
        let folder = format!("/{}", folder.trim_matches('/'));
        Self { client, folder }
    }

    #[must_use]
    pub fn path_for(&self, name: &str) -> String {
        if self.folder == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.folder)
        }
    }
}

#[async_trait]
impl ObjectStore for DropboxFolder {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String> {
        let path = self.path_for(name);
        self.client.upload(&path, bytes).await?;
        self.client.shared_link(&path).await
    }
}
