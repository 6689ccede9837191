//! Client-side connection utilities shared by every third-party API wrapper.

use crate::{CLIENT_REQUEST_TIMEOUT_SECS, CLIENT_VERSION, RetryPolicy};
use anyhow::{Context, Result, anyhow};
use log::warn;
use reqwest::{Client, Response};
use std::future::Future;
use std::time::Duration;

/// Build the HTTP client used by the API wrappers.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(CLIENT_REQUEST_TIMEOUT_SECS))
        .user_agent(format!("survey-tools/{CLIENT_VERSION}"))
        .build()
        .context("Failed to build HTTP client")
}

/// Helper function to determine if an error is retry-able
/// - `is_timeout()` catches typical network timeouts
/// - `is_connect()` catches typical connection failures
/// - `is_request()` catches DNS resolution failures and other transient request errors
fn is_retryable_error(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

/// Helper function to classify reqwest error types
fn error_type_str(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection"
    } else if e.is_request() {
        "request/DNS"
    } else if e.is_body() {
        "body"
    } else if e.is_decode() {
        "decode"
    } else {
        "unknown"
    }
}

/// Generic retry logic for HTTP requests with exponential backoff.
/// Handles both network errors and 5xx server errors.
/// Takes a closure to process the successful response.
///
/// # Errors
///
/// Returns an error once the attempts are exhausted, or whatever
/// `process_response` returns for the final response.
pub async fn retry_request<F, Fut, P, PFut, T>(
    request_fn: F,
    process_response: P,
    policy: RetryPolicy,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Response, reqwest::Error>>,
    P: FnOnce(Response) -> PFut,
    PFut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match request_fn().await {
            Ok(response) => {
                if response.status().is_server_error() {
                    if attempts < policy.max_retries {
                        let sleep = policy.backoff(attempts);
                        let status = response.status();
                        let error_msg = response.text().await.unwrap_or_default();
                        warn!(
                            "Server error ({status} {error_msg}), retrying in {sleep:?}... (attempt {attempts}/{})",
                            policy.max_retries
                        );
                        tokio::time::sleep(sleep).await;
                        continue;
                    }
                    let status = response.status();
                    let error_msg = response.text().await.unwrap_or_default();
                    return Err(anyhow!(
                        "Server error after {attempts} attempts: {status} {error_msg}"
                    ));
                }

                return process_response(response).await;
            }
            Err(e) => {
                if is_retryable_error(&e) && attempts < policy.max_retries {
                    let sleep = policy.backoff(attempts);
                    warn!(
                        "Network error ({}), retrying in {:?}... (attempt {}/{}): {}",
                        error_type_str(&e),
                        sleep,
                        attempts,
                        policy.max_retries,
                        e
                    );
                    tokio::time::sleep(sleep).await;
                    continue;
                }
                return Err(anyhow!(
                    "Network error ({}) after {attempts} attempts: {e}",
                    error_type_str(&e)
                ));
            }
        }
    }
}

/// Turn a non-success response into an error that carries the API's own message.
/// JSON error bodies are pretty-printed, anything else is passed through as text.
///
/// # Errors
///
/// Returns an error for any non-2xx status.
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let details = match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => serde_json::to_string_pretty(&json).unwrap_or(body),
        Err(_) => body,
    };
    Err(anyhow!("Server returned an error ({status}): {details}"))
}

/// Read a response body as JSON, treating `204 No Content` and empty bodies as `{}`.
///
/// # Errors
///
/// Returns an error if the body is not valid JSON.
pub async fn json_or_empty(response: Response) -> Result<serde_json::Value> {
    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Ok(serde_json::json!({}));
    }
    let bytes = response
        .bytes()
        .await
        .context("Failed to read response body")?;
    if bytes.is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_slice(&bytes).with_context(|| {
        format!(
            "Could not decode JSON from response body: {}",
            String::from_utf8_lossy(&bytes)
        )
    })
}
