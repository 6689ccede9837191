//! A thin wrapper around the Prolific REST API.

use crate::client_api::{build_http_client, check_status, json_or_empty, retry_request};
use crate::review_plan::{ProposedAction, ReviewPlanRow};
use crate::{ProlificSubmission, RetryPolicy, is_placeholder};
use anyhow::{Context, Result, bail};
use log::{debug, error, info};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const PROLIFIC_BASE_URL: &str = "https://api.prolific.com/api/v1";

/// Prolific rejects with one of a fixed set of categories; attention failures are the common case.
const DEFAULT_REJECTION_CATEGORY: &str = "FAILED_CHECK";

const DEFAULT_REJECTION_MESSAGE: &str = "Your submission did not meet the requirements of this study as described in the study instructions, so it has been rejected after review by the research team.";

pub struct ProlificClient {
    client: Client,
    base_url: String,
    token: String,
    policy: RetryPolicy,
}

/// Tally of what happened when a review plan was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub approved: usize,
    pub rejected: usize,
    pub screened_out: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
struct SubmissionsResponse {
    results: Vec<ProlificSubmission>,
}

impl ProlificClient {
    /// Create a client for the given API base.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is unset or still the template placeholder.
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        if is_placeholder(token) {
            bail!(
                "Prolific API token is not set or is still the placeholder. Add your actual token before running."
            );
        }
        Ok(Self {
            client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            policy: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Token {}", self.token))
                .context("API token contains invalid header characters")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Make a request to a Prolific endpoint (which should start with a '/').
    /// Empty responses are returned as an empty JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error for network failures, non-2xx statuses or undecodable bodies.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        params: Option<&[(&str, &str)]>,
    ) -> Result<Value> {
        let headers = self.auth_headers()?;
        let full_url = format!("{}{endpoint}", self.base_url);

        debug!("Making {method} request to: {full_url}");
        if let Some(body) = body {
            debug!(
                "Request Body: {}",
                serde_json::to_string_pretty(body).unwrap_or_default()
            );
        }
        if let Some(params) = params {
            debug!("URL Parameters: {params:?}");
        }

        let value = retry_request(
            || {
                let mut req = self
                    .client
                    .request(method.clone(), &full_url)
                    .headers(headers.clone());
                if let Some(body) = body {
                    req = req.json(body);
                }
                if let Some(params) = params {
                    req = req.query(params);
                }
                req.send()
            },
            |response| async move {
                let response = check_status(response).await?;
                json_or_empty(response).await
            },
            self.policy,
        )
        .await
        .with_context(|| format!("{method} {endpoint} failed"))?;

        debug!("API call to {endpoint} successful");
        Ok(value)
    }

    /// Retrieve every submission for a study, sorted by start time.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body has no `results`.
    pub async fn get_study_submissions(&self, study_id: &str) -> Result<Vec<ProlificSubmission>> {
        info!("Retrieving submissions for Study ID: {study_id}");
        let endpoint = format!("/studies/{study_id}/submissions/");
        let value = self.request(Method::GET, &endpoint, None, None).await?;

        let mut submissions = serde_json::from_value::<SubmissionsResponse>(value)
            .context("Submissions response did not contain 'results'")?
            .results;
        submissions.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        info!(
            "Retrieved {} submission(s) for study {study_id}.",
            submissions.len()
        );
        Ok(submissions)
    }

    /// Approve or reject a single submission.
    ///
    /// # Errors
    ///
    /// Returns an error if Prolific refuses the transition.
    pub async fn transition_submission(
        &self,
        submission_id: &str,
        action: &str,
        message: Option<&str>,
        rejection_category: Option<&str>,
    ) -> Result<Value> {
        let mut body = json!({ "action": action });
        if let Some(message) = message {
            body["message"] = json!(message);
        }
        if let Some(category) = rejection_category {
            body["rejection_category"] = json!(category);
        }
        let endpoint = format!("/submissions/{submission_id}/transition/");
        self.request(Method::POST, &endpoint, Some(&body), None)
            .await
    }

    /// Screen out many submissions of one study in a single call.
    ///
    /// # Errors
    ///
    /// Returns an error if Prolific refuses the request.
    pub async fn bulk_screen_out(
        &self,
        study_id: &str,
        submission_ids: &[String],
    ) -> Result<Value> {
        let body = json!({ "submission_ids": submission_ids });
        let endpoint = format!("/studies/{study_id}/screen-out-submissions/");
        self.request(Method::POST, &endpoint, Some(&body), None)
            .await
    }

    /// Apply a review plan. Only confirmed decisions are acted upon; everything
    /// else is left for manual review. With `dry_run` nothing is sent.
    ///
    /// # Errors
    ///
    /// Individual failures are counted, not returned; this only fails if the bulk
    /// screen-out request itself cannot be built.
    pub async fn execute_review_plan(
        &self,
        study_id: &str,
        plan: &[ReviewPlanRow],
        dry_run: bool,
    ) -> Result<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();
        let mut screen_out_ids = Vec::new();

        for row in plan {
            let submission_id = row.prolific_submission_id.as_str();
            match row.proposed_action {
                ProposedAction::Approve => {
                    if dry_run {
                        info!("[dry run] would approve {submission_id}");
                        summary.approved += 1;
                        continue;
                    }
                    match self
                        .transition_submission(submission_id, "APPROVE", None, None)
                        .await
                    {
                        Ok(_) => summary.approved += 1,
                        Err(e) => {
                            error!("Failed to approve {submission_id}: {e:#}");
                            summary.failed += 1;
                        }
                    }
                }
                ProposedAction::Reject => {
                    let message = if row.local_reason.is_empty() {
                        DEFAULT_REJECTION_MESSAGE
                    } else {
                        row.local_reason.as_str()
                    };
                    if dry_run {
                        info!("[dry run] would reject {submission_id}: {message}");
                        summary.rejected += 1;
                        continue;
                    }
                    match self
                        .transition_submission(
                            submission_id,
                            "REJECT",
                            Some(message),
                            Some(DEFAULT_REJECTION_CATEGORY),
                        )
                        .await
                    {
                        Ok(_) => summary.rejected += 1,
                        Err(e) => {
                            error!("Failed to reject {submission_id}: {e:#}");
                            summary.failed += 1;
                        }
                    }
                }
                ProposedAction::ScreenOut => screen_out_ids.push(submission_id.to_string()),
                _ => summary.skipped += 1,
            }
        }

        if !screen_out_ids.is_empty() {
            if dry_run {
                info!(
                    "[dry run] would screen out {} submission(s)",
                    screen_out_ids.len()
                );
                summary.screened_out += screen_out_ids.len();
            } else {
                match self.bulk_screen_out(study_id, &screen_out_ids).await {
                    Ok(_) => summary.screened_out += screen_out_ids.len(),
                    Err(e) => {
                        error!("Bulk screen-out failed: {e:#}");
                        summary.failed += screen_out_ids.len();
                    }
                }
            }
        }

        Ok(summary)
    }
}
