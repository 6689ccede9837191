//! A library with common utilities for running a crowdsourced survey pipeline.

pub mod client_api;
pub mod completion_codes;
pub mod dashboard_stats;
pub mod dropbox_api;
pub mod firestore;
pub mod html_pdf;
pub mod latin_square;
pub mod prolific_api;
pub mod qualtrics_api;
pub mod review_plan;
pub mod spreadsheet;
pub mod task_ids;
pub mod task_store;
pub mod task_transfer;
pub mod upload_pipeline;

#[cfg(feature = "database")]
pub mod db_util;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timeout for a single HTTP request to any third-party API.
pub const CLIENT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// How many times a transient HTTP failure is attempted before giving up.
pub const MAX_RETRIES: u32 = 3;

/// First backoff delay, doubled after each failed attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Number of responses shown alongside each task.
pub const RESPONSES_PER_TASK: usize = 5;

/// Spreadsheet columns holding per-model responses, in their original order.
pub const MODEL_COLUMNS: [&str; RESPONSES_PER_TASK] =
    ["model1", "model2", "model3", "model4", "model5"];

/// Display names for each model column, used in file names and orderings.
pub const DEFAULT_MODEL_NAMES: [&str; RESPONSES_PER_TASK] = [
    "GPT_4o_2025",
    "Claude_3_Opus",
    "Gemini_Ultra",
    "GPT_4_Turbo",
    "Claude_3_Sonnet",
];

/// Retry settings shared by every HTTP client in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, after `attempts` have already failed.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.base_delay * 2_u32.pow(attempts.saturating_sub(1))
    }
}

/// One submission record as returned by Prolific.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProlificSubmission {
    pub id: String,
    pub participant_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_null_string")]
    pub study_code: String,
    #[serde(default, deserialize_with = "deserialize_null_string")]
    pub started_at: String,
}

/// Treat JSON `null` the same as a missing string.
pub fn deserialize_null_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Returns true if a credential is unset or still holds a template placeholder.
#[must_use]
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.starts_with("YOUR_")
}
