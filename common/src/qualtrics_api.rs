//! Qualtrics v3 API: response exports and survey-flow embedded data.

use crate::client_api::{build_http_client, check_status, json_or_empty, retry_request};
use crate::{RetryPolicy, is_placeholder};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{Value, json};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default polling interval while an export is being prepared.
pub const EXPORT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polls before an export that never finishes is abandoned.
pub const EXPORT_MAX_POLLS: u32 = 720;

/// Embedded data field that receives the list of hidden occupations.
pub const HIDDEN_OCCUPATION_FIELD: &str = "hidden_occupation_numbers";

/// State of a response export job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportProgress {
    pub status: String,
    pub percent_complete: f64,
    pub file_id: String,
}

/// Where a downloaded export ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavedExport {
    /// The data file was extracted from the archive.
    Extracted(PathBuf),
    /// The body was not a ZIP archive and was written as-is.
    Raw(PathBuf),
    /// The archive contained no entries and was kept for inspection.
    Archive(PathBuf),
}

impl SavedExport {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Extracted(p) | Self::Raw(p) | Self::Archive(p) => p,
        }
    }
}

pub struct QualtricsClient {
    client: Client,
    base_url: String,
    token: String,
    policy: RetryPolicy,
    poll_interval: Duration,
}

impl QualtricsClient {
    /// Create a client for a Qualtrics data center (e.g. `co1`).
    ///
    /// # Errors
    ///
    /// Returns an error if the token or data center is unset.
    pub fn new(data_center: &str, token: &str) -> Result<Self> {
        if is_placeholder(data_center) {
            bail!("Qualtrics data center ID is not set.");
        }
        Self::with_base_url(
            &format!("https://{}.qualtrics.com/API/v3", data_center.trim()),
            token,
        )
    }

    /// Create a client against an explicit API base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is unset or still the template placeholder.
    pub fn with_base_url(base_url: &str, token: &str) -> Result<Self> {
        if is_placeholder(token) {
            bail!("Qualtrics API token is not set or is still the placeholder.");
        }
        Ok(Self {
            client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            policy: RetryPolicy::default(),
            poll_interval: EXPORT_POLL_INTERVAL,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-API-TOKEN",
            HeaderValue::from_str(&self.token)
                .context("API token contains invalid header characters")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn request(&self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        let headers = self.headers()?;
        let url = format!("{}{endpoint}", self.base_url);
        debug!("{method} {url}");
        retry_request(
            || {
                let mut req = self
                    .client
                    .request(method.clone(), &url)
                    .headers(headers.clone());
                if let Some(body) = body {
                    req = req.json(body);
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
        .with_context(|| format!("{method} {endpoint} failed"))
    }

    /// Start a response export and return its progress id.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or no id is returned.
    pub async fn start_export(&self, survey_id: &str, format: &str) -> Result<String> {
        let body = json!({ "format": format, "surveyId": survey_id });
        let value = self
            .request(Method::POST, "/responseexports", Some(&body))
            .await?;
        let result = &value["result"];
        let progress_id = result["progressId"]
            .as_str()
            .or_else(|| result["id"].as_str())
            .ok_or_else(|| anyhow!("Export response did not contain a progress id: {value}"))?;
        info!("Export started for survey {survey_id} (progress id {progress_id})");
        Ok(progress_id.to_string())
    }

    /// Check the progress of an export.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response has no status.
    pub async fn export_progress(&self, progress_id: &str) -> Result<ExportProgress> {
        let value = self
            .request(Method::GET, &format!("/responseexports/{progress_id}"), None)
            .await?;
        let result = &value["result"];
        let status = result["status"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Could not get status from progress response: {value}"))?;
        Ok(ExportProgress {
            status: status.to_string(),
            percent_complete: result["percentComplete"].as_f64().unwrap_or(0.0),
            file_id: result["fileId"]
                .as_str()
                .unwrap_or(progress_id)
                .to_string(),
        })
    }

    /// Poll an export until it completes and return the file id.
    ///
    /// # Errors
    ///
    /// Returns an error if the export fails, a poll request fails, or the
    /// export is still running after [`EXPORT_MAX_POLLS`] checks.
    pub async fn wait_for_export(&self, progress_id: &str) -> Result<String> {
        for _ in 0..EXPORT_MAX_POLLS {
            let progress = self.export_progress(progress_id).await?;
            info!(
                "Export status: {} ({:.0}% complete)",
                progress.status, progress.percent_complete
            );
            match progress.status.as_str() {
                "complete" => return Ok(progress.file_id),
                "failed" => bail!("Qualtrics reported the export {progress_id} as failed"),
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
        bail!("Export {progress_id} did not complete after {EXPORT_MAX_POLLS} checks")
    }

    /// Download the raw export file.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails.
    pub async fn download_export(&self, file_id: &str) -> Result<Vec<u8>> {
        let headers = self.headers()?;
        let url = format!("{}/responseexports/{file_id}/file", self.base_url);
        retry_request(
            || self.client.get(&url).headers(headers.clone()).send(),
            |response| async move {
                let response = check_status(response).await?;
                Ok(response
                    .bytes()
                    .await
                    .context("Failed to read export body")?
                    .to_vec())
            },
            self.policy,
        )
        .await
    }

    /// Run a full export: start, poll, download and extract into `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    pub async fn export_responses(
        &self,
        survey_id: &str,
        format: &str,
        output_dir: &Path,
        output_name: &str,
    ) -> Result<SavedExport> {
        let progress_id = self.start_export(survey_id, format).await?;
        let file_id = self.wait_for_export(&progress_id).await?;
        let bytes = self.download_export(&file_id).await?;
        save_export(&bytes, format, output_dir, output_name)
    }

    /// Set an embedded data field in the survey flow.
    ///
    /// Returns `Ok(false)` without writing anything if no `EmbeddedData`
    /// element declares the field.
    ///
    /// # Errors
    ///
    /// Returns an error if the flow cannot be fetched or the update is refused.
    pub async fn update_embedded_data(
        &self,
        survey_id: &str,
        field: &str,
        value: &str,
    ) -> Result<bool> {
        let flow_endpoint = format!("/survey-definitions/{survey_id}/flow");
        let response = self.request(Method::GET, &flow_endpoint, None).await?;
        let mut flow = response["result"]["Flow"]
            .as_array()
            .cloned()
            .ok_or_else(|| anyhow!("Survey flow response is missing 'result.Flow'"))?;
        info!("Found {} elements in the survey flow.", flow.len());

        let Some(element) = set_embedded_field(&mut flow, field, value) else {
            warn!("Embedded data field '{field}' not found in the survey flow.");
            return Ok(false);
        };
        let flow_id = element["FlowID"]
            .as_str()
            .ok_or_else(|| anyhow!("Embedded data element has no FlowID"))?
            .to_string();

        self.request(
            Method::PUT,
            &format!("{flow_endpoint}/{flow_id}"),
            Some(element),
        )
        .await?;
        info!("Updated {field} = {value} in element {flow_id}");
        Ok(true)
    }
}

/// Set `field` inside the first `EmbeddedData` flow element that declares it,
/// returning that element.
pub fn set_embedded_field<'a>(
    flow: &'a mut [Value],
    field: &str,
    value: &str,
) -> Option<&'a Value> {
    let index = flow.iter().position(|el| {
        el["Type"] == "EmbeddedData"
            && el["EmbeddedData"]
                .as_array()
                .is_some_and(|fields| fields.iter().any(|f| f["Field"] == field))
    })?;

    let element = &mut flow[index];
    if let Some(entry) = element["EmbeddedData"]
        .as_array_mut()
        .and_then(|fields| fields.iter_mut().find(|f| f["Field"] == field))
    {
        entry["Value"] = json!(value);
        entry["Type"] = json!("Custom");
    }
    Some(element)
}

/// Write a downloaded export to disk.
///
/// # Errors
///
/// Returns an error if the output directory or file cannot be written.
pub fn save_export(
    bytes: &[u8],
    format: &str,
    output_dir: &Path,
    output_name: &str,
) -> Result<SavedExport> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let Ok(mut archive) = zip::ZipArchive::new(Cursor::new(bytes)) else {
        warn!("Downloaded file is not a valid ZIP archive, saving raw content");
        let path = output_dir.join(format!("{output_name}_raw.{format}"));
        std::fs::write(&path, bytes)?;
        return Ok(SavedExport::Raw(path));
    };

    if archive.is_empty() {
        warn!("Downloaded archive is empty, keeping it for inspection");
        let path = output_dir.join(format!("{output_name}_archive.zip"));
        std::fs::write(&path, bytes)?;
        return Ok(SavedExport::Archive(path));
    }

    let suffix = format!(".{}", format.to_lowercase());
    let index = archive
        .file_names()
        .position(|name| name.to_lowercase().ends_with(&suffix));
    let index = index.unwrap_or_else(|| {
        warn!("Could not find a '.{format}' entry, extracting the first entry instead");
        0
    });

    let mut entry = archive
        .by_index(index)
        .context("Failed to read entry from export archive")?;
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;

    let path = output_dir.join(format!("{output_name}.{format}"));
    std::fs::write(&path, contents)?;
    info!("File extracted and saved to: {}", path.display());
    Ok(SavedExport::Extracted(path))
}

/// Parse a comma-separated list of numbers from the first line of some text,
/// dropping anything that is not purely digits.
#[must_use]
pub fn parse_occupation_numbers(text: &str) -> Vec<u32> {
    text.lines()
        .next()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Read the hidden occupation numbers file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_occupation_numbers(path: &Path) -> Result<Vec<u32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let numbers = parse_occupation_numbers(&text);
    if numbers.is_empty() && !text.trim().is_empty() {
        warn!(
            "{} contained no valid numbers, proceeding with an empty list",
            path.display()
        );
    }
    Ok(numbers)
}

#[must_use]
pub fn join_numbers(numbers: &[u32]) -> String {
    numbers
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
