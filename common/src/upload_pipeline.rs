//! Spreadsheet rows to uploaded PDFs, followed by a Latin-square reordering
//! of the model responses.

use crate::html_pdf::{PdfRenderer, prepare_document};
use crate::latin_square::{
    BalanceReport, apply_model_randomization, generate_latin_square_orders, verify_balance,
    write_summary,
};
use crate::spreadsheet::{Row, save_csv};
use crate::task_ids::{TaskRow, precompute_ids};
use crate::{DEFAULT_MODEL_NAMES, MODEL_COLUMNS, RetryPolicy};
use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::future::join_all;
use log::{error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::Semaphore;

pub const BATCH_SIZE: usize = 50;
pub const MAX_CONCURRENT_UPLOADS: usize = 20;
pub const SAVE_INTERVAL: usize = 50;

/// Column order of every output table.
pub const OUTPUT_COLUMNS: [&str; 11] = [
    "occupation_id",
    "task_id",
    "Job",
    "Task",
    "order_models",
    "Question",
    "model1",
    "model2",
    "model3",
    "model4",
    "model5",
];

/// Somewhere rendered files can be stored and shared from.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `name`, replacing any existing object, and return a shareable URL.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    /// Display name of the model behind each of `model1..model5`.
    pub model_names: Vec<String>,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub save_interval: usize,
    pub retry: RetryPolicy,
    pub progress_file: String,
    pub randomized_file: String,
    pub summary_file: String,
    /// Fixes the Latin-square shuffle, mostly for reproducible reruns.
    pub seed: Option<u64>,
}

impl PipelineConfig {
    #[must_use]
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            model_names: DEFAULT_MODEL_NAMES.iter().map(|s| (*s).to_string()).collect(),
            batch_size: BATCH_SIZE,
            max_concurrent: MAX_CONCURRENT_UPLOADS,
            save_interval: SAVE_INTERVAL,
            retry: RetryPolicy::default(),
            progress_file: "task_urls.csv".to_string(),
            randomized_file: "task_urls_randomized.csv".to_string(),
            summary_file: "randomization_summary.txt".to_string(),
            seed: None,
        }
    }

    fn model_name_refs(&self) -> Vec<&str> {
        self.model_names.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub processed: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub progress_path: PathBuf,
    pub randomized_path: Option<PathBuf>,
    pub balance: Option<BalanceReport>,
}

/// Name of the uploaded PDF for one cell.
#[must_use]
pub fn pdf_file_name(task_id: &str, column: &str, model_names: &[String]) -> String {
    if column == "Question" {
        return format!("{task_id}.pdf");
    }
    if let Some(i) = MODEL_COLUMNS.iter().position(|c| *c == column) {
        let name = model_names.get(i).map_or(column, String::as_str);
        return format!("{task_id}_model={name}.pdf");
    }
    format!("{task_id}_{column}.pdf")
}

/// Store a file, retrying with exponential backoff.
///
/// # Errors
///
/// Returns the last error once every attempt has failed.
pub async fn upload_with_retry(
    store: &dyn ObjectStore,
    name: &str,
    bytes: Vec<u8>,
    policy: RetryPolicy,
) -> Result<String> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match store.put(name, bytes.clone()).await {
            Ok(url) => return Ok(url),
            Err(e) if attempts < policy.max_retries => {
                let sleep = policy.backoff(attempts);
                warn!("Upload attempt {attempts} failed for {name}, retrying in {sleep:?}: {e:#}");
                tokio::time::sleep(sleep).await;
            }
            Err(e) => {
                error!("Failed to upload {name} after {attempts} attempts: {e:#}");
                return Err(e);
            }
        }
    }
}

async fn process_column(
    task: &TaskRow,
    column: &str,
    content: &str,
    renderer: &dyn PdfRenderer,
    store: &dyn ObjectStore,
    config: &PipelineConfig,
) -> Option<String> {
    let html = prepare_document(content)?;
    let pdf = match renderer.render(&html).await {
        Ok(pdf) => pdf,
        Err(e) => {
            error!("Error generating PDF for {}_{column}: {e:#}", task.task_id);
            return None;
        }
    };
    let name = pdf_file_name(&task.task_id, column, &config.model_names);
    upload_with_retry(store, &name, pdf, config.retry).await.ok()
}

async fn process_task(
    task: &TaskRow,
    renderer: &dyn PdfRenderer,
    store: &dyn ObjectStore,
    config: &PipelineConfig,
    semaphore: &Semaphore,
) -> (Row, usize) {
    let mut row = Row::new();
    row.insert("occupation_id".to_string(), task.occupation_id.clone());
    row.insert("task_id".to_string(), task.task_id.clone());
    row.insert("Job".to_string(), task.job.clone());
    row.insert("Task".to_string(), task.task.clone());
    if !task.order_models.is_empty() {
        row.insert("order_models".to_string(), task.order_models.clone());
    }

    let Ok(_permit) = semaphore.acquire().await else {
        return (row, task.content.len());
    };

    let urls = join_all(task.content.iter().map(|(column, content)| {
        process_column(task, column, content, renderer, store, config)
    }))
    .await;

    let mut failed = 0;
    for ((column, _), url) in task.content.iter().zip(urls) {
        match url {
            Some(url) => {
                row.insert(column.clone(), url);
            }
            None => failed += 1,
        }
    }
    (row, failed)
}

fn save_progress(config: &PipelineConfig, rows: &[Row]) -> Result<PathBuf> {
    let path = config.output_dir.join(&config.progress_file);
    save_csv(&path, &OUTPUT_COLUMNS, rows)?;
    info!("Saved progress: {} rows to {}", rows.len(), path.display());
    Ok(path)
}

/// Write the Latin-square randomized table and its summary.
///
/// # Errors
///
/// Returns an error if the orders cannot be generated or the files cannot be written.
pub fn save_randomized_output(
    config: &PipelineConfig,
    rows: &[Row],
) -> Result<(PathBuf, BalanceReport)> {
    let models = config.model_name_refs();
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };

    let orders = generate_latin_square_orders(&models, rows.len(), &mut rng)?;
    let mut randomized = rows.to_vec();
    apply_model_randomization(&mut randomized, &models, &orders)?;

    let order_strings: Vec<String> = orders.iter().map(|o| o.join(",")).collect();
    let balance = verify_balance(&order_strings, &models);

    let path = config.output_dir.join(&config.randomized_file);
    save_csv(&path, &OUTPUT_COLUMNS, &randomized)?;
    write_summary(
        &config.output_dir.join(&config.summary_file),
        &models,
        &balance,
    )?;
    info!(
        "Saved randomized output: {} rows to {}",
        randomized.len(),
        path.display()
    );
    Ok((path, balance))
}

/// Render and upload every content cell, saving progress as batches finish,
/// then write the randomized table.
///
/// # Errors
///
/// Returns an error if the configuration is unusable or an output file cannot
/// be written. Individual upload failures are logged and counted.
pub async fn run_pipeline(
    rows: &[Row],
    renderer: &dyn PdfRenderer,
    store: &dyn ObjectStore,
    config: &PipelineConfig,
) -> Result<PipelineReport> {
    if config.batch_size == 0 || config.max_concurrent == 0 {
        bail!("batch size and concurrency must be positive");
    }
    if config.model_names.len() != MODEL_COLUMNS.len() {
        bail!(
            "{} model names configured, expected {}",
            config.model_names.len(),
            MODEL_COLUMNS.len()
        );
    }
    std::fs::create_dir_all(&config.output_dir)?;

    let start = Instant::now();
    let tasks = precompute_ids(rows);
    let total = tasks.len();
    let total_batches = total.div_ceil(config.batch_size);
    let semaphore = Semaphore::new(config.max_concurrent);

    let mut results: Vec<Row> = Vec::with_capacity(total);
    let mut uploaded = 0;
    let mut failed = 0;

    for (batch_index, batch) in tasks.chunks(config.batch_size).enumerate() {
        let batch_start = Instant::now();
        info!("Processing batch {}/{total_batches}", batch_index + 1);

        let batch_results = join_all(
            batch
                .iter()
                .map(|task| process_task(task, renderer, store, config, &semaphore)),
        )
        .await;

        for (task, (row, task_failed)) in batch.iter().zip(batch_results) {
            uploaded += task.content.len() - task_failed;
            failed += task_failed;
            results.push(row);
        }

        info!(
            "Batch completed in {:.2} seconds. Processed: {}/{total}",
            batch_start.elapsed().as_secs_f64(),
            results.len()
        );
        if config.save_interval > 0 && results.len() % config.save_interval == 0 {
            save_progress(config, &results)?;
        }
    }

    info!("Saving final results...");
    let progress_path = save_progress(config, &results)?;

    let (randomized_path, balance) = if results.is_empty() {
        (None, None)
    } else {
        let (path, balance) = save_randomized_output(config, &results)?;
        (Some(path), Some(balance))
    };

    info!(
        "Processing completed in {:.2} seconds: {total} tasks, {uploaded} files uploaded, {failed} failed",
        start.elapsed().as_secs_f64()
    );
    Ok(PipelineReport {
        processed: total,
        uploaded,
        failed,
        progress_path,
        randomized_path,
        balance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spreadsheet::read_sheet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoRenderer;

    #[async_trait]
    impl PdfRenderer for EchoRenderer {
        async fn render(&self, html: &str) -> Result<Vec<u8>> {
            if html.contains("BROKEN") {
                bail!("render failed");
            }
            Ok(html.as_bytes().to_vec())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        names: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String> {
            assert!(!bytes.is_empty());
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("transient failure");
            }
            self.names.lock().unwrap().push(name.to_string());
            Ok(format!("https://store/{name}"))
        }
    }

    fn fast_config(dir: &std::path::Path) -> PipelineConfig {
        let mut config = PipelineConfig::new(dir.to_path_buf());
        config.batch_size = 2;
        config.retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        };
        config.seed = Some(42);
        config
    }

    fn task_row(job: &str, task: &str) -> Row {
        let mut row: Row = [
            ("Job".to_string(), job.to_string()),
            ("Task".to_string(), task.to_string()),
            ("Question".to_string(), format!("<p>{job} {task}</p>")),
        ]
        .into_iter()
        .collect();
        for col in MODEL_COLUMNS {
            row.insert(col.to_string(), format!("<p>{col}</p>"));
        }
        row
    }

    #[test]
    fn test_pdf_file_name() {
        let names: Vec<String> = DEFAULT_MODEL_NAMES.iter().map(|s| (*s).to_string()).collect();
        assert_eq!(pdf_file_name("task_001_01_1", "Question", &names), "task_001_01_1.pdf");
        assert_eq!(
            pdf_file_name("task_001_01_1", "model2", &names),
            "task_001_01_1_model=Claude_3_Opus.pdf"
        );
        assert_eq!(
            pdf_file_name("task_001_01_1", "extra", &names),
            "task_001_01_1_extra.pdf"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_retries_then_succeeds() {
        let store = MemoryStore {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        };
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        };
        let url = upload_with_retry(&store, "a.pdf", vec![1], policy).await.unwrap();
        assert_eq!(url, "https://store/a.pdf");

        let store = MemoryStore {
            failures_left: AtomicUsize::new(3),
            ..Default::default()
        };
        assert!(upload_with_retry(&store, "a.pdf", vec![1], policy).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_run_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast_config(dir.path());

        let mut rows = vec![
            task_row("Nurse", "Triage"),
            task_row("Nurse", "Triage"),
            task_row("Pilot", "Landing"),
        ];
        rows[2].insert("model3".to_string(), "BROKEN".to_string());
        rows[1].remove("model5");

        let store = MemoryStore::default();
        let report = run_pipeline(&rows, &EchoRenderer, &store, &config)
            .await
            .unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.uploaded, 16);
        assert_eq!(report.failed, 1);
        assert!(
            store
                .names
                .lock()
                .unwrap()
                .contains(&"task_002_01_1_model=GPT_4o_2025.pdf".to_string())
        );

        let progress = read_sheet(&report.progress_path, "Sheet1").unwrap();
        assert_eq!(progress.headers, OUTPUT_COLUMNS.to_vec());
        assert_eq!(progress.rows.len(), 3);
        assert_eq!(progress.rows[1]["task_id"], "task_001_01_2");
        assert_eq!(
            progress.rows[0]["model1"],
            "https://store/task_001_01_1_model=GPT_4o_2025.pdf"
        );
        assert!(!progress.rows[2].contains_key("model3"));

        let randomized = read_sheet(report.randomized_path.as_ref().unwrap(), "Sheet1").unwrap();
        let first = &randomized.rows[0];
        let order: Vec<&str> = first["order_models"].split(',').collect();
        assert_eq!(order.len(), 5);
        assert_eq!(
            first["model1"],
            format!("https://store/task_001_01_1_model={}.pdf", order[0])
        );
        assert!(dir.path().join("randomization_summary.txt").exists());
    }

    #[test_log::test(tokio::test)]
    async fn test_wrong_model_count_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path());
        config.model_names.pop();
        let store = MemoryStore::default();
        assert!(run_pipeline(&[], &EchoRenderer, &store, &config).await.is_err());
    }
}
