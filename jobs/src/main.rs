//! Batch jobs: render task spreadsheets to PDFs, upload them to Dropbox and
//! build the Latin-square randomized URL table.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use survey_common::DEFAULT_MODEL_NAMES;
use survey_common::dropbox_api::{DropboxClient, DropboxFolder};
use survey_common::html_pdf::WkHtmlToPdf;
use survey_common::spreadsheet::read_sheet;
use survey_common::upload_pipeline::{
    BATCH_SIZE, MAX_CONCURRENT_UPLOADS, PipelineConfig, run_pipeline, save_randomized_output,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Show additional output
    #[arg(short, long, global = true, env = "SURVEY_VERBOSE")]
    verbose: bool,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Directory for the URL tables and randomization summary
    #[arg(long, default_value = ".", env = "OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Comma-separated display names of the models behind model1..model5
    #[arg(long, value_delimiter = ',', env = "MODEL_NAMES")]
    model_names: Vec<String>,

    /// Seed for the Latin-square shuffle
    #[arg(long, env = "RANDOMIZATION_SEED")]
    seed: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render every content cell to PDF, upload it and record the shared links
    Upload {
        /// Task spreadsheet (xlsx or csv)
        #[arg(long, env = "INPUT_FILE")]
        input: PathBuf,

        /// Worksheet to read from a workbook
        #[arg(long, default_value = "Sheet1", env = "INPUT_SHEET")]
        sheet: String,

        /// Dropbox access token
        #[arg(long, env = "DROPBOX_ACCESS_TOKEN", hide_env_values = true)]
        dropbox_token: String,

        /// Dropbox folder the PDFs are uploaded to
        #[arg(long, default_value = "/task_pdfs", env = "DROPBOX_FOLDER")]
        dropbox_folder: String,

        /// Path of the wkhtmltopdf binary
        #[arg(long, default_value = "wkhtmltopdf", env = "WKHTMLTOPDF")]
        wkhtmltopdf: String,

        /// Rows processed per batch
        #[arg(long, default_value_t = BATCH_SIZE)]
        batch_size: usize,

        /// Uploads in flight at once
        #[arg(long, default_value_t = MAX_CONCURRENT_UPLOADS)]
        max_concurrent: usize,

        /// Only process the first N rows
        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Rebuild the randomized table from an existing URL table
    Randomize {
        /// URL table written by `upload` (xlsx or csv)
        #[arg(long, default_value = "task_urls.csv")]
        input: PathBuf,

        /// Worksheet to read from a workbook
        #[arg(long, default_value = "Sheet1", env = "INPUT_SHEET")]
        sheet: String,

        #[command(flatten)]
        output: OutputArgs,
    },
}

fn pipeline_config(output: &OutputArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::new(output.output_dir.clone());
    if !output.model_names.is_empty() {
        if output.model_names.len() != DEFAULT_MODEL_NAMES.len() {
            bail!(
                "expected {} model names, got {}",
                DEFAULT_MODEL_NAMES.len(),
                output.model_names.len()
            );
        }
        config.model_names = output.model_names.iter().map(|m| m.trim().to_string()).collect();
    }
    config.seed = output.seed;
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Could not create {}", config.output_dir.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.command {
        Command::Upload {
            input,
            sheet,
            dropbox_token,
            dropbox_folder,
            wkhtmltopdf,
            batch_size,
            max_concurrent,
            limit,
            output,
        } => {
            let mut config = pipeline_config(&output)?;
            config.batch_size = batch_size;
            config.max_concurrent = max_concurrent;

            let mut rows = read_sheet(&input, &sheet)?.rows;
            info!("Read {} rows from {}", rows.len(), input.display());
            if let Some(limit) = limit {
                rows.truncate(limit);
                info!("Limited to the first {} rows", rows.len());
            }

            let client = DropboxClient::new(&dropbox_token)?;
            let account = client.verify_connection().await?;
            info!("Connected to Dropbox as {account}");
            let store = DropboxFolder::new(client, &dropbox_folder);
            let renderer = WkHtmlToPdf {
                binary: wkhtmltopdf,
            };

            let report = run_pipeline(&rows, &renderer, &store, &config).await?;
            info!(
                "Processed {} rows: {} files uploaded, {} failed",
                report.processed, report.uploaded, report.failed
            );
            info!("URL table: {}", report.progress_path.display());
            if let Some(path) = &report.randomized_path {
                info!("Randomized table: {}", path.display());
            }
            if report.failed > 0 {
                warn!("Some files failed to upload; rerun to retry them");
            }
            Ok(())
        }
        Command::Randomize {
            input,
            sheet,
            output,
        } => {
            let config = pipeline_config(&output)?;
            let rows = read_sheet(&input, &sheet)?.rows;
            let (path, balance) = save_randomized_output(&config, &rows)?;
            info!(
                "Randomized {} rows into {} (balanced: {})",
                balance.total_rows,
                path.display(),
                balance.balanced
            );
            Ok(())
        }
    }
}
