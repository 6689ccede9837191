//! Command line tools for running a study on Qualtrics and Prolific.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use survey_common::completion_codes::{CompletionCategory, CompletionCodes};
use survey_common::prolific_api::{PROLIFIC_BASE_URL, ProlificClient};
use survey_common::qualtrics_api::{
    HIDDEN_OCCUPATION_FIELD, QualtricsClient, join_numbers, read_occupation_numbers,
};
use survey_common::review_plan::{
    ParticipantRow, action_counts, generate_review_plan, load_participant_flags,
    read_review_plan, save_review_plan,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Show additional output
    #[arg(short, long, global = true, env = "SURVEY_VERBOSE")]
    verbose: bool,
}

#[derive(Args, Debug)]
struct QualtricsArgs {
    /// Qualtrics API token
    #[arg(long, env = "QUALTRICS_API_TOKEN", hide_env_values = true)]
    qualtrics_token: String,

    /// Qualtrics data center, e.g. `iad1`
    #[arg(long, env = "QUALTRICS_DATA_CENTER")]
    data_center: String,

    /// Survey to work on
    #[arg(long, env = "QUALTRICS_SURVEY_ID")]
    survey_id: String,
}

#[derive(Args, Debug)]
struct ProlificArgs {
    /// Prolific API token
    #[arg(long, env = "PROLIFIC_API_TOKEN", hide_env_values = true)]
    prolific_token: String,

    /// The base API URL to connect to
    #[arg(long, default_value = PROLIFIC_BASE_URL, env = "PROLIFIC_API_BASE")]
    prolific_api_base: String,

    /// Study whose submissions are reviewed
    #[arg(long, env = "PROLIFIC_STUDY_ID")]
    study_id: String,
}

#[derive(Args, Debug)]
struct CodeArgs {
    #[arg(long, default_value = "C1G9PC0D", env = "CODE_APPROVED")]
    code_approved: String,
    #[arg(long, default_value = "C1NFUEQ1", env = "CODE_SCREENED_OUT")]
    code_screened_out: String,
    #[arg(long, default_value = "C1M8R1Y4", env = "CODE_FAILED_ATTENTION")]
    code_failed_attention: String,
    #[arg(long, default_value = "COISODYI", env = "CODE_NO_CONSENT")]
    code_no_consent: String,
}

impl CodeArgs {
    fn codes(&self) -> CompletionCodes {
        CompletionCodes {
            approved: self.code_approved.clone(),
            screened_out: self.code_screened_out.clone(),
            failed_attention: self.code_failed_attention.clone(),
            no_consent: self.code_no_consent.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download all survey responses
    ExportResponses {
        #[command(flatten)]
        qualtrics: QualtricsArgs,

        /// Export file format
        #[arg(long, default_value = "csv")]
        format: String,

        /// Directory the export is written to
        #[arg(long, default_value = ".", env = "QUALTRICS_OUTPUT_DIR")]
        output_dir: PathBuf,

        /// File name of the export, without extension
        #[arg(long, default_value = "qualtrics_responses")]
        name: String,
    },

    /// Write a list of occupation numbers into the survey's embedded data
    UpdateEmbeddedData {
        #[command(flatten)]
        qualtrics: QualtricsArgs,

        /// File whose first line is a comma-separated list of numbers
        #[arg(long, env = "OCCUPATION_NUMBERS_FILE")]
        numbers_file: PathBuf,

        /// Embedded data field to set
        #[arg(long, default_value = HIDDEN_OCCUPATION_FIELD)]
        field: String,
    },

    /// Work out the completion code every participant in a CSV should receive
    Classify {
        #[command(flatten)]
        codes: CodeArgs,

        /// CSV of participant flags
        #[arg(long)]
        participants: PathBuf,

        /// Write the result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Explain what a completion code means
    AnalyzeCode {
        #[command(flatten)]
        codes: CodeArgs,

        code: String,
    },

    /// Compare local decisions with Prolific and write a review plan
    ReviewPlan {
        #[command(flatten)]
        prolific: ProlificArgs,

        #[command(flatten)]
        codes: CodeArgs,

        /// CSV of participant flags
        #[arg(long)]
        participants: PathBuf,

        /// Where the plan is written
        #[arg(long, default_value = "review_plan.csv")]
        output: PathBuf,
    },

    /// Apply a review plan on Prolific (dry run unless --execute is given)
    ExecutePlan {
        #[command(flatten)]
        prolific: ProlificArgs,

        /// Plan produced by `review-plan`
        #[arg(long, default_value = "review_plan.csv")]
        plan: PathBuf,

        /// Actually send approvals, rejections and screen-outs
        #[arg(long)]
        execute: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ClassifiedParticipant {
    prolific_id: String,
    category: String,
    completion_code: String,
    reason: String,
}

/// Classify every participant, sorted by Prolific ID for stable output.
fn classify_participants(
    codes: &CompletionCodes,
    participants: &std::collections::HashMap<String, ParticipantRow>,
) -> Vec<ClassifiedParticipant> {
    let mut result: Vec<ClassifiedParticipant> = participants
        .iter()
        .map(|(id, row)| {
            let (category, reason) = codes.determine_completion_code(row);
            ClassifiedParticipant {
                prolific_id: id.clone(),
                category: category.map_or("MANUAL_REVIEW", CompletionCategory::name).to_string(),
                completion_code: category.map(|c| codes.code(c).to_string()).unwrap_or_default(),
                reason,
            }
        })
        .collect();
    result.sort_by(|a, b| a.prolific_id.cmp(&b.prolific_id));
    result
}

fn write_classified<W: std::io::Write>(rows: &[ClassifiedParticipant], writer: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn prolific_client(args: &ProlificArgs) -> Result<ProlificClient> {
    ProlificClient::new(&args.prolific_api_base, &args.prolific_token)
}

fn qualtrics_client(args: &QualtricsArgs) -> Result<QualtricsClient> {
    QualtricsClient::new(&args.data_center, &args.qualtrics_token)
}

async fn export_responses(
    qualtrics: &QualtricsArgs,
    format: &str,
    output_dir: &Path,
    name: &str,
) -> Result<()> {
    let client = qualtrics_client(qualtrics)?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Could not create {}", output_dir.display()))?;
    let saved = client
        .export_responses(&qualtrics.survey_id, format, output_dir, name)
        .await?;
    info!("Export saved to {}", saved.path().display());
    Ok(())
}

async fn update_embedded_data(
    qualtrics: &QualtricsArgs,
    numbers_file: &Path,
    field: &str,
) -> Result<()> {
    let numbers = read_occupation_numbers(numbers_file)?;
    if numbers.is_empty() {
        bail!("No occupation numbers found in {}", numbers_file.display());
    }
    info!("Read {} occupation numbers", numbers.len());

    let client = qualtrics_client(qualtrics)?;
    let updated = client
        .update_embedded_data(&qualtrics.survey_id, field, &join_numbers(&numbers))
        .await?;
    if !updated {
        bail!("Embedded data field '{field}' was not found in the survey flow");
    }
    info!("Updated '{field}' with {} numbers", numbers.len());
    Ok(())
}

async fn review_plan(
    prolific: &ProlificArgs,
    codes: &CompletionCodes,
    participants: &Path,
    output: &Path,
) -> Result<()> {
    let flags = load_participant_flags(participants)?;
    let client = prolific_client(prolific)?;
    let submissions = client.get_study_submissions(&prolific.study_id).await?;
    info!("Fetched {} submissions", submissions.len());

    let (plan, summary) = generate_review_plan(&submissions, &flags, codes);
    save_review_plan(&plan, output)?;

    info!(
        "Validation: {} matches, {} mismatches, {} csv only, {} code only, {} neither",
        summary.matches, summary.mismatches, summary.csv_only, summary.code_only, summary.neither
    );
    for (action, count) in action_counts(&plan) {
        info!("  {action:?}: {count}");
    }
    if summary.mismatches > 0 {
        warn!("Review the mismatched rows in {} before executing", output.display());
    }
    info!("Review plan saved to {}", output.display());
    Ok(())
}

async fn execute_plan(prolific: &ProlificArgs, plan_path: &Path, execute: bool) -> Result<()> {
    let plan = read_review_plan(plan_path)?;
    let client = prolific_client(prolific)?;
    if !execute {
        warn!("Dry run: nothing will be sent. Pass --execute to apply the plan.");
    }
    let summary = client
        .execute_review_plan(&prolific.study_id, &plan, !execute)
        .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.failed > 0 {
        bail!("{} actions failed", summary.failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.command {
        Command::ExportResponses {
            qualtrics,
            format,
            output_dir,
            name,
        } => export_responses(&qualtrics, &format, &output_dir, &name).await,
        Command::UpdateEmbeddedData {
            qualtrics,
            numbers_file,
            field,
        } => update_embedded_data(&qualtrics, &numbers_file, &field).await,
        Command::Classify {
            codes,
            participants,
            output,
        } => {
            let flags = load_participant_flags(&participants)?;
            let rows = classify_participants(&codes.codes(), &flags);
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Could not create {}", path.display()))?;
                    write_classified(&rows, file)?;
                    info!("Classified {} participants into {}", rows.len(), path.display());
                    Ok(())
                }
                None => write_classified(&rows, std::io::stdout()),
            }
        }
        Command::AnalyzeCode { codes, code } => {
            let analysis = codes.codes().analyze(code.trim());
            println!("{}", serde_json::to_string_pretty(&analysis)?);
            Ok(())
        }
        Command::ReviewPlan {
            prolific,
            codes,
            participants,
            output,
        } => review_plan(&prolific, &codes.codes(), &participants, &output).await,
        Command::ExecutePlan {
            prolific,
            plan,
            execute,
        } => execute_plan(&prolific, &plan, execute).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn row(pairs: &[(&str, &str)]) -> ParticipantRow {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test_log::test]
    fn test_classify_participants() {
        let codes = CompletionCodes::default();
        let mut participants = HashMap::new();
        participants.insert("p2".to_string(), row(&[("no_consent", "TRUE")]));
        participants.insert("p1".to_string(), row(&[("completed_survey", "true")]));
        participants.insert("p3".to_string(), row(&[]));

        let rows = classify_participants(&codes, &participants);
        assert_eq!(rows[0].prolific_id, "p1");
        assert_eq!(rows[0].category, "APPROVED");
        assert_eq!(rows[0].completion_code, codes.approved);
        assert_eq!(rows[1].category, "NO_CONSENT");
        assert_eq!(rows[2].category, "MANUAL_REVIEW");
        assert_eq!(rows[2].completion_code, "");

        let mut out = Vec::new();
        write_classified(&rows, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("prolific_id,category,completion_code,reason"));
    }

    #[test]
    fn test_cli_parses_execute_plan() {
        let cli = Cli::try_parse_from([
            "survey_client",
            "execute-plan",
            "--prolific-token",
            "abc",
            "--study-id",
            "s1",
        ])
        .unwrap();
        match cli.command {
            Command::ExecutePlan { execute, plan, .. } => {
                assert!(!execute);
                assert_eq!(plan, PathBuf::from("review_plan.csv"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
