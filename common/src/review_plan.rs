//! Reconcile a local CSV of participant decisions against the submissions recorded on Prolific.
//!
//! The remote completion code is trusted; the local CSV is used to flag disagreements
//! so they can be reviewed before anything is approved or rejected.

use crate::ProlificSubmission;
use crate::completion_codes::{CompletionCategory, CompletionCodes};
use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;

pub const CSV_COLUMN_PROLIFIC_ID: &str = "prolific_id";
pub const CSV_COLUMN_STATUS: &str = "status";

/// Rows that repeat the header or carry example labels rather than a participant.
const HEADER_LIKE_IDS: [&str; 3] = ["PROLIFIC_ID", "ATTN CHECKS", "NO CONSENT"];

/// A participant's row from the local CSV, keyed by column name.
pub type ParticipantRow = HashMap<String, String>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Match,
    Mismatch,
    CsvOnly,
    CodeOnly,
    Neither,
    NoCsvData,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposedAction {
    Approve,
    Reject,
    ScreenOut,
    ApproveNoCode,
    RejectNoCode,
    ScreenOutNoCode,
    ApproveNoLocalData,
    ManualReviewMismatch,
    ManualReviewNoLocalDecision,
    ManualReviewNoData,
    ManualReviewNoLocalData,
    /// The local status is present but not one of the recognised decisions.
    NoAction,
}

/// One line of the review plan, in output column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPlanRow {
    pub prolific_submission_id: String,
    pub prolific_participant_id: String,
    pub current_prolific_status: String,
    pub actual_completion_code: String,
    pub local_status: String,
    pub local_reason: String,
    pub local_category: String,
    pub validation_status: ValidationStatus,
    pub proposed_action: ProposedAction,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub matches: usize,
    pub mismatches: usize,
    pub csv_only: usize,
    pub code_only: usize,
    pub neither: usize,
}

fn cell(row: &ParticipantRow, column: &str) -> String {
    row.get(column).map(|v| v.trim().to_string()).unwrap_or_default()
}

/// Load participant decisions from a CSV reader.
/// Returns a map from Prolific ID to the full CSV row; the first row for an ID wins.
///
/// # Errors
///
/// Returns an error if the CSV cannot be parsed or lacks the required columns.
pub fn load_participant_flags_from_reader<R: io::Read>(
    reader: R,
) -> Result<HashMap<String, ParticipantRow>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader.headers().context("Could not read CSV header")?.clone();

    let required = [CSV_COLUMN_PROLIFIC_ID, CSV_COLUMN_STATUS];
    if !required.iter().all(|col| headers.iter().any(|h| h == *col)) {
        bail!(
            "CSV file must contain columns: {required:?}. Found columns: {:?}",
            headers.iter().collect::<Vec<_>>()
        );
    }

    let mut participant_data = HashMap::new();
    for (row_num, record) in reader.records().enumerate() {
        let row_num = row_num + 1;
        let record = record.with_context(|| format!("Could not parse CSV row {row_num}"))?;
        // short rows leave trailing columns empty, surplus fields are dropped
        let row: ParticipantRow = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();
        let prolific_id = cell(&row, CSV_COLUMN_PROLIFIC_ID);

        if prolific_id.is_empty() {
            warn!("Skipping row {row_num} due to missing '{CSV_COLUMN_PROLIFIC_ID}'.");
            continue;
        }
        if HEADER_LIKE_IDS.contains(&prolific_id.to_uppercase().as_str()) {
            info!("Skipping header/example row {row_num}: {prolific_id}");
            continue;
        }

        participant_data.entry(prolific_id).or_insert(row);
    }

    info!(
        "Successfully loaded {} participant records.",
        participant_data.len()
    );
    Ok(participant_data)
}

/// Load participant decisions from a CSV file on disk.
///
/// # Errors
///
/// Returns an error if the file is missing or malformed.
pub fn load_participant_flags(path: &Path) -> Result<HashMap<String, ParticipantRow>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("CSV file not found at {}", path.display()))?;
    load_participant_flags_from_reader(file)
        .with_context(|| format!("Could not read CSV file {}", path.display()))
}

/// Does the code Prolific recorded agree with the local decision?
/// Codes are resolved through the configured table first, then by category name.
fn code_agrees_with_status(codes: &CompletionCodes, code: &str, local_status: &str) -> bool {
    use CompletionCategory::{Approved, FailedAttention, NoConsent, ScreenedOut};

    let category = codes
        .category_of(code)
        .or_else(|| CompletionCategory::from_name(code));
    match category {
        Some(Approved) => local_status == "APPROVED",
        Some(FailedAttention) => local_status == "REJECTED",
        Some(NoConsent | ScreenedOut) => matches!(local_status, "SCREENED-OUT" | "REJECTED"),
        None => code == "TIMEOUT" && local_status == "REJECTED",
    }
}

/// Build the plan for every submission and tally how local and remote decisions compare.
#[must_use]
pub fn generate_review_plan(
    submissions: &[ProlificSubmission],
    participant_data: &HashMap<String, ParticipantRow>,
    codes: &CompletionCodes,
) -> (Vec<ReviewPlanRow>, ValidationSummary) {
    let mut summary = ValidationSummary::default();
    let mut plan = Vec::with_capacity(submissions.len());

    for sub in submissions {
        let actual_code = sub.study_code.trim().to_string();
        let mut local_status = String::new();
        let mut local_reason = String::new();
        let mut local_category = String::new();
        let mut notes = String::new();

        let (validation_status, proposed_action) =
            if let Some(row) = participant_data.get(&sub.participant_id) {
                local_status = cell(row, "status");
                local_reason = cell(row, "reason");
                local_category = cell(row, "category");

                match (actual_code.is_empty(), local_status.is_empty()) {
                    (false, false) => {
                        if code_agrees_with_status(codes, &actual_code, &local_status) {
                            summary.matches += 1;
                            let action = match local_status.as_str() {
                                "APPROVED" => ProposedAction::Approve,
                                "REJECTED" => ProposedAction::Reject,
                                _ => ProposedAction::ScreenOut,
                            };
                            (ValidationStatus::Match, action)
                        } else {
                            summary.mismatches += 1;
                            notes = format!(
                                "Local analysis: {local_status} but Qualtrics code: {actual_code}"
                            );
                            (
                                ValidationStatus::Mismatch,
                                ProposedAction::ManualReviewMismatch,
                            )
                        }
                    }
                    (false, true) => {
                        summary.code_only += 1;
                        notes = "Qualtrics assigned code but no local decision found".to_string();
                        (
                            ValidationStatus::CodeOnly,
                            ProposedAction::ManualReviewNoLocalDecision,
                        )
                    }
                    (true, false) => {
                        summary.csv_only += 1;
                        notes = "Local decision exists but no completion code from Qualtrics"
                            .to_string();
                        let action = match local_status.as_str() {
                            "APPROVED" => ProposedAction::ApproveNoCode,
                            "REJECTED" => ProposedAction::RejectNoCode,
                            "SCREENED-OUT" => ProposedAction::ScreenOutNoCode,
                            _ => ProposedAction::NoAction,
                        };
                        (ValidationStatus::CsvOnly, action)
                    }
                    (true, true) => {
                        summary.neither += 1;
                        notes = "No completion code and no local decision".to_string();
                        (ValidationStatus::Neither, ProposedAction::ManualReviewNoData)
                    }
                }
            } else {
                info!(
                    "P_ID {} (Sub {}) not found in local data.",
                    sub.participant_id, sub.id
                );
                if actual_code.is_empty() {
                    (
                        ValidationStatus::NoCsvData,
                        ProposedAction::ManualReviewNoLocalData,
                    )
                } else {
                    notes = "Using completion code (participant not in local data)".to_string();
                    (
                        ValidationStatus::NoCsvData,
                        ProposedAction::ApproveNoLocalData,
                    )
                }
            };

        plan.push(ReviewPlanRow {
            prolific_submission_id: sub.id.clone(),
            prolific_participant_id: sub.participant_id.clone(),
            current_prolific_status: sub.status.clone(),
            actual_completion_code: actual_code,
            local_status,
            local_reason,
            local_category,
            validation_status,
            proposed_action,
            notes,
        });
    }

    (plan, summary)
}

/// Count how many rows propose each action.
#[must_use]
pub fn action_counts(plan: &[ReviewPlanRow]) -> BTreeMap<ProposedAction, usize> {
    let mut counts = BTreeMap::new();
    for row in plan {
        *counts.entry(row.proposed_action).or_insert(0) += 1;
    }
    counts
}

/// Write the review plan as CSV.
///
/// # Errors
///
/// Returns an error if the writer fails.
pub fn write_review_plan<W: io::Write>(plan: &[ReviewPlanRow], writer: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in plan {
        writer.serialize(row).context("Could not serialize review plan row")?;
    }
    writer.flush().context("Could not flush review plan")?;
    Ok(())
}

/// Write the review plan to a CSV file.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn save_review_plan(plan: &[ReviewPlanRow], path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Could not save review plan to CSV at {}", path.display()))?;
    write_review_plan(plan, file)
}

/// Read a previously saved review plan.
///
/// # Errors
///
/// Returns an error if the file is missing or malformed.
pub fn read_review_plan(path: &Path) -> Result<Vec<ReviewPlanRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Could not open review plan {}", path.display()))?;
    reader
        .deserialize()
        .collect::<Result<Vec<ReviewPlanRow>, csv::Error>>()
        .context("Could not parse review plan")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(id: &str, participant: &str, code: &str, started: &str) -> ProlificSubmission {
        ProlificSubmission {
            id: id.to_string(),
            participant_id: participant.to_string(),
            status: "AWAITING REVIEW".to_string(),
            study_code: code.to_string(),
            started_at: started.to_string(),
        }
    }

    const LOCAL_CSV: &str = "\
prolific_id,status,reason,category
PROLIFIC_ID,status,,
p1,APPROVED,ok,good
p2,REJECTED,attention,bad
,APPROVED,,
p3,SCREENED-OUT,occupation,screen
p4,,,
p5,APPROVED,,
p1,REJECTED,duplicate,dup
";

    #[test_log::test]
    fn test_load_participant_flags() {
        let data = load_participant_flags_from_reader(LOCAL_CSV.as_bytes()).unwrap();
        assert_eq!(data.len(), 5);
        assert!(!data.contains_key("PROLIFIC_ID"));
        assert_eq!(data["p1"]["status"], "APPROVED");
    }

    #[test_log::test]
    fn test_load_tolerates_ragged_rows() {
        let csv = "prolific_id,status,reason
p1,APPROVED
p2,REJECTED,late,extra
p3,SCREENED-OUT,x
";
        let data = load_participant_flags_from_reader(csv.as_bytes()).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data["p1"]["status"], "APPROVED");
        assert!(!data["p1"].contains_key("reason"));
        assert_eq!(data["p2"]["reason"], "late");
        assert_eq!(data["p3"]["status"], "SCREENED-OUT");
    }

    #[test_log::test]
    fn test_load_requires_columns() {
        let result = load_participant_flags_from_reader("prolific_id,reason\np1,x\n".as_bytes());
        assert!(result.is_err());
    }

    #[test_log::test]
    fn test_generate_review_plan() {
        let codes = CompletionCodes::default();
        let data = load_participant_flags_from_reader(LOCAL_CSV.as_bytes()).unwrap();
        let submissions = vec![
            submission("s1", "p1", "C1G9PC0D", "1"),
            submission("s2", "p2", "C1M8R1Y4", "2"),
            submission("s3", "p3", "C1G9PC0D", "3"),
            submission("s4", "p4", "C1NFUEQ1", "4"),
            submission("s5", "p5", "", "5"),
            submission("s6", "p6", "C1G9PC0D", "6"),
            submission("s7", "p7", "", "7"),
        ];

        let (plan, summary) = generate_review_plan(&submissions, &data, &codes);

        assert_eq!(
            summary,
            ValidationSummary {
                matches: 2,
                mismatches: 1,
                csv_only: 1,
                code_only: 1,
                neither: 0,
            }
        );
        let actions: Vec<ProposedAction> = plan.iter().map(|r| r.proposed_action).collect();
        assert_eq!(
            actions,
            vec![
                ProposedAction::Approve,
                ProposedAction::Reject,
                ProposedAction::ManualReviewMismatch,
                ProposedAction::ManualReviewNoLocalDecision,
                ProposedAction::ApproveNoCode,
                ProposedAction::ApproveNoLocalData,
                ProposedAction::ManualReviewNoLocalData,
            ]
        );
        assert_eq!(
            plan[2].notes,
            "Local analysis: SCREENED-OUT but Qualtrics code: C1G9PC0D"
        );
        assert_eq!(plan[6].validation_status, ValidationStatus::NoCsvData);
    }

    #[test_log::test]
    fn test_category_names_and_timeout_are_accepted() {
        let codes = CompletionCodes::default();
        assert!(code_agrees_with_status(&codes, "NO_CONSENT", "REJECTED"));
        assert!(code_agrees_with_status(&codes, "SCREENED_OUT", "SCREENED-OUT"));
        assert!(code_agrees_with_status(&codes, "TIMEOUT", "REJECTED"));
        assert!(!code_agrees_with_status(&codes, "TIMEOUT", "APPROVED"));
        assert!(!code_agrees_with_status(&codes, "C1M8R1Y4", "SCREENED-OUT"));
    }

    #[test_log::test]
    fn test_write_and_count_plan() {
        let codes = CompletionCodes::default();
        let data = load_participant_flags_from_reader(LOCAL_CSV.as_bytes()).unwrap();
        let submissions = vec![
            submission("s1", "p1", "C1G9PC0D", "1"),
            submission("s5", "p5", "", "2"),
            submission("s9", "p9", "", "3"),
        ];
        let (plan, _) = generate_review_plan(&submissions, &data, &codes);

        let mut out = Vec::new();
        write_review_plan(&plan, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "prolific_submission_id,prolific_participant_id,current_prolific_status,actual_completion_code,local_status,local_reason,local_category,validation_status,proposed_action,notes"
        );
        assert!(lines.next().unwrap().contains("MATCH,APPROVE,"));

        let counts = action_counts(&plan);
        assert_eq!(counts[&ProposedAction::Approve], 1);
        assert_eq!(counts[&ProposedAction::ApproveNoCode], 1);
        assert_eq!(counts[&ProposedAction::ManualReviewNoLocalData], 1);
    }

    #[test_log::test]
    fn test_saved_plan_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.csv");
        let codes = CompletionCodes::default();
        let data = load_participant_flags_from_reader(LOCAL_CSV.as_bytes()).unwrap();
        let (plan, _) =
            generate_review_plan(&[submission("s2", "p2", "C1M8R1Y4", "1")], &data, &codes);

        save_review_plan(&plan, &path).unwrap();
        assert_eq!(read_review_plan(&path).unwrap(), plan);
    }
}
