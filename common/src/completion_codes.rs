//! Completion-code policy: which code a participant should get, and what to do about it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Why a participant's submission was closed out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionCategory {
    Approved,
    ScreenedOut,
    FailedAttention,
    NoConsent,
}

impl CompletionCategory {
    pub const ALL: [CompletionCategory; 4] = [
        CompletionCategory::Approved,
        CompletionCategory::ScreenedOut,
        CompletionCategory::FailedAttention,
        CompletionCategory::NoConsent,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CompletionCategory::Approved => "APPROVED",
            CompletionCategory::ScreenedOut => "SCREENED_OUT",
            CompletionCategory::FailedAttention => "FAILED_ATTENTION",
            CompletionCategory::NoConsent => "NO_CONSENT",
        }
    }

    /// Parse a category from its upper-case name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    fn expected_outcome(self) -> ExpectedOutcome {
        match self {
            CompletionCategory::Approved => ExpectedOutcome::AutoApprove,
            CompletionCategory::ScreenedOut => ExpectedOutcome::ScreenedOutWithPayment,
            CompletionCategory::FailedAttention | CompletionCategory::NoConsent => {
                ExpectedOutcome::Reject
            }
        }
    }

    fn description(self) -> &'static str {
        match self {
            CompletionCategory::Approved => {
                "Participant completed successfully and should be auto-approved"
            }
            CompletionCategory::ScreenedOut => {
                "Participant was screened out and should receive screening payment"
            }
            CompletionCategory::FailedAttention => {
                "Participant failed attention checks and should be rejected"
            }
            CompletionCategory::NoConsent => {
                "Participant did not provide consent and should be rejected"
            }
        }
    }
}

impl fmt::Display for CompletionCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What to do on Prolific for a given completion code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiAction {
    /// Auto-approves on the platform, nothing to do.
    Skip,
    ScreenOut,
    Reject,
    ManualReview,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectedOutcome {
    AutoApprove,
    ScreenedOutWithPayment,
    Reject,
    ManualReview,
    Unknown,
}

/// Detailed information about a single completion code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAnalysis {
    pub code: String,
    pub known: bool,
    pub meaning: String,
    pub expected_outcome: ExpectedOutcome,
    pub description: String,
}

/// The mapping between completion categories and the codes configured on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCodes {
    pub approved: String,
    pub screened_out: String,
    pub failed_attention: String,
    pub no_consent: String,
}

impl Default for CompletionCodes {
    fn default() -> Self {
        Self {
            approved: "C1G9PC0D".to_string(),
            screened_out: "C1NFUEQ1".to_string(),
            failed_attention: "C1M8R1Y4".to_string(),
            no_consent: "COISODYI".to_string(),
        }
    }
}

/// Flags that screen a participant out, checked in this order.
const SCREENING_FLAGS: [&str; 3] = [
    "did_not_understand_tasks",
    "occupation_not_confirmed",
    "insufficient_work_experience",
];

/// A flag is set when its trimmed, upper-cased value is `TRUE`.
fn flag_is(row: &HashMap<String, String>, column: &str, expected: &str) -> bool {
    row.get(column)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(expected))
}

impl CompletionCodes {
    #[must_use]
    pub fn code(&self, category: CompletionCategory) -> &str {
        match category {
            CompletionCategory::Approved => &self.approved,
            CompletionCategory::ScreenedOut => &self.screened_out,
            CompletionCategory::FailedAttention => &self.failed_attention,
            CompletionCategory::NoConsent => &self.no_consent,
        }
    }

    /// Reverse lookup of a code to its category.
    #[must_use]
    pub fn category_of(&self, code: &str) -> Option<CompletionCategory> {
        CompletionCategory::ALL
            .into_iter()
            .find(|c| self.code(*c) == code)
    }

    /// Determine the completion code a participant should receive from their CSV flags.
    /// Returns `None` for the code when the row needs a manual decision.
    #[must_use]
    pub fn determine_completion_code(
        &self,
        row: &HashMap<String, String>,
    ) -> (Option<CompletionCategory>, String) {
        if flag_is(row, "no_consent", "TRUE") {
            return (
                Some(CompletionCategory::NoConsent),
                concat!(
                    "Participant did not provide valid consent to participate in this research ",
                    "study. Consent is required for all participants as per ethical research ",
                    "guidelines and institutional requirements."
                )
                .to_string(),
            );
        }

        if flag_is(row, "failed_two_plus_attention_checks", "TRUE") {
            return (
                Some(CompletionCategory::FailedAttention),
                concat!(
                    "Participant failed two or more attention checks, indicating insufficient ",
                    "attention to study requirements."
                )
                .to_string(),
            );
        }

        if let Some(flag) = SCREENING_FLAGS.iter().find(|f| flag_is(row, f, "TRUE")) {
            return (
                Some(CompletionCategory::ScreenedOut),
                format!(
                    "Participant was screened out due to: {}",
                    flag.replace('_', " ")
                ),
            );
        }

        if flag_is(row, "screened_out", "TRUE") {
            return (
                Some(CompletionCategory::ScreenedOut),
                "Participant was screened out during the study process.".to_string(),
            );
        }

        if flag_is(row, "incomplete_survey_other_reasons", "TRUE") {
            return (
                Some(CompletionCategory::FailedAttention),
                concat!(
                    "Participant did not complete the survey for other reasons indicating ",
                    "insufficient engagement."
                )
                .to_string(),
            );
        }

        if flag_is(row, "completed_survey", "TRUE") && !flag_is(row, "approved", "FALSE") {
            return (
                Some(CompletionCategory::Approved),
                "Participant successfully completed the study and met all requirements."
                    .to_string(),
            );
        }

        (
            None,
            "Unable to determine appropriate completion code - requires manual review."
                .to_string(),
        )
    }

    /// The platform action to take for a completion code.
    #[must_use]
    pub fn action_for_code(&self, code: &str) -> ApiAction {
        match self.category_of(code) {
            Some(CompletionCategory::Approved) => ApiAction::Skip,
            Some(CompletionCategory::ScreenedOut) => ApiAction::ScreenOut,
            Some(CompletionCategory::FailedAttention | CompletionCategory::NoConsent) => {
                ApiAction::Reject
            }
            None => ApiAction::ManualReview,
        }
    }

    /// Human-readable name for a code.
    #[must_use]
    pub fn code_name(&self, code: &str) -> String {
        if code.is_empty() {
            return String::new();
        }
        match self.category_of(code) {
            Some(category) => category.name().to_string(),
            None => format!("UNKNOWN({code})"),
        }
    }

    #[must_use]
    pub fn is_known(&self, code: &str) -> bool {
        self.category_of(code).is_some()
    }

    #[must_use]
    pub fn all_codes(&self) -> Vec<&str> {
        CompletionCategory::ALL
            .into_iter()
            .map(|c| self.code(c))
            .collect()
    }

    #[must_use]
    pub fn analyze(&self, code: &str) -> CodeAnalysis {
        if code.is_empty() {
            return CodeAnalysis {
                code: String::new(),
                known: false,
                meaning: "NO_CODE".to_string(),
                expected_outcome: ExpectedOutcome::Unknown,
                description: "No completion code provided".to_string(),
            };
        }

        match self.category_of(code) {
            Some(category) => CodeAnalysis {
                code: code.to_string(),
                known: true,
                meaning: category.name().to_string(),
                expected_outcome: category.expected_outcome(),
                description: category.description().to_string(),
            },
            None => CodeAnalysis {
                code: code.to_string(),
                known: false,
                meaning: format!("UNKNOWN({code})"),
                expected_outcome: ExpectedOutcome::ManualReview,
                description: format!("Unknown completion code {code} - requires manual review"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_no_consent_has_priority() {
        let codes = CompletionCodes::default();
        let flags = row(&[
            ("no_consent", " true "),
            ("failed_two_plus_attention_checks", "TRUE"),
            ("completed_survey", "TRUE"),
        ]);
        let (category, reason) = codes.determine_completion_code(&flags);
        assert_eq!(category, Some(CompletionCategory::NoConsent));
        assert!(reason.contains("consent"));
    }

    #[test]
    fn test_attention_before_screening() {
        let codes = CompletionCodes::default();
        let flags = row(&[
            ("failed_two_plus_attention_checks", "TRUE"),
            ("occupation_not_confirmed", "TRUE"),
        ]);
        let (category, _) = codes.determine_completion_code(&flags);
        assert_eq!(category, Some(CompletionCategory::FailedAttention));
    }

    #[test]
    fn test_screening_flag_named_in_reason() {
        let codes = CompletionCodes::default();
        let flags = row(&[
            ("occupation_not_confirmed", "TRUE"),
            ("insufficient_work_experience", "TRUE"),
        ]);
        let (category, reason) = codes.determine_completion_code(&flags);
        assert_eq!(category, Some(CompletionCategory::ScreenedOut));
        assert_eq!(
            reason,
            "Participant was screened out due to: occupation not confirmed"
        );
    }

    #[test]
    fn test_incomplete_other_reasons() {
        let codes = CompletionCodes::default();
        let flags = row(&[("incomplete_survey_other_reasons", "True")]);
        let (category, _) = codes.determine_completion_code(&flags);
        assert_eq!(category, Some(CompletionCategory::FailedAttention));
    }

    #[test]
    fn test_approved_unless_explicitly_false() {
        let codes = CompletionCodes::default();
        let (category, _) = codes.determine_completion_code(&row(&[("completed_survey", "TRUE")]));
        assert_eq!(category, Some(CompletionCategory::Approved));

        let (category, reason) = codes.determine_completion_code(&row(&[
            ("completed_survey", "TRUE"),
            ("approved", "false"),
        ]));
        assert_eq!(category, None);
        assert!(reason.contains("manual review"));
    }

    #[test]
    fn test_empty_row_needs_review() {
        let codes = CompletionCodes::default();
        assert_eq!(codes.determine_completion_code(&HashMap::new()).0, None);
    }

    #[test]
    fn test_action_for_code() {
        let codes = CompletionCodes::default();
        assert_eq!(codes.action_for_code("C1G9PC0D"), ApiAction::Skip);
        assert_eq!(codes.action_for_code("C1NFUEQ1"), ApiAction::ScreenOut);
        assert_eq!(codes.action_for_code("C1M8R1Y4"), ApiAction::Reject);
        assert_eq!(codes.action_for_code("COISODYI"), ApiAction::Reject);
        assert_eq!(codes.action_for_code("XYZ"), ApiAction::ManualReview);
    }

    #[test]
    fn test_code_names() {
        let codes = CompletionCodes::default();
        assert_eq!(codes.code_name(""), "");
        assert_eq!(codes.code_name("C1NFUEQ1"), "SCREENED_OUT");
        assert_eq!(codes.code_name("XYZ"), "UNKNOWN(XYZ)");
        assert!(codes.is_known("COISODYI"));
        assert_eq!(codes.all_codes().len(), 4);
    }

    #[test]
    fn test_analyze() {
        let codes = CompletionCodes::default();

        let empty = codes.analyze("");
        assert_eq!(empty.meaning, "NO_CODE");
        assert_eq!(empty.expected_outcome, ExpectedOutcome::Unknown);

        let screened = codes.analyze("C1NFUEQ1");
        assert!(screened.known);
        assert_eq!(
            screened.expected_outcome,
            ExpectedOutcome::ScreenedOutWithPayment
        );

        let unknown = codes.analyze("ZZZ");
        assert!(!unknown.known);
        assert_eq!(unknown.expected_outcome, ExpectedOutcome::ManualReview);
    }

    #[test]
    fn test_category_names_round_trip() {
        for category in CompletionCategory::ALL {
            assert_eq!(CompletionCategory::from_name(category.name()), Some(category));
        }
    }
}
