//! Stable occupation and task identifiers for spreadsheet rows.

use crate::spreadsheet::Row;
use std::collections::HashMap;

/// Columns converted to PDFs, in processing order.
pub const CONTENT_COLUMNS: [&str; 6] = [
    "Question", "model1", "model2", "model3", "model4", "model5",
];

/// A spreadsheet row with its identifiers worked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRow {
    pub index: usize,
    pub occupation_id: String,
    pub task_id: String,
    pub job: String,
    pub task: String,
    pub order_models: String,
    /// Non-empty content columns, in `CONTENT_COLUMNS` order.
    pub content: Vec<(String, String)>,
}

/// Assign identifiers to every row.
///
/// Occupations are numbered by first appearance of `Job`. Within a job each
/// distinct `Task` is numbered by first appearance, and repeated (Job, Task)
/// rows get an increasing row counter: `task_<occ:03>_<task:02>_<row>`.
#[must_use]
pub fn precompute_ids(rows: &[Row]) -> Vec<TaskRow> {
    let mut occupation_numbers: HashMap<String, usize> = HashMap::new();
    let mut tasks_per_job: HashMap<String, usize> = HashMap::new();
    let mut task_numbers: HashMap<(String, String), (usize, usize)> = HashMap::new();

    let mut result = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let job = row.get("Job").cloned().unwrap_or_default();
        let task = row.get("Task").cloned().unwrap_or_default();

        let next_occupation = occupation_numbers.len() + 1;
        let occupation_num = *occupation_numbers.entry(job.clone()).or_insert(next_occupation);

        let (task_num, row_num) = task_numbers
            .entry((job.clone(), task.clone()))
            .or_insert_with(|| {
                let count = tasks_per_job.entry(job.clone()).or_insert(0);
                *count += 1;
                (*count, 0)
            });
        *row_num += 1;

        let content = CONTENT_COLUMNS
            .iter()
            .filter_map(|col| row.get(*col).map(|v| ((*col).to_string(), v.clone())))
            .collect();

        result.push(TaskRow {
            index,
            occupation_id: format!("occupation_{occupation_num:03}"),
            task_id: format!("task_{occupation_num:03}_{task_num:02}_{row_num}"),
            job,
            task,
            order_models: row.get("order_models").cloned().unwrap_or_default(),
            content,
        });
    }

    log::info!(
        "Pre-computed IDs for {} tasks across {} occupations",
        result.len(),
        occupation_numbers.len()
    );
    result
}
