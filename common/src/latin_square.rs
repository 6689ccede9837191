//! Latin-square presentation orders for model responses.

use crate::MODEL_COLUMNS;
use crate::spreadsheet::Row;
use anyhow::{Result, bail};
use log::{info, warn};
use rand::Rng;
use rand::seq::SliceRandom;
use std::fmt::Write as _;
use std::path::Path;

/// The `n` cyclic shifts of `models`, shuffled, repeated to cover `n_rows`.
///
/// # Errors
///
/// Returns an error if `models` is empty.
pub fn generate_latin_square_orders<R: Rng + ?Sized>(
    models: &[&str],
    n_rows: usize,
    rng: &mut R,
) -> Result<Vec<Vec<String>>> {
    let n = models.len();
    if n == 0 {
        bail!("at least one model is required");
    }

    let mut square: Vec<Vec<String>> = (0..n)
        .map(|shift| {
            (0..n)
                .map(|i| models[(shift + i) % n].to_string())
                .collect()
        })
        .collect();
    square.shuffle(rng);

    let orders = (0..n_rows).map(|i| square[i % n].clone()).collect();
    info!(
        "Generated {n_rows} Latin Square orders; each model appears in each position about {:.1} times",
        n_rows as f64 / n as f64
    );
    Ok(orders)
}

/// Reorder the model columns of every row.
///
/// `models[i]` names the response held in `MODEL_COLUMNS[i]`. After this call
/// column `modelK` holds the response of the K-th model in that row's order and
/// `order_models` records the order.
///
/// # Errors
///
/// Returns an error if there are fewer orders than rows or the model list does
/// not match the model columns.
pub fn apply_model_randomization(
    rows: &mut [Row],
    models: &[&str],
    orders: &[Vec<String>],
) -> Result<()> {
    if models.len() != MODEL_COLUMNS.len() {
        bail!(
            "expected {} model names, got {}",
            MODEL_COLUMNS.len(),
            models.len()
        );
    }
    if orders.len() < rows.len() {
        bail!("{} orders for {} rows", orders.len(), rows.len());
    }

    for (row, order) in rows.iter_mut().zip(orders) {
        let urls: Vec<Option<String>> = MODEL_COLUMNS.iter().map(|c| row.remove(*c)).collect();
        for (column, model) in MODEL_COLUMNS.iter().zip(order) {
            let source = models.iter().position(|m| *m == model.as_str());
            if let Some(url) = source.and_then(|i| urls[i].clone()) {
                row.insert((*column).to_string(), url);
            }
        }
        row.insert("order_models".to_string(), order.join(","));
    }
    Ok(())
}

/// How often each model landed in each position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceReport {
    pub counts: Vec<(String, Vec<usize>)>,
    pub total_rows: usize,
    pub balanced: bool,
}

/// Count model-per-position occurrences across comma-joined orders.
/// Balanced when every count is within one of `rows / n`.
#[must_use]
pub fn verify_balance(order_strings: &[String], models: &[&str]) -> BalanceReport {
    let n = models.len();
    let mut counts: Vec<(String, Vec<usize>)> =
        models.iter().map(|m| ((*m).to_string(), vec![0; n])).collect();

    for order in order_strings {
        for (position, model) in order.split(',').enumerate().take(n) {
            if let Some((_, c)) = counts.iter_mut().find(|(m, _)| m == model) {
                c[position] += 1;
            }
        }
    }

    let total_rows = order_strings.len();
    let expected = if n == 0 { 0.0 } else { total_rows as f64 / n as f64 };
    let balanced = counts
        .iter()
        .flat_map(|(_, c)| c.iter())
        .all(|&c| (c as f64 - expected).abs() <= 1.0);

    for (model, c) in &counts {
        info!("  {model}: {c:?} (total: {})", c.iter().sum::<usize>());
    }
    if balanced {
        info!("Latin Square randomization is properly balanced");
    } else {
        warn!("Latin Square randomization may not be perfectly balanced");
    }

    BalanceReport {
        counts,
        total_rows,
        balanced,
    }
}

/// Plain-text description of a randomization run.
#[must_use]
pub fn summary_text(models: &[&str], report: &BalanceReport) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "Latin Square Randomization Summary");
    let _ = writeln!(s, "{}", "=".repeat(40));
    let _ = writeln!(s);
    let _ = writeln!(s, "Total rows: {}", report.total_rows);
    let _ = writeln!(s, "Models: {}", models.join(", "));
    let _ = writeln!(s);
    let _ = writeln!(s, "Position counts (1st..{}th):", models.len());
    for (model, counts) in &report.counts {
        let _ = writeln!(s, "  {model}: {counts:?}");
    }
    let _ = writeln!(s);
    let _ = writeln!(
        s,
        "Balanced (every count within 1 of the mean): {}",
        if report.balanced { "yes" } else { "no" }
    );
    let _ = writeln!(
        s,
        "The 'order_models' column contains the randomized order for each row."
    );
    s
}

/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_summary(path: &Path, models: &[&str], report: &BalanceReport) -> Result<()> {
    std::fs::write(path, summary_text(models, report))?;
    Ok(())
}
