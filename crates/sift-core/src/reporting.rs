use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::domain::sample::Split;
use crate::fingerprint::format_rate;

/// Which model a result row describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Trained on the full (possibly dropout-augmented) split.
    Baseline,
    /// Retrained from scratch on the curated split.
    Curated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Baseline => "baseline",
            Phase::Curated => "curated",
        }
    }
}

/// One evaluated (member, phase, split) result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRow {
    pub member: String,
    pub model: String,
    pub dataset: String,
    pub seed: u64,
    pub dropout_rate: f64,
    pub phase: Phase,
    pub split: Split,
    pub acc: f64,
    pub balanced_acc: f64,
}

/// `<output_dir>/results/<member>.csv`
pub fn results_path(output_dir: &Path, member: &str) -> PathBuf {
    output_dir.join("results").join(format!("{member}.csv"))
}

/// Append rows to a results CSV, writing the header when the file is new.
pub fn append_results(path: &Path, rows: &[ResultRow]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    }
    let fresh = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {:?}", path))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(fresh)
        .from_writer(file);
    for row in rows {
        writer.serialize(row).context("serialize result row")?;
    }
    writer.flush().with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Load every `results/*.csv` under `output_dir`, in file name order.
pub fn read_results(output_dir: &Path) -> Result<Vec<ResultRow>> {
    let dir = output_dir.join("results");
    let mut files: Vec<PathBuf> = fs::read_dir(&dir)
        .with_context(|| format!("read {:?}", dir))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    files.sort();

    let mut rows = Vec::new();
    for file in files {
        let mut reader = csv::Reader::from_path(&file).with_context(|| format!("open {:?}", file))?;
        for row in reader.deserialize() {
            rows.push(row.with_context(|| format!("parse {:?}", file))?);
        }
    }
    Ok(rows)
}

/// Accuracy across seeds for one (phase, split, dropout rate).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryRow {
    pub phase: Phase,
    pub split: Split,
    pub dropout_rate: f64,
    pub runs: usize,
    pub mean_acc: f64,
    pub min_acc: f64,
    pub max_acc: f64,
    pub mean_balanced_acc: f64,
}

/// Group rows by (phase, split, dropout rate).
pub fn summarize(rows: &[ResultRow]) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<(Phase, Split, String), Vec<&ResultRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.phase, row.split, format_rate(row.dropout_rate)))
            .or_default()
            .push(row);
    }

    let mut out: Vec<SummaryRow> = groups
        .into_values()
        .map(|group| {
            let n = group.len() as f64;
            SummaryRow {
                phase: group[0].phase,
                split: group[0].split,
                dropout_rate: group[0].dropout_rate,
                runs: group.len(),
                mean_acc: group.iter().map(|r| r.acc).sum::<f64>() / n,
                min_acc: group.iter().map(|r| r.acc).fold(f64::INFINITY, f64::min),
                max_acc: group.iter().map(|r| r.acc).fold(f64::NEG_INFINITY, f64::max),
                mean_balanced_acc: group.iter().map(|r| r.balanced_acc).sum::<f64>() / n,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        (a.phase, a.split)
            .cmp(&(b.phase, b.split))
            .then(a.dropout_rate.total_cmp(&b.dropout_rate))
    });
    out
}

/// Render a markdown table of the summary.
pub fn render_summary_md(summary: &[SummaryRow]) -> String {
    let mut out = String::new();
    out.push_str("# Results Summary\n\n");
    out.push_str("| phase | split | dropout_rate | runs | acc mean | acc min | acc max | balanced acc mean |\n");
    out.push_str("|---|---|---|---|---|---|---|---|\n");
    for row in summary {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {:.4} | {:.4} | {:.4} | {:.4} |\n",
            row.phase.as_str(),
            row.split,
            format_rate(row.dropout_rate),
            row.runs,
            row.mean_acc,
            row.min_acc,
            row.max_acc,
            row.mean_balanced_acc
        ));
    }
    out
}
