//! Indented call-stack report.
//!
//! ```text
//! App#parse                   125 (100.0%)         125 (100.0%)
//! `-- App#load                125 (100.0%)           0   (0.0%)
//!     `-- App#main            125 (100.0%)           0   (0.0%)
//! ```
//!
//! The allocation site comes first, each caller one level deeper. Counts and
//! percentages are relative to the outermost printed frame.

use std::io::Write;

use crate::{
    error::{Result, SamplerError},
    query::CallStackFrame,
};

const CONNECTOR: &str = "`-- ";
const INDENT: &str = "    ";
const PERCENT_WIDTH: usize = 8;
const SELF_WIDTH: usize = 12;

/// One materialized report line.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub depth: usize,
    pub name: String,
    pub total_count: u64,
    pub total_percent: f64,
    pub self_count: u64,
    pub self_percent: f64,
}

/// Picks the allocation site plus at most `max_depth` callers from a stack
/// ordered outermost first.
pub fn render_rows(frames: &[CallStackFrame], max_depth: usize) -> Result<Vec<ReportRow>> {
    if max_depth == 0 {
        return Err(SamplerError::InvalidConfiguration(
            "max_depth must be a positive integer".to_string(),
        ));
    }

    let printed: Vec<&CallStackFrame> = frames.iter().rev().take(max_depth + 1).collect();
    let baseline = printed
        .last()
        .map(|frame| frame.total_count)
        .ok_or(SamplerError::EmptyStack)?;

    Ok(printed
        .into_iter()
        .enumerate()
        .map(|(depth, frame)| ReportRow {
            depth,
            name: frame.name.clone(),
            total_count: frame.total_count,
            total_percent: percent(frame.total_count, baseline),
            self_count: frame.self_count,
            self_percent: percent(frame.self_count, baseline),
        })
        .collect())
}

fn percent(count: u64, baseline: u64) -> f64 {
    if baseline == 0 {
        0.0
    } else {
        count as f64 / baseline as f64 * 100.0
    }
}

fn label(row: &ReportRow) -> String {
    match row.depth {
        0 => row.name.clone(),
        depth => format!("{}{CONNECTOR}{}", INDENT.repeat(depth - 1), row.name),
    }
}

/// Lays out rows in aligned columns. Widths are computed from these rows only.
pub fn format_rows(rows: &[ReportRow]) -> String {
    let labels: Vec<String> = rows.iter().map(label).collect();
    let name_width = labels
        .iter()
        .map(|label| label.chars().count())
        .max()
        .unwrap_or(0);
    let count_width = rows
        .iter()
        .map(|row| row.total_count.to_string().len())
        .max()
        .unwrap_or(0);

    let mut output = String::new();
    for (row, label) in rows.iter().zip(labels) {
        let total_percent = format!("({:.1}%)", row.total_percent);
        let self_percent = format!("({:.1}%)", row.self_percent);
        output.push_str(&format!(
            "{label:<name_width$} {total:>count_width$} {total_percent:>PERCENT_WIDTH$}{self_count:>SELF_WIDTH$} {self_percent:>PERCENT_WIDTH$}\n",
            total = row.total_count,
            self_count = row.self_count,
        ));
    }
    output
}

/// Writes the report for `frames` to `output`.
pub fn render<W: Write>(frames: &[CallStackFrame], max_depth: usize, output: &mut W) -> Result<()> {
    let rows = render_rows(frames, max_depth)?;
    output.write_all(format_rows(&rows).as_bytes())?;
    Ok(())
}

/// Prints call stacks returned by
/// [`AllocationSampler::heaviest_locations`](crate::AllocationSampler::heaviest_locations).
#[derive(Debug)]
pub struct StackPrinter<W: Write> {
    output: W,
    max_depth: usize,
}

impl<W: Write> StackPrinter<W> {
    pub fn new(output: W, max_depth: usize) -> Result<Self> {
        if max_depth == 0 {
            return Err(SamplerError::InvalidConfiguration(
                "max_depth must be a positive integer".to_string(),
            ));
        }
        Ok(StackPrinter { output, max_depth })
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn show(&mut self, frames: &[CallStackFrame]) -> Result<()> {
        render(frames, self.max_depth, &mut self.output)
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}
