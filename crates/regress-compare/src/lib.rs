//! Structural comparison of a simulation's output files against golden
//! references.
//!
//! [`compare`] always tries a whole-file hash first. Only when the bytes
//! differ does it pick a comparator from the closed [`ReportKind`] set, once,
//! based on the file name.

use regress_core::sha256_file;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

mod channels;
mod delimited;

pub use channels::ChannelShape;

pub const DEFAULT_MISMATCH_CAP: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// How a file is compared once the whole-file hashes disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportKind {
    Delimited { delimiter: char },
    Channels,
    Opaque,
}

impl ReportKind {
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("csv") => ReportKind::Delimited { delimiter: ',' },
            Some("json") => ReportKind::Channels,
            _ => ReportKind::Opaque,
        }
    }
}

/// Which step of [`compare`] produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    MissingFile,
    WholeFileHash,
    Structural(ReportKind),
}

#[derive(Debug, Clone)]
pub struct CompareOptions {
    /// Unattended run: drift that a human would only be warned about fails.
    pub automated: bool,
    pub mismatch_cap: usize,
    /// Channels present only in the candidate fail the comparison so that the
    /// reference gets refreshed.
    pub new_channels_fail: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            automated: false,
            mismatch_cap: DEFAULT_MISMATCH_CAP,
            new_channels_fail: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub outcome: Outcome,
    pub method: Method,
    pub artifact: PathBuf,
    pub detail: String,
    pub mismatches: Vec<String>,
    pub skipped_mismatches: usize,
    pub warnings: Vec<String>,
}

impl ComparisonResult {
    fn new(outcome: Outcome, method: Method, artifact: &Path) -> Self {
        Self {
            outcome,
            method,
            artifact: artifact.to_path_buf(),
            detail: String::new(),
            mismatches: Vec::new(),
            skipped_mismatches: 0,
            warnings: Vec::new(),
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    /// Detail plus the literal mismatch lines, as shown in reports.
    pub fn describe(&self) -> String {
        let mut out = self.detail.clone();
        if !self.mismatches.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            for line in &self.mismatches {
                out.push_str(line);
                out.push('\n');
            }
            if self.skipped_mismatches > 0 {
                out.push_str(&format!(
                    "... {} more mismatches not shown\n",
                    self.skipped_mismatches
                ));
            }
        }
        out
    }
}

/// Bounded collector for literal mismatch lines.
#[derive(Debug)]
pub(crate) struct MismatchLog {
    cap: usize,
    lines: Vec<String>,
    skipped: usize,
}

impl MismatchLog {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            lines: Vec::new(),
            skipped: 0,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        if self.lines.len() < self.cap {
            self.lines.push(line);
        } else {
            self.skipped += 1;
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.lines.len() + self.skipped
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, usize) {
        (self.lines, self.skipped)
    }
}

pub fn compare(reference: &Path, candidate: &Path, opts: &CompareOptions) -> ComparisonResult {
    if !candidate.exists() {
        return ComparisonResult::new(Outcome::Fail, Method::MissingFile, candidate)
            .with_detail("Report not generated by executable.");
    }
    if !reference.exists() {
        return ComparisonResult::new(Outcome::Error, Method::MissingFile, candidate)
            .with_detail(format!("Reference {} not found.", reference.display()));
    }

    let hashes = sha256_file(reference).and_then(|r| sha256_file(candidate).map(|c| (r, c)));
    match hashes {
        Ok((r, c)) if r == c => {
            return ComparisonResult::new(Outcome::Pass, Method::WholeFileHash, candidate);
        }
        Ok(_) => {}
        Err(e) => {
            return ComparisonResult::new(Outcome::Error, Method::WholeFileHash, candidate)
                .with_detail(format!("Failed to hash outputs: {}", e));
        }
    }

    let kind = ReportKind::for_path(candidate);
    let method = Method::Structural(kind);
    match kind {
        ReportKind::Delimited { delimiter } => {
            delimited::compare_delimited(reference, candidate, delimiter, method)
        }
        ReportKind::Channels => channels::compare_channels(reference, candidate, opts, method),
        ReportKind::Opaque => {
            ComparisonResult::new(Outcome::Fail, method, candidate).with_detail("Failed hash check.")
        }
    }
}
