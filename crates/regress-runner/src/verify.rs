//! Post-run verification: output comparison for regression scenarios and
//! the success marker for science scenarios.

use crate::report::format_duration;
use regress_compare::{compare, CompareOptions, ComparisonResult, Outcome};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_REPORT: &str = "InsetChart.json";
pub const SCIENCE_REPORT: &str = "scientific_feature_report.txt";
pub const SCIENCE_MARKER: &str = "SUMMARY: Success=True";

const ALL_OUTPUT_EXTENSIONS: [&str; 6] = ["json", "csv", "kml", "bin", "h5", "db"];

/// External mismatch plotter, started as `<cmd> <reference> <candidate>
/// <scenario>`. The caller never waits on it; a detached thread reaps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticPlotter {
    program: String,
    args: Vec<String>,
}

impl DiagnosticPlotter {
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Returns the reaper thread, which yields the plotter's exit status.
    pub fn spawn(
        &self,
        reference: &Path,
        candidate: &Path,
        scenario: &Path,
    ) -> Option<JoinHandle<Option<ExitStatus>>> {
        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(reference)
            .arg(candidate)
            .arg(scenario)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match result {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program, "cannot start plotter: {}", e);
                return None;
            }
        };
        let program = self.program.clone();
        let reaper = thread::Builder::new()
            .name("plotter-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(program = %program, "cannot wait for plotter: {}", e);
                    None
                }
            });
        match reaper {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(program = %self.program, "cannot start plotter reaper: {}", e);
                None
            }
        }
    }
}

/// Verdict for one job.
#[derive(Debug, Clone)]
pub struct Verification {
    pub passed: bool,
    pub detail: String,
    pub artifact: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub results: Vec<ComparisonResult>,
}

impl Verification {
    fn fail(detail: impl Into<String>, artifact: PathBuf) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
            artifact: Some(artifact),
            warnings: Vec::new(),
            results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    options: CompareOptions,
    all_outputs: bool,
    prefer_linux_reference: bool,
    plotter: Option<DiagnosticPlotter>,
    version: Option<String>,
}

impl Verifier {
    pub fn new(options: CompareOptions, all_outputs: bool) -> Self {
        Self {
            options,
            all_outputs,
            prefer_linux_reference: !cfg!(windows),
            plotter: None,
            version: None,
        }
    }

    pub fn with_plotter(mut self, plotter: Option<DiagnosticPlotter>) -> Self {
        self.plotter = plotter;
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_linux_reference(mut self, prefer: bool) -> Self {
        self.prefer_linux_reference = prefer;
        self
    }

    /// Output file names to compare for a scenario.
    pub fn targets(&self, scenario: &Path) -> Vec<String> {
        if !self.all_outputs {
            return vec![DEFAULT_REPORT.to_string()];
        }
        WalkDir::new(scenario.join("output"))
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| is_comparable_output(name))
            .collect()
    }

    /// Reference for `name`; a `<stem>.linux.json` sibling wins on non
    /// Windows hosts when present.
    pub fn reference_for(&self, scenario: &Path, name: &str) -> PathBuf {
        let output = scenario.join("output");
        if self.prefer_linux_reference {
            if let Some(stem) = name.strip_suffix(".json") {
                let alt = output.join(format!("{}.linux.json", stem));
                if alt.is_file() {
                    return alt;
                }
            }
        }
        output.join(name)
    }

    pub fn verify_regression(&self, scenario: &Path, work_dir: &Path) -> Verification {
        let targets = self.targets(scenario);
        if targets.is_empty() {
            return Verification::fail(
                format!(
                    "No reference outputs found under {}",
                    scenario.join("output").display()
                ),
                work_dir.join("output"),
            );
        }

        let mut results = Vec::with_capacity(targets.len());
        for name in &targets {
            let reference = self.reference_for(scenario, name);
            let candidate = work_dir.join("output").join(name);
            let result = compare(&reference, &candidate, &self.options);
            match result.outcome {
                Outcome::Pass => {}
                Outcome::Fail => {
                    error!(scenario = %scenario.display(), report = %name, "completed but did not match reference");
                    if !result.mismatches.is_empty() {
                        if let Some(plotter) = &self.plotter {
                            let _ = plotter.spawn(&reference, &candidate, scenario);
                        }
                    }
                }
                Outcome::Error => {
                    error!(scenario = %scenario.display(), report = %name, "comparison error: {}", result.detail);
                }
            }
            results.push(result);
        }

        let warnings: Vec<String> = results
            .iter()
            .flat_map(|r| r.warnings.iter().cloned())
            .collect();
        let failing: Vec<&ComparisonResult> = results.iter().filter(|r| !r.passed()).collect();
        let detail = failing
            .iter()
            .map(|r| {
                let name = r
                    .artifact
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{} - {}", name, r.describe().trim_end())
            })
            .collect::<Vec<_>>()
            .join("\n");
        let artifact = failing.first().map(|r| r.artifact.clone());
        Verification {
            passed: failing.is_empty(),
            detail,
            artifact,
            warnings,
            results,
        }
    }

    pub fn verify_science(&self, work_dir: &Path) -> Verification {
        let report = work_dir.join(SCIENCE_REPORT);
        match fs::read_to_string(&report) {
            Ok(text) if text.contains(SCIENCE_MARKER) => Verification {
                passed: true,
                detail: String::new(),
                artifact: None,
                warnings: Vec::new(),
                results: Vec::new(),
            },
            Ok(text) => {
                let summary = text
                    .lines()
                    .find(|l| l.contains("SUMMARY"))
                    .unwrap_or("no SUMMARY line")
                    .to_string();
                Verification::fail(format!("Science validation failed: {}", summary), report)
            }
            Err(_) => Verification::fail(
                format!("{} was not generated.", SCIENCE_REPORT),
                report,
            ),
        }
    }

    /// Appends `<version>\t<duration>` to `time.txt` after a pass.
    pub fn record_time(&self, work_dir: &Path, duration: Duration) {
        let Some(version) = &self.version else {
            return;
        };
        let path = work_dir.join("time.txt");
        let line = format!("{}\t{}\n", version, format_duration(duration));
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        match written {
            Ok(()) => info!(path = %path.display(), "recorded run time"),
            Err(e) => warn!(path = %path.display(), "problem writing time.txt: {}", e),
        }
    }
}

pub fn is_comparable_output(name: &str) -> bool {
    if name.starts_with('.') || name == "transitions.json" || name.contains("linux") {
        return false;
    }
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| ALL_OUTPUT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
