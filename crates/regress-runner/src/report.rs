//! Result aggregation and the JUnit-style XML report.

use crate::config::ExecutionMode;
use crate::state::{ExecutionRecord, JobState};
use crate::suite::ScenarioType;
use chrono::{DateTime, Utc};
use regress_compare::ComparisonResult;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Passed,
    Failed,
    Errored,
    /// Sweep member whose outputs are only collected.
    Collected,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestEntry {
    pub name: String,
    pub status: EntryStatus,
    pub sim_id: Option<String>,
    /// Only passing entries carry a run time.
    pub duration: Option<Duration>,
    pub detail: String,
    pub artifact: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub backend: Option<ExecutionMode>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Per-file comparisons behind a verdict.
    pub results: Vec<ComparisonResult>,
}

impl TestEntry {
    fn base(name: impl Into<String>, status: EntryStatus) -> Self {
        Self {
            name: name.into(),
            status,
            sim_id: None,
            duration: None,
            detail: String::new(),
            artifact: None,
            work_dir: None,
            warnings: Vec::new(),
            backend: None,
            started_at: None,
            ended_at: None,
            results: Vec::new(),
        }
    }

    /// Entry for a finished worker, read off its record. A verified record
    /// passes or fails, a completed sweep member is collected and every
    /// other state is an error described by `detail`.
    pub fn from_record(
        name: impl Into<String>,
        record: ExecutionRecord,
        scenario_type: ScenarioType,
        detail: String,
        duration: Duration,
    ) -> Self {
        let state = record.state();
        let mut e = match state {
            JobState::VerifiedPass => Self::passed(name, duration),
            JobState::VerifiedFail => Self::failed(name, detail),
            JobState::Completed if scenario_type == ScenarioType::Sweep => Self::collected(name),
            _ if detail.is_empty() => {
                Self::errored(name, format!("Simulation stopped in state {:?}.", state))
            }
            _ => Self::errored(name, detail),
        };
        e.sim_id = Some(record.sim_id);
        e.work_dir = record.work_dir;
        e.backend = Some(record.backend);
        e.started_at = record.started_at;
        e.ended_at = record.ended_at;
        e.results = record.results;
        e
    }

    pub fn passed(name: impl Into<String>, duration: Duration) -> Self {
        let mut e = Self::base(name, EntryStatus::Passed);
        e.duration = Some(duration);
        e
    }

    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut e = Self::base(name, EntryStatus::Failed);
        e.detail = detail.into();
        e
    }

    pub fn errored(name: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut e = Self::base(name, EntryStatus::Errored);
        e.detail = detail.into();
        e
    }

    pub fn collected(name: impl Into<String>) -> Self {
        Self::base(name, EntryStatus::Collected)
    }

    pub fn with_sim(mut self, sim_id: impl Into<String>, work_dir: Option<PathBuf>) -> Self {
        self.sim_id = Some(sim_id.into());
        self.work_dir = work_dir;
        self
    }

    pub fn with_artifact(mut self, artifact: Option<PathBuf>) -> Self {
        self.artifact = artifact;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Seconds for the report; -1 when the entry did not pass.
    pub fn seconds(&self) -> f64 {
        match (self.status, self.duration) {
            (EntryStatus::Passed, Some(d)) => d.as_secs_f64(),
            _ => -1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegressionReport {
    pub tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub schema: String,
    pub version: Option<String>,
    pub entries: Vec<TestEntry>,
    pub final_warnings: Vec<String>,
}

impl RegressionReport {
    pub fn new(version: Option<String>) -> Self {
        Self {
            schema: "not tested".to_string(),
            version,
            ..Self::default()
        }
    }

    pub fn record(&mut self, entry: TestEntry) {
        match entry.status {
            EntryStatus::Passed => {
                self.tests += 1;
                self.passed += 1;
            }
            EntryStatus::Failed => {
                self.tests += 1;
                self.failed += 1;
            }
            EntryStatus::Errored => {
                self.tests += 1;
                self.errors += 1;
            }
            EntryStatus::Collected => {}
        }
        for w in &entry.warnings {
            if !self.final_warnings.contains(w) {
                self.final_warnings.push(w.clone());
            }
        }
        self.entries.push(entry);
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.final_warnings.contains(&warning) {
            self.final_warnings.push(warning);
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{:3} tests total, {:3} passed, {:3} failed, {:3} errors, schema: {}.",
            self.tests, self.passed, self.failed, self.errors, self.schema
        )
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }

    pub fn to_xml(&self, elapsed: Duration) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            out,
            "<testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" time=\"{:.3}\">",
            escape_attr(&self.suite_name()),
            self.tests,
            self.failed,
            self.errors,
            elapsed.as_secs_f64()
        );
        for e in self
            .entries
            .iter()
            .filter(|e| e.status != EntryStatus::Collected)
        {
            let _ = write!(
                out,
                "  <testcase name=\"{}\" time=\"{:.3}\"",
                escape_attr(&e.name),
                e.seconds()
            );
            match e.status {
                EntryStatus::Failed | EntryStatus::Errored => {
                    let tag = if e.status == EntryStatus::Failed {
                        "failure"
                    } else {
                        "error"
                    };
                    let mut body = e.detail.clone();
                    if let Some(artifact) = &e.artifact {
                        let _ = write!(body, "\nArtifact: {}", artifact.display());
                    }
                    let _ = writeln!(
                        out,
                        ">\n    <{tag} message=\"{}\"><![CDATA[{}]]></{tag}>\n  </testcase>",
                        escape_attr(e.detail.lines().next().unwrap_or("")),
                        cdata(&body),
                    );
                }
                _ => out.push_str(" />\n"),
            }
        }
        out.push_str("</testsuite>\n");
        out
    }

    pub fn write_xml(&self, path: &Path, elapsed: Duration) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_xml(elapsed))?;
        info!(path = %path.display(), "wrote report");
        Ok(())
    }

    fn suite_name(&self) -> String {
        match &self.version {
            Some(v) => format!("Regression {}", v),
            None => "Regression".to_string(),
        }
    }
}

/// `H:MM:SS.mmm`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    format!(
        "{}:{:02}:{:02}.{:03}",
        total / 3600,
        (total / 60) % 60,
        total % 60,
        d.subsec_millis()
    )
}

fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' | '\r' | '\t' => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

fn cdata(s: &str) -> String {
    s.replace("]]>", "]]]]><![CDATA[>")
}

/// Starts the single consumer of finished entries. The handle yields the
/// report once every sender is dropped.
pub fn spawn_aggregator(
    expected: usize,
    report: RegressionReport,
) -> (Sender<TestEntry>, JoinHandle<RegressionReport>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || aggregate(rx, expected, report));
    (tx, handle)
}

fn aggregate(rx: Receiver<TestEntry>, expected: usize, mut report: RegressionReport) -> RegressionReport {
    let mut done = 0usize;
    for entry in rx {
        match entry.status {
            EntryStatus::Passed => info!(name = %entry.name, "passed"),
            EntryStatus::Failed => warn!(name = %entry.name, "failed"),
            EntryStatus::Errored => warn!(name = %entry.name, detail = %entry.detail, "errored"),
            EntryStatus::Collected => info!(name = %entry.name, "collected"),
        }
        report.record(entry);
        done += 1;
        info!("{} out of {} completed.", done, expected.max(done));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{JobEvent, RunStatus};
    use crate::suite::JobSpec;

    #[test]
    fn counters_follow_entry_status() {
        let mut r = RegressionReport::new(Some("2.20.0.0".into()));
        r.record(TestEntry::passed("a", Duration::from_secs(3)));
        r.record(TestEntry::failed("b", "mismatch"));
        r.record(TestEntry::errored("c", "boom"));
        r.record(TestEntry::collected("d"));
        assert_eq!((r.tests, r.passed, r.failed, r.errors), (3, 1, 1, 1));
        assert_eq!(r.entries.len(), 4);
        assert!(!r.all_passed());
        assert_eq!(
            r.summary_line(),
            "  3 tests total,   1 passed,   1 failed,   1 errors, schema: not tested."
        );
    }

    #[test]
    fn duration_is_negative_unless_passed() {
        assert_eq!(TestEntry::passed("a", Duration::from_millis(1500)).seconds(), 1.5);
        assert_eq!(TestEntry::failed("b", "").seconds(), -1.0);
        let mut e = TestEntry::errored("c", "");
        e.duration = Some(Duration::from_secs(2));
        assert_eq!(e.seconds(), -1.0);
    }

    #[test]
    fn warnings_are_deduplicated() {
        let mut r = RegressionReport::new(None);
        r.record(TestEntry::passed("a", Duration::ZERO).with_warnings(vec!["w".into()]));
        r.record(TestEntry::passed("b", Duration::ZERO).with_warnings(vec!["w".into()]));
        r.warn("x");
        assert_eq!(r.final_warnings, vec!["w".to_string(), "x".to_string()]);
    }

    #[test]
    fn xml_escapes_names_and_cdata() {
        let mut r = RegressionReport::new(None);
        r.record(TestEntry::passed("Generic/\"SEIR\" & co", Duration::from_secs(2)));
        r.record(
            TestEntry::failed("Vector/<x>", "bad ]]> value\nline two")
                .with_artifact(Some(PathBuf::from("/sims/1/output/InsetChart.json"))),
        );
        r.record(TestEntry::collected("sweep member"));
        let xml = r.to_xml(Duration::from_millis(12_345));
        assert!(xml.contains(
            "<testsuite name=\"Regression\" tests=\"2\" failures=\"1\" errors=\"0\" time=\"12.345\">"
        ));
        assert!(xml.contains("<testcase name=\"Generic/&quot;SEIR&quot; &amp; co\" time=\"2.000\" />"));
        assert!(xml.contains("<testcase name=\"Vector/&lt;x&gt;\" time=\"-1.000\">"));
        assert!(xml.contains("message=\"bad ]]&gt; value\""));
        assert!(xml.contains("<![CDATA[bad ]]]]><![CDATA[> value\nline two\nArtifact: /sims/1/output/InsetChart.json]]>"));
        assert!(!xml.contains("sweep member"));
    }

    fn record(state_events: &[JobEvent]) -> ExecutionRecord {
        let job = JobSpec {
            scenario: PathBuf::from("Generic/Demo"),
            name: "Generic/Demo".into(),
            config: serde_json::json!({"parameters": {}}),
            campaign: None,
            custom_reports: None,
            mode: ExecutionMode::Local,
            scenario_type: ScenarioType::Regression,
            overrides: Default::default(),
            sim_id: "sim_0001".into(),
        };
        let mut record = ExecutionRecord::new(&job, ExecutionMode::Local);
        record.work_dir = Some(PathBuf::from("/sims/sim_0001"));
        for event in state_events {
            record.advance(*event).unwrap();
        }
        record
    }

    #[test]
    fn entry_is_read_off_the_record() {
        use JobEvent::*;
        let done = [Launched, Exited(RunStatus::Completed)];

        let mut verified = record(&done);
        verified.advance(Verified { passed: true }).unwrap();
        let e = TestEntry::from_record("a", verified, ScenarioType::Regression, String::new(), Duration::from_secs(2));
        assert_eq!(e.status, EntryStatus::Passed);
        assert_eq!(e.seconds(), 2.0);
        assert_eq!(e.sim_id.as_deref(), Some("sim_0001"));
        assert_eq!(e.work_dir, Some(PathBuf::from("/sims/sim_0001")));
        assert_eq!(e.backend, Some(ExecutionMode::Local));
        assert!(e.started_at.is_some() && e.ended_at.is_some());

        let e = TestEntry::from_record("b", record(&done), ScenarioType::Sweep, String::new(), Duration::ZERO);
        assert_eq!(e.status, EntryStatus::Collected);

        // Completed but never verified is not a verdict.
        let e = TestEntry::from_record("c", record(&done), ScenarioType::Science, String::new(), Duration::ZERO);
        assert_eq!(e.status, EntryStatus::Errored);
        assert_eq!(e.detail, "Simulation stopped in state Completed.");

        let failed = record(&[Launched, Exited(RunStatus::Failed)]);
        let e = TestEntry::from_record("d", failed, ScenarioType::Regression, "Simulation failed.".into(), Duration::ZERO);
        assert_eq!(e.status, EntryStatus::Errored);
        assert_eq!(e.detail, "Simulation failed.");
    }

    #[test]
    fn duration_format_is_clock_like() {
        assert_eq!(format_duration(Duration::from_millis(3_723_045)), "1:02:03.045");
        assert_eq!(format_duration(Duration::ZERO), "0:00:00.000");
    }

    #[test]
    fn aggregator_collects_from_many_senders() {
        let (tx, handle) = spawn_aggregator(4, RegressionReport::new(None));
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let tx = tx.clone();
                thread::spawn(move || {
                    tx.send(TestEntry::passed(format!("t{}", i), Duration::ZERO))
                        .unwrap();
                })
            })
            .collect();
        drop(tx);
        for w in workers {
            w.join().unwrap();
        }
        let report = handle.join().unwrap();
        assert_eq!(report.passed, 4);
        assert_eq!(report.entries.len(), 4);
    }
}
