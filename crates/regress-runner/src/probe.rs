//! One-off checks against the engine binary that run beside the scenarios:
//! version detection, the schema self-test and the component test binary.

use crate::report::TestEntry;
use regress_core::load_json_file;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{error, info, warn};

/// First `a.b.c.d` token in `text`.
pub fn parse_version(text: &str) -> Option<String> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find_map(|token| {
            let parts: Vec<&str> = token.split('.').collect();
            parts
                .windows(4)
                .find(|w| w.iter().all(|p| !p.is_empty()))
                .map(|w| w.join("."))
        })
}

/// Asks the engine for its version with `-v`.
pub fn detect_version(engine: &Path) -> Option<String> {
    let output = Command::new(engine)
        .arg("-v")
        .stdin(Stdio::null())
        .output();
    match output {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout);
            let version = parse_version(&text);
            match &version {
                Some(v) => info!(engine = %engine.display(), version = %v, "engine version"),
                None => warn!(engine = %engine.display(), "no version in '-v' output"),
            }
            version
        }
        Err(e) => {
            warn!(engine = %engine.display(), "cannot query version: {}", e);
            None
        }
    }
}

/// Runs `<engine> --get-schema --schema-path <path>` and checks that the file
/// it writes parses as JSON.
pub fn schema_test(engine: &Path, schema_path: &Path) -> TestEntry {
    let started = Instant::now();
    let _ = fs::remove_file(schema_path);
    let status = Command::new(engine)
        .arg("--get-schema")
        .arg("--schema-path")
        .arg(schema_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let detail = match status {
        Err(e) => Some(format!("cannot run {}: {}", engine.display(), e)),
        Ok(s) if !s.success() => Some(format!("--get-schema exited with {}", s)),
        Ok(_) => match load_json_file(schema_path) {
            Ok(_) => None,
            Err(e) => Some(format!("Failed to load schema: {}", e)),
        },
    };
    match detail {
        None => {
            info!(path = %schema_path.display(), "schema test passed");
            TestEntry::passed("schema", started.elapsed())
        }
        Some(detail) => {
            error!("schema test failed: {}", detail);
            TestEntry::failed("schema", detail).with_artifact(Some(schema_path.to_path_buf()))
        }
    }
}

/// Runs the component test binary from its own directory.
pub fn component_tests(program: &Path) -> TestEntry {
    let started = Instant::now();
    let mut cmd = Command::new(program);
    if let Some(dir) = program.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }
    let status = cmd.stdin(Stdio::null()).status();
    match status {
        Ok(s) if s.success() => TestEntry::passed("component_tests", started.elapsed()),
        Ok(s) => {
            error!(program = %program.display(), "component tests failed: {}", s);
            TestEntry::failed("component_tests", format!("component tests exited with {}", s))
        }
        Err(e) => {
            error!(program = %program.display(), "cannot run component tests: {}", e);
            TestEntry::errored(
                "component_tests",
                format!("cannot run {}: {}", program.display(), e),
            )
        }
    }
}
