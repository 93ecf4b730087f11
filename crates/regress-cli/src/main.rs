use anyhow::Result;
use clap::Parser;
use regress_runner::config::{parse_constraints, DEFAULT_CONFIG_FILE, DEFAULT_MAX_ACTIVE};
use regress_runner::{EntryStatus, RunOptions, SuiteOutcome};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "regress",
    version = "0.3.0",
    about = "Regression harness for simulation engine builds"
)]
struct Cli {
    /// Suite JSON files or scenario directories, comma separated.
    suite: String,
    /// Engine binary; defaults to the Release (or Debug) build path.
    exe_path: Option<PathBuf>,
    #[arg(long)]
    perf: bool,
    /// Unattended run: no plots, bounded retries, timestep drift fails.
    #[arg(long)]
    hide_graphs: bool,
    #[arg(long)]
    debug: bool,
    #[arg(long)]
    quick_start: bool,
    #[arg(long)]
    label: Option<String>,
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    disable_schema_test: bool,
    #[arg(long)]
    use_dlls: bool,
    #[arg(long)]
    dll_path: Option<PathBuf>,
    #[arg(long)]
    skip_plugin_check: bool,
    #[arg(long)]
    all_outputs: bool,
    #[arg(long = "constraint")]
    constraints: Vec<String>,
    #[arg(long)]
    local: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_ACTIVE)]
    max_active: usize,
    #[arg(long)]
    plotter: Option<String>,
    #[arg(long)]
    component_tests: Option<PathBuf>,
    #[arg(long, default_value = "reports")]
    report_dir: PathBuf,
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn run_options(&self) -> Result<RunOptions> {
        Ok(RunOptions {
            suites: vec![self.suite.clone()],
            exe_path: self.exe_path.clone(),
            perf: self.perf,
            hide_graphs: self.hide_graphs,
            debug: self.debug,
            quick_start: self.quick_start,
            label: self.label.clone(),
            config_path: self.config.clone(),
            disable_schema_test: self.disable_schema_test,
            use_dlls: self.use_dlls,
            dll_path: self.dll_path.clone(),
            skip_plugin_check: self.skip_plugin_check,
            all_outputs: self.all_outputs,
            constraints: parse_constraints(&self.constraints)?,
            local: self.local,
            max_active: self.max_active,
            plotter: self.plotter.clone(),
            component_tests: self.component_tests.clone(),
            report_dir: self.report_dir.clone(),
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = cli.run_options().and_then(|opts| regress_runner::run_suite(&opts));
    match result {
        Ok(outcome) => {
            let all_passed = outcome.report.all_passed();
            if cli.json {
                emit_json(&outcome_to_json(&outcome));
            } else {
                print_outcome(&outcome);
            }
            if !all_passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if cli.json {
                emit_json(&json_error("run_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn print_outcome(outcome: &SuiteOutcome) {
    let report = &outcome.report;
    for entry in &report.entries {
        match entry.status {
            EntryStatus::Failed | EntryStatus::Errored => {
                println!("{} {}", status_word(entry.status), entry.name);
                for line in entry.detail.lines() {
                    println!("    {}", line);
                }
            }
            _ => {}
        }
    }
    if let Some(path) = &outcome.report_path {
        println!("{}", report.summary_line());
        println!("report: {}", path.display());
    }
    if let Some(path) = &outcome.sweep_out {
        println!("sweep_out: {}", path.display());
    }
    println!("run_id: {}", outcome.run_id);
    println!("elapsed: {:.1}s", outcome.elapsed.as_secs_f64());
    if !report.final_warnings.is_empty() {
        println!("----------------");
        for w in &report.final_warnings {
            println!("{}", w);
        }
        println!("----------------");
    }
}

fn status_word(status: EntryStatus) -> &'static str {
    match status {
        EntryStatus::Passed => "PASS",
        EntryStatus::Failed => "FAIL",
        EntryStatus::Errored => "ERROR",
        EntryStatus::Collected => "DONE",
    }
}

fn outcome_to_json(outcome: &SuiteOutcome) -> Value {
    let report = &outcome.report;
    json!({
        "ok": report.all_passed(),
        "command": "run",
        "run_id": outcome.run_id,
        "mode": outcome.mode,
        "summary": report.summary_line(),
        "tests": report.tests,
        "passed": report.passed,
        "failed": report.failed,
        "errors": report.errors,
        "schema": report.schema,
        "version": report.version,
        "report_path": outcome.report_path.as_ref().map(|p| p.display().to_string()),
        "sweep_out": outcome.sweep_out.as_ref().map(|p| p.display().to_string()),
        "elapsed_seconds": outcome.elapsed.as_secs_f64(),
        "entries": report.entries,
        "warnings": report.final_warnings
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_run_options() {
        let cli = Cli::parse_from([
            "regress",
            "generic.json,vector.json",
            "/bin/Eradication",
            "--hide-graphs",
            "--dll-path",
            "/plugins",
            "--constraint",
            "Simulation_Type:VECTOR_SIM",
            "--constraint",
            "Enable_Vital_Dynamics:True,Num_Cores:1",
            "--max-active",
            "4",
        ]);
        let opts = cli.run_options().unwrap();
        assert_eq!(opts.suites, vec!["generic.json,vector.json".to_string()]);
        assert_eq!(opts.exe_path, Some(PathBuf::from("/bin/Eradication")));
        assert!(opts.hide_graphs);
        assert!(opts.use_dlls());
        assert_eq!(opts.max_active, 4);
        assert_eq!(opts.constraints.len(), 3);
        assert_eq!(opts.constraints["Num_Cores"], "1");
        assert_eq!(opts.config_path, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn defaults_follow_library_defaults() {
        let cli = Cli::parse_from(["regress", "sanity"]);
        let opts = cli.run_options().unwrap();
        assert_eq!(opts.max_active, DEFAULT_MAX_ACTIVE);
        assert_eq!(opts.report_dir, PathBuf::from("reports"));
        assert!(opts.exe_path.is_none());
    }

    #[test]
    fn malformed_constraint_is_rejected() {
        let cli = Cli::parse_from(["regress", "sanity", "--constraint", "novalue"]);
        assert!(cli.run_options().is_err());
    }

    #[test]
    fn error_payload_shape() {
        let v = json_error("run_failed", "boom".into(), json!({}));
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "run_failed");
    }
}
