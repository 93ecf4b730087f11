//! Orchestration of a regression run: load suites, commission and dispatch
//! jobs under a concurrency ceiling, verify outputs and write the report.

use anyhow::{bail, Context, Result};
use chrono::Local;
use regress_compare::CompareOptions;
use regress_core::{atomic_write_json_pretty, ArtifactCache};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub mod backend;
pub mod commission;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod probe;
pub mod report;
pub mod state;
pub mod suite;
pub mod verify;

pub use backend::{ClusterBackend, ExecutionBackend, LocalBackend, PreparedJob};
pub use commission::{CommissionSettings, Commissioner, PluginSet};
pub use config::{ExecutionMode, RunOptions, RuntimeConfig};
pub use dispatch::{Dispatcher, SlotBudget, SlotPermit};
pub use error::RunError;
pub use report::{spawn_aggregator, EntryStatus, RegressionReport, TestEntry};
pub use state::{JobEvent, JobState, RunStatus};
pub use suite::{ConfigSource, JobPlan, JobSpec, LoadIssue, MaterializedConfigs, SimulationIdGen, Suite, SuiteKind};
pub use verify::{DiagnosticPlotter, Verifier};

pub struct SuiteOutcome {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub report: RegressionReport,
    /// `None` for sweeps that are only collected.
    pub report_path: Option<PathBuf>,
    pub sweep_out: Option<PathBuf>,
    pub elapsed: Duration,
}

pub fn run_suite(opts: &RunOptions) -> Result<SuiteOutcome> {
    run_suite_with(opts, &MaterializedConfigs)
}

pub fn run_suite_with(opts: &RunOptions, source: &dyn ConfigSource) -> Result<SuiteOutcome> {
    let started = Instant::now();
    let config = RuntimeConfig::load(&opts.config_path)
        .with_context(|| format!("loading {}", opts.config_path.display()))?;
    let mode = opts.execution_mode(&config);
    let roots = config.roots(mode)?.clone();
    let suite = suite::load_suites(&opts.suites).context("loading suites")?;
    info!(kind = %suite.kind, ?mode, "loaded suite");

    let engine = opts.executable_path();
    if !engine.is_file() {
        bail!("engine executable {} not found", engine.display());
    }
    let version = probe::detect_version(&engine);

    let ids = SimulationIdGen::new(Local::now());
    let run_id = ids.first_id();
    let cache = ArtifactCache::new(roots.bin_root.clone());
    let (plugins, plugin_warnings) = if opts.use_dlls() {
        let source_dir = opts.plugin_source_dir(config.src_root.as_deref());
        PluginSet::resolve(&source_dir, &roots.dll_root, opts.skip_plugin_check)
    } else {
        (PluginSet::default(), Vec::new())
    };

    let backend: Box<dyn ExecutionBackend> = match mode {
        ExecutionMode::Local => Box::new(LocalBackend),
        ExecutionMode::Cluster => {
            let hpc = config
                .hpc
                .as_ref()
                .context("cluster mode needs an [HPC] section")?;
            let settings = backend::ClusterSettings::from_hpc(
                hpc,
                opts.perf,
                opts.hide_graphs,
                opts.label.clone(),
            );
            let client = Arc::new(backend::HpcJobCli::new(
                hpc.scheduler_cli.clone(),
                hpc.head_node.clone(),
            ));
            let cluster = ClusterBackend::new(client, settings);
            cluster
                .preflight()
                .context("cluster preflight submission failed")?;
            Box::new(cluster)
        }
    };

    let plan = JobPlan {
        source,
        ids: &ids,
        mode,
        constraints: &opts.constraints,
    };
    let (jobs, issues) = plan.build(&suite);

    let mut report = RegressionReport::new(version.clone());
    for w in plugin_warnings {
        report.warn(w);
    }
    let mut early = Vec::new();
    for issue in issues {
        match issue {
            LoadIssue::Errored { name, error } => {
                early.push(TestEntry::errored(name, error.to_string()))
            }
            LoadIssue::Skipped { name, reason } => {
                report.warn(format!("Skipped {}: {}", name, reason))
            }
        }
    }

    let is_sweep = suite.kind.is_sweep();
    let run_schema = !is_sweep && !opts.disable_schema_test;
    let expected = jobs.len()
        + early.len()
        + usize::from(run_schema)
        + usize::from(opts.component_tests.is_some());
    let (tx, aggregator) = spawn_aggregator(expected, report);
    for entry in early {
        let _ = tx.send(entry);
    }

    let mut schema = "not tested".to_string();
    if run_schema {
        let entry = probe::schema_test(&engine, &opts.report_dir.join("test-schema.json"));
        schema = if entry.status == EntryStatus::Passed {
            "pass".to_string()
        } else {
            "fail".to_string()
        };
        let _ = tx.send(entry);
    }

    let compare_opts = CompareOptions {
        automated: opts.hide_graphs,
        ..CompareOptions::default()
    };
    let plotter = if opts.hide_graphs {
        None
    } else {
        opts.plotter.as_deref().and_then(DiagnosticPlotter::parse)
    };
    let verifier = Verifier::new(compare_opts, opts.all_outputs)
        .with_plotter(plotter)
        .with_version(version);
    let commissioner = Commissioner::new(
        CommissionSettings {
            sim_root: roots.sim_root.clone(),
            input_root: roots.input_root.clone(),
            home_input: roots.home_input.clone(),
            skip_plugin_check: opts.skip_plugin_check,
        },
        engine.clone(),
        cache,
        plugins,
    );

    let mut collected: Vec<(String, PathBuf)> = jobs
        .iter()
        .map(|j| (j.sim_id.clone(), commissioner.work_dir(j)))
        .collect();
    let dispatcher = Dispatcher::new(opts.max_active, &commissioner, backend.as_ref(), &verifier);
    dispatcher.run(jobs, &tx);
    info!(peak = dispatcher.budget().peak(), "all simulations finished");

    if let Some(program) = &opts.component_tests {
        let _ = tx.send(probe::component_tests(program));
    }
    drop(tx);

    let mut report = aggregator
        .join()
        .map_err(|_| anyhow::anyhow!("result aggregator panicked"))?;
    report.schema = schema;
    let elapsed = started.elapsed();

    let report_path = if is_sweep && suite.kind != SuiteKind::ScienceSweep {
        None
    } else {
        let path = opts.report_dir.join(format!("report_{}.xml", run_id));
        report
            .write_xml(&path, elapsed)
            .with_context(|| format!("writing {}", path.display()))?;
        Some(path)
    };

    let sweep_out = if is_sweep {
        let finished: Vec<&PathBuf> = report
            .entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Collected | EntryStatus::Passed))
            .filter_map(|e| e.work_dir.as_ref())
            .collect();
        collected.retain(|(_, dir)| finished.contains(&dir));
        collected.sort();
        let dirs: Vec<String> = collected
            .iter()
            .map(|(_, d)| d.display().to_string())
            .collect();
        let path = PathBuf::from("sweep_out.json");
        match atomic_write_json_pretty(&path, &json!(dirs)) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("problem writing sweep_out.json: {}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(SuiteOutcome {
        run_id,
        mode,
        report,
        report_path,
        sweep_out,
        elapsed,
    })
}
