//! Execution backends: local child processes or a cluster scheduler.

use crate::config::ExecutionMode;
use crate::error::RunError;
use crate::state::RunStatus;
use std::path::PathBuf;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

pub mod cluster;
pub mod local;

pub use cluster::{ClusterBackend, ClusterSettings, HpcJobCli, SchedulerClient, SubmitCommand};
pub use local::LocalBackend;

/// A commissioned job: its working directory exists and holds every input
/// the engine needs.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub sim_id: String,
    /// Scenario path, used in log lines.
    pub scenario: String,
    /// Human readable name from `Config_Name`.
    pub config_name: String,
    pub work_dir: PathBuf,
    pub engine: PathBuf,
    /// Value passed to `--input-path`.
    pub input_path: String,
    pub python_script_path: Option<String>,
    pub num_cores: u32,
}

#[derive(Debug)]
pub enum HandleKind {
    Process(Child),
    Scheduled { job_id: u64 },
}

#[derive(Debug)]
pub struct JobHandle {
    pub kind: HandleKind,
    pub work_dir: PathBuf,
    started: Instant,
    elapsed: Option<Duration>,
}

impl JobHandle {
    pub fn new(kind: HandleKind, work_dir: PathBuf) -> Self {
        Self {
            kind,
            work_dir,
            started: Instant::now(),
            elapsed: None,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Recorded run time, or wall time so far when none was recorded.
    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.started.elapsed())
    }

    pub fn finish(&mut self, duration: Duration) {
        self.elapsed = Some(duration);
    }
}

pub trait ExecutionBackend: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    fn start(&self, job: &PreparedJob) -> Result<JobHandle, RunError>;

    fn poll(&self, handle: &mut JobHandle) -> Result<RunStatus, RunError>;

    fn duration(&self, handle: &JobHandle) -> Duration {
        handle.elapsed()
    }

    fn poll_interval(&self) -> Duration;
}

/// Polls until the backend reports a terminal status.
pub fn wait_for_exit(
    backend: &dyn ExecutionBackend,
    handle: &mut JobHandle,
) -> Result<RunStatus, RunError> {
    loop {
        let status = backend.poll(handle)?;
        if status.is_terminal() {
            return Ok(status);
        }
        thread::sleep(backend.poll_interval());
    }
}
