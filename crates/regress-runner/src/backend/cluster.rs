//! Cluster execution through a job scheduler's command line tool.

use super::{ExecutionBackend, HandleKind, JobHandle, PreparedJob};
use crate::config::{ExecutionMode, HpcSection};
use crate::error::RunError;
use crate::state::RunStatus;
use std::fs;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

pub const JOB_NAME_LIMIT: usize = 79;
pub const AUTOMATED_SUBMIT_ATTEMPTS: u32 = 5;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Submits and inspects scheduler jobs.
pub trait SchedulerClient: Send + Sync {
    /// Returns the scheduler's job id.
    fn submit(&self, command: &SubmitCommand) -> Result<u64, String>;

    /// Raw text of the scheduler's job view.
    fn view(&self, job_id: u64) -> Result<String, String>;
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub head_node: String,
    pub node_group: String,
    pub username: Option<String>,
    pub cores_per_socket: u32,
    pub cores_per_node: u32,
    pub perf: bool,
    pub label: Option<String>,
    /// `None` retries submission forever.
    pub max_attempts: Option<u32>,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
}

impl ClusterSettings {
    pub fn from_hpc(hpc: &HpcSection, perf: bool, automated: bool, label: Option<String>) -> Self {
        Self {
            head_node: hpc.head_node.clone(),
            node_group: hpc.node_group.clone(),
            username: hpc.username.clone(),
            cores_per_socket: hpc.cores_per_socket,
            cores_per_node: hpc.cores_per_node,
            perf,
            label,
            max_attempts: automated.then_some(AUTOMATED_SUBMIT_ATTEMPTS),
            retry_delay: Duration::from_secs(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Arguments following `<scheduler> submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCommand {
    pub options: Vec<String>,
    pub command: Vec<String>,
}

impl SubmitCommand {
    pub fn build(job: &PreparedJob, settings: &ClusterSettings) -> Self {
        let mut options = base_options(settings, "Normal");
        options.push("/stdout:StdOut.txt".to_string());
        options.push("/stderr:StdErr.txt".to_string());
        options.push(format!("/workdir:{}", job.work_dir.display()));
        options.push(format!("/jobname:{}", job_name(job, settings.label.as_deref())));

        let cores = job.num_cores.max(1);
        let mut mpi_cores = None;
        let mut resource = format!("/numcores:{}", cores);
        if settings.perf {
            if settings.cores_per_node > 0 && cores % settings.cores_per_node == 0 {
                resource = format!("/numnodes:{}", cores / settings.cores_per_node);
                mpi_cores = Some(settings.cores_per_node);
            } else if cores == settings.cores_per_socket {
                resource = "/numsockets:1".to_string();
                mpi_cores = Some(settings.cores_per_socket);
            }
        }
        options.push(resource);

        let mut command = vec!["mpiexec".to_string()];
        if let Some(n) = mpi_cores {
            command.push("-c".to_string());
            command.push(n.to_string());
        }
        command.push(job.engine.display().to_string());
        command.extend(
            ["--config", "config.json", "--input-path"]
                .iter()
                .map(|s| s.to_string()),
        );
        command.push(job.input_path.clone());
        command.push("--progress".to_string());
        if let Some(psp) = &job.python_script_path {
            command.push("--python-script-path".to_string());
            command.push(psp.clone());
        }
        Self { options, command }
    }

    /// Trivial job used to check credentials before a suite starts.
    pub fn probe(settings: &ClusterSettings) -> Self {
        Self {
            options: base_options(settings, "Highest"),
            command: vec!["dir".to_string()],
        }
    }

    pub fn args(&self) -> impl Iterator<Item = &str> {
        self.options
            .iter()
            .chain(self.command.iter())
            .map(String::as_str)
    }

    pub fn render(&self) -> String {
        self.args().collect::<Vec<_>>().join(" ")
    }
}

fn base_options(settings: &ClusterSettings, priority: &str) -> Vec<String> {
    let mut options = vec![
        format!("/scheduler:{}", settings.head_node),
        format!("/nodegroup:{}", settings.node_group),
    ];
    if let Some(user) = &settings.username {
        options.push(format!("/user:{}", user));
    }
    if settings.perf {
        options.push("/exclusive".to_string());
    }
    options.push(format!("/priority:{}", priority));
    options
}

/// `<Config_Name>[_<label>]_(<sim id>)`, spaces replaced, cut to the
/// scheduler's name limit.
pub fn job_name(job: &PreparedJob, label: Option<&str>) -> String {
    let base = job.config_name.replace(' ', "_");
    let full = match label {
        Some(label) => format!("{}_{}_({})", base, label, job.sim_id),
        None => format!("{}_({})", base, job.sim_id),
    };
    full.chars().take(JOB_NAME_LIMIT).collect()
}

/// Last whitespace token of the submit output, trailing `.` removed.
pub fn parse_job_id(stdout: &str) -> Option<u64> {
    let token = stdout.split_whitespace().last()?;
    token
        .trim_end_matches('.')
        .parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
}

/// Reads the engine's `Done - HH:MM:SS` line.
pub fn parse_status_duration(text: &str) -> Option<Duration> {
    let line = text.lines().find(|l| l.starts_with("Done"))?;
    let (_, clock) = line.split_once('-')?;
    let mut parts = clock.trim().split(':').map(|p| p.trim().parse::<u64>());
    let (h, m, s) = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
    Some(Duration::from_secs(h * 3600 + m * 60 + s))
}

/// Shells out to the scheduler tool (`job submit`, `job view`).
#[derive(Debug, Clone)]
pub struct HpcJobCli {
    program: String,
    head_node: String,
}

impl HpcJobCli {
    pub fn new(program: impl Into<String>, head_node: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            head_node: head_node.into(),
        }
    }
}

impl SchedulerClient for HpcJobCli {
    fn submit(&self, command: &SubmitCommand) -> Result<u64, String> {
        let output = Command::new(&self.program)
            .arg("submit")
            .args(command.args())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("cannot run {}: {}", self.program, e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(format!(
                "{} submit failed: {} {}",
                self.program,
                stdout.trim(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_job_id(&stdout).ok_or_else(|| format!("unexpected submit output: {}", stdout.trim()))
    }

    fn view(&self, job_id: u64) -> Result<String, String> {
        let output = Command::new(&self.program)
            .arg("view")
            .arg(format!("/scheduler:{}", self.head_node))
            .arg(job_id.to_string())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("cannot run {}: {}", self.program, e))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub struct ClusterBackend {
    client: Arc<dyn SchedulerClient>,
    settings: ClusterSettings,
}

impl ClusterBackend {
    pub fn new(client: Arc<dyn SchedulerClient>, settings: ClusterSettings) -> Self {
        Self { client, settings }
    }

    /// Submits a trivial job once so bad credentials surface before any
    /// scenario is commissioned.
    pub fn preflight(&self) -> Result<u64, RunError> {
        let probe = SubmitCommand::probe(&self.settings);
        self.client.submit(&probe).map_err(|msg| {
            error!(
                "failed to submit test job to the cluster; check cached credentials and that {} is reachable: {}",
                self.settings.head_node, msg
            );
            RunError::Scheduler { attempts: 1 }
        })
    }
}

impl ExecutionBackend for ClusterBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Cluster
    }

    fn start(&self, job: &PreparedJob) -> Result<JobHandle, RunError> {
        let command = SubmitCommand::build(job, &self.settings);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.client.submit(&command) {
                Ok(job_id) => {
                    info!(scenario = %job.scenario, job_id, "submitted");
                    return Ok(JobHandle::new(
                        HandleKind::Scheduled { job_id },
                        job.work_dir.clone(),
                    ));
                }
                Err(msg) => {
                    warn!(scenario = %job.scenario, attempt = attempts, "job submit failed: {}", msg);
                }
            }
            if self.settings.max_attempts.is_some_and(|max| attempts >= max) {
                error!(
                    scenario = %job.scenario,
                    attempts,
                    "job submission failed multiple times; aborting this test"
                );
                return Err(RunError::Scheduler { attempts });
            }
            thread::sleep(self.settings.retry_delay);
        }
    }

    fn poll(&self, handle: &mut JobHandle) -> Result<RunStatus, RunError> {
        let HandleKind::Scheduled { job_id } = handle.kind else {
            return Err(RunError::Execution(
                "cluster backend asked to poll an unscheduled handle".to_string(),
            ));
        };
        let view = match self.client.view(job_id) {
            Ok(text) => text,
            Err(msg) => {
                warn!(job_id, "job view failed: {}", msg);
                return Ok(RunStatus::Running);
            }
        };
        let status = RunStatus::from_scheduler_view(&view);
        if status == RunStatus::Completed {
            let reported = fs::read_to_string(handle.work_dir.join("status.txt"))
                .ok()
                .and_then(|text| parse_status_duration(&text));
            let elapsed = reported.unwrap_or_else(|| handle.started().elapsed());
            handle.finish(elapsed);
        } else if status.is_terminal() {
            let elapsed = handle.started().elapsed();
            handle.finish(elapsed);
        }
        Ok(status)
    }

    fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings(perf: bool) -> ClusterSettings {
        ClusterSettings {
            head_node: "HEAD01".into(),
            node_group: "emod".into(),
            username: Some("DOMAIN\\tester".into()),
            cores_per_socket: 8,
            cores_per_node: 16,
            perf,
            label: None,
            max_attempts: Some(AUTOMATED_SUBMIT_ATTEMPTS),
            retry_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
        }
    }

    fn job(cores: u32, name: &str) -> PreparedJob {
        PreparedJob {
            sim_id: "2017_05_10_18_42_23_865_0001".into(),
            scenario: "Generic/Births".into(),
            config_name: name.into(),
            work_dir: PathBuf::from(r"\\share\sims\2017_05_10_18_42_23_865_0001"),
            engine: PathBuf::from(r"\\share\bin\abc\Eradication.exe"),
            input_path: r".;\\share\input\Namawala".into(),
            python_script_path: None,
            num_cores: cores,
        }
    }

    #[test]
    fn default_submission_requests_cores() {
        let cmd = SubmitCommand::build(&job(2, "Births and deaths"), &settings(false));
        assert!(cmd.options.contains(&"/scheduler:HEAD01".to_string()));
        assert!(cmd.options.contains(&"/user:DOMAIN\\tester".to_string()));
        assert!(cmd.options.contains(&"/priority:Normal".to_string()));
        assert!(cmd.options.contains(&"/numcores:2".to_string()));
        assert!(!cmd.options.contains(&"/exclusive".to_string()));
        assert!(cmd
            .options
            .contains(&"/jobname:Births_and_deaths_(2017_05_10_18_42_23_865_0001)".to_string()));
        assert_eq!(cmd.command[0], "mpiexec");
        assert_eq!(cmd.command[1], r"\\share\bin\abc\Eradication.exe");
        assert_eq!(cmd.command.last().map(String::as_str), Some("--progress"));
    }

    #[test]
    fn perf_mode_requests_whole_nodes_or_a_socket() {
        let nodes = SubmitCommand::build(&job(32, "x"), &settings(true));
        assert!(nodes.options.contains(&"/exclusive".to_string()));
        assert!(nodes.options.contains(&"/numnodes:2".to_string()));
        assert_eq!(&nodes.command[..3], &["mpiexec", "-c", "16"]);

        let socket = SubmitCommand::build(&job(8, "x"), &settings(true));
        assert!(socket.options.contains(&"/numsockets:1".to_string()));
        assert_eq!(&socket.command[..3], &["mpiexec", "-c", "8"]);

        let odd = SubmitCommand::build(&job(3, "x"), &settings(true));
        assert!(odd.options.contains(&"/numcores:3".to_string()));
        assert_eq!(odd.command[1], r"\\share\bin\abc\Eradication.exe");
    }

    #[test]
    fn job_name_is_truncated() {
        let long = "A very long configuration name ".repeat(5);
        let name = job_name(&job(1, &long), Some("nightly"));
        assert_eq!(name.chars().count(), JOB_NAME_LIMIT);
        assert!(name.starts_with("A_very_long"));
    }

    #[test]
    fn job_id_comes_from_last_token() {
        assert_eq!(parse_job_id("Job has been submitted. ID: 4412."), Some(4412));
        assert_eq!(parse_job_id("Job has been submitted. ID: 0."), None);
        assert_eq!(parse_job_id("error"), None);
        assert_eq!(parse_job_id(""), None);
    }

    #[test]
    fn status_file_duration() {
        let text = "Beginning Simulation...\nDone - 01:02:03\n";
        assert_eq!(parse_status_duration(text), Some(Duration::from_secs(3723)));
        assert_eq!(parse_status_duration("Running"), None);
    }

    #[test]
    fn probe_uses_highest_priority() {
        let probe = SubmitCommand::probe(&settings(false));
        assert!(probe.options.contains(&"/priority:Highest".to_string()));
        assert_eq!(probe.command, vec!["dir".to_string()]);
    }
}
