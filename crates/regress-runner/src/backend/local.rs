use super::{ExecutionBackend, HandleKind, JobHandle, PreparedJob};
use crate::config::ExecutionMode;
use crate::error::RunError;
use crate::state::RunStatus;
use std::fs::File;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{error, info};

/// Runs the engine as a child process in the job's working directory.
/// `poll` blocks for the lifetime of the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn command(job: &PreparedJob) -> Command {
        let mut cmd = Command::new(&job.engine);
        cmd.arg("-C")
            .arg("config.json")
            .arg("--input-path")
            .arg(&job.input_path);
        if let Some(psp) = &job.python_script_path {
            cmd.arg("--python-script-path").arg(psp);
        }
        cmd.current_dir(&job.work_dir);
        cmd
    }
}

impl ExecutionBackend for LocalBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Local
    }

    fn start(&self, job: &PreparedJob) -> Result<JobHandle, RunError> {
        let stdout = File::create(job.work_dir.join("stdout.txt"))?;
        let stderr = File::create(job.work_dir.join("stderr.txt"))?;
        let mut cmd = Self::command(job);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        let child = cmd.spawn().map_err(|e| {
            RunError::Execution(format!("cannot start {}: {}", job.engine.display(), e))
        })?;
        info!(
            scenario = %job.scenario,
            work_dir = %job.work_dir.display(),
            "running '{}'",
            job.config_name
        );
        Ok(JobHandle::new(HandleKind::Process(child), job.work_dir.clone()))
    }

    fn poll(&self, handle: &mut JobHandle) -> Result<RunStatus, RunError> {
        let started = handle.started();
        let HandleKind::Process(child) = &mut handle.kind else {
            return Err(RunError::Execution(
                "local backend asked to poll a non-process handle".to_string(),
            ));
        };
        let status = child.wait()?;
        handle.finish(started.elapsed());
        if status.success() {
            Ok(RunStatus::Completed)
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            error!(work_dir = %handle.work_dir.display(), %code, "engine exited with failure");
            Ok(RunStatus::Failed)
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn command_line_matches_engine_contract() {
        let job = PreparedJob {
            sim_id: "2024_01_01_00_00_00_000_0001".into(),
            scenario: "Generic/SEIR".into(),
            config_name: "SEIR".into(),
            work_dir: PathBuf::from("/sims/x"),
            engine: PathBuf::from("/bin/abc/Eradication"),
            input_path: ".;/home/input/Namawala".into(),
            python_script_path: Some(".".into()),
            num_cores: 1,
        };
        let cmd = LocalBackend::command(&job);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-C",
                "config.json",
                "--input-path",
                ".;/home/input/Namawala",
                "--python-script-path",
                "."
            ]
        );
        assert_eq!(cmd.get_current_dir(), Some(std::path::Path::new("/sims/x")));
    }
}
