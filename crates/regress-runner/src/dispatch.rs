//! Concurrent job dispatch under a fixed ceiling of active simulations.
//!
//! Every job gets its own worker thread. A worker takes a slot from the
//! [`SlotBudget`] before it commissions or launches anything and gives the
//! slot back once the job reaches a terminal state, so at most `max_active`
//! simulations are ever between launch and verdict. Finished entries go to
//! the aggregator over a channel; workers never touch the report directly.

use crate::backend::{wait_for_exit, ExecutionBackend};
use crate::commission::Commissioner;
use crate::report::TestEntry;
use crate::state::{ExecutionRecord, JobEvent, JobState, RunStatus};
use crate::suite::{JobSpec, ScenarioType};
use crate::verify::Verifier;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug)]
struct SlotState {
    avail: usize,
    peak: usize,
}

/// Blocking counter of simulation slots.
#[derive(Debug)]
pub struct SlotBudget {
    total: usize,
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl SlotBudget {
    /// A ceiling of zero is treated as one.
    pub fn new(total: usize) -> Arc<Self> {
        let total = total.max(1);
        Arc::new(Self {
            total,
            state: Mutex::new(SlotState {
                avail: total,
                peak: 0,
            }),
            cv: Condvar::new(),
        })
    }

    fn lock_or_recover(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.lock_or_recover().avail
    }

    pub fn in_use(&self) -> usize {
        self.total.saturating_sub(self.available())
    }

    /// Highest number of slots held at once since creation.
    pub fn peak(&self) -> usize {
        self.lock_or_recover().peak
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotPermit> {
        let mut st = self.lock_or_recover();
        if st.avail == 0 {
            return None;
        }
        self.take(&mut st);
        Some(SlotPermit {
            budget: Arc::clone(self),
            active: true,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> SlotPermit {
        let mut st = self.lock_or_recover();
        while st.avail == 0 {
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        self.take(&mut st);
        SlotPermit {
            budget: Arc::clone(self),
            active: true,
        }
    }

    fn take(&self, st: &mut SlotState) {
        st.avail -= 1;
        st.peak = st.peak.max(self.total - st.avail);
    }

    fn release(&self) {
        let mut st = self.lock_or_recover();
        debug_assert!(st.avail < self.total, "slot released twice");
        st.avail = (st.avail + 1).min(self.total);
        drop(st);
        self.cv.notify_one();
    }
}

/// One held slot; released on drop.
#[derive(Debug)]
pub struct SlotPermit {
    budget: Arc<SlotBudget>,
    active: bool,
}

impl SlotPermit {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.active {
            self.active = false;
            self.budget.release();
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

pub struct Dispatcher<'a> {
    budget: Arc<SlotBudget>,
    commissioner: &'a Commissioner,
    backend: &'a dyn ExecutionBackend,
    verifier: &'a Verifier,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        max_active: usize,
        commissioner: &'a Commissioner,
        backend: &'a dyn ExecutionBackend,
        verifier: &'a Verifier,
    ) -> Self {
        Self {
            budget: SlotBudget::new(max_active),
            commissioner,
            backend,
            verifier,
        }
    }

    pub fn budget(&self) -> &Arc<SlotBudget> {
        &self.budget
    }

    /// Runs every job and sends exactly one entry per job. Returns once all
    /// workers have finished.
    pub fn run(&self, jobs: Vec<JobSpec>, tx: &Sender<TestEntry>) {
        thread::scope(|scope| {
            for job in jobs {
                let tx = tx.clone();
                scope.spawn(move || {
                    let entry = self.run_one(&job);
                    if tx.send(entry).is_err() {
                        error!(scenario = %job.name, "result aggregator is gone; entry dropped");
                    }
                });
            }
        });
    }

    /// Drives one job through its [`ExecutionRecord`]; the entry is read off
    /// the record once it stops moving.
    pub fn run_one(&self, job: &JobSpec) -> TestEntry {
        let permit = self.budget.acquire();
        let mut record = ExecutionRecord::new(job, self.backend.mode());
        let name = entry_name(job);
        debug!(scenario = %name, sim_id = %job.sim_id, backend = ?record.backend, "slot acquired");

        let mut run = Outcome::default();
        if let Err(detail) = self.drive(job, &name, &mut record, permit, &mut run) {
            // Failed and canceled exits are already final.
            if !matches!(record.state(), JobState::Failed | JobState::Canceled) {
                if let Err(e) = record.advance(JobEvent::Errored) {
                    warn!(sim_id = %record.sim_id, "{}", e);
                }
            }
            run.detail = detail;
        }
        TestEntry::from_record(name, record, job.scenario_type, run.detail, run.duration)
            .with_artifact(run.artifact)
            .with_warnings(run.warnings)
    }

    /// Returns `Err` with the entry detail as soon as the job cannot reach
    /// a verdict.
    fn drive(
        &self,
        job: &JobSpec,
        name: &str,
        record: &mut ExecutionRecord,
        permit: SlotPermit,
        run: &mut Outcome,
    ) -> Result<(), String> {
        let prepared = self.commissioner.commission(job).map_err(|e| {
            error!(scenario = %name, "failed to commission: {}", e);
            e.to_string()
        })?;
        let work_dir = prepared.work_dir.clone();
        record.work_dir = Some(work_dir.clone());

        let mut handle = self.backend.start(&prepared).map_err(|e| e.to_string())?;
        step(record, JobEvent::Launched)?;

        let status = wait_for_exit(self.backend, &mut handle).map_err(|e| {
            error!(scenario = %name, "lost track of simulation: {}", e);
            e.to_string()
        })?;
        step(record, JobEvent::Exited(status))?;
        run.duration = self.backend.duration(&handle);

        if record.state() != JobState::Completed {
            let word = if status == RunStatus::Canceled {
                "was canceled"
            } else {
                "failed"
            };
            return Err(format!(
                "Simulation {}. See {} for stdout.txt and stderr.txt.",
                word,
                work_dir.display()
            ));
        }

        if job.scenario_type == ScenarioType::Sweep {
            permit.release();
            return Ok(());
        }

        let verdict = match job.scenario_type {
            ScenarioType::Science => self.verifier.verify_science(&work_dir),
            _ => self.verifier.verify_regression(&job.scenario, &work_dir),
        };
        record.results = verdict.results;
        step(
            record,
            JobEvent::Verified {
                passed: verdict.passed,
            },
        )?;
        if verdict.passed {
            self.verifier.record_time(&work_dir, run.duration);
        }
        drop(permit);
        run.detail = verdict.detail;
        run.artifact = verdict.artifact;
        run.warnings = verdict.warnings;
        Ok(())
    }
}

/// What a worker learns beyond the state of its record.
#[derive(Debug, Default)]
struct Outcome {
    detail: String,
    duration: Duration,
    artifact: Option<PathBuf>,
    warnings: Vec<String>,
}

/// Report name: the scenario, plus the swept values for sweep members.
pub fn entry_name(job: &JobSpec) -> String {
    if job.overrides.is_empty() {
        return job.name.clone();
    }
    let values = job
        .overrides
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{} [{}]", job.name, values)
}

fn step(record: &mut ExecutionRecord, event: JobEvent) -> Result<(), String> {
    record.advance(event).map(|_| ()).map_err(|e| {
        error!(sim_id = %record.sim_id, "{}", e);
        format!("Job bookkeeping failed: {}", e)
    })
}
