//! Turns a [`JobSpec`] into a populated working directory.

use crate::backend::PreparedJob;
use crate::error::RunError;
use crate::suite::JobSpec;
use regress_core::{atomic_write_json_pretty, ensure_dir, ArtifactCache};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const PLUGIN_KINDS: [&str; 3] = ["disease_plugins", "reporter_plugins", "interventions"];

const NOT_INPUT_FILES: [&str; 2] = ["Campaign_Filename", "Custom_Reports_Filename"];

fn plugin_extension() -> &'static str {
    if cfg!(windows) {
        "dll"
    } else {
        "so"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginEntry {
    pub kind: String,
    /// File stem without a `lib` prefix; matched against report class names.
    pub name: String,
    pub path: PathBuf,
}

/// Engine plugins resolved into the binary cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginSet {
    pub entries: Vec<PluginEntry>,
}

impl PluginSet {
    /// Caches every plugin found under `<source_dir>/<kind>/` into
    /// `<dll_root>/<kind>/<hash>/`. Failures are returned as warnings so the
    /// suite can still run without the affected plugin.
    pub fn resolve(source_dir: &Path, dll_root: &Path, skip_check: bool) -> (Self, Vec<String>) {
        let mut set = PluginSet::default();
        let mut warnings = Vec::new();
        if !source_dir.is_dir() {
            warnings.push(format!(
                "Plugin directory {} does not exist; not using plugins.",
                source_dir.display()
            ));
            return (set, warnings);
        }
        info!(dir = %source_dir.display(), "resolving engine plugins");
        for kind in PLUGIN_KINDS {
            let dir = source_dir.join(kind);
            if !dir.is_dir() {
                continue;
            }
            let cache = ArtifactCache::new(dll_root.join(kind));
            let files = WalkDir::new(&dir)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| {
                    e.path().extension().and_then(|x| x.to_str()) == Some(plugin_extension())
                });
            for file in files {
                let resolved = if skip_check {
                    cache.ensure_unchecked(file.path())
                } else {
                    cache.ensure(file.path())
                };
                match resolved {
                    Ok(path) => set.entries.push(PluginEntry {
                        kind: kind.to_string(),
                        name: plugin_name(file.path()),
                        path,
                    }),
                    Err(e) => {
                        warn!("{}", e);
                        warnings.push(format!("Failed to copy plugin: {}", e));
                    }
                }
            }
        }
        (set, warnings)
    }

    /// Content of `emodules_map.json`. Reporter plugins are limited to the
    /// classes the scenario's custom reports ask for.
    pub fn manifest(&self, custom_reports: Option<&Value>) -> Value {
        let wanted: BTreeSet<&str> = custom_reports
            .and_then(|r| r.get("Reports"))
            .and_then(Value::as_array)
            .map(|reports| {
                reports
                    .iter()
                    .filter_map(|r| r.get("class").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        let paths = |kind: &str, filter: bool| -> Vec<String> {
            self.entries
                .iter()
                .filter(|e| e.kind == kind)
                .filter(|e| !filter || wanted.contains(e.name.as_str()))
                .map(|e| e.path.display().to_string())
                .collect()
        };
        json!({
            "disease_plugins": paths("disease_plugins", false),
            "interventions": paths("interventions", false),
            "reporter_plugins": paths("reporter_plugins", true),
        })
    }
}

fn plugin_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.strip_prefix("lib").map(str::to_string).unwrap_or(stem)
}

#[derive(Debug, Clone)]
pub struct CommissionSettings {
    pub sim_root: PathBuf,
    /// Shared, read-only input tree, one directory per geography.
    pub input_root: PathBuf,
    /// Per-user input tree the engine actually reads; staged from
    /// `input_root` and the scenario directories.
    pub home_input: PathBuf,
    pub skip_plugin_check: bool,
}

pub struct Commissioner {
    settings: CommissionSettings,
    engine_source: PathBuf,
    cache: ArtifactCache,
    engine: Mutex<Option<PathBuf>>,
    plugins: PluginSet,
    dir_lock: Mutex<()>,
    stage_lock: Mutex<()>,
}

impl Commissioner {
    pub fn new(
        settings: CommissionSettings,
        engine_source: PathBuf,
        cache: ArtifactCache,
        plugins: PluginSet,
    ) -> Self {
        Self {
            settings,
            engine_source,
            cache,
            engine: Mutex::new(None),
            plugins,
            dir_lock: Mutex::new(()),
            stage_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Cached engine path. Resolved on first success and reused afterwards.
    pub fn engine(&self) -> Result<PathBuf, RunError> {
        let mut slot = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = slot.as_ref() {
            return Ok(path.clone());
        }
        let path = if self.settings.skip_plugin_check {
            self.cache.ensure_unchecked(&self.engine_source)?
        } else {
            self.cache.ensure(&self.engine_source)?
        };
        *slot = Some(path.clone());
        Ok(path)
    }

    pub fn work_dir(&self, job: &JobSpec) -> PathBuf {
        self.settings.sim_root.join(&job.sim_id)
    }

    pub fn commission(&self, job: &JobSpec) -> Result<PreparedJob, RunError> {
        let engine = self.engine()?;
        let work_dir = self.work_dir(job);
        self.create_work_dir(&work_dir)?;

        let commission_err =
            |what: &str, e: std::io::Error| RunError::Commission(format!("{}: {}", what, e));
        let params = &job.config["parameters"];
        let python_script_path = match params.get("Python_Script_Path").and_then(Value::as_str) {
            None | Some("NO") => None,
            Some("LOCAL") | Some("SHARED") | Some(".") => {
                copy_matching(&job.scenario, &work_dir, |name| {
                    name.starts_with("dtk_") && name.ends_with(".py")
                })
                .map_err(|e| commission_err("copying python scripts", e))?;
                Some(".".to_string())
            }
            Some(other) => {
                return Err(RunError::Configuration(format!(
                    "{} is not a valid value for Python_Script_Path. Valid values are NO, LOCAL, SHARED.",
                    other
                )))
            }
        };
        copy_matching(&job.scenario, &work_dir, |name| {
            name == "dtk_pre_process.py" || name == "dtk_post_process.py"
        })
        .map_err(|e| commission_err("copying processing scripts", e))?;
        let input_dir = self.stage_inputs(job, &work_dir)?;

        atomic_write_json_pretty(&work_dir.join("config.json"), &job.config)
            .map_err(|e| commission_err("writing config.json", e))?;
        if let Some(campaign) = &job.campaign {
            atomic_write_json_pretty(&work_dir.join("campaign.json"), campaign)
                .map_err(|e| commission_err("writing campaign.json", e))?;
        }
        if let Some(reports) = &job.custom_reports {
            atomic_write_json_pretty(&work_dir.join("custom_reports.json"), reports)
                .map_err(|e| commission_err("writing custom_reports.json", e))?;
        }
        let manifest = self.plugins.manifest(job.custom_reports.as_ref());
        atomic_write_json_pretty(&work_dir.join("emodules_map.json"), &manifest)
            .map_err(|e| commission_err("writing emodules_map.json", e))?;

        // The working directory is searched first so scenario-local copies win.
        let input_path = format!(".;{}", input_dir.display());

        debug!(sim_id = %job.sim_id, work_dir = %work_dir.display(), "commissioned");
        Ok(PreparedJob {
            sim_id: job.sim_id.clone(),
            scenario: job.name.clone(),
            config_name: job.config_name(),
            work_dir,
            engine,
            input_path,
            python_script_path,
            num_cores: num_cores(params),
        })
    }

    /// Copies every input file the config names. A file next to the scenario
    /// goes into the working directory; any other is refreshed from
    /// `<input_root>/<Geography>` into `<home_input>/<Geography>`, which is
    /// returned. Names found in neither place are logged and left to the
    /// engine to report.
    fn stage_inputs(&self, job: &JobSpec, work_dir: &Path) -> Result<PathBuf, RunError> {
        let params = &job.config["parameters"];
        let (shared, staged) = match params.get("Geography").and_then(Value::as_str) {
            Some(g) => (self.settings.input_root.join(g), self.settings.home_input.join(g)),
            None => (self.settings.input_root.clone(), self.settings.home_input.clone()),
        };
        let stage_err = |from: &Path, e: std::io::Error| {
            RunError::Commission(format!("cannot stage input {}: {}", from.display(), e))
        };
        // Jobs sharing a geography refresh the same files.
        let _guard = self.stage_lock.lock().unwrap_or_else(PoisonError::into_inner);
        ensure_dir(&staged).map_err(|e| stage_err(&staged, e))?;
        for input in input_files(params) {
            let Some(base) = Path::new(&input.name).file_name() else {
                continue;
            };
            let local = job.scenario.join(&input.name);
            let (from, to) = if local.is_file() {
                (local, work_dir.join(base))
            } else {
                (shared.join(&input.name), staged.join(base))
            };
            if !from.is_file() {
                warn!(
                    sim_id = %job.sim_id,
                    "input file '{}' not found in {} or {}",
                    input.name,
                    job.scenario.display(),
                    shared.display()
                );
                continue;
            }
            refresh(&from, &to).map_err(|e| stage_err(&from, e))?;
            if let Some(companion) = input.companion() {
                let header = append_extension(&from, &companion);
                if header.is_file() {
                    refresh(&header, &append_extension(&to, &companion))
                        .map_err(|e| stage_err(&header, e))?;
                }
            }
        }
        Ok(staged)
    }

    /// Serialized, and fails rather than reuse an existing directory.
    fn create_work_dir(&self, dir: &Path) -> Result<(), RunError> {
        let _guard = self.dir_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = dir.parent() {
            ensure_dir(parent).map_err(|e| {
                RunError::Commission(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        fs::create_dir(dir).map_err(|e| {
            RunError::Commission(format!(
                "cannot create working directory {}: {}",
                dir.display(),
                e
            ))
        })
    }
}

fn num_cores(params: &Value) -> u32 {
    match params.get("Num_Cores") {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32).unwrap_or(1),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(1),
        _ => 1,
    }
}

fn copy_matching(
    from: &Path,
    to: &Path,
    wanted: impl Fn(&str) -> bool,
) -> std::io::Result<()> {
    if !from.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(from).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if wanted(&*name) {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    Ok(())
}

/// One file named by a `*_Filename` / `*_Filenames` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub key: String,
    pub name: String,
}

impl InputFile {
    /// Binary climate and migration files travel with a `<name>.json` header.
    fn companion(&self) -> Option<&'static str> {
        let plain = self.key.starts_with("Demographics_") || self.key == "Load_Balance_Filename";
        (!plain).then_some("json")
    }
}

/// Files listed by `*_Filename` / `*_Filenames` parameters. String values
/// may hold several names separated by `;`.
pub fn input_files(params: &Value) -> Vec<InputFile> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    let mut files = Vec::new();
    for (key, value) in map {
        if !(key.ends_with("_Filename") || key.ends_with("_Filenames"))
            || NOT_INPUT_FILES.contains(&key.as_str())
        {
            continue;
        }
        let names: Vec<&str> = match value {
            Value::String(s) => s.split(';').collect(),
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        files.extend(
            names
                .into_iter()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(|n| InputFile {
                    key: key.clone(),
                    name: n.to_string(),
                }),
        );
    }
    files
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Copies `from` over `to` unless `to` is already at least as new.
fn refresh(from: &Path, to: &Path) -> std::io::Result<()> {
    let newer = |p: &Path| fs::metadata(p).and_then(|m| m.modified());
    if let (Ok(src), Ok(dst)) = (newer(from), newer(to)) {
        if dst >= src {
            return Ok(());
        }
    }
    fs::copy(from, to).map(|_| ())
}
