//! Suite descriptors, scenario materialization and job construction.

use crate::config::ExecutionMode;
use crate::error::RunError;
use chrono::{DateTime, Local};
use regress_core::load_json_file;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("cannot load suite {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
    #[error("suite {0} names no tests, science, sweep or science_sweep list")]
    UnknownKind(PathBuf),
    #[error("cannot mix suite kinds: already running '{existing}', cannot add '{added}'")]
    MixedKinds { existing: SuiteKind, added: SuiteKind },
    #[error("malformed sweep: {0}")]
    Sweep(String),
    #[error("no suites given")]
    Empty,
}

/// Root key of a suite descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteKind {
    Tests,
    Science,
    Sweep,
    ScienceSweep,
}

impl SuiteKind {
    const ALL: [SuiteKind; 4] = [
        SuiteKind::Tests,
        SuiteKind::Science,
        SuiteKind::Sweep,
        SuiteKind::ScienceSweep,
    ];

    pub fn key(self) -> &'static str {
        match self {
            SuiteKind::Tests => "tests",
            SuiteKind::Science => "science",
            SuiteKind::Sweep => "sweep",
            SuiteKind::ScienceSweep => "science_sweep",
        }
    }

    pub fn is_sweep(self) -> bool {
        matches!(self, SuiteKind::Sweep | SuiteKind::ScienceSweep)
    }

    /// How each scenario of this suite is verified. A science sweep is still
    /// verified as science.
    pub fn scenario_type(self) -> ScenarioType {
        match self {
            SuiteKind::Tests => ScenarioType::Regression,
            SuiteKind::Science | SuiteKind::ScienceSweep => ScenarioType::Science,
            SuiteKind::Sweep => ScenarioType::Sweep,
        }
    }
}

impl fmt::Display for SuiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioType {
    Regression,
    Science,
    Sweep,
}

/// One swept parameter and its candidate values. Names containing `:`
/// address nested keys below `parameters`.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParam {
    pub name: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepSpec {
    pub path: PathBuf,
    pub params: Vec<SweepParam>,
}

impl SweepSpec {
    fn from_json(value: &Value) -> Result<Self, SuiteError> {
        let path = value
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| SuiteError::Sweep("missing 'path'".into()))?;
        let mut params = Vec::new();
        if let Some(name) = value.get("param_name").and_then(Value::as_str) {
            let values = value
                .get("param_values")
                .and_then(Value::as_array)
                .ok_or_else(|| SuiteError::Sweep(format!("missing param_values for {}", name)))?;
            params.push(SweepParam {
                name: name.to_string(),
                values: values.clone(),
            });
        } else if let Some(names) = value.get("param_names").and_then(Value::as_array) {
            for name in names {
                let name = name
                    .as_str()
                    .ok_or_else(|| SuiteError::Sweep("param_names must be strings".into()))?;
                let key = format!("{}_values", name);
                let values = value
                    .get(&key)
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        SuiteError::Sweep(format!("Missing {} for parameter: {}", key, name))
                    })?;
                params.push(SweepParam {
                    name: name.to_string(),
                    values: values.clone(),
                });
            }
        } else {
            return Err(SuiteError::Sweep(
                "expected param_name or param_names".into(),
            ));
        }
        if let Some(empty) = params.iter().find(|p| p.values.is_empty()) {
            return Err(SuiteError::Sweep(format!("no values for {}", empty.name)));
        }
        Ok(Self {
            path: PathBuf::from(path),
            params,
        })
    }

    /// Cartesian product of all parameter values. The first parameter varies
    /// slowest.
    pub fn expand(&self) -> Vec<BTreeMap<String, Value>> {
        let mut combos: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];
        for param in &self.params {
            let mut next = Vec::with_capacity(combos.len() * param.values.len());
            for combo in &combos {
                for value in &param.values {
                    let mut c = combo.clone();
                    c.insert(param.name.clone(), value.clone());
                    next.push(c);
                }
            }
            combos = next;
        }
        combos
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suite {
    pub kind: SuiteKind,
    pub scenarios: Vec<PathBuf>,
    pub sweep: Option<SweepSpec>,
}

/// Loads and merges comma-separated suite arguments. Each argument is either
/// a scenario directory or a suite JSON file (`.json` is appended when
/// missing).
pub fn load_suites<S: AsRef<str>>(args: &[S]) -> Result<Suite, SuiteError> {
    let mut merged: Option<Suite> = None;
    for arg in args.iter().flat_map(|a| a.as_ref().split(',')) {
        let arg = arg.trim();
        if arg.is_empty() {
            continue;
        }
        let path = Path::new(arg);
        let next = if is_scenario_dir(path) {
            info!(scenario = %path.display(), "suite argument is a scenario directory");
            Suite {
                kind: SuiteKind::Tests,
                scenarios: vec![path.to_path_buf()],
                sweep: None,
            }
        } else {
            let file = if arg.ends_with(".json") {
                PathBuf::from(arg)
            } else {
                PathBuf::from(format!("{}.json", arg))
            };
            let doc = load_json_file(&file).map_err(|e| SuiteError::Unreadable {
                path: file.clone(),
                message: e.to_string(),
            })?;
            parse_suite(&file, &doc)?
        };
        merged = Some(match merged {
            None => next,
            Some(existing) => merge(existing, next)?,
        });
    }
    merged.ok_or(SuiteError::Empty)
}

fn is_scenario_dir(path: &Path) -> bool {
    path.is_dir()
        && (path.join("param_overrides.json").is_file() || path.join("config.json").is_file())
}

pub fn parse_suite(file: &Path, doc: &Value) -> Result<Suite, SuiteError> {
    // A bare list is a regression list.
    if let Some(items) = doc.as_array() {
        return Ok(Suite {
            kind: SuiteKind::Tests,
            scenarios: scenario_paths(items),
            sweep: None,
        });
    }
    let kind = SuiteKind::ALL
        .into_iter()
        .find(|k| doc.get(k.key()).is_some())
        .ok_or_else(|| SuiteError::UnknownKind(file.to_path_buf()))?;
    let body = &doc[kind.key()];
    if kind.is_sweep() {
        return Ok(Suite {
            kind,
            scenarios: Vec::new(),
            sweep: Some(SweepSpec::from_json(body)?),
        });
    }
    let items = body.as_array().map(Vec::as_slice).unwrap_or_default();
    Ok(Suite {
        kind,
        scenarios: scenario_paths(items),
        sweep: None,
    })
}

fn scenario_paths(items: &[Value]) -> Vec<PathBuf> {
    items
        .iter()
        .filter_map(|item| item.get("path").and_then(Value::as_str))
        .map(PathBuf::from)
        .collect()
}

fn merge(mut existing: Suite, next: Suite) -> Result<Suite, SuiteError> {
    if existing.kind != next.kind {
        return Err(SuiteError::MixedKinds {
            existing: existing.kind,
            added: next.kind,
        });
    }
    if existing.kind.is_sweep() {
        // Later sweep descriptors replace earlier ones.
        existing.sweep = next.sweep;
    } else {
        existing.scenarios.extend(next.scenarios);
    }
    Ok(existing)
}

/// Supplies the materialized documents of a scenario. Flattening of override
/// files happens upstream; this side only reads the finished documents.
pub trait ConfigSource: Send + Sync {
    fn config(&self, scenario: &Path) -> Result<Value, RunError>;
    fn campaign(&self, scenario: &Path, config: &Value) -> Result<Option<Value>, RunError>;
    fn custom_reports(&self, scenario: &Path) -> Result<Option<Value>, RunError>;
}

/// Reads `config.json`, the campaign file and `custom_reports.json` from the
/// scenario directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaterializedConfigs;

impl ConfigSource for MaterializedConfigs {
    fn config(&self, scenario: &Path) -> Result<Value, RunError> {
        let path = scenario.join("config.json");
        let value = load_json_file(&path).map_err(|e| {
            RunError::Configuration(format!("Malformed config.json in {}: {}", scenario.display(), e))
        })?;
        if value.get("parameters").is_some() {
            return Ok(value);
        }
        let mut wrapped = Map::new();
        wrapped.insert("parameters".to_string(), value);
        Ok(Value::Object(wrapped))
    }

    fn campaign(&self, scenario: &Path, config: &Value) -> Result<Option<Value>, RunError> {
        let params = &config["parameters"];
        let interventions = match &params["Enable_Interventions"] {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_i64() == Some(1),
            _ => true,
        };
        if !interventions {
            return Ok(Some(serde_json::json!({ "Events": [] })));
        }
        let named = params
            .get("Campaign_Filename")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|name| scenario.join(name));
        let path = match named {
            Some(p) if p.is_file() => p,
            _ => scenario.join("campaign.json"),
        };
        if !path.is_file() {
            return Ok(None);
        }
        load_json_file(&path).map(Some).map_err(|e| {
            RunError::Configuration(format!("Failed loading campaign {}: {}", path.display(), e))
        })
    }

    fn custom_reports(&self, scenario: &Path) -> Result<Option<Value>, RunError> {
        let path = scenario.join("custom_reports.json");
        if !path.is_file() {
            return Ok(None);
        }
        load_json_file(&path).map(Some).map_err(|e| {
            RunError::Configuration(format!("Malformed custom_reports.json: {}", e))
        })
    }
}

/// Text form used when matching constraints: strings verbatim, booleans as
/// `True`/`False`, everything else as JSON.
pub fn constraint_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

/// Returns the reason a config fails the constraints, if it does.
pub fn check_constraints(config: &Value, constraints: &BTreeMap<String, String>) -> Option<String> {
    let params = &config["parameters"];
    for (key, expected) in constraints {
        match params.get(key) {
            None => return Some(format!("parameter {} not present", key)),
            Some(actual) => {
                let actual = constraint_text(actual);
                if &actual != expected {
                    return Some(format!("{} == {} but must == {}", key, actual, expected));
                }
            }
        }
    }
    None
}

/// Sets `parameters.<name>`, walking nested objects for `a:b:c` names.
pub fn override_config_value(config: &mut Value, name: &str, value: Value) -> Result<(), String> {
    let mut node = config
        .get_mut("parameters")
        .ok_or_else(|| "config has no parameters".to_string())?;
    let mut parts = name.split(':').peekable();
    while let Some(part) = parts.next() {
        let obj = node
            .as_object_mut()
            .ok_or_else(|| format!("{} does not address an object", name))?;
        if parts.peek().is_none() {
            obj.insert(part.to_string(), value);
            return Ok(());
        }
        node = obj
            .get_mut(part)
            .ok_or_else(|| format!("{}: no key '{}'", name, part))?;
    }
    Err(format!("empty parameter name '{}'", name))
}

/// Issues simulation ids `YYYY_MM_DD_hh_mm_ss_mmm_NNNN`. One generator per
/// run; the counter keeps ids unique within a tick.
#[derive(Debug)]
pub struct SimulationIdGen {
    stamp: String,
    count: AtomicU32,
}

impl SimulationIdGen {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            stamp: start.format("%Y_%m_%d_%H_%M_%S_%3f").to_string(),
            count: AtomicU32::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.id(n)
    }

    /// The first id doubles as the run id.
    pub fn first_id(&self) -> String {
        self.id(1)
    }

    fn id(&self, n: u32) -> String {
        format!("{}_{:04}", self.stamp, n)
    }
}

/// Immutable description of one job, created at load time.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub scenario: PathBuf,
    pub name: String,
    pub config: Value,
    pub campaign: Option<Value>,
    pub custom_reports: Option<Value>,
    pub mode: ExecutionMode,
    pub scenario_type: ScenarioType,
    pub overrides: BTreeMap<String, Value>,
    pub sim_id: String,
}

impl JobSpec {
    pub fn config_name(&self) -> String {
        self.config["parameters"]
            .get("Config_Name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.scenario
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.name.clone())
            })
    }
}

/// Scenarios that never became jobs.
#[derive(Debug)]
pub enum LoadIssue {
    /// Recorded as errored before any working directory exists.
    Errored { name: String, error: RunError },
    /// Filtered out by constraints.
    Skipped { name: String, reason: String },
}

pub struct JobPlan<'a> {
    pub source: &'a dyn ConfigSource,
    pub ids: &'a SimulationIdGen,
    pub mode: ExecutionMode,
    pub constraints: &'a BTreeMap<String, String>,
}

impl JobPlan<'_> {
    pub fn build(&self, suite: &Suite) -> (Vec<JobSpec>, Vec<LoadIssue>) {
        let scenario_type = suite.kind.scenario_type();
        let mut jobs = Vec::new();
        let mut issues = Vec::new();
        let entries: Vec<(PathBuf, BTreeMap<String, Value>)> = match &suite.sweep {
            Some(sweep) => sweep
                .expand()
                .into_iter()
                .map(|o| (sweep.path.clone(), o))
                .collect(),
            None => suite
                .scenarios
                .iter()
                .map(|p| (p.clone(), BTreeMap::new()))
                .collect(),
        };
        for (scenario, overrides) in entries {
            match self.job(&scenario, overrides, scenario_type) {
                Ok(job) => jobs.push(job),
                Err(issue) => issues.push(issue),
            }
        }
        (jobs, issues)
    }

    fn job(
        &self,
        scenario: &Path,
        overrides: BTreeMap<String, Value>,
        scenario_type: ScenarioType,
    ) -> Result<JobSpec, LoadIssue> {
        let name = scenario.display().to_string();
        let errored = |error: RunError| LoadIssue::Errored {
            name: name.clone(),
            error,
        };
        let mut config = self.source.config(scenario).map_err(errored)?;
        if let Some(reason) = check_constraints(&config, self.constraints) {
            warn!(scenario = %name, %reason, "scenario does not satisfy constraints");
            return Err(LoadIssue::Skipped {
                name: name.clone(),
                reason,
            });
        }
        for (param, value) in &overrides {
            override_config_value(&mut config, param, value.clone())
                .map_err(|e| errored(RunError::Configuration(e)))?;
        }
        let campaign = self.source.campaign(scenario, &config).map_err(errored)?;
        let custom_reports = self.source.custom_reports(scenario).map_err(errored)?;
        Ok(JobSpec {
            scenario: scenario.to_path_buf(),
            name: name.clone(),
            config,
            campaign,
            custom_reports,
            mode: self.mode,
            scenario_type,
            overrides,
            sim_id: self.ids.next_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "regress_suite_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    #[test]
    fn parses_every_descriptor_form() {
        let f = Path::new("s.json");
        let bare = parse_suite(f, &json!([{"path": "a"}, {"path": "b"}])).unwrap();
        assert_eq!(bare.kind, SuiteKind::Tests);
        assert_eq!(bare.scenarios.len(), 2);

        let science = parse_suite(f, &json!({"science": [{"path": "s1"}]})).unwrap();
        assert_eq!(science.kind.scenario_type(), ScenarioType::Science);

        let sweep = parse_suite(
            f,
            &json!({"sweep": {"path": "x", "param_name": "Run_Number", "param_values": [1, 2, 3]}}),
        )
        .unwrap();
        assert_eq!(sweep.sweep.unwrap().expand().len(), 3);

        let sci_sweep = parse_suite(
            f,
            &json!({"science_sweep": {"path": "x", "param_name": "Run_Number", "param_values": [1]}}),
        )
        .unwrap();
        assert_eq!(sci_sweep.kind.scenario_type(), ScenarioType::Science);
        assert!(matches!(
            parse_suite(f, &json!({"other": []})),
            Err(SuiteError::UnknownKind(_))
        ));
    }

    #[test]
    fn multi_parameter_sweep_is_a_cartesian_product() {
        let suite = parse_suite(
            Path::new("s.json"),
            &json!({"sweep": {
                "path": "x",
                "param_names": ["A", "Outer:Inner"],
                "A_values": [1, 2],
                "Outer:Inner_values": ["p", "q", "r"]
            }}),
        )
        .unwrap();
        let combos = suite.sweep.unwrap().expand();
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0]["A"], json!(1));
        assert_eq!(combos[0]["Outer:Inner"], json!("p"));
        assert_eq!(combos[5]["A"], json!(2));
        assert_eq!(combos[5]["Outer:Inner"], json!("r"));
    }

    #[test]
    fn missing_values_list_is_rejected() {
        let err = parse_suite(
            Path::new("s.json"),
            &json!({"sweep": {"path": "x", "param_names": ["A"]}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("A_values"));
    }

    #[test]
    fn mixing_kinds_fails() {
        let tests = Suite {
            kind: SuiteKind::Tests,
            scenarios: vec!["a".into()],
            sweep: None,
        };
        let science = Suite {
            kind: SuiteKind::Science,
            scenarios: vec!["b".into()],
            sweep: None,
        };
        assert!(matches!(
            merge(tests.clone(), science),
            Err(SuiteError::MixedKinds { .. })
        ));
        let merged = merge(tests.clone(), tests).unwrap();
        assert_eq!(merged.scenarios.len(), 2);
    }

    #[test]
    fn nested_override_addresses_child_keys() {
        let mut config = json!({"parameters": {"Vector_Species_Params": {"arabiensis": {"Habitat": 1}}}});
        override_config_value(&mut config, "Vector_Species_Params:arabiensis:Habitat", json!(9))
            .unwrap();
        assert_eq!(
            config["parameters"]["Vector_Species_Params"]["arabiensis"]["Habitat"],
            json!(9)
        );
        override_config_value(&mut config, "Run_Number", json!(4)).unwrap();
        assert_eq!(config["parameters"]["Run_Number"], json!(4));
        assert!(override_config_value(&mut config, "Missing:Child", json!(1)).is_err());
    }

    #[test]
    fn constraints_compare_text_forms() {
        let config = json!({"parameters": {"Simulation_Type": "GENERIC_SIM", "Enable_Demographics_Builtin": 0, "Flag": true}});
        let mut constraints = BTreeMap::new();
        constraints.insert("Simulation_Type".to_string(), "GENERIC_SIM".to_string());
        constraints.insert("Enable_Demographics_Builtin".to_string(), "0".to_string());
        constraints.insert("Flag".to_string(), "True".to_string());
        assert_eq!(check_constraints(&config, &constraints), None);

        constraints.insert("Absent".to_string(), "1".to_string());
        assert!(check_constraints(&config, &constraints)
            .unwrap()
            .contains("not present"));
    }

    #[test]
    fn simulation_ids_are_unique_and_formatted() {
        let start = Local.with_ymd_and_hms(2017, 5, 10, 18, 42, 23).unwrap();
        let ids = SimulationIdGen::new(start);
        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(a, "2017_05_10_18_42_23_000_0001");
        assert_eq!(b, "2017_05_10_18_42_23_000_0002");
        assert_eq!(ids.first_id(), a);
    }

    #[test]
    fn builds_jobs_and_reports_issues() {
        let root = temp_root("plan");
        let good = root.join("Generic").join("Good");
        let broken = root.join("Generic").join("Broken");
        let filtered = root.join("Generic").join("Filtered");
        for dir in [&good, &broken, &filtered] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(
            good.join("config.json"),
            r#"{"parameters": {"Config_Name": "Good one", "Simulation_Type": "GENERIC_SIM", "Enable_Interventions": 0}}"#,
        )
        .unwrap();
        fs::write(broken.join("config.json"), "{oops").unwrap();
        fs::write(
            filtered.join("config.json"),
            r#"{"Simulation_Type": "VECTOR_SIM"}"#,
        )
        .unwrap();

        let suite = Suite {
            kind: SuiteKind::Tests,
            scenarios: vec![good.clone(), broken.clone(), filtered.clone()],
            sweep: None,
        };
        let ids = SimulationIdGen::new(Local::now());
        let mut constraints = BTreeMap::new();
        constraints.insert("Simulation_Type".to_string(), "GENERIC_SIM".to_string());
        let plan = JobPlan {
            source: &MaterializedConfigs,
            ids: &ids,
            mode: ExecutionMode::Local,
            constraints: &constraints,
        };
        let (jobs, issues) = plan.build(&suite);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].config_name(), "Good one");
        assert_eq!(jobs[0].campaign, Some(json!({"Events": []})));
        assert_eq!(jobs[0].scenario_type, ScenarioType::Regression);
        assert_eq!(issues.len(), 2);
        assert!(matches!(
            &issues[0],
            LoadIssue::Errored { error: RunError::Configuration(_), .. }
        ));
        assert!(matches!(&issues[1], LoadIssue::Skipped { .. }));
        let _ = fs::remove_dir_all(root);
    }
}
