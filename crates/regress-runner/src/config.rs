//! Runtime configuration: the ini document naming cluster and filesystem
//! roots, plus the command-line switches that shape a run.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_MAX_ACTIVE: usize = 20;
pub const DEFAULT_CONFIG_FILE: &str = "regression_test.cfg";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: cannot parse '{text}'")]
    Syntax { line: usize, text: String },
    #[error("missing section [{0}]")]
    MissingSection(String),
    #[error("missing key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },
    #[error("key '{key}' in section [{section}] is not a number: '{value}'")]
    InvalidNumber {
        section: String,
        key: String,
        value: String,
    },
    #[error("constraint '{0}' must have the form key:value")]
    InvalidConstraint(String),
}

/// Sectioned `key = value` document. Section names keep their case; keys are
/// lowercased the way ini readers usually treat them.
#[derive(Debug, Default, Clone)]
pub struct IniDocument {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniDocument {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut doc = IniDocument::default();
        let mut current: Option<String> = None;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                doc.sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let split = line
                .find(|c| c == '=' || c == ':')
                .map(|pos| (&line[..pos], &line[pos + 1..]));
            match (split, current.as_ref()) {
                (Some((key, value)), Some(section)) => {
                    doc.sections
                        .entry(section.clone())
                        .or_default()
                        .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
                }
                _ => {
                    return Err(ConfigError::Syntax {
                        line: idx + 1,
                        text: raw.to_string(),
                    })
                }
            }
        }
        Ok(doc)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)?
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn require(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
        if !self.has_section(section) {
            return Err(ConfigError::MissingSection(section.to_string()));
        }
        self.get(section, key).ok_or_else(|| ConfigError::MissingKey {
            section: section.to_string(),
            key: key.to_string(),
        })
    }

    fn number(&self, section: &str, key: &str) -> Result<u32, ConfigError> {
        let value = self.require(section, key)?;
        value.parse().map_err(|_| ConfigError::InvalidNumber {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HpcSection {
    pub head_node: String,
    pub node_group: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cores_per_socket: u32,
    pub cores_per_node: u32,
    /// Scheduler command line tool, `job` unless overridden.
    pub scheduler_cli: String,
}

/// Filesystem roots for one execution mode.
#[derive(Debug, Clone, Serialize)]
pub struct Roots {
    pub sim_root: PathBuf,
    pub input_root: PathBuf,
    pub bin_root: PathBuf,
    pub dll_root: PathBuf,
    pub home_input: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Cluster,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub hpc: Option<HpcSection>,
    pub local: Roots,
    pub cluster: Option<Roots>,
    pub src_root: Option<PathBuf>,
}

pub fn host_section() -> &'static str {
    if cfg!(windows) {
        "WINDOWS"
    } else {
        "POSIX"
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let doc = IniDocument::parse(&text)?;
        Self::from_ini(&doc, host_section())
    }

    pub fn from_ini(doc: &IniDocument, host: &str) -> Result<Self, ConfigError> {
        let hpc = match doc.get("HPC", "head_node") {
            Some(head_node) => Some(HpcSection {
                head_node: head_node.to_string(),
                node_group: doc.require("HPC", "node_group")?.to_string(),
                username: doc.get("HPC", "username").map(str::to_string),
                password: doc.get("HPC", "password").map(str::to_string),
                cores_per_socket: doc.number("HPC", "num_cores_per_socket")?,
                cores_per_node: doc.number("HPC", "num_cores_per_node")?,
                scheduler_cli: doc
                    .get("HPC", "scheduler_cli")
                    .unwrap_or("job")
                    .to_string(),
            }),
            None => None,
        };

        let local_bin = PathBuf::from(doc.require(host, "local_bin_root")?);
        let local = Roots {
            sim_root: doc.require(host, "local_sim_root")?.into(),
            input_root: doc.require(host, "local_input_root")?.into(),
            dll_root: doc
                .get(host, "local_dll_root")
                .map(PathBuf::from)
                .unwrap_or_else(|| local_bin.clone()),
            bin_root: local_bin,
            home_input: doc.require(host, "home_input")?.into(),
        };

        let cluster = if doc.has_section("ENVIRONMENT") && doc.get("ENVIRONMENT", "sim_root").is_some()
        {
            let bin = PathBuf::from(doc.require("ENVIRONMENT", "bin_root")?);
            Some(Roots {
                sim_root: doc.require("ENVIRONMENT", "sim_root")?.into(),
                input_root: doc.require("ENVIRONMENT", "input_root")?.into(),
                dll_root: doc
                    .get("ENVIRONMENT", "dll_root")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| bin.clone()),
                bin_root: bin,
                home_input: doc.require("ENVIRONMENT", "home_input")?.into(),
            })
        } else {
            None
        };

        Ok(Self {
            hpc,
            local,
            cluster,
            src_root: doc.get("LOCAL-ENVIRONMENT", "src_root").map(PathBuf::from),
        })
    }

    pub fn roots(&self, mode: ExecutionMode) -> Result<&Roots, ConfigError> {
        match mode {
            ExecutionMode::Local => Ok(&self.local),
            ExecutionMode::Cluster => self
                .cluster
                .as_ref()
                .ok_or_else(|| ConfigError::MissingSection("ENVIRONMENT".to_string())),
        }
    }
}

/// Command-line switches carried into the library.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub suites: Vec<String>,
    pub exe_path: Option<PathBuf>,
    pub perf: bool,
    /// Unattended mode: no plots, bounded submission retries, stricter
    /// comparison.
    pub hide_graphs: bool,
    pub debug: bool,
    pub quick_start: bool,
    pub label: Option<String>,
    pub config_path: PathBuf,
    pub disable_schema_test: bool,
    pub use_dlls: bool,
    pub dll_path: Option<PathBuf>,
    pub skip_plugin_check: bool,
    pub all_outputs: bool,
    pub constraints: BTreeMap<String, String>,
    pub local: bool,
    pub max_active: usize,
    pub plotter: Option<String>,
    pub component_tests: Option<PathBuf>,
    pub report_dir: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            suites: Vec::new(),
            exe_path: None,
            perf: false,
            hide_graphs: false,
            debug: false,
            quick_start: false,
            label: None,
            config_path: PathBuf::from(DEFAULT_CONFIG_FILE),
            disable_schema_test: false,
            use_dlls: false,
            dll_path: None,
            skip_plugin_check: false,
            all_outputs: false,
            constraints: BTreeMap::new(),
            local: false,
            max_active: DEFAULT_MAX_ACTIVE,
            plotter: None,
            component_tests: None,
            report_dir: PathBuf::from("reports"),
        }
    }
}

impl RunOptions {
    pub fn executable_path(&self) -> PathBuf {
        if let Some(path) = &self.exe_path {
            return path.clone();
        }
        let flavor = if self.debug { "Debug" } else { "Release" };
        if cfg!(windows) {
            PathBuf::from(format!("../Eradication/x64/{}/Eradication.exe", flavor))
        } else {
            PathBuf::from(format!("../build/x64/{}/Eradication/Eradication", flavor))
        }
    }

    /// An explicit plugin directory implies plugin use.
    pub fn use_dlls(&self) -> bool {
        self.use_dlls || self.dll_path.is_some()
    }

    /// Directory the built plugins are picked up from.
    pub fn plugin_source_dir(&self, src_root: Option<&Path>) -> PathBuf {
        if let Some(path) = &self.dll_path {
            return path.clone();
        }
        let flavor = if self.debug {
            "Debug"
        } else if self.quick_start {
            "QuickStart"
        } else {
            "Release"
        };
        src_root
            .unwrap_or(Path::new(".."))
            .join("build")
            .join("x64")
            .join(flavor)
    }

    pub fn execution_mode(&self, config: &RuntimeConfig) -> ExecutionMode {
        if self.local || cfg!(unix) || config.hpc.is_none() {
            ExecutionMode::Local
        } else {
            ExecutionMode::Cluster
        }
    }
}

/// Parses repeated `key:value` arguments; each may also hold a comma
/// separated list of pairs.
pub fn parse_constraints<S: AsRef<str>>(
    args: &[S],
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut out = BTreeMap::new();
    for arg in args {
        for pair in arg.as_ref().split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidConstraint(pair.to_string()))?;
            if key.trim().is_empty() {
                return Err(ConfigError::InvalidConstraint(pair.to_string()));
            }
            out.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(out)
}
