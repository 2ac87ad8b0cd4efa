//! Test script specs.
//!
//! Every test script lives in its own directory under the scripts root and carries a
//! `spec.json` describing its parameters, timeout, and result uploads, plus an
//! executable `run` entry point.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::error::{Result, SatelliteError};

pub const SPEC_FILE: &str = "spec.json";
pub const ENTRY_POINT: &str = "run";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub test_system: String,
    pub test_name: String,
    pub results_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Shell command whose output lines become extra option values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub description: String,
    pub parameters: Vec<Parameter>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub no_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub uploads: Vec<Upload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidSpec {
    pub name: String,
    pub spec: Spec,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidSpec {
    pub name: String,
    pub error: String,
}

/// Specs discovered on disk, split by whether they parse.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Available {
    pub valid: Vec<ValidSpec>,
    pub invalid: Vec<InvalidSpec>,
}

/// Where the executor gets script specs and entry points from.
pub trait SpecSource: Send + Sync {
    fn root(&self) -> &Path;

    fn load_spec(&self, name: &str) -> Result<Spec>;

    fn entry_point(&self, name: &str) -> PathBuf {
        self.root().join(name).join(ENTRY_POINT)
    }
}

/// A directory of test scripts, one subdirectory per script.
#[derive(Debug, Clone)]
pub struct ScriptDirectory {
    root: PathBuf,
}

impl ScriptDirectory {
    /// Open a scripts directory. Fails if it does not exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SatelliteError::MissingScriptDirectory(root));
        }
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// List every script directory, separating valid specs from broken ones.
    pub fn available(&self) -> Available {
        let mut available = Available::default();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.root.display(), error = %e, "Failed to read script directory");
                return available;
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        for name in names {
            match self.load_spec(&name) {
                Ok(spec) => available.valid.push(ValidSpec { name, spec }),
                Err(e) => available.invalid.push(InvalidSpec {
                    name,
                    error: e.to_string(),
                }),
            }
        }
        available
    }

    /// Expand each parameter's `shell` command into option values.
    ///
    /// The command runs in the script's directory; its stdout lines, minus blanks, are
    /// appended to any static options. A failing command leaves the parameter with no
    /// options at all.
    pub async fn resolve_dynamic_options(&self, name: &str, mut spec: Spec) -> Spec {
        let cwd = self.root.join(name);
        for param in spec.parameters.iter_mut() {
            let Some(shell) = param.shell.clone() else {
                continue;
            };
            let output = Command::new("sh")
                .arg("-c")
                .arg(&shell)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await;
            param.options = match output {
                Ok(out) if out.status.success() => {
                    let mut options = param.options.take().unwrap_or_default();
                    options.extend(
                        String::from_utf8_lossy(&out.stdout)
                            .lines()
                            .filter(|line| !line.is_empty())
                            .map(|line| Value::String(line.to_string())),
                    );
                    Some(options)
                }
                Ok(out) => {
                    tracing::debug!(spec = name, shell = %shell, code = ?out.status.code(), "Option command failed");
                    Some(Vec::new())
                }
                Err(e) => {
                    tracing::warn!(spec = name, shell = %shell, error = %e, "Failed to run option command");
                    Some(Vec::new())
                }
            };
        }
        spec
    }
}

impl SpecSource for ScriptDirectory {
    fn root(&self) -> &Path {
        &self.root
    }

    fn load_spec(&self, name: &str) -> Result<Spec> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." || name == "." {
            return Err(SatelliteError::SpecNotFound(name.to_string()));
        }
        let path = self.root.join(name).join(SPEC_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SatelliteError::SpecNotFound(name.to_string()),
            _ => SatelliteError::Io(e),
        })?;
        serde_json::from_str(&text).map_err(|e| SatelliteError::InvalidSpec {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}
