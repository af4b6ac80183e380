//! Run configuration: everything a minimization needs, resolvable from an
//! optional TOML file with CLI flags layered on top by the driver.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::predicate::PredicateSpec;

/// Errors loading a settings file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// One watched-write rule in the settings file.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WriteSpec {
    pub fd: i32,
    pub substring: String,
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Settings for one minimization run.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MinimizerConfig {
    /// The command template (positional on the CLI).
    pub command: Option<String>,
    /// Wrap the template in `sh -c`.
    #[serde(default)]
    pub shell: bool,
    /// Feed the candidate on the subject's stdin.
    #[serde(default)]
    pub write_to_stdin: bool,
    /// Wall-clock budget per subject run; 0 disables.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Exit-status failure lists (see the predicate syntax).
    #[serde(default)]
    pub status: Vec<String>,
    /// Termination-signal failure lists.
    #[serde(default)]
    pub signal: Vec<String>,
    /// Watched-fd substrings.
    #[serde(default)]
    pub writes: Vec<WriteSpec>,
    /// Original input; stdin when absent.
    pub input: Option<PathBuf>,
    /// Result destination; stdout when absent.
    pub output: Option<PathBuf>,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            command: None,
            shell: false,
            write_to_stdin: false,
            timeout_ms: default_timeout_ms(),
            status: Vec::new(),
            signal: Vec::new(),
            writes: Vec::new(),
            input: None,
            output: None,
        }
    }
}

impl MinimizerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// The raw predicate settings this config describes.
    pub fn predicate_spec(&self) -> PredicateSpec {
        PredicateSpec {
            status: self.status.clone(),
            signals: self.signal.clone(),
            writes: self
                .writes
                .iter()
                .map(|w| (w.fd, w.substring.clone().into_bytes()))
                .collect(),
            timeout_ms: self.timeout_ms,
            shell: self.shell,
        }
    }
}
