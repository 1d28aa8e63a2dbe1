//! Immutable environment handed to every refiner invocation.
//!
//! Built once at startup from the process environment plus an optional
//! env file, then passed by value into the runner. Nothing here mutates the
//! harness's own process environment.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::Path;

use tracing::debug;

/// Key forced from the env file for reproducible runs.
const PRIMARY_KEY: &str = "OPENAI_API_KEY";

/// Key never forwarded to subprocesses.
const BACKUP_KEY: &str = "OPENAI_API_KEY_BACKUP";

/// Environment variables for refiner subprocesses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubprocessEnv {
    vars: BTreeMap<String, String>,
}

impl SubprocessEnv {
    /// Snapshot of the current process environment.
    ///
    /// Pairs whose key or value is not valid UTF-8 are skipped.
    pub fn from_process() -> Self {
        Self::from_os_vars(std::env::vars_os())
    }

    fn from_os_vars(vars: impl IntoIterator<Item = (OsString, OsString)>) -> Self {
        Self::from_vars(vars.into_iter().filter_map(|(key, value)| {
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some((key, value)),
                (key, _) => {
                    debug!(key = ?key, "skipping non UTF-8 environment variable");
                    None
                }
            }
        }))
    }

    /// Builds an environment from explicit pairs.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut vars: BTreeMap<String, String> = vars.into_iter().collect();
        vars.remove(BACKUP_KEY);
        Self { vars }
    }

    /// Returns a new environment with the contents of `env_path` merged in.
    ///
    /// A missing file yields an unchanged copy. `OPENAI_API_KEY` from the
    /// file always wins; other keys only fill gaps.
    pub fn with_env_file(&self, env_path: &Path) -> std::io::Result<Self> {
        if !env_path.exists() {
            debug!(path = %env_path.display(), "env file not found, skipping");
            return Ok(self.clone());
        }
        let content = fs::read_to_string(env_path)?;
        let mut vars = self.vars.clone();
        for (key, value) in parse_env_file(&content) {
            if key == PRIMARY_KEY {
                vars.insert(key, value);
            } else {
                vars.entry(key).or_insert(value);
            }
        }
        Ok(Self { vars })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Parses `KEY=VALUE` lines, dropping the backup key.
///
/// Accepts blank lines, `#` comments, an `export ` prefix, and values wrapped
/// in matching single or double quotes.
fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for raw in content.lines() {
        let mut line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("export ") {
            line = rest.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key == BACKUP_KEY {
            continue;
        }
        pairs.push((key.to_string(), unquote(value.trim()).to_string()));
    }
    pairs
}

fn unquote(value: &str) -> &str {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
