//! Container environment assembly.
//!
//! Sources merge in ascending precedence: image config ENV, host
//! `SINGULARITYENV_`-prefixed variables, `--env-file` contents, `--env`
//! flags. Within that, `PATH` and `LD_LIBRARY_PATH` are composed rather
//! than overwritten: `APPEND_PATH`/`PREPEND_PATH` pseudo-keys splice around
//! the resolved `PATH`, and `LD_LIBRARY_PATH` always ends with the
//! container library bind directory.

use std::path::Path;

use ibex_common::{IbexError, IbexResult};

use crate::filesystem::CONTAINER_LIBS_DIR;

/// Prefix marking host variables destined for the container.
pub const ENV_PREFIX: &str = "SINGULARITYENV_";

/// PATH used when no source defines one.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Insertion-ordered environment map with last-writer-wins semantics.
#[derive(Debug, Default)]
struct EnvMap {
    entries: Vec<(String, String)>,
}

impl EnvMap {
    fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn into_vec(self) -> Vec<String> {
        self.entries
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

/// Merge every environment source into the final `KEY=VALUE` list.
pub fn merge_environment(
    image_env: &[String],
    host_env: &[(String, String)],
    env_files: &[std::path::PathBuf],
    env_flags: &[String],
) -> IbexResult<Vec<String>> {
    let mut map = EnvMap::default();

    for entry in image_env {
        if let Some((key, value)) = entry.split_once('=') {
            map.set(key, value);
        }
    }

    for (key, value) in host_env {
        if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
            if !stripped.is_empty() {
                map.set(stripped, value);
            }
        }
    }

    for file in env_files {
        for (key, value) in parse_env_file(file)? {
            map.set(&key, &value);
        }
    }

    for entry in env_flags {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            IbexError::config(format!("--env entries must be KEY=VALUE, got {entry:?}"))
        })?;
        map.set(key, value);
    }

    compose_path(&mut map);
    compose_library_path(&mut map);

    Ok(map.into_vec())
}

/// Splice `PREPEND_PATH`/`APPEND_PATH` around the resolved `PATH`.
fn compose_path(map: &mut EnvMap) {
    let prepend = map.remove("PREPEND_PATH");
    let append = map.remove("APPEND_PATH");

    if prepend.is_none() && append.is_none() && map.get("PATH").is_some() {
        return;
    }

    let mut path = map
        .get("PATH")
        .map_or_else(|| DEFAULT_PATH.to_string(), ToString::to_string);
    if let Some(prepend) = prepend {
        path = format!("{prepend}:{path}");
    }
    if let Some(append) = append {
        path = format!("{path}:{append}");
    }
    map.set("PATH", &path);
}

/// The container's private library directory always rides at the end of
/// `LD_LIBRARY_PATH`.
fn compose_library_path(map: &mut EnvMap) {
    let current = map.get("LD_LIBRARY_PATH").unwrap_or("");
    if current.split(':').any(|p| p == CONTAINER_LIBS_DIR) {
        return;
    }
    let value = if current.is_empty() {
        CONTAINER_LIBS_DIR.to_string()
    } else {
        format!("{current}:{CONTAINER_LIBS_DIR}")
    };
    map.set("LD_LIBRARY_PATH", &value);
}

/// Parse a `--env-file`: `KEY=VALUE` lines, `#` comments, optional
/// `export ` prefix, optional matching quotes around the value.
fn parse_env_file(path: &Path) -> IbexResult<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        IbexError::config(format!("cannot read env file {}: {e}", path.display()))
    })?;

    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(IbexError::config(format!(
                "malformed line in env file {}: {line:?}",
                path.display()
            )));
        };
        pairs.push((key.trim().to_string(), unquote(value.trim()).to_string()));
    }
    Ok(pairs)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
