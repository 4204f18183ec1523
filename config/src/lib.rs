//! # Hierarchical application configuration
//!
//! Loads a dotted-key configuration tree from YAML files with profile
//! overlays and environment variable overrides:
//!
//! 1. `application.yaml` in the configuration directory (mandatory).
//! 2. `application-<profile>.yaml` for every active profile, overlaid in
//!    order; the last profile wins.
//! 3. Environment variables, mapped `SERVER_PORT` → `server.port`
//!    (optionally restricted to a prefix such as `BRM_`).
//!
//! The configuration directory comes from `APPLICATION_CONFIGURATION_DIR`
//! (default `./configs`), active profiles from `APPLICATION_PROFILES_ACTIVE`
//! (comma separated), and the environment prefix from
//! `APPLICATION_CONFIGURATION_PREFIX`.
//!
//! [`Config::from_sources`] accepts the directory, profiles and variables
//! explicitly so callers (and tests) can load without touching process
//! state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::Value;

mod duration;

pub use duration::parse_duration;

/// Errors produced while loading or reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration directory does not exist.
    #[error("configuration directory does not exist: {0}")]
    MissingDirectory(Utf8PathBuf),

    /// The mandatory base `application.yaml` is absent.
    #[error("base configuration file does not exist: {0}")]
    MissingBaseFile(Utf8PathBuf),

    /// A configuration file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration file could not be parsed as YAML.
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A value could not be interpreted as a duration string.
    #[error("invalid duration string: {0:?}")]
    InvalidDuration(String),
}

/// An immutable, flattened view over the merged configuration tree.
///
/// Keys are dotted paths (`server.port`, `storages.main.params.baseDir`).
/// [`Config::sub`] narrows the view to a sub-tree without copying values.
#[derive(Debug, Clone)]
pub struct Config {
    values: Arc<BTreeMap<String, Value>>,
    prefix: String,
}

impl Config {
    /// Loads configuration using the process environment, as described in
    /// the crate documentation.
    pub fn load() -> Result<Self, ConfigError> {
        let dir = std::env::var("APPLICATION_CONFIGURATION_DIR")
            .unwrap_or_else(|_| "./configs".to_string());
        let profiles = std::env::var("APPLICATION_PROFILES_ACTIVE").unwrap_or_default();
        let profiles: Vec<&str> = profiles
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let prefix = std::env::var("APPLICATION_CONFIGURATION_PREFIX").ok();

        Self::from_sources(
            Utf8Path::new(&dir),
            &profiles,
            prefix.as_deref(),
            std::env::vars(),
        )
    }

    /// Loads configuration from explicit sources.
    ///
    /// `vars` plays the role of the process environment; only variables
    /// whose mapped key contains a dot (and, when `env_prefix` is given,
    /// which carry the `<PREFIX>_` prefix) participate in the overlay.
    pub fn from_sources(
        dir: &Utf8Path,
        profiles: &[&str],
        env_prefix: Option<&str>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        if !dir.is_dir() {
            return Err(ConfigError::MissingDirectory(dir.to_owned()));
        }

        let mut values = BTreeMap::new();

        let base = dir.join("application.yaml");
        if !base.is_file() {
            return Err(ConfigError::MissingBaseFile(base));
        }
        tracing::debug!(file = %base, "loading base configuration");
        load_file(&base, &mut values)?;

        for profile in profiles {
            let path = dir.join(format!("application-{profile}.yaml"));
            if !path.is_file() {
                tracing::warn!(profile, file = %path, "profile configuration file not found");
                continue;
            }
            tracing::debug!(profile, file = %path, "loading profile configuration");
            load_file(&path, &mut values)?;
        }

        overlay_env(env_prefix, vars, &mut values);

        Ok(Self {
            values: Arc::new(values),
            prefix: String::new(),
        })
    }

    /// Returns a view over the sub-tree rooted at `prefix`.
    pub fn sub(&self, prefix: &str) -> Config {
        Config {
            values: self.values.clone(),
            prefix: self.full_key(prefix),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else if key.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}.{key}", self.prefix)
        }
    }

    fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(&self.full_key(key))
    }

    /// Returns whether a key (or any key below it) is present.
    pub fn exists(&self, key: &str) -> bool {
        let full = self.full_key(key);
        let nested = format!("{full}.");
        self.values
            .range(full.clone()..)
            .take_while(|(k, _)| k.as_str() == full || k.starts_with(&nested))
            .next()
            .is_some()
    }

    /// Returns the direct child key names of the current sub-tree.
    pub fn keys(&self) -> Vec<String> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}.", self.prefix)
        };

        let mut children = BTreeSet::new();
        for key in self.values.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let child = rest.split('.').next().unwrap_or(rest);
                if !child.is_empty() {
                    children.insert(child.to_string());
                }
            }
        }
        children.into_iter().collect()
    }

    /// String accessor; numbers and booleans are rendered as strings.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.value(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// String accessor with a default.
    pub fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or_else(|| default.to_string())
    }

    /// Integer accessor; string values (environment overrides) are parsed.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.value(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer accessor with a default.
    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    /// Boolean accessor; string values are parsed.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.value(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean accessor with a default.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Duration accessor for Go-style duration strings (`10s`, `1m30s`,
    /// `250ms`). Returns `Ok(None)` when the key is absent.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        match self.get_str(key) {
            Some(s) => parse_duration(&s).map(Some),
            None => Ok(None),
        }
    }

    /// Maps `logging.level` onto a `tracing` level. Unknown or absent
    /// values yield `None` so the caller can apply its own default.
    pub fn log_level(&self) -> Option<tracing::Level> {
        match self.get_str("logging.level")?.to_ascii_lowercase().as_str() {
            "debug" => Some(tracing::Level::DEBUG),
            "info" => Some(tracing::Level::INFO),
            "warn" | "warning" => Some(tracing::Level::WARN),
            "error" => Some(tracing::Level::ERROR),
            _ => None,
        }
    }
}

fn load_file(path: &Utf8Path, values: &mut BTreeMap<String, Value>) -> Result<(), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    let document: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    flatten("", &document, values);
    Ok(())
}

/// Flattens nested mappings into dotted keys. Scalars and sequences are
/// stored as-is; later calls override earlier keys.
fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                let key = match key {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                let child_prefix = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&child_prefix, child, out);
            }
        }
        Value::Null if prefix.is_empty() => {}
        _ => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), value.clone());
            }
        }
    }
}

fn overlay_env(
    env_prefix: Option<&str>,
    vars: impl IntoIterator<Item = (String, String)>,
    out: &mut BTreeMap<String, Value>,
) {
    for (name, value) in vars {
        let name = match env_prefix {
            Some(prefix) => {
                let wanted = format!("{prefix}_");
                match name.strip_prefix(&wanted) {
                    Some(rest) => rest.to_string(),
                    None => continue,
                }
            }
            None => name,
        };
        let key = name.to_ascii_lowercase().replace('_', ".");
        // Variables that do not map onto a dotted key (PATH, HOME, ...)
        // are not configuration.
        if !key.contains('.') {
            continue;
        }
        out.insert(key, Value::String(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_configs(dir: &Utf8Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            std::fs::write(dir.join(name), content).unwrap();
        }
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, path)
    }

    #[test]
    fn base_file_is_mandatory() {
        let (_guard, dir) = tempdir();
        let err = Config::from_sources(&dir, &[], None, std::iter::empty()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBaseFile(_)));
    }

    #[test]
    fn profile_overlay_last_profile_wins() {
        let (_guard, dir) = tempdir();
        write_configs(
            &dir,
            &[
                ("application.yaml", "server:\n  port: 8080\n"),
                ("application-dev.yaml", "server:\n  port: 8081\n"),
                ("application-prod.yaml", "server:\n  port: 8082\n"),
            ],
        );

        let cfg = Config::from_sources(&dir, &["dev", "prod"], None, std::iter::empty()).unwrap();
        assert_eq!(cfg.get_int("server.port"), Some(8082));

        let cfg = Config::from_sources(&dir, &["prod", "dev"], None, std::iter::empty()).unwrap();
        assert_eq!(cfg.get_int("server.port"), Some(8081));
    }

    #[test]
    fn environment_overrides_files() {
        let (_guard, dir) = tempdir();
        write_configs(
            &dir,
            &[
                ("application.yaml", "server:\n  port: 8080\n"),
                ("application-dev.yaml", "server:\n  port: 8081\n"),
                ("application-prod.yaml", "server:\n  port: 8082\n"),
            ],
        );

        let vars = vec![("SERVER_PORT".to_string(), "9090".to_string())];
        let cfg = Config::from_sources(&dir, &["dev", "prod"], None, vars).unwrap();
        assert_eq!(cfg.get_int("server.port"), Some(9090));
    }

    #[test]
    fn environment_prefix_filters_variables() {
        let (_guard, dir) = tempdir();
        write_configs(&dir, &[("application.yaml", "server:\n  port: 8080\n")]);

        let vars = vec![
            ("BRM_SERVER_PORT".to_string(), "9001".to_string()),
            ("SERVER_PORT".to_string(), "9002".to_string()),
        ];
        let cfg = Config::from_sources(&dir, &[], Some("BRM"), vars).unwrap();
        assert_eq!(cfg.get_int("server.port"), Some(9001));
    }

    #[test]
    fn missing_profile_files_are_skipped() {
        let (_guard, dir) = tempdir();
        write_configs(&dir, &[("application.yaml", "server:\n  port: 8080\n")]);

        let cfg = Config::from_sources(&dir, &["nope"], None, std::iter::empty()).unwrap();
        assert_eq!(cfg.get_int("server.port"), Some(8080));
    }

    #[test]
    fn sub_tree_view_and_keys() {
        let (_guard, dir) = tempdir();
        write_configs(
            &dir,
            &[(
                "application.yaml",
                concat!(
                    "storages:\n",
                    "  main:\n",
                    "    class: hashcomputing.filestorage\n",
                    "    params:\n",
                    "      baseDir: /tmp/data\n",
                    "      lockDir: /tmp/locks\n",
                    "      lockTimeout: 5s\n",
                    "  scratch:\n",
                    "    class: std.filestorage\n",
                    "    params:\n",
                    "      basePath: /tmp/scratch\n",
                ),
            )],
        );

        let cfg = Config::from_sources(&dir, &[], None, std::iter::empty()).unwrap();
        let storages = cfg.sub("storages");
        assert_eq!(storages.keys(), vec!["main", "scratch"]);

        let main = storages.sub("main");
        assert_eq!(
            main.get_str("class").as_deref(),
            Some("hashcomputing.filestorage")
        );
        assert_eq!(
            main.sub("params").get_duration("lockTimeout").unwrap(),
            Some(Duration::from_secs(5))
        );
        assert!(main.exists("params"));
        assert!(!main.exists("upstream"));
    }

    #[test]
    fn scalar_coercion() {
        let (_guard, dir) = tempdir();
        write_configs(
            &dir,
            &[(
                "application.yaml",
                "server:\n  port: 8080\nlogging:\n  level: warn\nfeature:\n  enabled: true\n",
            )],
        );

        let vars = vec![("FEATURE_ENABLED".to_string(), "false".to_string())];
        let cfg = Config::from_sources(&dir, &[], None, vars).unwrap();
        assert_eq!(cfg.get_str("server.port").as_deref(), Some("8080"));
        assert_eq!(cfg.get_bool("feature.enabled"), Some(false));
        assert_eq!(cfg.log_level(), Some(tracing::Level::WARN));
        assert_eq!(cfg.get_int_or("server.missing", 42), 42);
    }
}
