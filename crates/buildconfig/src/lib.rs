//! Typed view of `build_config.json`, the project-level configuration shared by
//! every asset build step. The shader pipeline only consumes `pmtech_dir`; all
//! other keys are carried through untouched so tools that share the file keep
//! working.
//!
//! Types:
//!
//! - `BuildConfig` holds the engine root plus the opaque remainder of the file.
//! - `ConfigError` classifies read, parse, expansion and validation failures.
//! - `PathResolver` (re-exported from `path`) expands `~` and `$VAR`
//!   references so configs can point at the engine checkout portably.
mod path;

pub use path::{PathError, PathResolver};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CONFIG_FILE: &str = "build_config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration not found at {0}")]
    Missing(PathBuf),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub pmtech_dir: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BuildConfig {
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let raw: BuildConfig = serde_json::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(dir) = &self.pmtech_dir {
            if dir.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "pmtech_dir must not be empty when present".into(),
                ));
            }
        }
        Ok(())
    }

    /// Expanded engine root, relative paths are joined onto the resolver's
    /// working directory.
    pub fn pmtech_dir(&self, resolver: &PathResolver) -> Result<Option<PathBuf>, ConfigError> {
        match &self.pmtech_dir {
            Some(raw) => Ok(Some(resolver.normalize_local_path(raw)?)),
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
{
    "pmtech_dir": "third_party/pmtech",
    "textures_dir": "assets/textures/",
    "tools": { "premake": "premake5" }
}
"#;

    #[test]
    fn parses_sample_config() {
        let config = BuildConfig::from_json_str(SAMPLE).expect("parse config");
        assert_eq!(config.pmtech_dir.as_deref(), Some("third_party/pmtech"));
        assert_eq!(
            config.get("textures_dir").and_then(Value::as_str),
            Some("assets/textures/")
        );
        assert!(config.get("tools").is_some());
    }

    #[test]
    fn pmtech_dir_is_optional() {
        let config = BuildConfig::from_json_str("{}").unwrap();
        assert!(config.pmtech_dir.is_none());
        let resolver = PathResolver::with_cwd("/work");
        assert!(config.pmtech_dir(&resolver).unwrap().is_none());
    }

    #[test]
    fn rejects_blank_pmtech_dir() {
        let err = BuildConfig::from_json_str(r#"{ "pmtech_dir": "  " }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = BuildConfig::from_json_str(r#"{ "pmtech_dir": }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let err = BuildConfig::load(&temp.path().join("build_config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn resolves_relative_pmtech_dir_against_cwd() {
        let temp = tempfile::tempdir().unwrap();
        let engine = temp.path().join("engine");
        std::fs::create_dir_all(&engine).unwrap();
        std::fs::write(
            temp.path().join("build_config.json"),
            r#"{ "pmtech_dir": "engine" }"#,
        )
        .unwrap();

        let config = BuildConfig::load(&temp.path().join("build_config.json")).unwrap();
        let resolver = PathResolver::with_cwd(temp.path());
        assert_eq!(config.pmtech_dir(&resolver).unwrap(), Some(engine));
    }
}
