//! Expansion of `~` and `$VAR` / `${VAR}` in configured directories, so
//! `pmtech_dir` and include roots can be written portably.
use std::env;
use std::path::{Path, PathBuf};

use directories_next::BaseDirs;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("environment variable '{0}' is not set")]
    UnsetVariable(String),
    #[error("unterminated '${{{0}' in '{1}'")]
    Unterminated(String, String),
    #[error("empty environment variable reference in '{0}'")]
    EmptyVariable(String),
    #[error("unable to determine home directory for '{0}'")]
    NoHome(String),
    #[error("'~user' expansion is not supported ('{0}')")]
    UserHome(String),
    #[error("path must not be empty")]
    Empty,
    #[error("failed to resolve current working directory: {0}")]
    CurrentDir(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    cwd: PathBuf,
}

impl PathResolver {
    pub fn new() -> Result<Self, PathError> {
        let cwd = env::current_dir().map_err(PathError::CurrentDir)?;
        Ok(Self { cwd })
    }

    pub fn with_cwd<P: Into<PathBuf>>(cwd: P) -> Self {
        Self { cwd: cwd.into() }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Substitutes variables, then a leading `~`.
    pub fn expand_path(&self, input: &str) -> Result<PathBuf, PathError> {
        let substituted = substitute_vars(input)?;
        let path = expand_home(&substituted)?;
        if path.as_os_str() != input {
            debug!(original = %input, expanded = %path.display(), "expanded path");
        }
        Ok(path)
    }

    /// Expanded path, joined onto the working directory when that candidate
    /// exists. Relative paths that do not exist there are returned as is.
    pub fn normalize_local_path(&self, input: &str) -> Result<PathBuf, PathError> {
        let expanded = self.expand_path(input)?;
        if expanded.as_os_str().is_empty() {
            return Err(PathError::Empty);
        }
        if expanded.is_absolute() {
            return Ok(expanded);
        }

        let joined = self.cwd.join(&expanded);
        if joined.exists() {
            return Ok(joined);
        }
        debug!(path = %expanded.display(), cwd = %self.cwd.display(), "path not found under cwd");
        Ok(expanded)
    }
}

fn expand_home(input: &str) -> Result<PathBuf, PathError> {
    let Some(rest) = input.strip_prefix('~') else {
        return Ok(PathBuf::from(input));
    };
    let rest = match rest.chars().next() {
        None => "",
        Some('/') | Some('\\') => &rest[1..],
        Some(_) => return Err(PathError::UserHome(input.to_string())),
    };

    let dirs = BaseDirs::new().ok_or_else(|| PathError::NoHome(input.to_string()))?;
    let home = dirs.home_dir();
    Ok(if rest.is_empty() {
        home.to_path_buf()
    } else {
        home.join(rest)
    })
}

fn substitute_vars(input: &str) -> Result<String, PathError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(dollar) = rest.find('$') {
        output.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            let close = braced
                .find('}')
                .ok_or_else(|| PathError::Unterminated(braced.to_string(), input.to_string()))?;
            if close == 0 {
                return Err(PathError::EmptyVariable(input.to_string()));
            }
            (&braced[..close], close + 2)
        } else {
            let len = after
                .find(|c: char| !(c == '_' || c.is_ascii_alphanumeric()))
                .unwrap_or(after.len());
            (&after[..len], len)
        };

        if name.is_empty() {
            output.push('$');
        } else {
            let value = env::var(name).map_err(|_| PathError::UnsetVariable(name.to_string()))?;
            output.push_str(&value);
        }
        rest = &after[consumed..];
    }

    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_braced_and_bare_variables() {
        env::set_var("PMFX_PATH_TEST", "engine");
        let resolver = PathResolver::with_cwd("/");
        assert_eq!(
            resolver.expand_path("/src/${PMFX_PATH_TEST}/tools").unwrap(),
            PathBuf::from("/src/engine/tools")
        );
        assert_eq!(
            resolver.expand_path("/src/$PMFX_PATH_TEST/tools").unwrap(),
            PathBuf::from("/src/engine/tools")
        );
        env::remove_var("PMFX_PATH_TEST");
    }

    #[test]
    fn reports_unset_and_malformed_variables() {
        let resolver = PathResolver::with_cwd("/");
        let err = resolver.expand_path("/tmp/$UNSET_PMFX_VAR").unwrap_err();
        assert!(matches!(err, PathError::UnsetVariable(ref name) if name == "UNSET_PMFX_VAR"));
        assert!(matches!(
            resolver.expand_path("/tmp/${OPEN").unwrap_err(),
            PathError::Unterminated(..)
        ));
        assert!(matches!(
            resolver.expand_path("/tmp/${}").unwrap_err(),
            PathError::EmptyVariable(_)
        ));
    }

    #[test]
    fn lone_dollar_is_kept() {
        let resolver = PathResolver::with_cwd("/");
        assert_eq!(resolver.expand_path("cost$").unwrap(), PathBuf::from("cost$"));
        assert_eq!(resolver.expand_path("a$-b").unwrap(), PathBuf::from("a$-b"));
    }

    #[test]
    fn expands_home_prefix() {
        let resolver = PathResolver::with_cwd("/");
        assert!(resolver.expand_path("~").unwrap().is_absolute());
        assert!(resolver.expand_path("~/pmtech").unwrap().ends_with("pmtech"));
        assert!(matches!(
            resolver.expand_path("~someone/pmtech").unwrap_err(),
            PathError::UserHome(_)
        ));
    }

    #[test]
    fn relative_paths_prefer_existing_cwd_entries() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("engine")).unwrap();
        let resolver = PathResolver::with_cwd(temp.path());
        assert_eq!(
            resolver.normalize_local_path("engine").unwrap(),
            temp.path().join("engine")
        );
        assert_eq!(
            resolver.normalize_local_path("absent").unwrap(),
            PathBuf::from("absent")
        );
        assert!(matches!(resolver.normalize_local_path(""), Err(PathError::Empty)));
    }
}
