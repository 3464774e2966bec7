//! Loads a pmfx file and inlines its `#include` tree.
//!
//! Every file is sanitized on read (tabs to spaces, runs of spaces collapsed,
//! `//` and `/* */` comments removed). Includes are resolved relative to the
//! including file first and then against the configured include roots; each
//! normalized path is inlined at most once per top-level load, and a file's
//! dependencies are prepended so they precede its own body.
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("pmfx source not found at {0}")]
    Missing(PathBuf),

    #[error("include \"{include}\" referenced from {from} could not be found")]
    MissingInclude { include: String, from: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct PmfxSource {
    pub path: PathBuf,
    /// Sanitized text with every include inlined.
    pub text: String,
    /// Normalized include paths in discovery order, without duplicates.
    pub includes: Vec<PathBuf>,
}

impl PmfxSource {
    pub fn load(path: &Path, include_dirs: &[PathBuf]) -> Result<Self, LoadError> {
        if !path.is_file() {
            return Err(LoadError::Missing(path.to_path_buf()));
        }
        let root = normalize_path(path);
        let mut resolver = IncludeResolver {
            include_dirs,
            seen: HashSet::from([root.clone()]),
            includes: Vec::new(),
        };
        let text = resolver.inline_file(&root)?;
        debug!(path = %root.display(), includes = ?resolver.includes, "loaded pmfx source");
        Ok(Self {
            path: root,
            text,
            includes: resolver.includes,
        })
    }

    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

struct IncludeResolver<'a> {
    include_dirs: &'a [PathBuf],
    seen: HashSet<PathBuf>,
    includes: Vec<PathBuf>,
}

impl IncludeResolver<'_> {
    fn inline_file(&mut self, path: &Path) -> Result<String, LoadError> {
        let raw = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (body, directives) = take_include_directives(&sanitize(&raw));
        let dir = path.parent().unwrap_or_else(|| Path::new(""));

        let mut direct = Vec::new();
        for include in directives {
            let resolved = self.resolve(&include, dir, path)?;
            if self.seen.insert(resolved.clone()) {
                self.includes.push(resolved.clone());
                direct.push(resolved);
            }
        }

        let mut text = body;
        for include in direct.iter().rev() {
            let included = self.inline_file(include)?;
            text = format!("{included}\n{text}");
        }
        Ok(text)
    }

    fn resolve(&self, include: &str, dir: &Path, from: &Path) -> Result<PathBuf, LoadError> {
        std::iter::once(dir)
            .chain(self.include_dirs.iter().map(PathBuf::as_path))
            .map(|root| normalize_path(&root.join(include)))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| LoadError::MissingInclude {
                include: include.to_string(),
                from: from.to_path_buf(),
            })
    }
}

/// Removes `#include "..."` lines, returning the remaining text and the
/// quoted paths in order.
fn take_include_directives(source: &str) -> (String, Vec<String>) {
    let mut body = String::with_capacity(source.len());
    let mut includes = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("#include") {
            let mut quoted = rest.split('"');
            if let (Some(_), Some(name)) = (quoted.next(), quoted.next()) {
                if !name.is_empty() {
                    includes.push(name.to_string());
                    body.push('\n');
                    continue;
                }
            }
        }
        body.push_str(line);
        body.push('\n');
    }
    (body, includes)
}

/// Tabs to spaces, runs of spaces collapsed, comments removed.
pub fn sanitize(source: &str) -> String {
    let mut collapsed = String::with_capacity(source.len());
    let mut previous_space = false;
    for ch in source.chars() {
        let ch = if ch == '\t' { ' ' } else { ch };
        if ch == '\r' {
            continue;
        }
        if ch == ' ' && previous_space {
            continue;
        }
        previous_space = ch == ' ';
        collapsed.push(ch);
    }
    remove_comments(&collapsed)
}

/// Strips `//` line comments and `/* */` block comments, keeping the newlines
/// a block comment spans so line structure survives.
pub fn remove_comments(source: &str) -> String {
    let mut output = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut in_block = false;
    while let Some(ch) = chars.next() {
        if in_block {
            if ch == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_block = false;
            } else if ch == '\n' {
                output.push('\n');
            }
            continue;
        }
        if ch == '/' {
            match chars.peek() {
                Some('/') => {
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            output.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    in_block = true;
                    continue;
                }
                _ => {}
            }
        }
        output.push(ch);
    }
    output
}

/// Lexical normalization: drops `.` components and folds `..` where possible.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    normalized.pop();
                } else {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create dirs");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    #[test]
    fn sanitizes_whitespace_and_comments() {
        let source = "float4\t\tcolor; // trailing\n/* block\nspans */float  x;\n";
        assert_eq!(sanitize(source), "float4 color; \n\n float x;\n");
    }

    #[test]
    fn inlines_includes_before_body_once() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "lib/common.jsn", "float common() { return 1.0; }\n");
        write(
            temp.path(),
            "lib/lighting.pmfx",
            "#include \"common.jsn\"\nfloat light() { return common(); }\n",
        );
        let root = write(
            temp.path(),
            "main.pmfx",
            "#include \"lib/lighting.pmfx\"\n#include \"lib/common.jsn\"\nvoid main() {}\n",
        );

        let loaded = PmfxSource::load(&root, &[]).unwrap();
        assert_eq!(loaded.includes.len(), 2);
        assert_eq!(loaded.text.matches("float common()").count(), 1);
        let common = loaded.text.find("float common()").unwrap();
        let light = loaded.text.find("float light()").unwrap();
        let main = loaded.text.find("void main()").unwrap();
        assert!(common < light && light < main);
        assert!(!loaded.text.contains("#include"));
    }

    #[test]
    fn include_cycles_terminate() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "a.pmfx", "#include \"b.pmfx\"\nfloat a;\n");
        write(temp.path(), "b.pmfx", "#include \"a.pmfx\"\nfloat b;\n");
        let loaded = PmfxSource::load(&temp.path().join("a.pmfx"), &[]).unwrap();
        assert_eq!(loaded.includes, vec![normalize_path(&temp.path().join("b.pmfx"))]);
        assert_eq!(loaded.text.matches("float a;").count(), 1);
    }

    #[test]
    fn falls_back_to_include_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let shared = temp.path().join("shared");
        write(&shared, "macros.pmfx", "#define X 1\n");
        let root = write(temp.path(), "src/main.pmfx", "#include \"macros.pmfx\"\n");
        let loaded = PmfxSource::load(&root, &[shared.clone()]).unwrap();
        assert_eq!(loaded.includes, vec![shared.join("macros.pmfx")]);
    }

    #[test]
    fn missing_include_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let root = write(temp.path(), "main.pmfx", "#include \"nope.pmfx\"\n");
        let err = PmfxSource::load(&root, &[]).unwrap_err();
        assert!(matches!(err, LoadError::MissingInclude { ref include, .. } if include == "nope.pmfx"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "inc.pmfx", "float inc;\n");
        let root = write(temp.path(), "main.pmfx", "#include \"inc.pmfx\"\nfloat main;\n");
        let first = PmfxSource::load(&root, &[]).unwrap();
        let second = PmfxSource::load(&root, &[]).unwrap();
        assert_eq!(first.text, second.text);
        assert_eq!(first.includes, second.includes);
    }

    #[test]
    fn normalizes_parent_components() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d.pmfx")),
            PathBuf::from("/a/c/d.pmfx")
        );
    }
}
