//! Collects the pmfx files a run should build.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

pub const PMFX_EXTENSION: &str = "pmfx";

/// Default shader roots: engine shaders first, then the project's own.
pub fn default_roots(pmtech_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(dir) = pmtech_dir {
        roots.push(dir.join("assets").join("shaders"));
    }
    roots.push(PathBuf::from("assets").join("shaders"));
    roots
}

/// Expands each input into pmfx files. Directories are searched recursively
/// and their matches sorted; explicit files are kept as given. Missing roots
/// are skipped with a warning.
pub fn collect_pmfx_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
        } else if input.is_dir() {
            let mut found = Vec::new();
            walk(input, &mut found)?;
            found.sort();
            debug!(root = %input.display(), count = found.len(), "discovered pmfx files");
            files.extend(found);
        } else {
            warn!(path = %input.display(), "shader input does not exist, skipping");
        }
    }
    Ok(files)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to enumerate shader directory {}", dir.display()))?
    {
        let entry = entry?;
        let entry_type = entry.file_type()?;
        let entry_path = entry.path();
        if entry_type.is_dir() {
            walk(&entry_path, found)?;
        } else if entry_type.is_file() && is_pmfx(&entry_path) {
            found.push(entry_path);
        }
    }
    Ok(())
}

fn is_pmfx(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(PMFX_EXTENSION)
}
