//! Backend emitters lowering a `ShaderSlice` to HLSL, GLSL or Metal source.
//!
//! Every emitter prepends the backend's macros, writes the generated source
//! to the per-pmfx temp directory, and produces `<permutation>.<stage>c` in
//! the per-pmfx output directory, invoking the external compiler or
//! validator where the backend has one.
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::context::{BuildContext, ShaderPlatform};
use crate::slice::{ConditionedSource, ShaderSlice};

pub mod glsl;
pub mod hlsl;
pub mod metal;

pub const INDENT: usize = 4;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no {platform} compiler configured")]
    MissingCompiler { platform: ShaderPlatform },

    #[error("failed to launch {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {code}")]
    ToolFailed { tool: PathBuf, code: i32 },

    #[error("{stage} shaders are not supported on {platform}")]
    UnsupportedStage {
        platform: ShaderPlatform,
        stage: crate::context::Stage,
    },
}

impl BackendError {
    /// Exit code to surface for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ToolFailed { code, .. } => *code,
            _ => 1,
        }
    }
}

/// Names identifying one permutation's artifacts on disk.
#[derive(Debug, Clone)]
pub struct EmitTarget<'a> {
    pub pmfx_name: &'a str,
    pub permutation_name: &'a str,
    pub permutation_id: u64,
}

#[derive(Debug, Clone)]
pub struct EmitOutput {
    pub source: String,
    pub temp_path: PathBuf,
    pub output_path: PathBuf,
}

pub fn emit(
    ctx: &BuildContext,
    conditioned: &ConditionedSource,
    slice: &ShaderSlice,
    target: &EmitTarget<'_>,
) -> Result<EmitOutput, BackendError> {
    match ctx.shader_platform {
        ShaderPlatform::Hlsl => hlsl::emit(ctx, conditioned, slice, target),
        ShaderPlatform::Glsl => glsl::emit(ctx, conditioned, slice, target),
        ShaderPlatform::Metal => metal::emit(ctx, conditioned, slice, target),
    }
}

/// `<output>/<pmfx>/<permutation>.<vsc|psc|csc>`
pub fn output_path(ctx: &BuildContext, slice: &ShaderSlice, target: &EmitTarget<'_>) -> PathBuf {
    ctx.pmfx_output_dir(target.pmfx_name).join(format!(
        "{}.{}",
        target.permutation_name,
        slice.stage.artifact_extension()
    ))
}

/// `<temp>/<pmfx>/<permutation><suffix>`
pub fn temp_path(ctx: &BuildContext, target: &EmitTarget<'_>, suffix: &str) -> PathBuf {
    ctx.pmfx_temp_dir(target.pmfx_name)
        .join(format!("{}{}", target.permutation_name, suffix))
}

pub(crate) fn write_file(path: &Path, contents: &str) -> Result<(), BackendError> {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
    };
    write().map_err(|source| BackendError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = contents.len(), "wrote shader source");
    Ok(())
}

/// Runs an external compiler or validator, relaying its output line by line.
pub(crate) fn run_tool(program: &Path, args: &[OsString]) -> Result<(), BackendError> {
    debug!(tool = %program.display(), ?args, "invoking shader tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| BackendError::Spawn {
            path: program.to_path_buf(),
            source,
        })?;

    let success = output.status.success();
    let streams = [&output.stdout, &output.stderr];
    for line in streams
        .iter()
        .flat_map(|stream| std::str::from_utf8(stream).unwrap_or_default().lines())
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
    {
        if success {
            info!("{line}");
        } else {
            error!("{line}");
        }
    }

    if success {
        Ok(())
    } else {
        Err(BackendError::ToolFailed {
            tool: program.to_path_buf(),
            code: output.status.code().unwrap_or(1),
        })
    }
}

/// The body between the entry's opening brace and its closing brace.
pub(crate) fn entry_body(slice: &ShaderSlice) -> &str {
    let body = slice.entry.body();
    let inner = body.strip_prefix('{').unwrap_or(body);
    inner.strip_suffix('}').unwrap_or(inner)
}
