use std::ffi::OsString;
use std::fs;

use tracing::debug;

use super::{output_path, run_tool, temp_path, write_file, BackendError, EmitOutput, EmitTarget, INDENT};
use crate::context::{BuildContext, ShaderPlatform, Stage};
use crate::macros::platform_macros;
use crate::slice::{ConditionedSource, ShaderSlice};
use crate::text::format_source;

/// Assembles the HLSL translation unit for one stage.
pub fn generate(ctx: &BuildContext, conditioned: &ConditionedSource, slice: &ShaderSlice) -> String {
    let mut source = platform_macros(&ctx.macros_source, ShaderPlatform::Hlsl);
    source.push_str(&conditioned.struct_decls(slice));
    for cbuffer in &slice.cbuffers {
        source.push_str(&cbuffer.source);
        source.push('\n');
    }

    let mut emitted = Vec::new();
    for io in [&slice.input, &slice.instance_input, &slice.output].into_iter().flatten() {
        if emitted.contains(&io.name.as_str()) {
            continue;
        }
        emitted.push(io.name.as_str());
        source.push_str(&io.decl);
        source.push('\n');
    }

    source.push_str(&slice.texture_decls());
    source.push_str(&slice.functions_source());
    if slice.stage == Stage::Compute {
        source.push_str("[numthreads(16, 16, 1)]\n");
    }
    source.push_str(&slice.entry.source);
    source.push('\n');
    format_source(&source, INDENT)
}

fn temp_extension(stage: Stage) -> &'static str {
    match stage {
        Stage::Vertex => ".vs",
        Stage::Pixel => ".ps",
        Stage::Compute => ".cs",
    }
}

pub fn emit(
    ctx: &BuildContext,
    conditioned: &ConditionedSource,
    slice: &ShaderSlice,
    target: &EmitTarget<'_>,
) -> Result<EmitOutput, BackendError> {
    let source = generate(ctx, conditioned, slice);
    let temp_path = temp_path(ctx, target, temp_extension(slice.stage));
    write_file(&temp_path, &source)?;

    let compiler = ctx
        .compiler
        .as_deref()
        .ok_or(BackendError::MissingCompiler {
            platform: ShaderPlatform::Hlsl,
        })?;

    let output_path = output_path(ctx, slice, target);
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|source| BackendError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let profile = format!("{}_{}", slice.stage.as_str(), ctx.shader_version);
    debug!(profile = %profile, entry = slice.entry_name(), "compiling hlsl");
    let args: Vec<OsString> = vec![
        "/T".into(),
        profile.into(),
        "/E".into(),
        slice.entry_name().into(),
        "/Fo".into(),
        output_path.clone().into_os_string(),
        temp_path.clone().into_os_string(),
    ];
    run_tool(compiler, &args)?;

    Ok(EmitOutput {
        source,
        temp_path,
        output_path,
    })
}
