//! GLSL 330 / GLSL ES 300 lowering.
//!
//! Stage IO structs become loose `in`/`out` variables suffixed with the
//! struct they came from (`_vs_input`, `_vs_output`, `_ps_output`), the
//! original struct types are kept so helper functions compile unchanged, and
//! a generated `main()` copies between the two around the entry body.
//! `input`/`output` are reserved words in GLSL, so standalone uses are
//! renamed to `_input`/`_output` in the final text.
use tracing::{debug, warn};

use super::{entry_body, output_path, run_tool, temp_path, write_file, BackendError, EmitOutput, EmitTarget, INDENT};
use crate::context::{default_shader_version, BuildContext, ShaderPlatform, Stage};
use crate::extract::CBufferDecl;
use crate::macros::platform_macros;
use crate::slice::{ConditionedSource, IoField, IoStruct, ShaderSlice};
use crate::text::{self, format_source};

/// The profile follows the sub-platform: GLES targets always get an `es`
/// version and the precision qualifier, desktop targets always get `core`.
fn version_header(ctx: &BuildContext) -> String {
    let version = ctx.shader_version.trim();
    let gles = ctx.is_gles();
    let version = match (gles, version.ends_with("es")) {
        (true, true) | (false, false) if !version.is_empty() => version,
        _ => {
            let fallback = default_shader_version(ShaderPlatform::Glsl, ctx.sub_platform);
            warn!(requested = %version, used = %fallback, gles, "glsl version does not match target profile");
            fallback
        }
    };
    let mut header = if gles {
        format!("#version {version}\n")
    } else {
        format!("#version {version} core\n")
    };
    for define in ctx.platform_defines() {
        header.push_str(&format!("#define {define}\n"));
    }
    if gles {
        header.push_str("precision highp float;\n");
    }
    header
}

/// `layout (std140) uniform name { ... };`
fn uniform_block(cbuffer: &CBufferDecl) -> String {
    format!("layout (std140) uniform {}\n{};\n", cbuffer.name, cbuffer.body())
}

fn struct_decl(io: &IoStruct) -> String {
    let fields: String = io
        .fields
        .iter()
        .map(|field| format!("{};\n", field.decl()))
        .collect();
    format!("struct {}\n{{\n{fields}}};\n\n", io.name)
}

/// `SV_Target3` -> `Some("3")`, bare `SV_Target` -> `None`.
fn target_index(field: &IoField) -> Option<&str> {
    let index = field.semantic.strip_prefix("SV_Target")?;
    (!index.is_empty()).then_some(index)
}

fn is_depth(field: &IoField) -> bool {
    field.semantic.starts_with("SV_Depth")
}

fn stage_interface(slice: &ShaderSlice) -> String {
    let mut source = String::new();
    let mut location = 0;

    if let Some(input) = &slice.input {
        for field in &input.fields {
            match slice.stage {
                Stage::Vertex => {
                    source.push_str(&format!(
                        "layout(location = {location}) in {} {}_vs_input;\n",
                        field.ty, field.name
                    ));
                    location += 1;
                }
                _ if field.is_position() => {}
                _ => source.push_str(&format!("in {} {}_vs_output;\n", field.ty, field.name)),
            }
        }
    }

    if let Some(instance) = &slice.instance_input {
        for field in &instance.fields {
            source.push_str(&format!(
                "layout(location = {location}) in {} {}_instance_input;\n",
                field.ty, field.name
            ));
            location += 1;
        }
    }

    if let Some(output) = &slice.output {
        for field in &output.fields {
            match slice.stage {
                Stage::Vertex if field.is_position() => {}
                Stage::Vertex => {
                    source.push_str(&format!("out {} {}_vs_output;\n", field.ty, field.name));
                }
                _ if is_depth(field) => {}
                _ => {
                    if let Some(index) = target_index(field) {
                        source.push_str(&format!("layout(location = {index}) "));
                    }
                    source.push_str(&format!("out {} {}_ps_output;\n", field.ty, field.name));
                }
            }
        }
    }
    source
}

fn input_assignment(slice: &ShaderSlice) -> String {
    let mut source = String::new();
    if let Some(input) = &slice.input {
        source.push_str(&format!("{} input;\n", input.name));
        for field in &input.fields {
            match slice.stage {
                Stage::Vertex => source.push_str(&format!("input.{0} = {0}_vs_input;\n", field.name)),
                _ if field.is_position() => {
                    source.push_str(&format!("input.{} = gl_FragCoord;\n", field.name))
                }
                _ => source.push_str(&format!("input.{0} = {0}_vs_output;\n", field.name)),
            }
        }
    }
    if let (Some(instance), Some(param)) = (&slice.instance_input, &slice.instance_param) {
        source.push_str(&format!("{} {param};\n", instance.name));
        for field in &instance.fields {
            source.push_str(&format!("{param}.{0} = {0}_instance_input;\n", field.name));
        }
    }
    source
}

fn output_assignment(slice: &ShaderSlice, local: &str) -> String {
    let Some(output) = &slice.output else {
        return String::new();
    };
    let suffix = match slice.stage {
        Stage::Vertex => "_vs_output",
        _ => "_ps_output",
    };
    output
        .fields
        .iter()
        .map(|field| {
            if slice.stage == Stage::Vertex && field.is_position() {
                format!("gl_Position = {local}.{};\n", field.name)
            } else if is_depth(field) {
                format!("gl_FragDepth = {local}.{};\n", field.name)
            } else {
                format!("{}{suffix} = {local}.{};\n", field.name, field.name)
            }
        })
        .collect()
}

/// Entry body up to its final `return`, plus the returned variable's name.
fn split_return(body: &str) -> (&str, Option<&str>) {
    match text::find_last_token(body, "return") {
        Some(pos) => {
            let returned = text::identifier_after(body, pos + "return".len()).map(|(_, name)| name);
            (&body[..pos], returned)
        }
        None => (body, None),
    }
}

/// Rewrites each remaining `return <local>;` into the output copy followed by
/// a bare `return;`, since `main()` returns nothing.
fn rewrite_early_returns(slice: &ShaderSlice, body: &str) -> String {
    let mut source = String::with_capacity(body.len());
    let mut cursor = 0;
    while let Some(pos) = text::find_token_from(body, "return", cursor) {
        let after = pos + "return".len();
        let statement = text::identifier_after(body, after).and_then(|(end, local)| {
            let semicolon = text::find_byte_from(body, b';', end)?;
            body[end..semicolon].trim().is_empty().then_some((local, semicolon))
        });
        source.push_str(&body[cursor..pos]);
        match statement {
            Some((local, semicolon)) => {
                source.push_str("{\n");
                source.push_str(&output_assignment(slice, local));
                source.push_str("return;\n}");
                cursor = semicolon + 1;
            }
            None => {
                source.push_str("return");
                cursor = after;
            }
        }
    }
    source.push_str(&body[cursor..]);
    source
}

pub fn generate(
    ctx: &BuildContext,
    conditioned: &ConditionedSource,
    slice: &ShaderSlice,
    target: &EmitTarget<'_>,
) -> String {
    let mut source = version_header(ctx);
    source.push_str(&format!(
        "//{} {} {} {}\n",
        target.pmfx_name,
        target.permutation_name,
        slice.stage.as_str(),
        target.permutation_id
    ));
    source.push_str(&platform_macros(&ctx.macros_source, ShaderPlatform::Glsl));
    source.push_str(&stage_interface(slice));

    let mut emitted: Vec<&str> = Vec::new();
    for io in [&slice.input, &slice.instance_input, &slice.output].into_iter().flatten() {
        if io.fields.is_empty() || emitted.contains(&io.name.as_str()) {
            continue;
        }
        emitted.push(io.name.as_str());
        source.push_str(&struct_decl(io));
    }

    source.push_str(&conditioned.struct_decls(slice));
    for cbuffer in &slice.cbuffers {
        source.push_str(&uniform_block(cbuffer));
    }
    source.push_str(&slice.texture_decls());
    source.push_str(&slice.functions_source());

    let (body, returned) = split_return(entry_body(slice));
    source.push_str("void main()\n{\n");
    source.push_str(&input_assignment(slice));
    source.push_str(rewrite_early_returns(slice, body).trim());
    source.push('\n');
    source.push_str(&output_assignment(slice, returned.unwrap_or("output")));
    source.push_str("}\n");

    let source = text::replace_token(&source, "input", "_input");
    let source = text::replace_token(&source, "output", "_output");
    format_source(&source, INDENT)
}

fn temp_extension(stage: Stage) -> &'static str {
    match stage {
        Stage::Vertex => ".vert",
        _ => ".frag",
    }
}

pub fn emit(
    ctx: &BuildContext,
    conditioned: &ConditionedSource,
    slice: &ShaderSlice,
    target: &EmitTarget<'_>,
) -> Result<EmitOutput, BackendError> {
    if slice.stage == Stage::Compute {
        return Err(BackendError::UnsupportedStage {
            platform: ShaderPlatform::Glsl,
            stage: slice.stage,
        });
    }

    let source = generate(ctx, conditioned, slice, target);
    let temp_path = temp_path(ctx, target, temp_extension(slice.stage));
    write_file(&temp_path, &source)?;

    match ctx.compiler.as_deref() {
        Some(validator) if validator.is_file() => {
            run_tool(validator, &[temp_path.clone().into_os_string()])?;
        }
        Some(validator) => {
            warn!(validator = %validator.display(), "glsl validator not found, skipping validation");
        }
        None => debug!("no glsl validator configured, skipping validation"),
    }

    let output_path = output_path(ctx, slice, target);
    write_file(&output_path, &source)?;
    Ok(EmitOutput {
        source,
        temp_path,
        output_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OsPlatform;

    const SOURCE: &str = "struct vs_input\n{\n float4 position : POSITION;\n float2 uv : TEXCOORD0;\n};\n\
struct vs_instance_input\n{\n float4 offset : TEXCOORD4;\n};\n\
struct vs_output\n{\n float4 position : SV_POSITION;\n float2 uv : TEXCOORD0;\n};\n\
struct ps_output\n{\n float4 colour : SV_Target0;\n float4 normal : SV_Target1;\n float depth : SV_Depth;\n};\n\
cbuffer per_pass : register(b0)\n{\n float4x4 vp;\n};\n\
vs_output vs_main(vs_input input, vs_instance_input instance_input)\n{\n vs_output output;\n output.position = mul(input.position + instance_input.offset, vp);\n output.uv = input.uv;\n return output;\n}\n\
ps_output ps_main(vs_output input)\n{\n ps_output output;\n output.colour = float4(input.uv, 0.0, 1.0);\n output.normal = input.position;\n output.depth = 0.5;\n return output;\n}\n";

    fn target(id: u64) -> EmitTarget<'static> {
        EmitTarget {
            pmfx_name: "basic",
            permutation_name: "default",
            permutation_id: id,
        }
    }

    fn conditioned() -> ConditionedSource {
        ConditionedSource::new(SOURCE.to_string(), None, Vec::new())
    }

    #[test]
    fn vertex_stage_declares_locations_and_main() {
        let ctx = BuildContext::new(ShaderPlatform::Glsl, OsPlatform::Linux, "out");
        let conditioned = conditioned();
        let slice = conditioned.slice(Stage::Vertex, "vs_main").unwrap();
        let source = generate(&ctx, &conditioned, &slice, &target(0));

        assert!(source.starts_with("#version 330 core\n#define GLSL\n//basic default vs 0\n"));
        assert!(source.contains("layout(location = 0) in float4 position_vs_input;"));
        assert!(source.contains("layout(location = 1) in float2 uv_vs_input;"));
        assert!(source.contains("layout(location = 2) in float4 offset_instance_input;"));
        assert!(source.contains("out float2 uv_vs_output;"));
        assert!(!source.contains("out float4 position_vs_output;"));
        assert!(source.contains("layout (std140) uniform per_pass\n{"));
        assert!(source.contains("    vs_input _input;\n    _input.position = position_vs_input;"));
        assert!(source.contains("    instance_input.offset = offset_instance_input;"));
        assert!(source.contains("    gl_Position = _output.position;"));
        assert!(source.contains("    uv_vs_output = _output.uv;"));
        assert!(!source.contains("return"));
        assert!(!text::contains_token(&source, "input"));
        assert!(!text::contains_token(&source, "output"));
    }

    #[test]
    fn pixel_stage_maps_targets_and_depth() {
        let ctx = BuildContext::new(ShaderPlatform::Glsl, OsPlatform::Android, "out");
        let conditioned = conditioned();
        let slice = conditioned.slice(Stage::Pixel, "ps_main").unwrap();
        let source = generate(&ctx, &conditioned, &slice, &target(5));

        assert!(source.starts_with("#version 300 es\n#define GLSL\n#define GLES\nprecision highp float;\n//basic default ps 5\n"));
        assert!(source.contains("in float2 uv_vs_output;"));
        assert!(!source.contains("in float4 position_vs_output;"));
        assert!(source.contains("    _input.position = gl_FragCoord;"));
        assert!(source.contains("layout(location = 0) out float4 colour_ps_output;"));
        assert!(source.contains("layout(location = 1) out float4 normal_ps_output;"));
        assert!(!source.contains("depth_ps_output"));
        assert!(source.contains("    gl_FragDepth = _output.depth;"));
    }

    #[test]
    fn profile_follows_sub_platform_not_version() {
        let conditioned = conditioned();
        let slice = conditioned.slice(Stage::Pixel, "ps_main").unwrap();

        let gles = BuildContext::new(ShaderPlatform::Glsl, OsPlatform::Android, "out").with_shader_version("330");
        let source = generate(&gles, &conditioned, &slice, &target(0));
        assert!(source.starts_with("#version 300 es\n#define GLSL\n#define GLES\nprecision highp float;\n"));

        let desktop = BuildContext::new(ShaderPlatform::Glsl, OsPlatform::Linux, "out").with_shader_version("300 es");
        let source = generate(&desktop, &conditioned, &slice, &target(0));
        assert!(source.starts_with("#version 330 core\n#define GLSL\n//"));
        assert!(!source.contains("precision"));

        let desktop = BuildContext::new(ShaderPlatform::Glsl, OsPlatform::Linux, "out").with_shader_version("450");
        assert_eq!(version_header(&desktop), "#version 450 core\n#define GLSL\n");
    }

    #[test]
    fn early_returns_copy_outputs_before_leaving_main() {
        let conditioned = ConditionedSource::new(
            "struct vs_input\n{\n float4 position : POSITION;\n float2 uv : TEXCOORD0;\n};\n\
struct vs_output\n{\n float4 position : SV_POSITION;\n float2 uv : TEXCOORD0;\n};\n\
vs_output vs_main(vs_input input)\n{\n vs_output output;\n output.uv = input.uv;\n\
 if (input.uv.x > 0.5)\n {\n output.position = input.position;\n return output;\n }\n\
 output.position = float4(0.0, 0.0, 0.0, 1.0);\n return output;\n}\n"
                .to_string(),
            None,
            Vec::new(),
        );
        let slice = conditioned.slice(Stage::Vertex, "vs_main").unwrap();
        let ctx = BuildContext::new(ShaderPlatform::Glsl, OsPlatform::Linux, "out");
        let source = generate(&ctx, &conditioned, &slice, &target(0));

        assert_eq!(source.matches("gl_Position = _output.position;").count(), 2);
        assert_eq!(source.matches("uv_vs_output = _output.uv;").count(), 2);
        assert_eq!(source.matches("return;").count(), 1);
        assert!(!source.contains("return _output"));
    }

    #[test]
    fn compute_is_unsupported() {
        let ctx = BuildContext::new(ShaderPlatform::Glsl, OsPlatform::Linux, "out");
        let conditioned = ConditionedSource::new(
            "void cs_main(uint3 gid : SV_DispatchThreadID)\n{\n}\n".to_string(),
            None,
            Vec::new(),
        );
        let slice = conditioned.slice(Stage::Compute, "cs_main").unwrap();
        let err = emit(&ctx, &conditioned, &slice, &target(0)).unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedStage { .. }));
    }

    #[test]
    fn emit_writes_dump_and_artifact_without_validator() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(ShaderPlatform::Glsl, OsPlatform::Linux, temp.path().join("out"))
            .with_temp_dir(temp.path().join("temp"));
        let conditioned = conditioned();
        let slice = conditioned.slice(Stage::Pixel, "ps_main").unwrap();
        let output = emit(&ctx, &conditioned, &slice, &target(0)).unwrap();
        assert_eq!(output.output_path, temp.path().join("out/basic/default.psc"));
        assert!(temp.path().join("temp/basic/default.frag").is_file());
        assert_eq!(std::fs::read_to_string(&output.output_path).unwrap(), output.source);
    }
}
