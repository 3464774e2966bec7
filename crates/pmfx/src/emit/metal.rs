//! Metal Shading Language lowering.
//!
//! Metal has no global resources, so every cbuffer member and texture a free
//! function touches is threaded through as an extra leading parameter, and
//! every call site (entry included) passes it along. The relation is closed
//! over transitive calls before any text is rewritten.
//!
//! Vertex input arrives as raw `device packed_*` arrays indexed by
//! `vid`/`iid` and is unpacked into the authored input structs on entry;
//! cbuffers are bound from buffer slot 8 upward and re-exposed as locals.
use std::collections::BTreeSet;

use tracing::debug;

use super::{entry_body, output_path, temp_path, write_file, BackendError, EmitOutput, EmitTarget, INDENT};
use crate::context::{BuildContext, ShaderPlatform, Stage};
use crate::extract::{CBufferDecl, FunctionDecl, Member, TextureSampler};
use crate::macros::platform_macros;
use crate::slice::{ConditionedSource, IoField, IoStruct, ShaderSlice};
use crate::text::{self, format_source};

/// Slots below this are reserved for vertex and instance streams.
const CBUFFER_SLOT_OFFSET: u32 = 8;
const FROM_UBYTE: &str = "0.00392156862";

fn is_byte_semantic(semantic: &str) -> bool {
    semantic.contains("COLOR") || semantic.contains("BLENDINDICES")
}

fn vector_width(ty: &str) -> Option<char> {
    if ty.contains('x') {
        return None;
    }
    ty.chars().last().filter(|ch| matches!(ch, '2' | '3' | '4'))
}

/// Storage type of one field inside a `packed_` vertex struct.
fn packed_type(field: &IoField) -> String {
    let width = vector_width(&field.ty);
    if is_byte_semantic(&field.semantic) {
        match width {
            Some(width) => format!("packed_uchar{width}"),
            None => "uchar".to_string(),
        }
    } else if width.is_some() {
        format!("packed_{}", field.ty)
    } else {
        field.ty.clone()
    }
}

fn packed_struct(io: &IoStruct) -> String {
    let fields: String = io
        .fields
        .iter()
        .map(|field| format!("{} {};\n", packed_type(field), field.name))
        .collect();
    format!("struct packed_{}\n{{\n{fields}}};\n", io.name)
}

fn field_attribute(field: &IoField) -> String {
    let semantic = field.semantic.as_str();
    if semantic.eq_ignore_ascii_case("SV_POSITION") {
        " [[position]]".to_string()
    } else if let Some(index) = semantic.strip_prefix("SV_Target") {
        let index = if index.is_empty() { "0" } else { index };
        format!(" [[color({index})]]")
    } else if semantic.starts_with("SV_Depth") {
        " [[depth(any)]]".to_string()
    } else {
        String::new()
    }
}

fn io_struct(io: &IoStruct, annotate: bool) -> String {
    let fields: String = io
        .fields
        .iter()
        .map(|field| {
            let attribute = if annotate { field_attribute(field) } else { String::new() };
            format!("{}{attribute};\n", field.decl())
        })
        .collect();
    format!("struct {}\n{{\n{fields}}};\n", io.name)
}

/// A resource threaded into free functions.
#[derive(Debug, Clone, Copy)]
enum Resource<'a> {
    Member(&'a Member),
    Texture(&'a TextureSampler),
}

impl Resource<'_> {
    fn name(&self) -> &str {
        match self {
            Self::Member(member) => &member.name,
            Self::Texture(texture) => &texture.name,
        }
    }

    fn param(&self) -> String {
        match self {
            Self::Member(member) if member.is_array() => format!("constant {}* {}", member.ty, member.name),
            Self::Member(member) => format!("constant {}& {}", member.ty, member.name),
            Self::Texture(texture) => format!("{}_arg({})", texture.macro_type, texture.name),
        }
    }

    fn args(&self) -> String {
        match self {
            Self::Member(member) => member.name.clone(),
            Self::Texture(texture) => format!("{0}, sampler_{0}", texture.name),
        }
    }
}

/// Resources each function needs, closed over the call graph.
struct Augmentation<'a> {
    resources: Vec<Resource<'a>>,
    per_function: Vec<BTreeSet<usize>>,
}

impl<'a> Augmentation<'a> {
    fn new(functions: &[FunctionDecl], cbuffers: &'a [CBufferDecl], textures: &'a [TextureSampler]) -> Self {
        let resources: Vec<Resource<'a>> = cbuffers
            .iter()
            .flat_map(|cbuffer| cbuffer.members.iter().map(Resource::Member))
            .chain(textures.iter().map(Resource::Texture))
            .collect();

        let mut per_function: Vec<BTreeSet<usize>> = functions
            .iter()
            .map(|function| {
                resources
                    .iter()
                    .enumerate()
                    .filter(|(_, resource)| text::contains_token(function.body(), resource.name()))
                    .map(|(index, _)| index)
                    .collect()
            })
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for caller in 0..functions.len() {
                for callee in 0..functions.len() {
                    if caller == callee || !text::calls_function(functions[caller].body(), &functions[callee].name) {
                        continue;
                    }
                    let inherited: Vec<usize> = per_function[callee]
                        .difference(&per_function[caller])
                        .copied()
                        .collect();
                    if !inherited.is_empty() {
                        per_function[caller].extend(inherited);
                        changed = true;
                    }
                }
            }
        }

        Self {
            resources,
            per_function,
        }
    }

    fn params(&self, index: usize) -> Vec<String> {
        self.per_function[index]
            .iter()
            .map(|&resource| self.resources[resource].param())
            .collect()
    }

    fn args(&self, index: usize) -> String {
        self.per_function[index]
            .iter()
            .map(|&resource| self.resources[resource].args())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Inserts the callee's extra arguments right after `(` at every call site.
    fn rewrite_calls(&self, functions: &[FunctionDecl], body: &str) -> String {
        let bytes = body.as_bytes();
        let mut insertions: Vec<(usize, String)> = Vec::new();
        for (index, function) in functions.iter().enumerate() {
            if self.per_function[index].is_empty() {
                continue;
            }
            let args = self.args(index);
            for paren in text::find_calls(body, &function.name) {
                let mut next = paren + 1;
                while next < bytes.len() && bytes[next].is_ascii_whitespace() {
                    next += 1;
                }
                let separator = if bytes.get(next) == Some(&b')') { "" } else { ", " };
                insertions.push((paren + 1, format!("{args}{separator}")));
            }
        }
        insertions.sort_by_key(|(pos, _)| *pos);

        let mut output = String::with_capacity(body.len());
        let mut cursor = 0;
        for (pos, insertion) in insertions {
            output.push_str(&body[cursor..pos]);
            output.push_str(&insertion);
            cursor = pos;
        }
        output.push_str(&body[cursor..]);
        output
    }
}

/// `in`/`out`/`inout` parameters become references in the matching address space.
fn rewrite_param(param: &str) -> String {
    let words: Vec<&str> = param.split_whitespace().collect();
    match words.as_slice() {
        ["out" | "inout", ty, name, ..] => format!("thread {ty}& {name}"),
        ["in", ty, name, ..] => format!("constant {ty}& {name}"),
        _ => param.trim().to_string(),
    }
}

fn function_source(index: usize, function: &FunctionDecl, functions: &[FunctionDecl], aug: &Augmentation<'_>) -> String {
    let mut params = aug.params(index);
    params.extend(
        function
            .params()
            .split(',')
            .filter(|param| !param.trim().is_empty())
            .map(rewrite_param),
    );
    format!(
        "{}({}){}{}\n\n",
        function.head(),
        params.join(", "),
        function.trailer(),
        aug.rewrite_calls(functions, function.body())
    )
}

fn entry_signature(slice: &ShaderSlice) -> String {
    let kind = match slice.stage {
        Stage::Vertex => "vertex",
        Stage::Pixel => "fragment",
        Stage::Compute => "kernel",
    };

    let mut params = Vec::new();
    match slice.stage {
        Stage::Vertex => {
            if let Some(input) = &slice.input {
                params.push(format!("device packed_{}* vertices [[buffer(0)]]", input.name));
            }
            params.push("uint vid [[vertex_id]]".to_string());
            if let Some(instance) = &slice.instance_input {
                params.push(format!("device packed_{}* instances [[buffer(1)]]", instance.name));
                params.push("uint iid [[instance_id]]".to_string());
            }
        }
        Stage::Pixel => {
            if let Some(input) = &slice.input {
                let param = slice.input_param.as_deref().unwrap_or("input");
                params.push(format!("{} {param} [[stage_in]]", input.name));
            }
        }
        Stage::Compute => params.push("uint2 gid [[thread_position_in_grid]]".to_string()),
    }

    for texture in &slice.textures {
        params.push(texture.decl().trim_end_matches(';').to_string());
    }
    for cbuffer in &slice.cbuffers {
        let slot = cbuffer.register.unwrap_or(0) + CBUFFER_SLOT_OFFSET;
        params.push(format!("constant c_{0} &{0} [[buffer({slot})]]", cbuffer.name));
    }

    format!(
        "{kind} {} {}_main({})\n",
        slice.entry.return_type,
        slice.stage.as_str(),
        params.join("\n, ")
    )
}

fn unpack(io: &IoStruct, local: &str, stream: &str) -> String {
    let mut source = format!("{} {local};\n", io.name);
    for field in &io.fields {
        source.push_str(&format!("{local}.{0} = {1}({stream}.{0})", field.name, field.ty));
        if field.semantic.contains("COLOR") {
            source.push_str(&format!(" * {FROM_UBYTE}"));
        }
        source.push_str(";\n");
    }
    source
}

fn entry_prologue(slice: &ShaderSlice) -> String {
    let mut source = String::new();
    if slice.stage == Stage::Vertex {
        if let Some(input) = &slice.input {
            source.push_str(&unpack(input, slice.input_param.as_deref().unwrap_or("input"), "vertices[vid]"));
        }
        if let Some(instance) = &slice.instance_input {
            let local = slice.instance_param.as_deref().unwrap_or("instance_input");
            source.push_str(&unpack(instance, local, "instances[iid]"));
        }
    }
    for cbuffer in &slice.cbuffers {
        for member in &cbuffer.members {
            if member.is_array() {
                source.push_str(&format!(
                    "constant {0}* {1} = &{2}.{1}[0];\n",
                    member.ty, member.name, cbuffer.name
                ));
            } else {
                source.push_str(&format!(
                    "constant {0}& {1} = {2}.{1};\n",
                    member.ty, member.name, cbuffer.name
                ));
            }
        }
    }
    source
}

pub fn generate(ctx: &BuildContext, conditioned: &ConditionedSource, slice: &ShaderSlice) -> String {
    let mut source = platform_macros(&ctx.macros_source, ShaderPlatform::Metal);
    source.push_str("using namespace metal;\n");
    source.push_str(&conditioned.struct_decls(slice));

    for cbuffer in &slice.cbuffers {
        source.push_str(&format!("struct c_{}\n{};\n", cbuffer.name, cbuffer.body()));
    }

    if slice.stage == Stage::Vertex {
        for io in [&slice.input, &slice.instance_input].into_iter().flatten() {
            source.push_str(&packed_struct(io));
        }
    }

    let mut emitted: Vec<&str> = Vec::new();
    for (io, annotate) in [
        (&slice.input, slice.stage == Stage::Pixel),
        (&slice.instance_input, false),
        (&slice.output, true),
    ] {
        let Some(io) = io else { continue };
        if emitted.contains(&io.name.as_str()) {
            continue;
        }
        emitted.push(io.name.as_str());
        source.push_str(&io_struct(io, annotate));
    }

    let aug = Augmentation::new(&slice.functions, &slice.cbuffers, &slice.textures);
    for (index, function) in slice.functions.iter().enumerate() {
        source.push_str(&function_source(index, function, &slice.functions, &aug));
    }

    source.push_str(&entry_signature(slice));
    source.push_str("{\n");
    source.push_str(&entry_prologue(slice));
    source.push_str(&aug.rewrite_calls(&slice.functions, entry_body(slice)));
    source.push_str("\n}\n");
    format_source(&source, INDENT)
}

pub fn emit(
    ctx: &BuildContext,
    conditioned: &ConditionedSource,
    slice: &ShaderSlice,
    target: &EmitTarget<'_>,
) -> Result<EmitOutput, BackendError> {
    let source = generate(ctx, conditioned, slice);
    let temp_path = temp_path(ctx, target, &format!("_{}.metal", slice.stage.as_str()));
    write_file(&temp_path, &source)?;

    let output_path = output_path(ctx, slice, target);
    write_file(&output_path, &source)?;
    debug!(output = %output_path.display(), "metal source written, library compilation is left to the runtime");
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

    fn ctx() -> BuildContext {
        BuildContext::new(ShaderPlatform::Metal, OsPlatform::Osx, "out")
    }

    fn generate_stage(source: &str, stage: Stage, entry: &str) -> String {
        let conditioned = ConditionedSource::new(source.to_string(), None, Vec::new());
        let slice = conditioned.slice(stage, entry).unwrap();
        generate(&ctx(), &conditioned, &slice)
    }

    const TEXTURED: &str = "struct vs_output\n{\n float4 position : SV_POSITION;\n float2 uv : TEXCOORD0;\n};\n\
struct ps_output\n{\n float4 colour : SV_Target0;\n float depth : SV_Depth;\n};\n\
declare_texture_samplers\n{\n texture_2d( diffuse, 0 );\n};\n\
float4 f()\n{\n return sample_texture(diffuse, uv);\n}\n\
float4 g(float2 uv)\n{\n return f() * uv.x;\n}\n\
ps_output ps_main(vs_output input)\n{\n ps_output output;\n output.colour = f() + g(input.uv);\n output.depth = 0.0;\n return output;\n}\n";

    #[test]
    fn textures_are_threaded_through_calls() {
        let source = generate_stage(TEXTURED, Stage::Pixel, "ps_main");
        assert!(source.contains("float4 f(texture_2d_arg(diffuse))"));
        assert!(source.contains("float4 g(texture_2d_arg(diffuse), float2 uv)"));
        assert!(source.contains("return f(diffuse, sampler_diffuse) * uv.x;"));
        assert!(source.contains("output.colour = f(diffuse, sampler_diffuse) + g(diffuse, sampler_diffuse, input.uv);"));
        assert!(source.contains("fragment ps_output ps_main(vs_output input [[stage_in]]\n, texture_2d( diffuse, 0 ))"));
    }

    #[test]
    fn io_structs_carry_attributes() {
        let source = generate_stage(TEXTURED, Stage::Pixel, "ps_main");
        assert!(source.contains("struct vs_output\n{\n    float4 position [[position]];\n    float2 uv;\n};"));
        assert!(source.contains("    float4 colour [[color(0)]];\n    float depth [[depth(any)]];"));
        assert!(source.contains("using namespace metal;"));
    }

    const VERTEX: &str = "struct vs_input\n{\n float4 position : POSITION;\n float4 colour : COLOR0;\n uint4 bones : BLENDINDICES0;\n float4x4 world : TEXCOORD1;\n};\n\
struct vs_output\n{\n float4 position : SV_POSITION;\n float4 colour : TEXCOORD0;\n};\n\
cbuffer per_pass : register(b1)\n{\n float4x4 vp;\n float4 lights[4];\n};\n\
float4 transform(float4 p)\n{\n return mul(p, vp);\n}\n\
void accumulate(in float4 l, inout float4 colour)\n{\n colour += l;\n}\n\
vs_output vs_main(vs_input input)\n{\n vs_output output;\n output.position = transform(input.position);\n output.colour = input.colour;\n accumulate(lights[0], output.colour);\n return output;\n}\n";

    #[test]
    fn vertex_input_is_packed_and_unpacked() {
        let source = generate_stage(VERTEX, Stage::Vertex, "vs_main");
        assert!(source.contains(
            "struct packed_vs_input\n{\n    packed_float4 position;\n    packed_uchar4 colour;\n    packed_uchar4 bones;\n    float4x4 world;\n};"
        ));
        assert!(source.contains("vertex vs_output vs_main(device packed_vs_input* vertices [[buffer(0)]]\n, uint vid [[vertex_id]]\n, constant c_per_pass &per_pass [[buffer(9)]])"));
        assert!(source.contains("    vs_input input;\n    input.position = float4(vertices[vid].position);"));
        assert!(source.contains("input.colour = float4(vertices[vid].colour) * 0.00392156862;"));
        assert!(source.contains("input.bones = uint4(vertices[vid].bones);"));
    }

    #[test]
    fn cbuffer_members_become_parameters_and_locals() {
        let source = generate_stage(VERTEX, Stage::Vertex, "vs_main");
        assert!(source.contains("struct c_per_pass\n{\n    float4x4 vp;"));
        assert!(source.contains("float4 transform(constant float4x4& vp, float4 p)"));
        assert!(source.contains("void accumulate(constant float4& l, thread float4& colour)"));
        assert!(source.contains("    constant float4x4& vp = per_pass.vp;\n    constant float4* lights = &per_pass.lights[0];"));
        assert!(source.contains("output.position = transform(vp, input.position);"));
        assert!(source.contains("accumulate(lights[0], output.colour);"));
    }

    #[test]
    fn compute_uses_grid_position() {
        let source = "void cs_main(uint3 gid : SV_DispatchThreadID)\n{\n write_texture(target, float4(0.0, 0.0, 0.0, 1.0), gid.xy);\n}\n\
declare_texture_samplers\n{\n texture_2d_rw( target, 2 );\n};\n";
        let source = generate_stage(source, Stage::Compute, "cs_main");
        assert!(source.contains("kernel void cs_main(uint2 gid [[thread_position_in_grid]]\n, texture_2d_rw( target, 2 ))"));
    }

    #[test]
    fn emit_writes_metal_dump_and_artifact() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(ShaderPlatform::Metal, OsPlatform::Osx, temp.path().join("out"))
            .with_temp_dir(temp.path().join("temp"));
        let conditioned = ConditionedSource::new(TEXTURED.to_string(), None, Vec::new());
        let slice = conditioned.slice(Stage::Pixel, "ps_main").unwrap();
        let target = EmitTarget {
            pmfx_name: "basic",
            permutation_name: "lit__3__",
            permutation_id: 3,
        };
        let output = emit(&ctx, &conditioned, &slice, &target).unwrap();
        assert_eq!(output.temp_path, temp.path().join("temp/basic/lit__3___ps.metal"));
        assert_eq!(output.output_path, temp.path().join("out/basic/lit__3__.psc"));
        assert!(output.output_path.is_file());
    }
}
