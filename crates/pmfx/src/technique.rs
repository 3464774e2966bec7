//! Per-permutation material constants and technique-scoped texture samplers.
//!
//! Constants from the technique (including `permutation(<expr>)` groups that
//! hold under the permutation) and from each `inherit_constants` parent are
//! laid out group by group. Within a group, members sort by descending
//! element count, keeping first-seen order for equal sizes; the running
//! offset is padded to a 16 byte boundary at the end.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::conditional;
use crate::extract::{CBufferDecl, Member, TextureSampler};
use crate::manifest::{member_wise_merge, Manifest, ManifestError, TechniqueSpec};
use crate::ordered::Ordered;
use crate::permutation::Permutation;

pub const MATERIAL_CBUFFER: &str = "material_data";
pub const MATERIAL_REGISTER: u32 = 7;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("material constants of '{technique}' occupy {size_bytes} bytes, not a multiple of 16")]
    Misaligned { technique: String, size_bytes: u32 },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantInfo {
    #[serde(rename = "type")]
    pub ty: String,
    pub offset: u32,
    pub num_elements: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MaterialLayout {
    pub constants: Ordered<ConstantInfo>,
    pub used_bytes: u32,
    pub size_bytes: u32,
    /// `cbuffer material_data : register(b7)`; absent without constants.
    pub cbuffer: Option<CBufferDecl>,
    /// C-side mirror of the cbuffer for the material header.
    pub c_struct: String,
}

pub fn element_count(ty: &str) -> Option<u32> {
    match ty {
        "float" => Some(1),
        "float2" => Some(2),
        "float3" => Some(3),
        "float4" => Some(4),
        "float4x4" => Some(16),
        _ => None,
    }
}

fn padding_type(elements: u32) -> &'static str {
    match elements {
        1 => "float",
        2 => "float2",
        _ => "float3",
    }
}

/// The technique's constants with `permutation(<expr>)` groups resolved:
/// plain entries first, then members of every truthy group not already present.
pub fn conditioned_constants(constants: &Ordered<Value>, permutation: &Permutation) -> Ordered<Value> {
    let env = permutation.env();
    let mut plain = Value::Object(Map::new());
    let mut groups = Vec::new();
    for (key, value) in constants.iter() {
        match conditional::conditional_key_expression(key) {
            Some(expression) => groups.push((expression, value)),
            None => {
                if let Value::Object(map) = &mut plain {
                    map.insert(key.to_string(), value.clone());
                }
            }
        }
    }
    for (expression, value) in groups {
        if conditional::is_truthy(expression, &env) {
            member_wise_merge(&mut plain, value);
        }
    }
    match plain {
        Value::Object(map) => map.into_iter().collect(),
        _ => Ordered::new(),
    }
}

fn constant_groups(
    manifest: &Manifest,
    spec: &TechniqueSpec,
    permutation: &Permutation,
) -> Result<Vec<Ordered<Value>>, LayoutError> {
    let mut groups = vec![conditioned_constants(&spec.constants, permutation)];
    for parent in &spec.inherit_constants {
        if manifest.raw(parent).is_none() {
            warn!(technique = %permutation.technique, inherit = %parent, "inherit_constants names an unknown technique");
            continue;
        }
        let parent_spec = manifest.technique(parent)?;
        groups.push(conditioned_constants(&parent_spec.constants, permutation));
    }
    Ok(groups)
}

/// Stable descending sort by element count; unknown types are skipped.
fn sort_group(technique: &str, group: &Ordered<Value>) -> Vec<(String, String, u32, Map<String, Value>)> {
    let mut sorted: Vec<(String, String, u32, Map<String, Value>)> = Vec::new();
    for (name, value) in group.iter() {
        let ty = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let Some(count) = element_count(ty) else {
            warn!(technique, constant = name, ty, "unsupported constant type, skipping");
            continue;
        };
        let mut extra = value.as_object().cloned().unwrap_or_default();
        for key in ["type", "offset", "num_elements"] {
            extra.remove(key);
        }
        let position = sorted
            .iter()
            .position(|(_, _, existing, _)| count > *existing)
            .unwrap_or(sorted.len());
        sorted.insert(position, (name.to_string(), ty.to_string(), count, extra));
    }
    sorted
}

pub fn material_layout(
    manifest: &Manifest,
    spec: &TechniqueSpec,
    permutation: &Permutation,
    platform_defines: &[&str],
) -> Result<MaterialLayout, LayoutError> {
    let technique = permutation.technique.as_str();
    let mut constants = Ordered::new();
    let mut members = Vec::new();
    let mut offset = 0u32;

    for group in constant_groups(manifest, spec, permutation)? {
        for (name, ty, count, extra) in sort_group(technique, &group) {
            if constants.contains_key(&name) {
                warn!(technique, constant = %name, "constant declared twice, keeping the first");
                continue;
            }
            constants.insert(
                name.clone(),
                ConstantInfo {
                    ty: ty.clone(),
                    offset,
                    num_elements: count,
                    extra,
                },
            );
            members.push(Member {
                ty,
                name: format!("m_{name}"),
                array: None,
            });
            offset += count;
        }
    }

    if offset == 0 {
        return Ok(MaterialLayout::default());
    }

    let used = offset;
    let pad = (4 - offset % 4) % 4;
    if pad != 0 {
        members.push(Member {
            ty: padding_type(pad).to_string(),
            name: "m_padding".to_string(),
            array: None,
        });
        offset += pad;
    }

    let size_bytes = offset * 4;
    if size_bytes % 16 != 0 {
        return Err(LayoutError::Misaligned {
            technique: technique.to_string(),
            size_bytes,
        });
    }

    let body: String = members
        .iter()
        .map(|member| format!("    {} {};\n", member.ty, member.name))
        .collect();
    let cbuffer_source = format!(
        "cbuffer {MATERIAL_CBUFFER} : register(b{MATERIAL_REGISTER})\n{{\n{body}}};"
    );
    let c_struct = format!(
        "struct {technique}{}\n{{\n{body}}};\n\n",
        struct_suffix(permutation, platform_defines)
    );

    Ok(MaterialLayout {
        constants,
        used_bytes: used * 4,
        size_bytes,
        cbuffer: Some(CBufferDecl {
            name: MATERIAL_CBUFFER.to_string(),
            register: Some(MATERIAL_REGISTER),
            members,
            source: cbuffer_source,
        }),
        c_struct,
    })
}

/// `_name` per define at 1, `_name<value>` above 1; empty for id 0.
pub fn struct_suffix(permutation: &Permutation, platform_defines: &[&str]) -> String {
    if permutation.id == 0 {
        return String::new();
    }
    permutation
        .defines
        .iter()
        .filter(|(name, _)| !platform_defines.contains(&name.as_str()))
        .filter(|(_, value)| *value > 0)
        .map(|(name, value)| {
            if *value == 1 {
                format!("_{}", name.to_lowercase())
            } else {
                format!("_{}{}", name.to_lowercase(), value)
            }
        })
        .collect()
}

pub fn technique_textures(spec: &TechniqueSpec) -> Vec<TextureSampler> {
    spec.texture_samplers
        .iter()
        .map(|(name, sampler)| TextureSampler::new(sampler.ty.clone(), name, sampler.unit))
        .collect()
}
