//! `info.json` writer and the incremental rebuild check that reads it back.
//!
//! Types:
//!
//! - `ReflectionRecord` describes one technique permutation for the runtime:
//!   vertex layouts, cbuffer and texture bindings, material constants, the
//!   artifact names and the permutation options.
//! - `DependencyRecord` is the whole file: input timestamps plus every
//!   record built from the pmfx.
//!
//! Functions:
//!
//! - `tracked_files` lists the inputs that invalidate a pmfx's outputs.
//! - `is_up_to_date` compares a previous `info.json` against those inputs.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::BuildContext;
use crate::manifest::TechniqueSpec;
use crate::ordered::Ordered;
use crate::permutation::{Permutation, PermutationOption, PermutationSet};
use crate::slice::{ConditionedSource, IoStruct, ShaderSlice};
use crate::source::PmfxSource;
use crate::technique::{ConstantInfo, MaterialLayout};

/// Semantic names in id order with their per-element byte size.
const SEMANTICS: [(&str, u32); 8] = [
    ("SV_POSITION", 4),
    ("POSITION", 4),
    ("TEXCOORD", 4),
    ("NORMAL", 4),
    ("TANGENT", 4),
    ("BITANGENT", 4),
    ("COLOR", 1),
    ("BLENDINDICES", 1),
];

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("failed to read modification time of {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputElement {
    pub name: String,
    pub semantic_index: u32,
    /// Index into the semantic table; `-1` for semantics outside it.
    pub semantic_id: i32,
    pub size: u32,
    pub element_size: u32,
    pub num_elements: u32,
    pub offset: u32,
}

fn num_elements(ty: &str) -> u32 {
    let dims = ty.trim_start_matches(|ch: char| ch.is_ascii_alphabetic());
    if dims.is_empty() {
        return 1;
    }
    dims.split('x')
        .map(|dim| dim.parse::<u32>().unwrap_or(1))
        .product()
}

fn semantic_info(semantic: &str) -> (i32, u32, u32) {
    let upper = semantic.to_ascii_uppercase();
    for (id, (name, element_size)) in SEMANTICS.iter().enumerate() {
        if let Some(index) = upper.strip_prefix(name) {
            let index = if index.is_empty() { 0 } else { index.parse().unwrap_or(0) };
            return (id as i32, index, *element_size);
        }
    }
    warn!(semantic, "unknown vertex semantic");
    (-1, 0, 4)
}

/// Packed vertex layout of an IO struct, offsets accumulating in declaration order.
pub fn input_elements(io: Option<&IoStruct>) -> Vec<InputElement> {
    let Some(io) = io else {
        return Vec::new();
    };
    let mut offset = 0;
    io.fields
        .iter()
        .map(|field| {
            let (semantic_id, semantic_index, element_size) = semantic_info(&field.semantic);
            let num_elements = num_elements(&field.ty);
            let size = element_size * num_elements;
            let element = InputElement {
                name: field.name.clone(),
                semantic_index,
                semantic_id,
                size,
                element_size,
                num_elements,
                offset,
            };
            offset += size;
            element
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CBufferBinding {
    pub name: String,
    pub location: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureBinding {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub data_type: String,
    pub fragments: u32,
    pub unit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cs: Option<String>,
    pub texture_sampler_bindings: Vec<TextureBinding>,
    pub cbuffers: Vec<CBufferBinding>,
    pub vs_inputs: Vec<InputElement>,
    pub instance_inputs: Vec<InputElement>,
    pub vs_outputs: Vec<InputElement>,
    pub constants: Ordered<ConstantInfo>,
    pub constants_used_bytes: u32,
    pub constants_size_bytes: u32,
    pub vs_file: String,
    pub ps_file: String,
    pub cs_file: String,
    pub permutations: Ordered<PermutationOption>,
    pub permutation_id: u64,
    pub permutation_option_mask: u64,
    /// Manifest keys this tool does not interpret, passed through to the runtime.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReflectionRecord {
    /// `vertex` supplies the vertex layouts; techniques without one report none.
    pub fn new(
        spec: &TechniqueSpec,
        permutation: &Permutation,
        set: &PermutationSet,
        layout: &MaterialLayout,
        conditioned: &ConditionedSource,
        vertex: Option<&ShaderSlice>,
    ) -> Self {
        let name = permutation.name();
        Self {
            name: permutation.technique.clone(),
            vs: spec.vs.clone(),
            ps: spec.ps.clone(),
            cs: spec.cs.clone(),
            texture_sampler_bindings: conditioned
                .textures
                .iter()
                .map(|texture| TextureBinding {
                    name: texture.name.clone(),
                    ty: texture.macro_type.clone(),
                    data_type: texture.data_type.clone(),
                    fragments: texture.fragments,
                    unit: texture.unit,
                })
                .collect(),
            cbuffers: conditioned
                .cbuffers
                .iter()
                .map(|cbuffer| CBufferBinding {
                    name: cbuffer.name.clone(),
                    location: cbuffer.register.unwrap_or(0),
                })
                .collect(),
            vs_inputs: input_elements(vertex.and_then(|slice| slice.input.as_ref())),
            instance_inputs: input_elements(vertex.and_then(|slice| slice.instance_input.as_ref())),
            vs_outputs: input_elements(vertex.and_then(|slice| slice.output.as_ref())),
            constants: layout.constants.clone(),
            constants_used_bytes: layout.used_bytes,
            constants_size_bytes: layout.size_bytes,
            vs_file: format!("{name}.vsc"),
            ps_file: format!("{name}.psc"),
            cs_file: format!("{name}.csc"),
            permutations: set.options.clone(),
            permutation_id: permutation.id,
            permutation_option_mask: set.option_mask,
            extra: spec.extra.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStamp {
    pub name: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub files: Vec<FileStamp>,
    pub techniques: Vec<ReflectionRecord>,
}

impl DependencyRecord {
    pub fn new(files: &[PathBuf], techniques: Vec<ReflectionRecord>) -> Result<Self, DependencyError> {
        let files = files.iter().map(|path| stamp(path)).collect::<Result<_, _>>()?;
        Ok(Self { files, techniques })
    }

    pub fn write(&self, path: &Path) -> Result<(), DependencyError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| DependencyError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, json)
        };
        write().map_err(|source| DependencyError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), techniques = self.techniques.len(), "wrote reflection info");
        Ok(())
    }
}

/// Only the dependency list is needed to decide staleness.
#[derive(Deserialize)]
struct RecordedFiles {
    files: Vec<FileStamp>,
}

fn stamp_name(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn modified(path: &Path) -> Result<f64, DependencyError> {
    let stat = |path: &Path| -> std::io::Result<f64> {
        let modified = fs::metadata(path)?.modified()?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0))
    };
    stat(path).map_err(|source| DependencyError::Stat {
        path: path.to_path_buf(),
        source,
    })
}

pub fn stamp(path: &Path) -> Result<FileStamp, DependencyError> {
    Ok(FileStamp {
        name: stamp_name(path),
        timestamp: modified(path)?,
    })
}

/// Tool, macros header, the pmfx itself, then its includes.
pub fn tracked_files(ctx: &BuildContext, source: &PmfxSource) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    files.extend(ctx.tool_file.iter().cloned());
    files.extend(ctx.macros_file.iter().cloned());
    files.push(source.path.clone());
    files.extend(source.includes.iter().cloned());
    files
}

/// True when `info_path` exists, names exactly the current inputs, and
/// none of them changed since it was written.
pub fn is_up_to_date(info_path: &Path, current: &[PathBuf]) -> bool {
    let Ok(text) = fs::read_to_string(info_path) else {
        debug!(path = %info_path.display(), "no previous reflection info");
        return false;
    };
    let recorded: RecordedFiles = match serde_json::from_str(&text) {
        Ok(recorded) => recorded,
        Err(err) => {
            debug!(path = %info_path.display(), error = %err, "unreadable reflection info");
            return false;
        }
    };

    let current_names: HashSet<String> = current.iter().map(|path| stamp_name(path)).collect();
    let recorded_names: HashSet<&str> = recorded.files.iter().map(|file| file.name.as_str()).collect();
    if let Some(added) = current_names.iter().find(|name| !recorded_names.contains(name.as_str())) {
        debug!(file = %added, "new dependency since last build");
        return false;
    }

    for file in &recorded.files {
        if !current_names.contains(&file.name) {
            debug!(file = %file.name, "dependency no longer referenced");
            return false;
        }
        match modified(Path::new(&file.name)) {
            Ok(timestamp) if timestamp <= file.timestamp => {}
            Ok(_) => {
                debug!(file = %file.name, "dependency is out of date");
                return false;
            }
            Err(_) => {
                debug!(file = %file.name, "dependency is missing");
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::IoField;
    use std::time::{Duration, SystemTime};

    fn field(ty: &str, name: &str, semantic: &str) -> IoField {
        IoField {
            ty: ty.to_string(),
            name: name.to_string(),
            semantic: semantic.to_string(),
        }
    }

    #[test]
    fn vertex_layout_uses_semantic_sizes() {
        let io = IoStruct {
            name: "vs_input".into(),
            decl: String::new(),
            fields: vec![
                field("float4", "position", "POSITION"),
                field("float2", "uv", "TEXCOORD1"),
                field("float4", "colour", "COLOR"),
                field("float4x4", "world", "TEXCOORD4"),
                field("float", "weight", "BLENDWEIGHT"),
            ],
        };
        let elements = input_elements(Some(&io));
        assert_eq!(elements[0].semantic_id, 1);
        assert_eq!(elements[0].size, 16);
        assert_eq!(elements[1].semantic_index, 1);
        assert_eq!(elements[1].offset, 16);
        assert_eq!(elements[2].semantic_id, 6);
        assert_eq!(elements[2].element_size, 1);
        assert_eq!(elements[2].size, 4);
        assert_eq!(elements[2].offset, 24);
        assert_eq!(elements[3].num_elements, 16);
        assert_eq!(elements[3].offset, 28);
        assert_eq!(elements[4].semantic_id, -1);
        assert_eq!(elements[4].num_elements, 1);
    }

    #[test]
    fn sv_position_wins_over_position() {
        assert_eq!(semantic_info("SV_POSITION"), (0, 0, 4));
        assert_eq!(semantic_info("BLENDINDICES2"), (7, 2, 1));
    }

    #[test]
    fn up_to_date_requires_same_files_and_older_stamps() {
        let temp = tempfile::tempdir().unwrap();
        let pmfx = temp.path().join("a.pmfx");
        let include = temp.path().join("common.jsn");
        fs::write(&pmfx, "x").unwrap();
        fs::write(&include, "y").unwrap();
        let info = temp.path().join("out/a/info.json");

        assert!(!is_up_to_date(&info, &[pmfx.clone()]));
        DependencyRecord::new(&[pmfx.clone()], Vec::new()).unwrap().write(&info).unwrap();
        assert!(is_up_to_date(&info, &[pmfx.clone()]));
        assert!(!is_up_to_date(&info, &[pmfx.clone(), include.clone()]));

        let later = SystemTime::now() + Duration::from_secs(120);
        fs::File::options()
            .write(true)
            .open(&pmfx)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(!is_up_to_date(&info, &[pmfx.clone()]));
    }

    #[test]
    fn missing_recorded_file_is_stale() {
        let temp = tempfile::tempdir().unwrap();
        let pmfx = temp.path().join("a.pmfx");
        fs::write(&pmfx, "x").unwrap();
        let info = temp.path().join("info.json");
        DependencyRecord::new(&[pmfx.clone()], Vec::new()).unwrap().write(&info).unwrap();
        fs::remove_file(&pmfx).unwrap();
        assert!(!is_up_to_date(&info, &[pmfx]));
    }

    #[test]
    fn record_serializes_extras_inline() {
        let record = ReflectionRecord {
            name: "lit".into(),
            vs: Some("vs_main".into()),
            ps: None,
            cs: None,
            texture_sampler_bindings: Vec::new(),
            cbuffers: vec![CBufferBinding {
                name: "material_data".into(),
                location: 7,
            }],
            vs_inputs: Vec::new(),
            instance_inputs: Vec::new(),
            vs_outputs: Vec::new(),
            constants: Ordered::new(),
            constants_used_bytes: 0,
            constants_size_bytes: 0,
            vs_file: "lit.vsc".into(),
            ps_file: "lit.psc".into(),
            cs_file: "lit.csc".into(),
            permutations: Ordered::new(),
            permutation_id: 0,
            permutation_option_mask: 0,
            extra: serde_json::from_str(r#"{"blend_state": "alpha"}"#).unwrap(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["blend_state"], "alpha");
        assert_eq!(value["cbuffers"][0]["location"], 7);
        assert!(value.get("ps").is_none());
    }
}
