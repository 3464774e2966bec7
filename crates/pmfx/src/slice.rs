//! Projects one permutation onto a single shader stage: the entry function,
//! the functions it transitively calls, the cbuffers and textures those
//! bodies touch, and the stage IO structs named by the entry signature.
use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use crate::context::Stage;
use crate::extract::{self, CBufferDecl, Declarations, FunctionDecl, StructDecl, TextureSampler};
use crate::text;

const TEXTURE_ACCESSORS: [&str; 3] = ["sample_texture", "read_texture", "write_texture"];

#[derive(Debug, Error)]
pub enum SliceError {
    #[error("{stage} entry function '{name}' not found")]
    MissingEntry { stage: Stage, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IoField {
    pub ty: String,
    pub name: String,
    /// HLSL semantic including its index, e.g. `TEXCOORD1`; empty if absent.
    pub semantic: String,
}

impl IoField {
    /// `ty name`, the declaration without its semantic.
    pub fn decl(&self) -> String {
        format!("{} {}", self.ty, self.name)
    }

    pub fn is_position(&self) -> bool {
        self.semantic.eq_ignore_ascii_case("SV_POSITION") || self.name == "position"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IoStruct {
    pub name: String,
    pub decl: String,
    pub fields: Vec<IoField>,
}

impl IoStruct {
    fn from_decl(decl: StructDecl) -> Self {
        let fields = decl
            .body()
            .split(';')
            .filter_map(|statement| {
                let (declaration, semantic) = match statement.split_once(':') {
                    Some((declaration, semantic)) => (declaration, semantic.trim()),
                    None => (statement, ""),
                };
                let mut words = declaration.split_whitespace();
                let ty = words.next()?;
                let name = words.next()?;
                Some(IoField {
                    ty: ty.to_string(),
                    name: name.to_string(),
                    semantic: semantic.to_string(),
                })
            })
            .collect();
        Self {
            name: decl.name,
            decl: decl.source,
            fields,
        }
    }
}

/// A parameter of the entry signature.
#[derive(Debug, Clone, PartialEq)]
struct Param {
    text: String,
    ty: String,
    name: String,
}

fn parse_params(params: &str) -> Vec<Param> {
    params
        .split(',')
        .map(str::trim)
        .filter(|param| !param.is_empty())
        .map(|param| {
            let declaration = param.split(':').next().unwrap_or(param);
            let words: Vec<&str> = declaration.split_whitespace().collect();
            let name = words.last().copied().unwrap_or_default();
            let ty = if words.len() >= 2 { words[words.len() - 2] } else { "" };
            Param {
                text: param.to_string(),
                ty: ty.to_string(),
                name: name.to_string(),
            }
        })
        .collect()
}

/// One permutation's conditioned source with its declaration tables, the
/// material cbuffer and the technique textures already appended.
#[derive(Debug, Clone)]
pub struct ConditionedSource {
    pub text: String,
    pub decls: Declarations,
    pub cbuffers: Vec<CBufferDecl>,
    pub textures: Vec<TextureSampler>,
}

impl ConditionedSource {
    pub fn new(text: String, material: Option<CBufferDecl>, technique_textures: Vec<TextureSampler>) -> Self {
        let decls = Declarations::extract(&text);
        let mut cbuffers = decls.cbuffers.clone();
        cbuffers.extend(material);
        let mut textures = decls.textures.clone();
        textures.extend(technique_textures);
        Self {
            text,
            decls,
            cbuffers,
            textures,
        }
    }

    /// Generic struct declarations, one per line group. Structs the slice
    /// uses as stage IO are left to the backend's IO emission.
    pub fn struct_decls(&self, slice: &ShaderSlice) -> String {
        let io_names = slice.io_struct_names();
        self.decls
            .structs
            .iter()
            .filter(|decl| !io_names.contains(&decl.name.as_str()))
            .map(|decl| format!("{}\n", decl.source))
            .collect()
    }

    pub fn slice(&self, stage: Stage, entry_name: &str) -> Result<ShaderSlice, SliceError> {
        let entry = self
            .decls
            .function(entry_name)
            .cloned()
            .ok_or_else(|| SliceError::MissingEntry {
                stage,
                name: entry_name.to_string(),
            })?;

        let functions = used_functions(&entry, &self.decls.functions);

        let params = parse_params(entry.params());
        let mut input_param = params
            .iter()
            .find(|param| param.name == "input" || param.name == "_input")
            .cloned();
        let mut instance_param = params
            .iter()
            .find(|param| param.name == "instance_input" || param.name == "_instance_input")
            .cloned();

        let mut input = input_param
            .as_ref()
            .and_then(|param| extract::find_struct(&self.text, &param.ty));
        let mut instance_input = instance_param
            .as_ref()
            .and_then(|param| extract::find_struct(&self.text, &param.ty));
        let output = extract::find_struct(&self.text, &entry.return_type).map(IoStruct::from_decl);

        let mut dropped = Vec::new();
        if input.as_ref().is_some_and(StructDecl::is_empty) {
            debug!(entry = entry_name, "input struct is empty, removing it from the signature");
            input = None;
            dropped.extend(input_param.take());
        }
        if instance_input.as_ref().is_some_and(StructDecl::is_empty) {
            debug!(entry = entry_name, "instance input struct is empty, removing it from the signature");
            instance_input = None;
            dropped.extend(instance_param.take());
        }
        let entry = if dropped.is_empty() {
            entry
        } else {
            strip_params(&entry, &params, &dropped)
        };

        let mut used_source: String = functions.iter().map(|f| f.source.as_str()).collect();
        used_source.push_str(&entry.source);

        let textures = used_textures(&used_source, &self.textures);
        let tokens = text::tokens(&used_source);
        let cbuffers = self
            .cbuffers
            .iter()
            .filter(|cbuffer| cbuffer.members.iter().any(|member| tokens.contains(member.name.as_str())))
            .cloned()
            .collect();

        Ok(ShaderSlice {
            stage,
            entry,
            functions,
            cbuffers,
            textures,
            input: input.map(IoStruct::from_decl),
            input_param: input_param.map(|param| param.name),
            instance_input: instance_input.map(IoStruct::from_decl),
            instance_param: instance_param.map(|param| param.name),
            output,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ShaderSlice {
    pub stage: Stage,
    /// Entry function, with empty IO parameters already removed.
    pub entry: FunctionDecl,
    /// Transitively called functions in source order, entry excluded.
    pub functions: Vec<FunctionDecl>,
    pub cbuffers: Vec<CBufferDecl>,
    pub textures: Vec<TextureSampler>,
    pub input: Option<IoStruct>,
    pub input_param: Option<String>,
    pub instance_input: Option<IoStruct>,
    pub instance_param: Option<String>,
    pub output: Option<IoStruct>,
}

impl ShaderSlice {
    pub fn entry_name(&self) -> &str {
        &self.entry.name
    }

    pub fn io_struct_names(&self) -> Vec<&str> {
        [&self.input, &self.instance_input, &self.output]
            .into_iter()
            .flatten()
            .map(|io| io.name.as_str())
            .collect()
    }

    pub fn functions_source(&self) -> String {
        self.functions
            .iter()
            .map(|function| format!("{}\n\n", function.source))
            .collect()
    }

    pub fn texture_decls(&self) -> String {
        self.textures
            .iter()
            .map(|texture| format!("{}\n", texture.decl()))
            .collect()
    }
}

fn used_functions(entry: &FunctionDecl, functions: &[FunctionDecl]) -> Vec<FunctionDecl> {
    let mut used: HashSet<&str> = HashSet::new();
    let mut pending = vec![entry.source.as_str()];
    while let Some(body) = pending.pop() {
        for function in functions {
            if function.name == entry.name || used.contains(function.name.as_str()) {
                continue;
            }
            if text::calls_function(body, &function.name) {
                used.insert(function.name.as_str());
                pending.push(function.source.as_str());
            }
        }
    }
    functions
        .iter()
        .filter(|function| used.contains(function.name.as_str()))
        .cloned()
        .collect()
}

/// Rebuilds the entry without the parameters in `dropped`.
fn strip_params(entry: &FunctionDecl, params: &[Param], dropped: &[Param]) -> FunctionDecl {
    let kept: Vec<&str> = params
        .iter()
        .filter(|param| !dropped.contains(param))
        .map(|param| param.text.as_str())
        .collect();
    let source = format!(
        "{}({}){}{}",
        entry.head(),
        kept.join(", "),
        entry.trailer(),
        entry.body()
    );
    extract::find_function(&source, &entry.name).unwrap_or_else(|| entry.clone())
}

/// First arguments of `sample_texture*`, `read_texture*` and `write_texture*`
/// calls, intersected with the declared samplers in declaration order.
fn used_textures(source: &str, declared: &[TextureSampler]) -> Vec<TextureSampler> {
    let bytes = source.as_bytes();
    let mut names: HashSet<&str> = HashSet::new();
    for accessor in TEXTURE_ACCESSORS {
        let mut cursor = 0;
        while let Some(pos) = text::find_from(source, accessor, cursor) {
            cursor = pos + accessor.len();
            if pos > 0 && text::is_ident_char(bytes[pos - 1]) {
                continue;
            }
            let Some((end, _)) = text::identifier_after(source, pos) else {
                continue;
            };
            let mut open = end;
            while open < bytes.len() && bytes[open].is_ascii_whitespace() {
                open += 1;
            }
            if bytes.get(open) != Some(&b'(') {
                continue;
            }
            if let Some((_, name)) = text::identifier_after(source, open + 1) {
                names.insert(name);
            }
        }
    }
    declared
        .iter()
        .filter(|texture| names.contains(texture.name.as_str()))
        .cloned()
        .collect()
}
