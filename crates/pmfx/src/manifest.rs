//! The `pmfx: { ... }` manifest embedded in every pmfx source.
//!
//! Types:
//!
//! - `Manifest` keeps the raw technique objects in document order so
//!   inheritance can merge them member-wise before typing.
//! - `TechniqueSpec` is the typed view of one (already merged) technique.
//! - `PermutationSpec` is the `[bit_exponent, [values...]]` pair of a
//!   permutation dimension.
//!
//! Functions:
//!
//! - `Manifest::parse` locates the block, tolerates trailing commas, and
//!   synthesizes the `default` technique for manifest-less shaders that still
//!   provide `vs_main` and `ps_main`.
//! - `strip_manifest` removes the block so later passes only see shader code.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::extract;
use crate::ordered::Ordered;
use crate::text;

const MANIFEST_MARKER: &str = "pmfx:";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("pmfx: block is missing its opening or closing brace")]
    Unterminated,

    #[error("malformed pmfx manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pmfx manifest must be a JSON object of techniques")]
    NotAnObject,

    #[error("technique '{technique}' is malformed: {source}")]
    Technique {
        technique: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("technique '{0}' inherits from itself")]
    InheritanceCycle(String),
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    techniques: Map<String, Value>,
}

impl Manifest {
    /// Returns `Ok(None)` when the source is a library: no manifest block and
    /// no canonical `vs_main`/`ps_main` pair.
    pub fn parse(source: &str) -> Result<Option<Self>, ManifestError> {
        let Some((_, open, close)) = find_manifest_block(source)? else {
            if extract::find_function(source, "vs_main").is_some()
                && extract::find_function(source, "ps_main").is_some()
            {
                debug!("no pmfx: block, using default vs_main/ps_main technique");
                return Ok(Some(Self::default_technique()));
            }
            return Ok(None);
        };

        let json = strip_trailing_commas(&source[open..=close]);
        match serde_json::from_str::<Value>(&json)? {
            Value::Object(techniques) => Ok(Some(Self { techniques })),
            _ => Err(ManifestError::NotAnObject),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        match value {
            Value::Object(techniques) => Ok(Self { techniques }),
            _ => Err(ManifestError::NotAnObject),
        }
    }

    fn default_technique() -> Self {
        let mut default = Map::new();
        default.insert("vs".into(), Value::String("vs_main".into()));
        default.insert("ps".into(), Value::String("ps_main".into()));
        let mut techniques = Map::new();
        techniques.insert("default".into(), Value::Object(default));
        Self { techniques }
    }

    pub fn technique_names(&self) -> impl Iterator<Item = &str> {
        self.techniques.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.techniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.techniques.get(name)
    }

    /// The technique with its `inherit` chain merged in, child members first.
    pub fn merged(&self, name: &str) -> Result<Value, ManifestError> {
        let mut visited = HashSet::new();
        self.merged_inner(name, &mut visited)
    }

    fn merged_inner(&self, name: &str, visited: &mut HashSet<String>) -> Result<Value, ManifestError> {
        if !visited.insert(name.to_string()) {
            return Err(ManifestError::InheritanceCycle(name.to_string()));
        }
        let mut technique = self
            .techniques
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        let parent = technique
            .get("inherit")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(parent) = parent {
            if self.techniques.contains_key(&parent) {
                let parent = self.merged_inner(&parent, visited)?;
                member_wise_merge(&mut technique, &parent);
            } else {
                warn!(technique = name, inherit = %parent, "inherited technique not found");
            }
        }
        Ok(technique)
    }

    pub fn technique(&self, name: &str) -> Result<TechniqueSpec, ManifestError> {
        let merged = self.merged(name)?;
        TechniqueSpec::from_value(name, merged)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationSpec(pub i32, pub Vec<i64>);

impl PermutationSpec {
    pub fn bit_exponent(&self) -> i32 {
        self.0
    }

    pub fn values(&self) -> &[i64] {
        &self.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureSamplerSpec {
    #[serde(rename = "type")]
    pub ty: String,
    pub unit: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TechniqueSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit: Option<String>,
    #[serde(default)]
    pub inherit_constants: Vec<String>,
    #[serde(default)]
    pub permutations: Ordered<PermutationSpec>,
    #[serde(default)]
    pub defines: Vec<String>,
    /// Raw entries; `permutation(<expr>)` keys hold nested constant maps.
    #[serde(default)]
    pub constants: Ordered<Value>,
    #[serde(default)]
    pub texture_samplers: Ordered<TextureSamplerSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TechniqueSpec {
    pub fn from_value(name: &str, value: Value) -> Result<Self, ManifestError> {
        serde_json::from_value(value).map_err(|source| ManifestError::Technique {
            technique: name.to_string(),
            source,
        })
    }

    pub fn entry(&self, stage: crate::context::Stage) -> Option<&str> {
        use crate::context::Stage;
        match stage {
            Stage::Vertex => self.vs.as_deref(),
            Stage::Pixel => self.ps.as_deref(),
            Stage::Compute => self.cs.as_deref(),
        }
    }
}

/// Child members win; objects present on both sides merge recursively and
/// parent-only members are appended.
pub fn member_wise_merge(child: &mut Value, parent: &Value) {
    let (Value::Object(child), Value::Object(parent)) = (child, parent) else {
        return;
    };
    for (key, parent_value) in parent {
        match child.get_mut(key) {
            None => {
                child.insert(key.clone(), parent_value.clone());
            }
            Some(child_value) if child_value.is_object() => {
                member_wise_merge(child_value, parent_value);
            }
            Some(_) => {}
        }
    }
}

/// `(marker_start, open_brace, close_brace)` of the manifest block.
fn find_manifest_block(source: &str) -> Result<Option<(usize, usize, usize)>, ManifestError> {
    let bytes = source.as_bytes();
    let mut cursor = 0;
    while let Some(pos) = text::find_from(source, MANIFEST_MARKER, cursor) {
        if pos > 0 && text::is_ident_char(bytes[pos - 1]) {
            cursor = pos + MANIFEST_MARKER.len();
            continue;
        }
        let open = text::find_byte_from(source, b'{', pos).ok_or(ManifestError::Unterminated)?;
        let close = text::match_brace(source, open).ok_or(ManifestError::Unterminated)?;
        return Ok(Some((pos, open, close)));
    }
    Ok(None)
}

/// Removes the manifest block, leaving shader code only.
pub fn strip_manifest(source: &str) -> String {
    match find_manifest_block(source) {
        Ok(Some((start, _, close))) => {
            let mut end = close + 1;
            if source.as_bytes().get(end) == Some(&b';') {
                end += 1;
            }
            format!("{}{}", &source[..start], &source[end..])
        }
        _ => source.to_string(),
    }
}

/// Drops commas that directly precede `}` or `]`, ignoring string contents.
pub fn strip_trailing_commas(json: &str) -> String {
    let mut output = String::with_capacity(json.len());
    let mut pending_comma: Option<String> = None;
    let mut in_string = false;
    let mut escaped = false;

    for ch in json.chars() {
        if in_string {
            output.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        if let Some(held) = pending_comma.as_mut() {
            if ch.is_whitespace() {
                held.push(ch);
                continue;
            }
            let held = pending_comma.take().unwrap_or_default();
            if ch == '}' || ch == ']' {
                output.push_str(&held[1..]);
            } else {
                output.push_str(&held);
            }
        }

        match ch {
            ',' => pending_comma = Some(String::from(",")),
            '"' => {
                in_string = true;
                output.push(ch);
            }
            _ => output.push(ch),
        }
    }
    if let Some(held) = pending_comma {
        output.push_str(&held);
    }
    output
}
