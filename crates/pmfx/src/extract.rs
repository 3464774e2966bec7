//! Locates struct, cbuffer, texture sampler and function declarations in a
//! permutation-specific source.
//!
//! Types:
//!
//! - `StructDecl`, `CBufferDecl`, `TextureSampler`, `FunctionDecl` carry the
//!   original declaration text alongside the parsed parts later stages need.
//! - `Declarations` bundles all four tables for one permutation.
use tracing::warn;

use crate::text;

/// Stage IO structs are emitted per stage, never as generic declarations.
pub const RESERVED_IO_STRUCTS: [&str; 5] = [
    "vs_input",
    "vs_output",
    "ps_input",
    "ps_output",
    "vs_instance_input",
];

const TEXTURE_BLOCK: &str = "declare_texture_samplers";

const NON_FUNCTION_WORDS: [&str; 12] = [
    "if", "for", "while", "switch", "return", "register", "else", "do", "case", "new", "sizeof",
    "packoffset",
];

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    /// `struct name { ... };`
    pub source: String,
}

impl StructDecl {
    pub fn body(&self) -> &str {
        let open = self.source.find('{').map(|pos| pos + 1).unwrap_or(0);
        let close = self.source.rfind('}').unwrap_or(self.source.len()).max(open);
        &self.source[open..close]
    }

    /// True when conditional elision left no members behind.
    pub fn is_empty(&self) -> bool {
        self.body().trim().trim_matches(';').trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub ty: String,
    /// Base name without any array suffix.
    pub name: String,
    /// Array extent text inside `[...]`, if any.
    pub array: Option<String>,
}

impl Member {
    fn parse(ty: &str, declarator: &str) -> Self {
        match declarator.find('[') {
            Some(bracket) => Self {
                ty: ty.to_string(),
                name: declarator[..bracket].to_string(),
                array: Some(declarator[bracket + 1..].trim_end_matches(']').to_string()),
            },
            None => Self {
                ty: ty.to_string(),
                name: declarator.to_string(),
                array: None,
            },
        }
    }

    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CBufferDecl {
    pub name: String,
    pub register: Option<u32>,
    pub members: Vec<Member>,
    pub source: String,
}

impl CBufferDecl {
    pub fn body(&self) -> &str {
        let open = self.source.find('{').unwrap_or(0);
        let close = self.source.rfind('}').map(|pos| pos + 1).unwrap_or(self.source.len());
        &self.source[open..close.max(open)]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureSampler {
    /// Macro used to declare the binding, e.g. `texture_2d`.
    pub macro_type: String,
    pub name: String,
    pub unit: i64,
    pub data_type: String,
    pub fragments: u32,
    args: Vec<String>,
}

impl TextureSampler {
    pub fn new(macro_type: impl Into<String>, name: impl Into<String>, unit: i64) -> Self {
        let name = name.into();
        Self {
            macro_type: macro_type.into(),
            args: vec![name.clone(), unit.to_string()],
            name,
            unit,
            data_type: "float4".to_string(),
            fragments: 1,
        }
    }

    fn parse(statement: &str) -> Option<Self> {
        let open = statement.find('(')?;
        let close = statement.rfind(')')?;
        let macro_type = statement[..open].trim();
        if macro_type.is_empty() || close < open {
            return None;
        }
        let args: Vec<String> = statement[open + 1..close]
            .split(',')
            .map(|arg| arg.trim().to_string())
            .filter(|arg| !arg.is_empty())
            .collect();

        let (data_type, fragments, name, unit) = if args.len() >= 4 {
            if args[1].parse::<u32>().is_ok() {
                (args[0].clone(), args[1].as_str(), args[2].clone(), args[3].as_str())
            } else {
                (args[0].clone(), args[2].as_str(), args[1].clone(), args[3].as_str())
            }
        } else if args.len() >= 2 {
            ("float4".to_string(), "1", args[0].clone(), args[1].as_str())
        } else {
            warn!(statement, "texture sampler declaration needs a name and unit");
            return None;
        };

        let unit = unit.parse().unwrap_or_else(|_| {
            warn!(statement, "texture unit is not an integer, using 0");
            0
        });
        Some(Self {
            macro_type: macro_type.to_string(),
            fragments: fragments.parse().unwrap_or(1),
            data_type,
            name,
            unit,
            args,
        })
    }

    /// `macro( args );`
    pub fn decl(&self) -> String {
        format!("{}( {} );", self.macro_type, self.args.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub return_type: String,
    pub name: String,
    /// Full text from the start of the declaration line to the closing brace.
    pub source: String,
    paren_open: usize,
    paren_close: usize,
    body_open: usize,
}

impl FunctionDecl {
    /// Text between the parameter list parentheses.
    pub fn params(&self) -> &str {
        &self.source[self.paren_open + 1..self.paren_close]
    }

    /// Everything before the parameter list, e.g. `float4 lighting`.
    pub fn head(&self) -> &str {
        &self.source[..self.paren_open]
    }

    /// Text after `)` up to the body, e.g. ` : SV_Target`.
    pub fn trailer(&self) -> &str {
        &self.source[self.paren_close + 1..self.body_open]
    }

    /// `{ ... }` including braces.
    pub fn body(&self) -> &str {
        &self.source[self.body_open..]
    }
}

#[derive(Debug, Clone, Default)]
pub struct Declarations {
    pub structs: Vec<StructDecl>,
    pub cbuffers: Vec<CBufferDecl>,
    pub textures: Vec<TextureSampler>,
    pub functions: Vec<FunctionDecl>,
}

impl Declarations {
    pub fn extract(source: &str) -> Self {
        Self {
            structs: find_structs(source),
            cbuffers: find_cbuffers(source),
            textures: find_texture_samplers(source),
            functions: find_functions(source),
        }
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions.iter().find(|function| function.name == name)
    }
}

/// `(start, name, end_inclusive)` for every `keyword name ... { ... };`.
fn find_blocks<'a>(source: &'a str, keyword: &str) -> Vec<(usize, &'a str, usize)> {
    let mut blocks = Vec::new();
    let mut cursor = 0;
    while let Some(start) = text::find_token_from(source, keyword, cursor) {
        cursor = start + keyword.len();
        let Some((_, name)) = text::identifier_after(source, cursor) else {
            continue;
        };
        let Some(open) = text::find_byte_from(source, b'{', cursor) else {
            break;
        };
        if text::find_byte_from(source, b';', cursor).is_some_and(|semi| semi < open) {
            continue;
        }
        let Some(close) = text::match_brace(source, open) else {
            break;
        };
        let mut end = close;
        let mut next = close + 1;
        while next < source.len() && source.as_bytes()[next] == b' ' {
            next += 1;
        }
        if source.as_bytes().get(next) == Some(&b';') {
            end = next;
        }
        blocks.push((start, name, end));
        cursor = end + 1;
    }
    blocks
}

fn block_source(source: &str, start: usize, end: usize) -> String {
    let mut text = source[start..=end].to_string();
    if !text.ends_with(';') {
        text.push(';');
    }
    text
}

pub fn find_structs(source: &str) -> Vec<StructDecl> {
    find_blocks(source, "struct")
        .into_iter()
        .map(|(start, name, end)| StructDecl {
            name: name.to_string(),
            source: block_source(source, start, end),
        })
        .filter(|decl| !RESERVED_IO_STRUCTS.contains(&decl.name.as_str()))
        .collect()
}

/// Any struct named `name`, reserved IO structs included.
pub fn find_struct(source: &str, name: &str) -> Option<StructDecl> {
    find_blocks(source, "struct")
        .into_iter()
        .find(|(_, found, _)| *found == name)
        .map(|(start, name, end)| StructDecl {
            name: name.to_string(),
            source: block_source(source, start, end),
        })
}

pub fn find_cbuffers(source: &str) -> Vec<CBufferDecl> {
    find_blocks(source, "cbuffer")
        .into_iter()
        .map(|(start, name, end)| {
            let decl = block_source(source, start, end);
            let header = &decl[..decl.find('{').unwrap_or(decl.len())];
            let words = text::split_block(&decl);
            let members = words
                .chunks_exact(2)
                .map(|pair| Member::parse(&pair[0], &pair[1]))
                .collect();
            CBufferDecl {
                name: name.to_string(),
                register: parse_register(header),
                members,
                source: decl,
            }
        })
        .collect()
}

fn parse_register(header: &str) -> Option<u32> {
    let open = header.find("register")?;
    let rest = &header[open + "register".len()..];
    let inner = rest.trim_start().strip_prefix('(')?;
    let close = inner.find(')')?;
    inner[..close].trim().trim_start_matches('b').parse().ok()
}

pub fn find_texture_samplers(source: &str) -> Vec<TextureSampler> {
    let Some(start) = text::find_token(source, TEXTURE_BLOCK) else {
        return Vec::new();
    };
    let Some(open) = text::find_byte_from(source, b'{', start) else {
        return Vec::new();
    };
    let Some(close) = text::match_brace(source, open) else {
        return Vec::new();
    };
    source[open + 1..close]
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .filter_map(TextureSampler::parse)
        .collect()
}

pub fn find_functions(source: &str) -> Vec<FunctionDecl> {
    let bytes = source.as_bytes();
    let mut functions = Vec::new();
    let mut cursor = 0;

    while let Some(paren) = text::find_byte_from(source, b'(', cursor) {
        cursor = paren + 1;
        let Some((name_start, name)) = text::identifier_before(source, paren) else {
            continue;
        };
        if NON_FUNCTION_WORDS.contains(&name) || name.as_bytes()[0].is_ascii_digit() {
            continue;
        }
        let Some((type_start, return_type)) = text::identifier_before(source, name_start) else {
            continue;
        };
        if NON_FUNCTION_WORDS.contains(&return_type) || (type_start > 0 && bytes[type_start - 1] == b'[') {
            continue;
        }
        let Some(close) = text::match_paren(source, paren) else {
            continue;
        };
        let Some(open) = text::find_byte_from(source, b'{', close) else {
            continue;
        };
        if text::find_byte_from(source, b';', close).is_some_and(|semi| semi < open) {
            cursor = close + 1;
            continue;
        }
        let Some(end) = text::match_brace(source, open) else {
            break;
        };

        let mut start = source[..type_start]
            .rfind(['\n', ';', '}'])
            .map(|pos| pos + 1)
            .unwrap_or(0);
        while start < type_start && bytes[start].is_ascii_whitespace() {
            start += 1;
        }

        functions.push(FunctionDecl {
            return_type: return_type.to_string(),
            name: name.to_string(),
            source: source[start..=end].to_string(),
            paren_open: paren - start,
            paren_close: close - start,
            body_open: open - start,
        });
        cursor = end + 1;
    }
    functions
}

pub fn find_function(source: &str, name: &str) -> Option<FunctionDecl> {
    find_functions(source).into_iter().find(|function| function.name == name)
}
