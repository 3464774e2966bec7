//! Process-wide configuration for one pmfx build invocation.
//!
//! `BuildContext` is assembled once by the driver and passed by reference
//! through every pipeline stage; nothing in the crate keeps global state.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderPlatform {
    Hlsl,
    Glsl,
    Metal,
}

impl ShaderPlatform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hlsl => "hlsl",
            Self::Glsl => "glsl",
            Self::Metal => "metal",
        }
    }

    /// Name of the always-on pseudo define and of the macros header section.
    pub fn define_name(self) -> &'static str {
        match self {
            Self::Hlsl => "HLSL",
            Self::Glsl => "GLSL",
            Self::Metal => "METAL",
        }
    }
}

impl fmt::Display for ShaderPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShaderPlatform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hlsl" => Ok(Self::Hlsl),
            "glsl" => Ok(Self::Glsl),
            "metal" => Ok(Self::Metal),
            other => Err(format!(
                "unknown shader platform '{other}'; expected hlsl, glsl, or metal"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsPlatform {
    Win32,
    Osx,
    Linux,
    Ios,
    Android,
}

impl OsPlatform {
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            Self::Win32
        } else if cfg!(target_os = "macos") {
            Self::Osx
        } else {
            Self::Linux
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Win32 => "win32",
            Self::Osx => "osx",
            Self::Linux => "linux",
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }

    pub fn sub_platform(self) -> Option<SubPlatform> {
        match self {
            Self::Ios | Self::Android => Some(SubPlatform::Gles),
            _ => None,
        }
    }
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsPlatform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "win32" | "windows" => Ok(Self::Win32),
            "osx" | "macos" => Ok(Self::Osx),
            "linux" => Ok(Self::Linux),
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            other => Err(format!(
                "unknown platform '{other}'; expected win32, osx, linux, ios, or android"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubPlatform {
    Gles,
}

impl SubPlatform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gles => "gles",
        }
    }

    pub fn define_name(self) -> &'static str {
        match self {
            Self::Gles => "GLES",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Vertex,
    Pixel,
    Compute,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Vertex, Stage::Pixel, Stage::Compute];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vertex => "vs",
            Self::Pixel => "ps",
            Self::Compute => "cs",
        }
    }

    /// Extension of the processed artifact, e.g. `.vsc`.
    pub fn artifact_extension(self) -> &'static str {
        match self {
            Self::Vertex => "vsc",
            Self::Pixel => "psc",
            Self::Compute => "csc",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    pub shader_platform: ShaderPlatform,
    pub sub_platform: Option<SubPlatform>,
    pub shader_version: String,
    pub os_platform: OsPlatform,
    pub include_dirs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Directory receiving `<pmfx>.h` material headers; `None` disables them.
    pub struct_dir: Option<PathBuf>,
    /// External compiler (HLSL) or validator (GLSL). Metal needs none.
    pub compiler: Option<PathBuf>,
    pub macros_file: Option<PathBuf>,
    pub macros_source: String,
    /// Fingerprinted alongside the inputs so a new tool build invalidates outputs.
    pub tool_file: Option<PathBuf>,
    pub force: bool,
}

impl BuildContext {
    pub fn new(
        shader_platform: ShaderPlatform,
        os_platform: OsPlatform,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let sub_platform = os_platform.sub_platform();
        Self {
            shader_platform,
            sub_platform,
            shader_version: default_shader_version(shader_platform, sub_platform).to_string(),
            os_platform,
            include_dirs: Vec::new(),
            output_dir: output_dir.into(),
            temp_dir: PathBuf::from("temp"),
            struct_dir: None,
            compiler: None,
            macros_file: None,
            macros_source: String::new(),
            tool_file: None,
            force: false,
        }
    }

    pub fn with_shader_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        if !version.trim().is_empty() {
            self.shader_version = version;
        }
        self
    }

    pub fn with_include_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.include_dirs = dirs;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_struct_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.struct_dir = dir;
        self
    }

    pub fn with_compiler(mut self, compiler: Option<PathBuf>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_macros(mut self, file: Option<PathBuf>, source: impl Into<String>) -> Self {
        self.macros_file = file;
        self.macros_source = source.into();
        self
    }

    pub fn with_tool_file(mut self, file: Option<PathBuf>) -> Self {
        self.tool_file = file;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn is_gles(&self) -> bool {
        self.sub_platform == Some(SubPlatform::Gles)
    }

    /// Always-on pseudo defines, e.g. `["GLSL", "GLES"]`.
    pub fn platform_defines(&self) -> Vec<&'static str> {
        let mut defines = vec![self.shader_platform.define_name()];
        if let Some(sub) = self.sub_platform {
            defines.push(sub.define_name());
        }
        defines
    }

    pub fn pmfx_output_dir(&self, pmfx_name: &str) -> PathBuf {
        self.output_dir.join(pmfx_name)
    }

    pub fn pmfx_temp_dir(&self, pmfx_name: &str) -> PathBuf {
        self.temp_dir.join(pmfx_name)
    }

    pub fn info_path(&self, pmfx_name: &str) -> PathBuf {
        self.pmfx_output_dir(pmfx_name).join("info.json")
    }

    pub fn header_path(&self, pmfx_name: &str) -> Option<PathBuf> {
        self.struct_dir
            .as_deref()
            .map(|dir: &Path| dir.join(format!("{pmfx_name}.h")))
    }
}

pub fn default_shader_version(
    platform: ShaderPlatform,
    sub_platform: Option<SubPlatform>,
) -> &'static str {
    match (platform, sub_platform) {
        (ShaderPlatform::Hlsl, _) => "4_0",
        (ShaderPlatform::Glsl, Some(SubPlatform::Gles)) => "300 es",
        (ShaderPlatform::Glsl, None) => "330",
        (ShaderPlatform::Metal, _) => "",
    }
}
