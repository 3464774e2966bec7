use std::ffi::OsString;
use std::path::PathBuf;

use buildconfig::DEFAULT_CONFIG_FILE;
use clap::Parser;
use pmfx::{OsPlatform, ShaderPlatform};

/// Single-dash long flags accepted for compatibility with existing build scripts.
const LEGACY_FLAGS: [&str; 4] = ["-root_dir", "-shader_platform", "-shader_version", "-platform"];

pub const DEFAULT_STRUCT_DIR: &str = "shader_structs";
pub const DEFAULT_TEMP_DIR: &str = "temp";

#[derive(Parser, Debug)]
#[command(
    name = "pmfxc",
    author,
    version,
    about = "Builds pmfx shader files into per-platform shader binaries and reflection info"
)]
pub struct Cli {
    /// Change into this directory before doing any work.
    #[arg(long = "root_dir", alias = "root-dir", value_name = "DIR")]
    pub root_dir: Option<PathBuf>,

    /// Target shading language: `hlsl`, `glsl`, or `metal`.
    #[arg(
        long = "shader_platform",
        alias = "shader-platform",
        value_name = "PLATFORM",
        value_parser = parse_shader_platform,
        default_value = "hlsl"
    )]
    pub shader_platform: ShaderPlatform,

    /// Shader model or language version (e.g. `4_0`, `330`, `300 es`).
    #[arg(long = "shader_version", alias = "shader-version", value_name = "VERSION")]
    pub shader_version: Option<String>,

    /// Target OS platform: `win32`, `osx`, `linux`, `ios`, or `android` (defaults to the host).
    #[arg(long = "platform", value_name = "OS", value_parser = parse_os_platform)]
    pub platform: Option<OsPlatform>,

    /// Additional include search directory; may be repeated.
    #[arg(short = 'I', value_name = "DIR")]
    pub include_dirs: Vec<PathBuf>,

    /// Project build configuration providing `pmtech_dir`.
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Output root; defaults to `bin/<platform>/data/pmfx/<shader_platform>`.
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Shader compiler or validator executable.
    #[arg(long, value_name = "PATH")]
    pub compiler: Option<PathBuf>,

    /// Portability macros header prepended to every generated shader.
    #[arg(long, value_name = "FILE")]
    pub macros: Option<PathBuf>,

    /// Directory receiving generated C material headers.
    #[arg(long = "struct-dir", value_name = "DIR", default_value = DEFAULT_STRUCT_DIR)]
    pub struct_dir: PathBuf,

    /// Directory receiving generated shader sources before compilation.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_TEMP_DIR)]
    pub temp: PathBuf,

    /// Rebuild every pmfx file even when its reflection info is current.
    #[arg(long)]
    pub force: bool,

    /// Number of pmfx files built concurrently; `0` uses every available core.
    #[arg(long, short = 'j', value_name = "N", default_value_t = 1)]
    pub jobs: usize,

    /// pmfx files or directories to build instead of the default shader roots.
    #[arg(value_name = "INPUTS")]
    pub inputs: Vec<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse_from(normalize_legacy_args(std::env::args_os()))
}

/// Rewrites `-root_dir` style flags to `--root_dir` so clap can parse them.
pub fn normalize_legacy_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some(flag) if LEGACY_FLAGS.contains(&flag) => OsString::from(format!("-{flag}")),
            _ => arg,
        })
        .collect()
}

pub fn parse_shader_platform(value: &str) -> Result<ShaderPlatform, String> {
    if value.trim().is_empty() {
        return Err("shader platform must not be empty".to_string());
    }
    value.parse()
}

pub fn parse_os_platform(value: &str) -> Result<OsPlatform, String> {
    if value.trim().is_empty() {
        return Err("platform must not be empty".to_string());
    }
    value.parse()
}
