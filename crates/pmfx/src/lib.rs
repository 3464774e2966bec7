//! pmfx shader build pipeline.
//!
//! A pmfx file is HLSL-dialect shader code with an embedded JSON manifest of
//! techniques. [`build_pmfx`] loads one file, expands each technique into its
//! permutations, lowers every stage to the configured backend (HLSL, GLSL or
//! Metal) and writes reflection info plus an optional C material header.
pub mod conditional;
pub mod context;
pub mod emit;
pub mod extract;
pub mod macros;
pub mod manifest;
pub mod ordered;
pub mod permutation;
pub mod pipeline;
pub mod reflect;
pub mod slice;
pub mod source;
pub mod technique;
pub mod text;

pub use context::{default_shader_version, BuildContext, OsPlatform, ShaderPlatform, Stage, SubPlatform};
pub use emit::BackendError;
pub use manifest::{Manifest, ManifestError, TechniqueSpec};
pub use permutation::{Permutation, PermutationSet};
pub use pipeline::{build_pmfx, BuildReport, BuildStatus, PmfxError};
pub use reflect::{DependencyRecord, ReflectionRecord};
pub use source::{LoadError, PmfxSource};
