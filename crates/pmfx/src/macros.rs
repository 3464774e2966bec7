//! Selects the backend's slice of the shared shader macros header.
//!
//! The header is split into `#ifdef HLSL ... #endif //HLSL` style sections
//! plus a trailing `//GENERIC MACROS` section that every backend receives.
use crate::context::ShaderPlatform;

const GENERIC_MARKER: &str = "//GENERIC MACROS";

pub fn platform_macros(source: &str, platform: ShaderPlatform) -> String {
    let name = platform.define_name();
    let mut macros = String::new();

    let opener = format!("#ifdef {name}");
    let closer = format!("#endif //{name}");
    if let Some(start) = source.find(&opener) {
        let body_start = start + opener.len();
        let body_end = source[body_start..]
            .find(&closer)
            .map(|offset| body_start + offset)
            .unwrap_or(source.len());
        macros.push_str(&source[body_start..body_end]);
    }

    if let Some(generic) = source.find(GENERIC_MARKER) {
        if !macros.ends_with('\n') && !macros.is_empty() {
            macros.push('\n');
        }
        macros.push_str(&source[generic..]);
    }

    if !macros.is_empty() && !macros.ends_with('\n') {
        macros.push('\n');
    }
    macros
}
