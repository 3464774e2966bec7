use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

const SHADER: &str = r#"
struct vs_input
{
    float4 position : POSITION;
};

struct vs_output
{
    float4 position : SV_POSITION;
};

struct ps_output
{
    float4 colour : SV_Target;
};

vs_output vs_main( vs_input input )
{
    vs_output output;
    output.position = input.position;
    return output;
}

ps_output ps_main( vs_output input )
{
    ps_output output;
    output.colour = float4(1.0, 0.0, 0.0, 1.0);
    return output;
}
"#;

const LIBRARY: &str = "float4 tint(float4 colour)\n{\n    return colour;\n}\n";

/// Project checkout with an engine root wired up through build_config.json.
fn create_project(root: &Path) {
    let engine = root.join("engine");
    fs::create_dir_all(engine.join("tools")).unwrap();
    fs::create_dir_all(engine.join("assets/shaders")).unwrap();
    fs::create_dir_all(root.join("assets/shaders/forward")).unwrap();

    fs::write(
        engine.join("tools/_shader_macros.h"),
        "#ifdef METAL\n#define texture_2d( name, sampler_index ) texture2d<float> name [[texture(sampler_index)]], sampler sampler_##name [[sampler(sampler_index)]]\n#endif //METAL\n//GENERIC MACROS\n#define PI 3.14159265358979323846264\n",
    )
    .unwrap();
    fs::write(engine.join("assets/shaders/common.pmfx"), LIBRARY).unwrap();
    fs::write(root.join("assets/shaders/forward/basic.pmfx"), SHADER).unwrap();
    fs::write(root.join("build_config.json"), r#"{ "pmtech_dir": "engine" }"#).unwrap();
}

fn pmfxc(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pmfxc"))
        .env("RUST_LOG", "warn")
        .arg("-root_dir")
        .arg(root)
        .args(args)
        .output()
        .expect("failed to run pmfxc")
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn builds_default_roots_for_metal() {
    let temp = TempDir::new().unwrap();
    create_project(temp.path());

    let output = pmfxc(temp.path(), &["-shader_platform", "metal", "-platform", "osx"]);
    assert!(output.status.success());

    let out_dir = temp.path().join("bin/osx/data/pmfx/metal");
    assert!(out_dir.join("basic/default.vsc").is_file());
    assert!(out_dir.join("basic/default.psc").is_file());
    assert!(!out_dir.join("common").exists());
    assert!(temp.path().join("temp/basic/default_vs.metal").is_file());

    let info = read_json(&out_dir.join("basic/info.json"));
    let files: Vec<&str> = info["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|file| file["name"].as_str().unwrap())
        .collect();
    assert_eq!(files.len(), 3);
    assert!(files[1].ends_with("engine/tools/_shader_macros.h"));
    assert!(files[2].ends_with("assets/shaders/forward/basic.pmfx"));
    assert_eq!(info["techniques"][0]["name"], "default");
}

#[test]
fn second_run_is_incremental_until_forced() {
    let temp = TempDir::new().unwrap();
    create_project(temp.path());
    let args = ["-shader_platform", "glsl", "-platform", "linux"];

    assert!(pmfxc(temp.path(), &args).status.success());
    let info_path = temp.path().join("bin/linux/data/pmfx/glsl/basic/info.json");
    let vert = temp.path().join("bin/linux/data/pmfx/glsl/basic/default.vsc");
    assert!(info_path.is_file());
    fs::remove_file(&vert).unwrap();

    assert!(pmfxc(temp.path(), &args).status.success());
    assert!(!vert.exists());

    let mut forced = args.to_vec();
    forced.push("--force");
    assert!(pmfxc(temp.path(), &forced).status.success());
    assert!(vert.is_file());
}

#[test]
fn explicit_inputs_replace_default_roots() {
    let temp = TempDir::new().unwrap();
    create_project(temp.path());
    fs::write(temp.path().join("extra.pmfx"), SHADER).unwrap();

    let output = pmfxc(
        temp.path(),
        &["-shader_platform", "metal", "-platform", "ios", "--output", "out", "extra.pmfx"],
    );
    assert!(output.status.success());
    assert!(temp.path().join("out/extra/info.json").is_file());
    assert!(!temp.path().join("out/basic").exists());
}

#[cfg(unix)]
#[test]
fn exit_code_reports_compiler_failure() {
    let temp = TempDir::new().unwrap();
    create_project(temp.path());

    let output = pmfxc(
        temp.path(),
        &["-shader_platform", "hlsl", "-platform", "win32", "--compiler", "false"],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(!temp
        .path()
        .join("bin/win32/data/pmfx/hlsl/basic/info.json")
        .exists());
    assert!(temp.path().join("temp/basic/default.vs").is_file());
}

#[test]
fn missing_root_dir_is_an_error() {
    let temp = TempDir::new().unwrap();
    let output = pmfxc(&temp.path().join("missing"), &[]);
    assert!(!output.status.success());
}
