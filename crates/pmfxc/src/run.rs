use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use buildconfig::{BuildConfig, ConfigError, PathResolver};
use pmfx::{
    build_pmfx, BuildContext, BuildReport, BuildStatus, OsPlatform, PmfxError, ShaderPlatform,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::discover::{collect_pmfx_files, default_roots};

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Builds every discovered pmfx file and returns the process exit code.
pub fn run(cli: Cli) -> Result<i32> {
    if let Some(root) = &cli.root_dir {
        env::set_current_dir(root)
            .with_context(|| format!("failed to change into root directory {}", root.display()))?;
    }

    let resolver = PathResolver::new()?;
    let pmtech_dir = load_pmtech_dir(&cli.config, &resolver)?;
    let ctx = build_context(&cli, pmtech_dir.as_deref())?;
    debug!(
        platform = %ctx.shader_platform,
        version = %ctx.shader_version,
        os = %ctx.os_platform,
        output = %ctx.output_dir.display(),
        temp = %ctx.temp_dir.display(),
        compiler = ?ctx.compiler,
        macros = ?ctx.macros_file,
        includes = ?ctx.include_dirs,
        "resolved pmfx build context"
    );

    let inputs = if cli.inputs.is_empty() {
        default_roots(pmtech_dir.as_deref())
    } else {
        cli.inputs.clone()
    };
    let files = collect_pmfx_files(&inputs)?;
    if files.is_empty() {
        warn!(roots = ?inputs, "no pmfx files found");
    }

    let jobs = worker_count(cli.jobs, files.len());
    debug!(files = files.len(), jobs, "building pmfx files");
    let mut summary = RunSummary::default();
    for (file, result) in files.iter().zip(build_all(&ctx, &files, jobs)) {
        match result {
            Ok(report) => summary.record(&report),
            Err(err) => {
                error!(path = %file.display(), error = %err, "failed to build pmfx");
                summary.record_error();
            }
        }
    }
    summary.log();
    Ok(summary.exit_code)
}

fn worker_count(requested: usize, files: usize) -> usize {
    let requested = if requested == 0 {
        thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        requested
    };
    requested.min(files).max(1)
}

/// Results come back in `files` order whatever the worker count, so the
/// summary and exit code do not depend on scheduling.
fn build_all(
    ctx: &BuildContext,
    files: &[PathBuf],
    jobs: usize,
) -> Vec<Result<BuildReport, PmfxError>> {
    if jobs <= 1 {
        return files.iter().map(|file| build_pmfx(ctx, file)).collect();
    }

    let next = AtomicUsize::new(0);
    let (sender, receiver) = mpsc::channel();
    thread::scope(|scope| {
        for _ in 0..jobs {
            let sender = sender.clone();
            let next = &next;
            scope.spawn(move || loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(file) = files.get(index) else {
                    break;
                };
                if sender.send((index, build_pmfx(ctx, file))).is_err() {
                    break;
                }
            });
        }
    });
    drop(sender);

    let mut results: Vec<_> = receiver.into_iter().collect();
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

fn load_pmtech_dir(config_path: &Path, resolver: &PathResolver) -> Result<Option<PathBuf>> {
    let config = match BuildConfig::load(config_path) {
        Ok(config) => config,
        Err(ConfigError::Missing(path)) => {
            debug!(path = %path.display(), "no build config, engine shaders disabled");
            return Ok(None);
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to load build config {}", config_path.display())
            })
        }
    };
    let dir = config.pmtech_dir(resolver)?;
    if dir.is_none() {
        warn!(path = %config_path.display(), "build config has no pmtech_dir");
    }
    Ok(dir)
}

fn build_context(cli: &Cli, pmtech_dir: Option<&Path>) -> Result<BuildContext> {
    let platform = cli.shader_platform;
    let os = cli.platform.unwrap_or_else(OsPlatform::host);
    let tools_dir = pmtech_dir.map(|dir| dir.join("tools"));

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(os, platform));
    let compiler = cli
        .compiler
        .clone()
        .or_else(|| tools_dir.as_deref().and_then(|tools| default_compiler(tools, platform)));
    let macros_file = cli
        .macros
        .clone()
        .or_else(|| tools_dir.as_deref().map(|tools| tools.join("_shader_macros.h")));
    let macros_source = read_macros(macros_file.as_deref())?;
    let tool_file = env::current_exe().ok();

    let mut ctx = BuildContext::new(platform, os, output)
        .with_include_dirs(cli.include_dirs.clone())
        .with_temp_dir(cli.temp.clone())
        .with_struct_dir(Some(cli.struct_dir.clone()))
        .with_compiler(compiler)
        .with_macros(macros_file.filter(|path| path.is_file()), macros_source)
        .with_tool_file(tool_file)
        .with_force(cli.force);
    if let Some(version) = &cli.shader_version {
        ctx = ctx.with_shader_version(version.clone());
    }
    Ok(ctx)
}

pub fn default_output_dir(os: OsPlatform, platform: ShaderPlatform) -> PathBuf {
    ["bin", os.as_str(), "data", "pmfx", platform.as_str()]
        .iter()
        .collect()
}

/// fxc for HLSL, the reference validator for GLSL; Metal has no tool.
pub fn default_compiler(tools_dir: &Path, platform: ShaderPlatform) -> Option<PathBuf> {
    let bin = tools_dir.join("bin");
    match platform {
        ShaderPlatform::Hlsl => Some(bin.join("fxc").join("fxc")),
        ShaderPlatform::Glsl => Some(
            bin.join("glsl")
                .join(OsPlatform::host().as_str())
                .join("validator"),
        ),
        ShaderPlatform::Metal => None,
    }
}

fn read_macros(path: Option<&Path>) -> Result<String> {
    let Some(path) = path else {
        return Ok(String::new());
    };
    if !path.is_file() {
        warn!(path = %path.display(), "shader macros header not found");
        return Ok(String::new());
    }
    fs::read_to_string(path)
        .with_context(|| format!("failed to read shader macros {}", path.display()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub built: usize,
    pub up_to_date: usize,
    pub libraries: usize,
    pub failed: usize,
    pub exit_code: i32,
}

impl RunSummary {
    pub fn record(&mut self, report: &BuildReport) {
        match report.status {
            BuildStatus::Built => self.built += 1,
            BuildStatus::UpToDate => self.up_to_date += 1,
            BuildStatus::Library => self.libraries += 1,
            BuildStatus::Failed => self.failed += 1,
        }
        if report.exit_code != 0 {
            self.exit_code = report.exit_code;
        }
    }

    pub fn record_error(&mut self) {
        self.failed += 1;
        self.exit_code = 1;
    }

    fn log(&self) {
        info!(
            built = self.built,
            up_to_date = self.up_to_date,
            libraries = self.libraries,
            failed = self.failed,
            "pmfx build finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: BuildStatus, exit_code: i32) -> BuildReport {
        BuildReport {
            pmfx: "forward".into(),
            status,
            exit_code,
            permutations: 1,
            failures: usize::from(exit_code != 0),
        }
    }

    #[test]
    fn output_dir_follows_platform_layout() {
        assert_eq!(
            default_output_dir(OsPlatform::Osx, ShaderPlatform::Metal),
            PathBuf::from("bin/osx/data/pmfx/metal")
        );
    }

    #[test]
    fn compilers_live_under_tools() {
        let tools = Path::new("pmtech/tools");
        assert_eq!(
            default_compiler(tools, ShaderPlatform::Hlsl),
            Some(PathBuf::from("pmtech/tools/bin/fxc/fxc"))
        );
        let validator = default_compiler(tools, ShaderPlatform::Glsl).unwrap();
        assert!(validator.starts_with("pmtech/tools/bin/glsl"));
        assert!(validator.ends_with("validator"));
        assert_eq!(default_compiler(tools, ShaderPlatform::Metal), None);
    }

    #[test]
    fn summary_keeps_last_non_zero_exit_code() {
        let mut summary = RunSummary::default();
        summary.record(&report(BuildStatus::Failed, 3));
        summary.record(&report(BuildStatus::Built, 0));
        summary.record(&report(BuildStatus::Failed, 2));
        summary.record(&report(BuildStatus::UpToDate, 0));
        summary.record(&report(BuildStatus::Library, 0));
        assert_eq!(summary.exit_code, 2);
        assert_eq!(summary.built, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.up_to_date, 1);
        assert_eq!(summary.libraries, 1);
    }

    #[test]
    fn worker_count_is_clamped_to_files() {
        assert_eq!(worker_count(8, 3), 3);
        assert_eq!(worker_count(2, 10), 2);
        assert_eq!(worker_count(4, 0), 1);
        assert!(worker_count(0, 64) >= 1);
    }

    #[test]
    fn parallel_builds_keep_input_order() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(ShaderPlatform::Metal, OsPlatform::Osx, temp.path().join("out"))
            .with_temp_dir(temp.path().join("temp"));
        let files: Vec<PathBuf> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|name| {
                let path = temp.path().join(format!("{name}.pmfx"));
                fs::write(&path, "float4 helper(float4 x)\n{\n    return x;\n}\n").unwrap();
                path
            })
            .collect();
        let mut missing = files.clone();
        missing.push(temp.path().join("missing.pmfx"));

        let results = build_all(&ctx, &missing, 3);
        let names: Vec<String> = results[..5]
            .iter()
            .map(|result| result.as_ref().unwrap().pmfx.clone())
            .collect();
        assert_eq!(names, ["a", "b", "c", "d", "e"]);
        assert!(results[5].is_err());
    }

    #[test]
    fn missing_config_disables_engine_root() {
        let temp = tempfile::tempdir().unwrap();
        let resolver = PathResolver::with_cwd(temp.path());
        let dir = load_pmtech_dir(&temp.path().join("build_config.json"), &resolver).unwrap();
        assert!(dir.is_none());
    }

    #[test]
    fn config_pmtech_dir_is_resolved() {
        let temp = tempfile::tempdir().unwrap();
        let engine = temp.path().join("engine");
        fs::create_dir_all(&engine).unwrap();
        let config = temp.path().join("build_config.json");
        let json = serde_json::json!({ "pmtech_dir": engine.to_string_lossy() });
        fs::write(&config, json.to_string()).unwrap();

        let resolver = PathResolver::with_cwd(temp.path());
        assert_eq!(load_pmtech_dir(&config, &resolver).unwrap(), Some(engine));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let config = temp.path().join("build_config.json");
        fs::write(&config, "{ not json").unwrap();
        let resolver = PathResolver::with_cwd(temp.path());
        assert!(load_pmtech_dir(&config, &resolver).is_err());
    }
}
