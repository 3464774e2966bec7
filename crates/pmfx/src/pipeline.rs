//! Builds one pmfx file end to end.
//!
//! Failures inside a permutation (missing entry point, backend error) are
//! logged and recorded against that permutation; the remaining permutations
//! and techniques still build. Reflection info and the material header are
//! only written when every permutation succeeded, so a failed pmfx is
//! retried on the next run.
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::conditional::evaluate_conditional_blocks;
use crate::context::{BuildContext, ShaderPlatform, Stage};
use crate::emit::{self, EmitTarget};
use crate::manifest::{strip_manifest, Manifest, ManifestError, TechniqueSpec};
use crate::permutation::{self, Permutation, PermutationSet};
use crate::reflect::{self, DependencyError, DependencyRecord, ReflectionRecord};
use crate::slice::{ConditionedSource, ShaderSlice};
use crate::source::{LoadError, PmfxSource};
use crate::technique::{self, LayoutError};

#[derive(Debug, Error)]
pub enum PmfxError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("failed to write material header {path}: {source}")]
    Header {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    UpToDate,
    /// No manifest and no default entry points; nothing to build.
    Library,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub pmfx: String,
    pub status: BuildStatus,
    /// Last non-zero exit code observed, `0` when everything succeeded.
    pub exit_code: i32,
    pub permutations: usize,
    pub failures: usize,
}

impl BuildReport {
    fn new(pmfx: String, status: BuildStatus) -> Self {
        Self {
            pmfx,
            status,
            exit_code: 0,
            permutations: 0,
            failures: 0,
        }
    }
}

/// Per-pmfx accumulator threaded through technique and permutation builds.
struct PmfxBuild<'a> {
    ctx: &'a BuildContext,
    manifest: &'a Manifest,
    name: String,
    shader_source: String,
    platform_defines: Vec<&'static str>,
    records: Vec<ReflectionRecord>,
    header: String,
    report: BuildReport,
}

impl PmfxBuild<'_> {
    fn fail(&mut self, exit_code: i32) {
        self.report.failures += 1;
        self.report.exit_code = exit_code;
    }

    fn build_technique(&mut self, technique: &str) -> Result<(), PmfxError> {
        let spec = match self.manifest.technique(technique) {
            Ok(spec) => spec,
            Err(err) => {
                error!(pmfx = %self.name, technique, error = %err, "invalid technique");
                self.fail(1);
                return Ok(());
            }
        };

        if self.ctx.shader_platform == ShaderPlatform::Glsl && spec.cs.is_some() {
            warn!(pmfx = %self.name, technique, "compute shaders are not supported on glsl, skipping technique");
            return Ok(());
        }

        let set = permutation::generate(technique, &spec, &self.platform_defines);
        self.header.push_str(&set.c_defines);
        for permutation in &set.permutations {
            self.build_permutation(&spec, &set, permutation)?;
        }
        Ok(())
    }

    fn build_permutation(
        &mut self,
        spec: &TechniqueSpec,
        set: &PermutationSet,
        permutation: &Permutation,
    ) -> Result<(), PmfxError> {
        let permutation_name = permutation.name();
        info!(technique = %permutation.technique, id = permutation.id, "building permutation");
        self.report.permutations += 1;

        let text = evaluate_conditional_blocks(&self.shader_source, &permutation.env());
        let layout = technique::material_layout(self.manifest, spec, permutation, &self.platform_defines)?;
        self.header.push_str(&layout.c_struct);
        let conditioned = ConditionedSource::new(text, layout.cbuffer.clone(), technique::technique_textures(spec));

        let target = EmitTarget {
            pmfx_name: &self.name,
            permutation_name: &permutation_name,
            permutation_id: permutation.id,
        };

        let mut vertex: Option<ShaderSlice> = None;
        let mut failure = None;
        for stage in Stage::ALL {
            let Some(entry) = spec.entry(stage) else {
                continue;
            };
            let slice = match conditioned.slice(stage, entry) {
                Ok(slice) => slice,
                Err(err) => {
                    error!(pmfx = %self.name, permutation = %permutation_name, error = %err, "skipping stage");
                    failure = Some(1);
                    continue;
                }
            };
            match emit::emit(self.ctx, &conditioned, &slice, &target) {
                Ok(output) => debug!(output = %output.output_path.display(), "emitted shader"),
                Err(err) => {
                    error!(pmfx = %self.name, permutation = %permutation_name, stage = %stage, error = %err, "shader build failed");
                    failure = Some(err.exit_code());
                }
            }
            if stage == Stage::Vertex {
                vertex = Some(slice);
            }
        }
        if let Some(exit_code) = failure {
            self.fail(exit_code);
        }

        self.records.push(ReflectionRecord::new(
            spec,
            permutation,
            set,
            &layout,
            &conditioned,
            vertex.as_ref(),
        ));
        Ok(())
    }
}

fn write_header(path: &Path, header: &str) -> Result<(), PmfxError> {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, header)
    };
    write().map_err(|source| PmfxError::Header {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "wrote material header");
    Ok(())
}

/// Loads, checks and builds every technique permutation of one pmfx file.
pub fn build_pmfx(ctx: &BuildContext, path: &Path) -> Result<BuildReport, PmfxError> {
    let source = PmfxSource::load(path, &ctx.include_dirs)?;
    let name = source.name();

    let Some(manifest) = Manifest::parse(&source.text)? else {
        debug!(pmfx = %name, "no techniques, treating as a library");
        return Ok(BuildReport::new(name, BuildStatus::Library));
    };

    let files = reflect::tracked_files(ctx, &source);
    let info_path = ctx.info_path(&name);
    if !ctx.force && reflect::is_up_to_date(&info_path, &files) {
        info!(pmfx = %name, "up to date");
        return Ok(BuildReport::new(name, BuildStatus::UpToDate));
    }

    info!(pmfx = %name, path = %source.path.display(), "building pmfx");
    let mut build = PmfxBuild {
        ctx,
        manifest: &manifest,
        name: name.clone(),
        shader_source: strip_manifest(&source.text),
        platform_defines: ctx.platform_defines(),
        records: Vec::new(),
        header: String::new(),
        report: BuildReport::new(name, BuildStatus::Built),
    };
    let techniques: Vec<String> = manifest.technique_names().map(str::to_string).collect();
    for technique in &techniques {
        build.build_technique(technique)?;
    }

    let mut report = build.report;
    if report.failures > 0 {
        error!(pmfx = %report.pmfx, failures = report.failures, "pmfx failed, reflection info not written");
        report.status = BuildStatus::Failed;
        return Ok(report);
    }

    DependencyRecord::new(&files, build.records)?.write(&info_path)?;
    if let Some(header_path) = ctx.header_path(&report.pmfx) {
        if !build.header.trim().is_empty() {
            write_header(&header_path, &build.header)?;
        }
    }
    Ok(report)
}
