//! Common types for the compilation pipeline.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::naming::ModelName;

/// Configuration for the build orchestrator.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// External translator program (source language → generated code).
    pub translator_program: PathBuf,

    /// Translator arguments. `{source}`, `{output}` and `{module}` are substituted.
    pub translator_args: Vec<String>,

    /// Native build program (generated code + glue → loadable module).
    pub toolchain_program: PathBuf,

    /// Toolchain arguments. `{glue}`, `{generated}`, `{output}`, `{module}`,
    /// `{work_dir}` are substituted; `{include}` expands to one `-I<dir>` per include dir.
    pub toolchain_args: Vec<String>,

    /// Fixed include directories for the native build (runtime headers).
    pub include_dirs: Vec<PathBuf>,

    /// Glue template file. `None` uses the built-in template.
    pub template_path: Option<PathBuf>,

    /// Extension of the generated code file.
    pub generated_extension: String,

    /// Extension of the rendered glue file.
    pub glue_extension: String,

    /// Upper bound on builds running at once.
    pub max_concurrent_builds: usize,

    /// Parent directory for per-build work directories. `None` uses the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            translator_program: PathBuf::from("stanc"),
            translator_args: vec![
                "--name={module}".to_string(),
                "--o={output}".to_string(),
                "{source}".to_string(),
            ],
            toolchain_program: PathBuf::from("c++"),
            toolchain_args: vec![
                "-std=c++17".to_string(),
                "-O2".to_string(),
                "-shared".to_string(),
                "-fPIC".to_string(),
                "{include}".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
                "{glue}".to_string(),
            ],
            include_dirs: Vec::new(),
            template_path: None,
            generated_extension: "hpp".to_string(),
            glue_extension: "cpp".to_string(),
            max_concurrent_builds: default_build_slots(),
            scratch_dir: None,
        }
    }
}

impl CompilerConfig {
    /// Defaults overridden by `KILN_TRANSLATOR`, `KILN_TOOLCHAIN`, `KILN_INCLUDE`,
    /// `KILN_TEMPLATE` and `KILN_MAX_BUILDS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(program) = std::env::var_os("KILN_TRANSLATOR") {
            config.translator_program = PathBuf::from(program);
        }
        if let Some(program) = std::env::var_os("KILN_TOOLCHAIN") {
            config.toolchain_program = PathBuf::from(program);
        }
        if let Some(paths) = std::env::var_os("KILN_INCLUDE") {
            config.include_dirs = std::env::split_paths(&paths).collect();
        }
        if let Some(template) = std::env::var_os("KILN_TEMPLATE") {
            config.template_path = Some(PathBuf::from(template));
        }
        if let Ok(value) = std::env::var("KILN_MAX_BUILDS") {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => config.max_concurrent_builds = n,
                _ => tracing::warn!("Ignoring invalid KILN_MAX_BUILDS value: {}", value),
            }
        }

        config
    }

    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }

    pub fn with_include_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.include_dirs = dirs;
        self
    }

    pub fn with_max_concurrent_builds(mut self, n: usize) -> Self {
        self.max_concurrent_builds = n.max(1);
        self
    }
}

fn default_build_slots() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A compiled module image plus the diagnostics captured while building it.
#[derive(Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    /// Bytes of the loadable module.
    pub binary: Arc<[u8]>,

    /// Captured toolchain output (may be empty).
    pub diagnostics: String,
}

impl CompiledArtifact {
    pub fn new(binary: Vec<u8>, diagnostics: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            diagnostics: diagnostics.into(),
        }
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("binary_len", &self.binary.len())
            .field("diagnostics_len", &self.diagnostics.len())
            .finish()
    }
}

/// Result of a `compile` call.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub model_name: ModelName,
    pub artifact: CompiledArtifact,
    /// Served from the artifact store without building.
    pub cached: bool,
}

/// Snapshot of orchestrator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub toolchain_runs: u64,
    /// Callers that attached to a build already in flight.
    pub coalesced: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub toolchain_runs: AtomicU64,
    pub coalesced: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BuildStats {
        BuildStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            toolchain_runs: self.toolchain_runs.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Platform-specific dynamic library extension.
pub fn dylib_extension() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dll"
    }
    #[cfg(target_os = "macos")]
    {
        "dylib"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "so"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CompilerConfig::default();
        assert!(config.max_concurrent_builds >= 1);
        assert!(config.translator_args.iter().any(|a| a.contains("{source}")));
        assert!(config.toolchain_args.iter().any(|a| a == "{include}"));
        assert!(config.template_path.is_none());
    }

    #[test]
    fn test_max_builds_never_zero() {
        let config = CompilerConfig::default().with_max_concurrent_builds(0);
        assert_eq!(config.max_concurrent_builds, 1);
    }

    #[test]
    fn test_dylib_extension() {
        let ext = dylib_extension();
        #[cfg(target_os = "linux")]
        assert_eq!(ext, "so");
        #[cfg(target_os = "macos")]
        assert_eq!(ext, "dylib");
        #[cfg(target_os = "windows")]
        assert_eq!(ext, "dll");
    }

    #[test]
    fn test_artifact_debug_hides_bytes() {
        let artifact = CompiledArtifact::new(vec![1, 2, 3], "ok");
        let rendered = format!("{:?}", artifact);
        assert!(rendered.contains("binary_len: 3"));
    }
}
