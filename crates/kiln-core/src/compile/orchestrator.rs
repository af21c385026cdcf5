//! Build orchestration: cache lookup, request coalescing, and the build pipeline.
//!
//! ```text
//! compile(source)
//!     │
//!     ├── derive name ──► store hit? ──► CompileOutput { cached: true }
//!     │
//!     └── miss ──► in-flight table ──► attach to existing build
//!                        │
//!                        └── start build (one per name)
//!                               │  semaphore slot
//!                               │  spawn_blocking:
//!                               │    translate ─► render glue ─► [capture] toolchain ─► read module
//!                               └── persist ─► remove from in-flight table
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::naming::{
    ModelName, ModuleIdentifier, Versions, derive_model_name, derive_module_identifier,
    program_fingerprint,
};
use crate::store::ArtifactStore;

use super::abort::{AbortHandle, AbortOnDrop};
use super::capture::OutputCapture;
use super::template;
use super::toolchain::{
    BuildUnit, CommandToolchain, CommandTranslator, NativeToolchain, ToolError, Translator,
};
use super::types::{
    BuildStats, CompileOutput, CompiledArtifact, CompilerConfig, StatsCounters, dylib_extension,
};

type BuildFuture = BoxFuture<'static, Result<CompiledArtifact>>;

/// A build other callers can attach to.
struct InflightBuild {
    id: u64,
    build: WeakShared<BuildFuture>,
    abort: AbortHandle,
}

struct Inner {
    config: CompilerConfig,
    translator: Arc<dyn Translator>,
    toolchain: Arc<dyn NativeToolchain>,
    store: Arc<dyn ArtifactStore>,
    versions: Versions,
    template: String,
    capture: OutputCapture,
    slots: Arc<Semaphore>,
    inflight: Mutex<FxHashMap<ModelName, InflightBuild>>,
    next_build_id: AtomicU64,
    stats: StatsCounters,
}

/// Compiles model programs into loadable modules, at most once per model name.
///
/// Cheap to clone; clones share the cache, the in-flight table and the
/// output capture.
#[derive(Clone)]
pub struct BuildOrchestrator {
    inner: Arc<Inner>,
}

impl BuildOrchestrator {
    /// Create an orchestrator from explicit tools.
    pub fn new(
        config: CompilerConfig,
        translator: Arc<dyn Translator>,
        toolchain: Arc<dyn NativeToolchain>,
        store: Arc<dyn ArtifactStore>,
    ) -> Result<Self> {
        Self::with_capture(config, translator, toolchain, store, OutputCapture::new())
    }

    /// Create an orchestrator with a specific output capture.
    pub fn with_capture(
        config: CompilerConfig,
        translator: Arc<dyn Translator>,
        toolchain: Arc<dyn NativeToolchain>,
        store: Arc<dyn ArtifactStore>,
        capture: OutputCapture,
    ) -> Result<Self> {
        let template = template::load_template(config.template_path.as_deref())?;
        let versions = Versions::current(translator.version());
        let slots = Arc::new(Semaphore::new(config.max_concurrent_builds.max(1)));

        tracing::debug!(
            "Build orchestrator ready: translator '{}', platform {}, {} build slots",
            versions.translator,
            versions.platform,
            config.max_concurrent_builds
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                translator,
                toolchain,
                store,
                versions,
                template,
                capture,
                slots,
                inflight: Mutex::new(FxHashMap::default()),
                next_build_id: AtomicU64::new(0),
                stats: StatsCounters::default(),
            }),
        })
    }

    /// Create an orchestrator that runs the configured external programs.
    pub fn from_config(config: CompilerConfig, store: Arc<dyn ArtifactStore>) -> Result<Self> {
        let translator = CommandTranslator::new(
            &config.translator_program,
            config.translator_args.clone(),
        )?;
        let toolchain = CommandToolchain::new(
            &config.toolchain_program,
            config.toolchain_args.clone(),
        )?;
        Self::new(config, Arc::new(translator), Arc::new(toolchain), store)
    }

    /// Versions mixed into every model name.
    pub fn versions(&self) -> &Versions {
        &self.inner.versions
    }

    /// The model name `source` compiles to.
    pub fn model_name(&self, source: &str) -> ModelName {
        derive_model_name(source, &self.inner.versions)
    }

    /// The artifact store backing this orchestrator.
    pub fn store(&self) -> Arc<dyn ArtifactStore> {
        self.inner.store.clone()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BuildStats {
        self.inner.stats.snapshot()
    }

    /// Names with a build currently in flight.
    pub fn inflight(&self) -> Vec<ModelName> {
        // Upgraded handles are dropped after the lock is released: dropping
        // the last one finishes the build, which takes the lock again.
        let live: Vec<_> = self
            .inner
            .lock_inflight()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.build.upgrade()))
            .collect();

        let mut names: Vec<_> = live
            .into_iter()
            .filter_map(|(name, build)| build.map(|_| name))
            .collect();
        names.sort();
        names
    }

    /// Ask an in-flight build to stop. Every caller waiting on it gets `Error::Cancelled`.
    ///
    /// Returns whether a build was in flight.
    pub fn abort_build(&self, name: &ModelName) -> bool {
        let live = self
            .inner
            .lock_inflight()
            .get(name)
            .and_then(|entry| entry.build.upgrade().map(|build| (build, entry.abort.clone())));

        match live {
            Some((_build, abort)) => {
                tracing::info!("Aborting build of {}", name);
                abort.abort();
                true
            }
            None => false,
        }
    }

    /// Compile `source`, returning the cached artifact when one exists.
    ///
    /// Concurrent calls for the same program share a single build and all
    /// observe the same outcome.
    pub async fn compile(&self, source: &str) -> Result<CompileOutput> {
        let inner = &self.inner;
        let model_name = derive_model_name(source, &inner.versions);
        let fingerprint = program_fingerprint(source, &inner.versions);

        if let Some(artifact) = Inner::lookup(inner, &model_name, &fingerprint).await? {
            StatsCounters::bump(&inner.stats.cache_hits);
            tracing::debug!("Cache hit for {}", model_name);
            return Ok(CompileOutput {
                model_name,
                artifact,
                cached: true,
            });
        }

        StatsCounters::bump(&inner.stats.cache_misses);
        tracing::debug!("Cache miss for {}", model_name);

        let build = Inner::join_or_start(inner, &model_name, source, fingerprint);
        let artifact = build.await?;

        Ok(CompileOutput {
            model_name,
            artifact,
            cached: false,
        })
    }
}

/// Removes a build's in-flight entry when its driving future ends, whether
/// it finished or every waiter dropped it. Abandoned builds are also aborted.
struct InflightGuard {
    inner: Arc<Inner>,
    name: ModelName,
    id: u64,
    abandon: AbortOnDrop,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inner.finish_inflight(&self.name, self.id);
    }
}

impl Inner {
    fn lock_inflight(&self) -> MutexGuard<'_, FxHashMap<ModelName, InflightBuild>> {
        // Entries are plain data; a panic mid-update cannot leave them inconsistent.
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store lookup. Store failures count as misses; fingerprint mismatches are errors.
    async fn lookup(
        inner: &Arc<Inner>,
        name: &ModelName,
        fingerprint: &str,
    ) -> Result<Option<CompiledArtifact>> {
        let store = inner.store.clone();
        let key = name.clone();
        let stored = match tokio::task::spawn_blocking(move || store.get(&key)).await {
            Ok(Ok(stored)) => stored,
            Ok(Err(e)) => {
                tracing::warn!("Artifact store lookup failed for {}, rebuilding: {}", name, e);
                None
            }
            Err(e) => {
                tracing::warn!("Artifact store lookup task failed for {}: {}", name, e);
                None
            }
        };

        match stored {
            Some(stored) if stored.fingerprint != fingerprint => {
                tracing::error!(
                    "Model name collision for {}: stored fingerprint {} differs from {}",
                    name,
                    stored.fingerprint,
                    fingerprint
                );
                Err(Error::NameCollision {
                    model_name: name.to_string(),
                    stored: stored.fingerprint,
                    requested: fingerprint.to_string(),
                })
            }
            Some(stored) => Ok(Some(stored.artifact)),
            None => Ok(None),
        }
    }

    fn join_or_start(
        inner: &Arc<Inner>,
        name: &ModelName,
        source: &str,
        fingerprint: String,
    ) -> Shared<BuildFuture> {
        let mut inflight = inner.lock_inflight();

        if let Some(build) = inflight.get(name).and_then(|entry| entry.build.upgrade()) {
            StatsCounters::bump(&inner.stats.coalesced);
            tracing::debug!("Attaching to in-flight build of {}", name);
            return build;
        }

        let id = inner.next_build_id.fetch_add(1, Ordering::Relaxed);
        let abort = AbortHandle::new();
        let build = Self::run_build(
            inner.clone(),
            id,
            name.clone(),
            source.to_string(),
            fingerprint,
            abort.clone(),
        )
        .boxed()
        .shared();

        // A fresh, never-polled future always downgrades.
        if let Some(weak) = build.downgrade() {
            inflight.insert(name.clone(), InflightBuild { id, build: weak, abort });
        }

        build
    }

    async fn run_build(
        inner: Arc<Inner>,
        id: u64,
        name: ModelName,
        source: String,
        fingerprint: String,
        abort: AbortHandle,
    ) -> Result<CompiledArtifact> {
        let mut guard = InflightGuard {
            inner: inner.clone(),
            name: name.clone(),
            id,
            abandon: AbortOnDrop::new(abort.clone()),
        };

        let result = Self::build_or_reuse(&inner, &name, source, &fingerprint, abort).await;

        if let Ok(artifact) = &result {
            Self::persist(&inner, &name, &fingerprint, artifact).await;
        }

        guard.abandon.disarm();
        drop(guard);
        result
    }

    async fn build_or_reuse(
        inner: &Arc<Inner>,
        name: &ModelName,
        source: String,
        fingerprint: &str,
        abort: AbortHandle,
    ) -> Result<CompiledArtifact> {
        let permit = inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled(format!("build pool closed before {} started", name)))?;

        // Another build of this name may have finished while we queued.
        if let Some(artifact) = Self::lookup(inner, name, fingerprint).await? {
            tracing::debug!("{} was stored while queued, skipping build", name);
            return Ok(artifact);
        }

        let worker = inner.clone();
        let worker_name = name.clone();
        tokio::task::spawn_blocking(move || {
            // The slot stays taken until the worker thread is done, even if
            // every waiter has gone away.
            let _permit = permit;
            worker.build_blocking(&worker_name, &source, &abort)
        })
        .await?
    }

    async fn persist(inner: &Arc<Inner>, name: &ModelName, fingerprint: &str, artifact: &CompiledArtifact) {
        let store = inner.store.clone();
        let key = name.clone();
        let fingerprint = fingerprint.to_string();
        let artifact = artifact.clone();

        match tokio::task::spawn_blocking(move || store.put(&key, &fingerprint, &artifact)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to store artifact for {}: {}", name, e),
            Err(e) => tracing::warn!("Artifact store write task failed for {}: {}", name, e),
        }
    }

    fn finish_inflight(&self, name: &ModelName, id: u64) {
        let mut inflight = self.lock_inflight();
        if inflight.get(name).is_some_and(|entry| entry.id == id) {
            inflight.remove(name);
        }
    }

    /// The build pipeline. Runs on a blocking worker thread.
    fn build_blocking(&self, name: &ModelName, source: &str, abort: &AbortHandle) -> Result<CompiledArtifact> {
        let cancelled = || Error::Cancelled(format!("build of {}", name));
        if abort.is_aborted() {
            return Err(cancelled());
        }

        let module = derive_module_identifier(name);
        let work_dir = self.create_work_dir()?;

        tracing::info!("Translating {} as {}", name, module);
        let generated_path = work_dir
            .path()
            .join(format!("{}.{}", module, self.config.generated_extension));
        self.translator
            .translate(source, &module, &generated_path, abort)
            .map_err(|e| match e {
                ToolError::Rejected(diagnostics) => Error::Translation {
                    model_name: name.to_string(),
                    diagnostics,
                },
                ToolError::Unavailable(message) => Error::Compile {
                    model_name: name.to_string(),
                    diagnostics: message,
                },
                ToolError::Cancelled => cancelled(),
            })?;

        if abort.is_aborted() {
            return Err(cancelled());
        }

        let unit = self.prepare_unit(&module, work_dir.path(), generated_path)?;

        tracing::info!("Building module {} for {}", module, name);
        let mut capture = self.capture.acquire();
        // Another build may have held the capture for a while.
        if abort.is_aborted() {
            return Err(cancelled());
        }
        StatsCounters::bump(&self.stats.toolchain_runs);
        let built = self.toolchain.build(&unit, &mut capture, abort);
        let mut diagnostics = capture.finish();

        let compile_error = |diagnostics: String| Error::Compile {
            model_name: name.to_string(),
            diagnostics,
        };

        match built {
            Ok(()) => {}
            Err(ToolError::Cancelled) => return Err(cancelled()),
            Err(ToolError::Rejected(message)) | Err(ToolError::Unavailable(message)) => {
                append_line(&mut diagnostics, &message);
                return Err(compile_error(diagnostics));
            }
        }

        let binary = match fs::read(&unit.output_path) {
            Ok(binary) if !binary.is_empty() => binary,
            Ok(_) => {
                append_line(&mut diagnostics, "toolchain produced an empty module");
                return Err(compile_error(diagnostics));
            }
            Err(e) => {
                append_line(
                    &mut diagnostics,
                    &format!("module not found at {}: {}", unit.output_path.display(), e),
                );
                return Err(compile_error(diagnostics));
            }
        };

        if !exports_init_symbol(&binary, &module) {
            append_line(
                &mut diagnostics,
                &format!("module does not export {}", module.init_symbol()),
            );
            return Err(compile_error(diagnostics));
        }

        if let Err(e) = work_dir.close() {
            tracing::warn!("Failed to remove build directory for {}: {}", name, e);
        }

        tracing::info!("Built {} ({} bytes)", name, binary.len());
        Ok(CompiledArtifact::new(binary, diagnostics))
    }

    fn create_work_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kiln_build_");
        let dir = match &self.config.scratch_dir {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    fn prepare_unit(&self, module: &ModuleIdentifier, work_dir: &Path, generated_path: PathBuf) -> Result<BuildUnit> {
        // Forward slashes keep the include directive valid on every platform.
        let generated = generated_path.to_string_lossy().replace('\\', "/");
        let glue = template::render(
            &self.template,
            &[
                ("module_identifier", module.as_str()),
                ("generated_path", generated.as_str()),
            ],
        )?;

        let glue_path = work_dir.join(format!("{}.{}", module, self.config.glue_extension));
        fs::write(&glue_path, glue)?;

        let mut include_dirs = self.config.include_dirs.clone();
        include_dirs.push(work_dir.to_path_buf());

        Ok(BuildUnit {
            module: module.clone(),
            work_dir: work_dir.to_path_buf(),
            generated_path,
            glue_path,
            include_dirs,
            output_path: work_dir.join(format!("{}.{}", module, dylib_extension())),
        })
    }
}

fn append_line(diagnostics: &mut String, line: &str) {
    if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
        diagnostics.push('\n');
    }
    diagnostics.push_str(line);
}

/// Exported symbol names appear verbatim in the dynamic symbol table.
fn exports_init_symbol(binary: &[u8], module: &ModuleIdentifier) -> bool {
    let symbol = module.init_symbol();
    binary
        .windows(symbol.len())
        .any(|window| window == symbol.as_bytes())
}
