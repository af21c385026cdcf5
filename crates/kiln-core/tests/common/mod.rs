//! In-process stand-ins for the translator and native toolchain.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kiln_core::compile::{BuildUnit, CaptureGuard, ToolError};
use kiln_core::{
    AbortHandle, ArtifactStore, BuildOrchestrator, CompiledArtifact, CompilerConfig, Error,
    MemoryStore, ModelName, ModuleIdentifier, NativeToolchain, OutputCapture, Result,
    StoredArtifact, Translator,
};

pub const MODEL_SOURCE: &str = "parameters { real y; } model { y ~ normal(0,1); }";

/// Sleep for `delay`, returning early with `Cancelled` if aborted.
fn work(delay: Duration, abort: &AbortHandle) -> std::result::Result<(), ToolError> {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if abort.is_aborted() {
            return Err(ToolError::Cancelled);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// Copies the source to the output. Rejects programs containing `syntax error`.
#[derive(Default)]
pub struct FakeTranslator {
    pub delay: Duration,
    pub runs: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeTranslator {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Translator for FakeTranslator {
    fn version(&self) -> &str {
        "fake-translator 2.32.0"
    }

    fn translate(
        &self,
        source: &str,
        module: &ModuleIdentifier,
        output: &Path,
        abort: &AbortHandle,
    ) -> std::result::Result<(), ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = work(self.delay, abort).and_then(|()| {
            if source.contains("syntax error") {
                return Err(ToolError::Rejected(
                    "Syntax error in 'model', line 1, column 0".to_string(),
                ));
            }
            fs::write(output, format!("// {}\n{}", module, source))
                .map_err(|e| ToolError::Unavailable(e.to_string()))
        });

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Writes a fake module image that exports the init symbol.
///
/// Fails when the generated code contains `link error`.
#[derive(Default)]
pub struct FakeToolchain {
    pub delay: Duration,
    /// Leave the init symbol out of the image.
    pub omit_symbol: bool,
    pub started: AtomicUsize,
    pub cancelled: AtomicUsize,
}

impl FakeToolchain {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl NativeToolchain for FakeToolchain {
    fn build(
        &self,
        unit: &BuildUnit,
        capture: &mut CaptureGuard<'_>,
        abort: &AbortHandle,
    ) -> std::result::Result<(), ToolError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _ = writeln!(capture, "warning: fake toolchain building {}", unit.module);

        if let Err(e) = work(self.delay, abort) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }

        let generated = fs::read_to_string(&unit.generated_path)
            .map_err(|e| ToolError::Unavailable(e.to_string()))?;
        if generated.contains("link error") {
            let _ = writeln!(capture, "error: undefined reference to `stan::math::foo`");
            return Err(ToolError::Rejected("fake toolchain exited with 1".to_string()));
        }

        let mut image = b"\x7fELF fake module\0".to_vec();
        if !self.omit_symbol {
            image.extend_from_slice(unit.module.init_symbol().as_bytes());
            image.push(0);
        }
        image.extend_from_slice(generated.as_bytes());
        fs::write(&unit.output_path, image).map_err(|e| ToolError::Unavailable(e.to_string()))
    }
}

/// A store whose every operation fails.
pub struct BrokenStore;

impl ArtifactStore for BrokenStore {
    fn get(&self, _name: &ModelName) -> Result<Option<StoredArtifact>> {
        Err(Error::Store("disk on fire".to_string()))
    }

    fn put(&self, _name: &ModelName, _fingerprint: &str, _artifact: &CompiledArtifact) -> Result<()> {
        Err(Error::Store("disk on fire".to_string()))
    }

    fn list(&self) -> Result<Vec<ModelName>> {
        Err(Error::Store("disk on fire".to_string()))
    }

    fn delete(&self, _name: &ModelName) -> Result<bool> {
        Err(Error::Store("disk on fire".to_string()))
    }
}

/// Orchestrator wired to fakes, with all scratch files under `scratch`.
pub struct Harness {
    pub orchestrator: BuildOrchestrator,
    pub translator: Arc<FakeTranslator>,
    pub toolchain: Arc<FakeToolchain>,
    pub store: Arc<dyn ArtifactStore>,
}

impl Harness {
    pub fn new(scratch: &Path, translator: FakeTranslator, toolchain: FakeToolchain) -> Self {
        Self::with_store(scratch, translator, toolchain, Arc::new(MemoryStore::new()), 4)
    }

    pub fn with_store(
        scratch: &Path,
        translator: FakeTranslator,
        toolchain: FakeToolchain,
        store: Arc<dyn ArtifactStore>,
        max_builds: usize,
    ) -> Self {
        let translator = Arc::new(translator);
        let toolchain = Arc::new(toolchain);
        let config = CompilerConfig::default()
            .with_scratch_dir(scratch.to_path_buf())
            .with_max_concurrent_builds(max_builds);

        let orchestrator = BuildOrchestrator::with_capture(
            config,
            translator.clone(),
            toolchain.clone(),
            store.clone(),
            OutputCapture::new(),
        )
        .unwrap();

        Self {
            orchestrator,
            translator,
            toolchain,
            store,
        }
    }
}

pub fn dir_is_empty(path: &Path) -> bool {
    fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
