//! Loading compiled artifacts into the running process.
//!
//! An artifact is written to a fresh scratch directory as
//! `<module identifier>.<dylib extension>`, opened with `libloading`, and
//! initialized through its `kiln_init_<module identifier>` entry point.
//! The scratch directory never outlives the call on unix; Windows keeps the
//! file locked while mapped, so there it is removed when the module is dropped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use tempfile::TempDir;

use crate::compile::{CompiledArtifact, dylib_extension};
use crate::error::{Error, Result};
use crate::naming::{ModelName, ModuleIdentifier, derive_module_identifier};
use crate::store::ArtifactStore;

/// Signature of the initialization entry point. Zero means success.
type InitFn = unsafe extern "C" fn() -> i32;

/// Loads artifacts from a store or from memory.
#[derive(Debug, Clone, Default)]
pub struct ModuleLoader {
    /// Parent for scratch directories. `None` uses the system temp dir.
    scratch_root: Option<PathBuf>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create scratch directories under `root`.
    pub fn with_scratch_root(root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: Some(root.into()),
        }
    }

    /// Look up `name` in `store` and load it.
    ///
    /// Store failures are reported as `NotFound`; loading never triggers a build.
    pub fn load(&self, name: &ModelName, store: &dyn ArtifactStore) -> Result<LoadedModule> {
        let stored = match store.get(name) {
            Ok(Some(stored)) => stored,
            Ok(None) => return Err(Error::NotFound(name.to_string())),
            Err(e) => {
                tracing::warn!("Artifact store lookup failed for {}: {}", name, e);
                return Err(Error::NotFound(name.to_string()));
            }
        };

        self.load_artifact(name, &stored.artifact)
    }

    /// [`load`](Self::load) on a blocking worker thread.
    ///
    /// The store read, the file write and the dlopen all block; async callers
    /// should go through here.
    pub async fn load_async(&self, name: &ModelName, store: Arc<dyn ArtifactStore>) -> Result<LoadedModule> {
        let loader = self.clone();
        let name = name.clone();
        tokio::task::spawn_blocking(move || loader.load(&name, store.as_ref())).await?
    }

    /// [`load_artifact`](Self::load_artifact) on a blocking worker thread.
    pub async fn load_artifact_async(&self, name: &ModelName, artifact: CompiledArtifact) -> Result<LoadedModule> {
        let loader = self.clone();
        let name = name.clone();
        tokio::task::spawn_blocking(move || loader.load_artifact(&name, &artifact)).await?
    }

    /// Load an artifact that is already in memory.
    pub fn load_artifact(&self, name: &ModelName, artifact: &CompiledArtifact) -> Result<LoadedModule> {
        let identifier = derive_module_identifier(name);
        let scratch = self.create_scratch()?;

        let result = materialize_and_open(scratch.path(), &identifier, artifact);

        // Windows refuses to delete a mapped DLL; keep the directory until unload.
        let keep_scratch = cfg!(windows) && result.is_ok();
        let scratch = if keep_scratch {
            Some(scratch)
        } else {
            if let Err(e) = scratch.close() {
                tracing::warn!("Failed to remove load directory for {}: {}", name, e);
            }
            None
        };

        let library = result?;
        tracing::info!("Loaded {} as {}", name, identifier);

        Ok(LoadedModule {
            library,
            name: name.clone(),
            identifier,
            diagnostics: artifact.diagnostics.clone(),
            _scratch: scratch,
        })
    }

    fn create_scratch(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kiln_load_");
        let dir = match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

/// The entry point name is derived from the file stem, so it must be the module identifier.
fn ensure_stem_matches(path: &Path, identifier: &ModuleIdentifier) -> Result<()> {
    let stem = path.file_stem().and_then(|s| s.to_str());
    if stem == Some(identifier.as_str()) {
        return Ok(());
    }
    Err(Error::Load {
        module: identifier.to_string(),
        message: format!("file name {} does not match module identifier", path.display()),
    })
}

fn materialize_and_open(dir: &Path, identifier: &ModuleIdentifier, artifact: &CompiledArtifact) -> Result<Library> {
    let load_error = |message: String| Error::Load {
        module: identifier.to_string(),
        message,
    };

    let path = dir.join(format!("{}.{}", identifier, dylib_extension()));
    ensure_stem_matches(&path, identifier)?;
    fs::write(&path, &artifact.binary[..])
        .map_err(|e| load_error(format!("failed to write {}: {}", path.display(), e)))?;

    // Safety: the image was produced by our own build pipeline; its only
    // load-time behaviour is static initialization of generated code.
    let library = unsafe { Library::new(&path) }
        .map_err(|e| load_error(format!("failed to open {}: {}", path.display(), e)))?;

    let symbol = identifier.init_symbol();
    let code = {
        let init: Symbol<InitFn> = unsafe { library.get(symbol.as_bytes()) }
            .map_err(|e| load_error(format!("missing entry point {}: {}", symbol, e)))?;

        // Safety: the glue template defines the entry point with this signature.
        unsafe { init() }
    };
    if code != 0 {
        return Err(load_error(format!("{} returned {}", symbol, code)));
    }

    Ok(library)
}

/// A loaded, initialized module. The library stays mapped while this lives.
pub struct LoadedModule {
    library: Library,
    name: ModelName,
    identifier: ModuleIdentifier,
    diagnostics: String,
    // Dropped after `library`.
    _scratch: Option<TempDir>,
}

impl LoadedModule {
    pub fn name(&self) -> &ModelName {
        &self.name
    }

    pub fn identifier(&self) -> &ModuleIdentifier {
        &self.identifier
    }

    /// Diagnostics captured when the module was built.
    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    /// Resolve an exported symbol.
    ///
    /// # Safety
    /// `T` must match the symbol's actual type.
    pub unsafe fn symbol<T>(&self, name: &str) -> Result<Symbol<'_, T>> {
        unsafe { self.library.get(name.as_bytes()) }.map_err(|e| Error::Load {
            module: self.identifier.to_string(),
            message: format!("missing symbol {}: {}", name, e),
        })
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}
