//! Per-invocation state shared by all commands.

use std::path::Path;
use std::sync::Arc;

use kiln_core::{ArtifactStore, CompilerConfig, KilnDirs, ModuleLoader, SqliteStore};

pub struct Context {
    pub dirs: KilnDirs,
    store: Arc<SqliteStore>,
}

impl Context {
    /// Open the kiln home at `home`, or the default one.
    pub fn open(home: Option<&Path>) -> anyhow::Result<Self> {
        let home = match home {
            Some(home) => home.to_path_buf(),
            None => KilnDirs::default_home(),
        };

        let dirs = KilnDirs::from_home(&home)?;
        let store = Arc::new(SqliteStore::open(&dirs.store_path)?);
        tracing::debug!("Using kiln home {}", dirs.home.display());

        Ok(Self { dirs, store })
    }

    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    pub fn shared_store(&self) -> Arc<dyn ArtifactStore> {
        self.store.clone()
    }

    /// Compiler settings from the environment, with scratch space under the kiln home.
    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig::from_env().with_scratch_dir(self.dirs.scratch_dir.clone())
    }

    pub fn loader(&self) -> ModuleLoader {
        ModuleLoader::with_scratch_root(&self.dirs.scratch_dir)
    }
}
