//! Kiln directory management.
//!
//! Provides a consistent directory structure so the CLI and library
//! callers agree on where artifacts and scratch files live.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Environment variable overriding the kiln home directory.
pub const HOME_ENV: &str = "KILN_HOME";

/// Directory structure for a kiln installation.
///
/// ```text
/// <home>/
/// ├── store.sqlite3   # Compiled artifacts keyed by model name
/// └── scratch/        # Per-build and per-load temporary directories
/// ```
#[derive(Debug, Clone)]
pub struct KilnDirs {
    /// The home directory itself.
    pub home: PathBuf,

    /// SQLite database holding compiled artifacts.
    pub store_path: PathBuf,

    /// Parent of all transient build and load directories.
    pub scratch_dir: PathBuf,
}

impl KilnDirs {
    /// Create the directory structure under `home`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn from_home(home: &Path) -> Result<Self> {
        let home = home.to_path_buf();
        let store_path = home.join("store.sqlite3");
        let scratch_dir = home.join("scratch");

        fs::create_dir_all(&scratch_dir)?;

        Ok(Self {
            home,
            store_path,
            scratch_dir,
        })
    }

    /// Default home: `$KILN_HOME`, else the user cache directory, else the system temp dir.
    pub fn default_home() -> PathBuf {
        if let Some(home) = std::env::var_os(HOME_ENV) {
            return PathBuf::from(home);
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kiln")
    }

    /// Remove leftover scratch directories (e.g. after a crash) and recreate the scratch root.
    pub fn clean_scratch(&self) -> Result<()> {
        if self.scratch_dir.exists() {
            fs::remove_dir_all(&self.scratch_dir)?;
        }
        fs::create_dir_all(&self.scratch_dir)?;
        Ok(())
    }
}
