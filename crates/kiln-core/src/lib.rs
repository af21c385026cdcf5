//! Core engine for Kiln, a content-addressed model compilation cache.
//!
//! This crate provides:
//! - Deterministic model names derived from program text and tool versions
//! - Persistent artifact storage keyed by model name
//! - Build orchestration with per-name request coalescing
//! - Loading compiled modules into the running process
//! - A registry for long-running named operations

pub mod compile;
pub mod error;
pub mod loader;
pub mod naming;
pub mod operations;
pub mod paths;
pub mod store;

pub use compile::{
    AbortHandle, BuildOrchestrator, BuildStats, CompileOutput, CompiledArtifact, CompilerConfig,
    NativeToolchain, OutputCapture, Translator,
};
pub use error::{Error, Result};
pub use loader::{LoadedModule, ModuleLoader};
pub use naming::{
    ModelName, ModuleIdentifier, Versions, derive_model_name, derive_module_identifier,
    program_fingerprint,
};
pub use operations::{Operation, OperationRegistry, OperationStatus};
pub use paths::KilnDirs;
pub use store::{ArtifactStore, MemoryStore, SqliteStore, StoredArtifact};
