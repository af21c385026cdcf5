//! Compilation pipeline for model programs.
//!
//! This module provides:
//! - Build orchestration with per-name request coalescing
//! - Translator and native toolchain drivers
//! - Glue template rendering
//! - Exclusive capture of toolchain diagnostics
//!
//! # Architecture
//!
//! ```text
//! Program source
//!     │
//!     ├── NameDeriver ──► models/<digest> ──► ArtifactStore (hit: done)
//!     │
//!     └── Translator ──► <module>.hpp ─┐
//!                                      ├──► NativeToolchain ──► <module>.so ──► ArtifactStore
//!         Glue template ──► <module>.cpp ┘         │
//!                                                  └── OutputCapture (diagnostics)
//! ```

mod abort;
mod capture;
mod orchestrator;
mod template;
mod toolchain;
mod types;

pub use abort::AbortHandle;
pub use capture::{CaptureGuard, OutputCapture};
pub use orchestrator::BuildOrchestrator;
pub use template::{BUILTIN_GLUE_TEMPLATE, load_template, render};
pub use toolchain::{
    BuildUnit, CommandToolchain, CommandTranslator, NativeToolchain, ToolError, Translator,
    expand_args,
};
pub use types::{BuildStats, CompileOutput, CompiledArtifact, CompilerConfig, dylib_extension};
