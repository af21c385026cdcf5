//! Content-derived model names and module identifiers.
//!
//! A model name is a short digest of the program source together with
//! everything that affects the compiled binary:
//!
//! ```text
//! blake3(source ++ translator version ++ kiln version ++ platform)
//!     │
//!     ├── first 5 bytes ──► models/3f9a0c11e2     (ModelName, cache key)
//!     │                        │
//!     │                        └──► model_3f9a0c11e2   (ModuleIdentifier)
//!     │
//!     └── all 32 bytes ──► fingerprint             (collision detection)
//! ```
//!
//! Five bytes means a collision is expected after roughly a million
//! distinct models. Collisions are detected by the store, which keeps the
//! full fingerprint next to each artifact.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix of every model name.
pub const MODEL_NAME_PREFIX: &str = "models/";

/// Prefix of every module identifier.
pub const MODULE_IDENTIFIER_PREFIX: &str = "model_";

/// Number of digest bytes kept in a model name.
pub const DIGEST_SIZE: usize = 5;

/// Versions of everything besides the source that changes the compiled module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versions {
    /// Version string reported by the external translator.
    pub translator: String,
    /// Version of this system.
    pub system: String,
    /// Platform identifier (operating system and architecture).
    pub platform: String,
}

impl Versions {
    /// Versions for this build of kiln on this platform.
    pub fn current(translator: impl Into<String>) -> Self {
        Self {
            translator: translator.into(),
            system: env!("CARGO_PKG_VERSION").to_string(),
            platform: platform_identifier(),
        }
    }
}

/// Identifier of the running platform, e.g. `linux-x86_64`.
pub fn platform_identifier() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Stable identifier of a program; the sole cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelName(String);

impl ModelName {
    /// Parse a model name received from outside, e.g. a CLI argument.
    pub fn parse(text: &str) -> Result<Self> {
        let digest = text
            .strip_prefix(MODEL_NAME_PREFIX)
            .ok_or_else(|| Error::InvalidModelName(text.to_string()))?;

        let well_formed = digest.len() == DIGEST_SIZE * 2
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if !well_formed {
            return Err(Error::InvalidModelName(text.to_string()));
        }

        Ok(Self(text.to_string()))
    }

    /// The name as text, e.g. `models/3f9a0c11e2`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex digest part of the name.
    pub fn digest(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name under which a compiled module is materialized and initialized.
///
/// Always a valid identifier token (`[A-Za-z_][A-Za-z0-9_]*`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentifier(String);

impl ModuleIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Symbol of the initialization entry point exported by the module.
    pub fn init_symbol(&self) -> String {
        format!("kiln_init_{}", self.0)
    }
}

impl fmt::Display for ModuleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn program_hash(source: &str, versions: &Versions) -> blake3::Hash {
    // Order is part of the name format; do not reorder.
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(versions.translator.as_bytes());
    hasher.update(versions.system.as_bytes());
    hasher.update(versions.platform.as_bytes());
    hasher.finalize()
}

/// Compute the model name of a program.
pub fn derive_model_name(source: &str, versions: &Versions) -> ModelName {
    let hash = program_hash(source, versions);
    let digest: String = hash.as_bytes()[..DIGEST_SIZE]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    ModelName(format!("{}{}", MODEL_NAME_PREFIX, digest))
}

/// Full-width fingerprint of a program, stored to detect name collisions.
pub fn program_fingerprint(source: &str, versions: &Versions) -> String {
    program_hash(source, versions).to_hex().to_string()
}

/// Derive the module identifier from a model name.
pub fn derive_module_identifier(name: &ModelName) -> ModuleIdentifier {
    let tail: String = name
        .digest()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    ModuleIdentifier(format!("{}{}", MODULE_IDENTIFIER_PREFIX, tail))
}

/// Whether `text` is a valid identifier token.
pub fn is_valid_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
