//! Error types for kiln-core.

use thiserror::Error;

/// Result type for kiln-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kiln-core.
///
/// Every variant is `Clone` so that a single failed build can be handed to
/// every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The external translator rejected the program.
    #[error("translation failed for {model_name}:\n{diagnostics}")]
    Translation {
        model_name: String,
        diagnostics: String,
    },

    /// The native build step failed.
    #[error("compilation failed for {model_name}{}", render_diagnostics(diagnostics))]
    Compile {
        model_name: String,
        diagnostics: String,
    },

    /// No artifact stored under this name.
    #[error("model not found: {0}")]
    NotFound(String),

    /// The binary image could not be loaded.
    #[error("failed to load module {module}: {message}")]
    Load { module: String, message: String },

    /// Operation still unfinished when the registry was shut down.
    #[error("operation `{0}` cancelled before finishing")]
    OperationAbandoned(String),

    /// Text that is not a well-formed model name.
    #[error("invalid model name: {0}")]
    InvalidModelName(String),

    /// Two different programs hash to the same short model name.
    #[error("model name collision for {model_name}: stored fingerprint {stored}, requested {requested}")]
    NameCollision {
        model_name: String,
        stored: String,
        requested: String,
    },

    /// Work was cancelled before it finished.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// No operation registered under this name.
    #[error("operation not found: {0}")]
    OperationNotFound(String),

    /// An operation with this name was already registered.
    #[error("operation already exists: {0}")]
    DuplicateOperation(String),

    /// Invalid state transition or request.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Artifact store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Toolchain discovery or invocation error.
    #[error("toolchain error: {0}")]
    Toolchain(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

fn render_diagnostics(diagnostics: &str) -> String {
    if diagnostics.trim().is_empty() {
        " (no diagnostics captured)".to_string()
    } else {
        format!(":\n{}", diagnostics)
    }
}

impl Error {
    /// Render the error together with a short recovery hint, for terminal output.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::Translation { .. } => Some("fix the program and compile again"),
            Error::Compile { .. } => {
                Some("check that the toolchain and include directories are configured (KILN_TOOLCHAIN, KILN_INCLUDE)")
            }
            Error::NotFound(_) => Some("compile the program first with `kiln compile`"),
            Error::NameCollision { .. } => {
                Some("delete the stored model with `kiln delete` to replace it")
            }
            Error::Toolchain(_) => Some("make sure the translator and compiler are on PATH"),
            Error::InvalidModelName(_) => Some("model names look like `models/0123456789`"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }

    /// Captured diagnostics carried by this error, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Error::Translation { diagnostics, .. } | Error::Compile { diagnostics, .. } => {
                Some(diagnostics)
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled("worker task cancelled".to_string())
        } else {
            Self::InvalidOperation(format!("worker task panicked: {}", e))
        }
    }
}
