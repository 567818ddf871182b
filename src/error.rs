//! Error types for the TuneVault extension host.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the extension host.
///
/// Extensions never see these directly: at the sandbox boundary every failure
/// is folded into a `{ success: false, error: "..." }` value. The variants
/// exist for the host application and for tests.
#[derive(Error, Debug)]
pub enum Error {
    /// Capability missing: file permission, disallowed domain, path escape.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Sandbox boundary violation: private-address target, absolute path
    /// outside the download allow-list.
    #[error("Sandbox violation: {0}")]
    Sandbox(String),

    /// Malformed input: bad manifest, invalid URL, missing argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote endpoint returned a non-success status.
    #[error("HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    /// AES-GCM open failure or key derivation trouble. Never masked.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Token endpoint returned an `error` field or no `access_token`.
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// Script evaluation failed inside the VM.
    #[error("Script error: {0}")]
    Script(String),

    /// VM execution exceeded its allotted duration.
    #[error("{message}")]
    Timeout { message: String },
}

impl Error {
    /// Create a permission-denied error.
    pub fn permission(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    /// Create a sandbox-violation error.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a remote-failure error.
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }

    /// Create a crypto error.
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Create an OAuth error.
    pub fn oauth(message: impl Into<String>) -> Self {
        Self::OAuth(message.into())
    }

    /// Create a script error.
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Whether this error was produced by the execution-timeout interrupt.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
