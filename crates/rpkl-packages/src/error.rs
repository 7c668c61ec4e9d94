//! Error types for package and module resolution

use thiserror::Error;

/// Result type for resolution operations
pub type Result<T> = std::result::Result<T, Error>;

/// Resolution error
///
/// Every variant carries a fully rendered message that includes the URIs and
/// checksums involved. Errors are `Clone` so that a single failed download can
/// be reported to every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid URI, package URI or asset URI syntax
    #[error("Malformed URI: {0}")]
    MalformedUri(String),

    /// Invalid triple-dot import reference
    #[error("Malformed module reference: {0}")]
    MalformedReference(String),

    /// The package itself could not be loaded (metadata, archive, checksum)
    #[error("{0}")]
    PackageLoad(String),

    /// The package loaded fine but the asset does not exist inside it
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// A module reference could not be found (e.g. triple-dot search exhausted)
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Cannot resolve triple-dot import from module `{0}`, because it does not have a hierarchical, local origin.")]
    AscensionNotSupported(String),

    /// Project-level failure (checksum pin mismatch, unresolvable conflict)
    #[error("{0}")]
    Resolution(String),

    /// Rejected by the security manager
    #[error("{0}")]
    Security(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid project: {0}")]
    InvalidProject(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Create an IO error with context
    pub fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Error::Io(format!("{}: {}", context, err))
    }

    /// Create a malformed URI error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedUri(message.into())
    }

    /// Whether this error means "the thing asked for does not exist", as
    /// opposed to a failure to load it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::AssetNotFound(_) | Error::ModuleNotFound(_))
    }
}

/// Error returned by a [`Transport`](crate::packages::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("HTTP request to `{0}` failed with status 404 Not Found")]
    NotFound(String),

    #[error("HTTP request to `{uri}` failed with status {status}")]
    Status { uri: String, status: u16 },

    #[error("Refusing to fetch `{0}` because it is not an HTTPS URI")]
    UnsupportedScheme(String),

    #[error("HTTP request to `{uri}` failed: {message}")]
    Io { uri: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds() {
        assert!(Error::AssetNotFound("x".into()).is_not_found());
        assert!(Error::ModuleNotFound("x".into()).is_not_found());
        assert!(!Error::PackageLoad("x".into()).is_not_found());
    }

    #[test]
    fn test_io_context() {
        let err = Error::io("Failed to read /tmp/x", "permission denied");
        assert_eq!(
            err.to_string(),
            "IO error: Failed to read /tmp/x: permission denied"
        );
    }
}
