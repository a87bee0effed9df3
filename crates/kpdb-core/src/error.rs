//! Error types for kpdb-core

use thiserror::Error;

/// Result type alias for kpdb-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while importing or exporting a database
#[derive(Error, Debug)]
pub enum Error {
    /// The database or key file does not exist
    #[error("file not found")]
    FileNotFound,

    /// Read/write failure or a stream integrity violation
    #[error("I/O error: {0}")]
    Io(String),

    /// The supplied credentials failed to decrypt the database
    #[error("invalid password or key file")]
    Password,

    /// The file is syntactically malformed or uses an unsupported feature
    #[error("format error: {0}")]
    Format(String),

    /// An invariant that should be impossible to violate was violated
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound,
            _ => Error::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(Error::from(err), Error::FileNotFound));
    }

    #[test]
    fn other_io_errors_stay_io() {
        let err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        assert!(matches!(Error::from(err), Error::Io(_)));
    }
}
