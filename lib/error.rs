//! Error taxonomy shared by every layer of the cache.

use thiserror::Error;

use crate::backend::BackendError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to the request layer.
#[derive(Debug, Error)]
pub enum Error {
    /// No object lives at the requested path.
    #[error("file does not exist: {path}")]
    FileDoesNotExist {
        /// Offending path.
        path: String,
    },

    /// An object already lives at the requested path.
    #[error("file already exists: {path}")]
    FileAlreadyExists {
        /// Offending path.
        path: String,
    },

    /// A directory operation was attempted on something else.
    #[error("not a directory: {path}")]
    IsNotDirectory {
        /// Offending path.
        path: String,
    },

    /// A regular-file operation was attempted on a directory.
    #[error("is a directory: {path}")]
    IsDirectory {
        /// Offending path.
        path: String,
    },

    /// The directory still holds entries.
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty {
        /// Offending path.
        path: String,
    },

    /// The path is not absolute, or names `.` or `..`.
    #[error("invalid path: {path:?}")]
    InvalidPath {
        /// Offending path.
        path: String,
    },

    /// The root directory cannot be removed or renamed.
    #[error("resource busy: {path}")]
    Busy {
        /// Offending path.
        path: String,
    },

    /// A rename that cannot be expressed, such as moving a directory below itself.
    #[error("cannot rename {from} to {to}")]
    InvalidRename {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },

    /// The mode bits describe a file type this filesystem cannot store.
    #[error("file type not supported (mode {mode:#o})")]
    TypeNotSupported {
        /// The rejected mode.
        mode: u32,
    },

    /// The access would address a stripe past the last encodable index.
    #[error("offset {offset} is beyond the maximum file size")]
    FileTooLarge {
        /// First byte that cannot be addressed.
        offset: u64,
    },

    /// Bytes stored under a key could not be decoded.
    #[error("corrupted object under key {key}")]
    Corrupted {
        /// Printable form of the key.
        key: String,
    },

    /// The backend reported a missing key where the caller expected one.
    ///
    /// The metadata and cache store boundaries translate this into
    /// [`Error::FileDoesNotExist`]; it only escapes through direct backend use.
    #[error("key does not exist: {key}")]
    KeyDoesNotExist {
        /// Printable form of the key.
        key: String,
    },

    /// Any other backend failure, carrying the backend's native status code.
    #[error("backend failure ({code}): {message}")]
    Backend {
        /// Native status code.
        code: i32,
        /// Human-readable description.
        message: String,
    },
}

impl Error {
    /// The OS status code the request layer should reply with.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::FileDoesNotExist { .. } | Self::KeyDoesNotExist { .. } => libc::ENOENT,
            Self::FileAlreadyExists { .. } => libc::EEXIST,
            Self::IsNotDirectory { .. } => libc::ENOTDIR,
            Self::IsDirectory { .. } => libc::EISDIR,
            Self::DirectoryNotEmpty { .. } => libc::ENOTEMPTY,
            Self::TypeNotSupported { .. } => libc::ENOTSUP,
            Self::FileTooLarge { .. } => libc::EFBIG,
            Self::InvalidRename { .. } | Self::InvalidPath { .. } => libc::EINVAL,
            Self::Busy { .. } => libc::EBUSY,
            // Backends report errno-compatible codes; anything non-positive is opaque.
            Self::Backend { code, .. } if *code > 0 => *code,
            Self::Backend { .. } | Self::Corrupted { .. } => libc::EIO,
        }
    }

    /// Replaces a backend-level "missing key" with "missing file" for `path`.
    #[must_use]
    pub fn at_path(self, path: &str) -> Self {
        match self {
            Self::KeyDoesNotExist { .. } => Self::FileDoesNotExist {
                path: path.to_owned(),
            },
            other => other,
        }
    }
}

impl From<BackendError> for Error {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::KeyDoesNotExist { key } => Self::KeyDoesNotExist { key },
            BackendError::Failure { code, message } => Self::Backend { code, message },
        }
    }
}
