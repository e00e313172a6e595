//! Unified error surface for the shared-folder bridge.
//!
//! Remote failures, local policy rejections and cache bookkeeping errors all
//! end up here so every operation returns one `SfError` the caller (or the
//! FUSE dispatcher) can map to an errno.

use std::fmt;
use std::io::ErrorKind;
use thiserror::Error;

pub type SfResult<T> = Result<T, SfError>;

/// Optional path attached to path-shaped errors.
#[derive(Debug, Clone, Default)]
pub struct PathHint(Option<String>);

impl PathHint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(path: impl Into<String>) -> Self {
        Self(Some(path.into()))
    }
}

impl fmt::Display for PathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(path) if !path.is_empty() => write!(f, ": {path}"),
            _ => Ok(()),
        }
    }
}

impl From<&str> for PathHint {
    fn from(value: &str) -> Self {
        Self::some(value)
    }
}

impl From<String> for PathHint {
    fn from(value: String) -> Self {
        Self::some(value)
    }
}

#[derive(Error, Debug)]
pub enum SfError {
    #[error("not found{path}")]
    NotFound { path: PathHint },

    #[error("already exists{path}")]
    AlreadyExists { path: PathHint },

    #[error("not a directory{path}")]
    NotADirectory { path: PathHint },

    #[error("is a directory{path}")]
    IsADirectory { path: PathHint },

    #[error("directory not empty{path}")]
    DirectoryNotEmpty { path: PathHint },

    #[error("permission denied{path}")]
    PermissionDenied { path: PathHint },

    /// The host store refused the operation as read-only/unsupported.
    /// Symlink creation remaps this to `PermissionDenied` before it escapes.
    #[error("read-only filesystem{path}")]
    ReadOnlyFilesystem { path: PathHint },

    #[error("crosses devices")]
    CrossesDevices,

    #[error("invalid input")]
    InvalidInput,

    #[error("invalid data")]
    InvalidData,

    #[error("invalid filename")]
    InvalidFilename,

    #[error("name too long")]
    NameTooLong,

    #[error("unsupported")]
    Unsupported,

    /// Inline (non-blocking) resolution cannot be served; retry blocking.
    #[error("would block")]
    WouldBlock,

    /// No usable remote handle for the requested access.
    #[error("bad handle")]
    BadHandle,

    /// Synthesized enumeration identifier does not fit the identifier width.
    #[error("identifier range overflow")]
    RangeOverflow,

    #[error("out of memory")]
    OutOfMemory,

    #[error("not connected")]
    NotConnected,

    #[error("timed out")]
    TimedOut,

    #[error("other error")]
    Other,
}

impl SfError {
    pub fn not_found(path: impl Into<PathHint>) -> Self {
        SfError::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<PathHint>) -> Self {
        SfError::AlreadyExists { path: path.into() }
    }

    /// errno the FUSE dispatcher reports for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            SfError::NotFound { .. } => libc::ENOENT,
            SfError::AlreadyExists { .. } => libc::EEXIST,
            SfError::NotADirectory { .. } => libc::ENOTDIR,
            SfError::IsADirectory { .. } => libc::EISDIR,
            SfError::DirectoryNotEmpty { .. } => libc::ENOTEMPTY,
            SfError::PermissionDenied { .. } => libc::EPERM,
            SfError::ReadOnlyFilesystem { .. } => libc::EROFS,
            SfError::CrossesDevices => libc::EXDEV,
            SfError::InvalidInput => libc::EINVAL,
            SfError::InvalidData => libc::EINVAL,
            SfError::InvalidFilename => libc::EINVAL,
            SfError::NameTooLong => libc::ENAMETOOLONG,
            SfError::Unsupported => libc::EOPNOTSUPP,
            SfError::WouldBlock => libc::EAGAIN,
            SfError::BadHandle => libc::EBADF,
            SfError::RangeOverflow => libc::EINVAL,
            SfError::OutOfMemory => libc::ENOMEM,
            SfError::NotConnected => libc::ENOTCONN,
            SfError::TimedOut => libc::ETIMEDOUT,
            SfError::Other => libc::EIO,
        }
    }
}

impl From<std::io::Error> for SfError {
    fn from(value: std::io::Error) -> Self {
        // Transport implementations built on real channels report io::Error;
        // fold the kinds we distinguish into the SfError taxonomy.
        match value.kind() {
            ErrorKind::NotFound => SfError::NotFound {
                path: PathHint::none(),
            },
            ErrorKind::AlreadyExists => SfError::AlreadyExists {
                path: PathHint::none(),
            },
            ErrorKind::NotADirectory => SfError::NotADirectory {
                path: PathHint::none(),
            },
            ErrorKind::IsADirectory => SfError::IsADirectory {
                path: PathHint::none(),
            },
            ErrorKind::DirectoryNotEmpty => SfError::DirectoryNotEmpty {
                path: PathHint::none(),
            },
            ErrorKind::PermissionDenied => SfError::PermissionDenied {
                path: PathHint::none(),
            },
            ErrorKind::ReadOnlyFilesystem => SfError::ReadOnlyFilesystem {
                path: PathHint::none(),
            },
            ErrorKind::CrossesDevices => SfError::CrossesDevices,
            ErrorKind::InvalidInput => SfError::InvalidInput,
            ErrorKind::InvalidData => SfError::InvalidData,
            ErrorKind::InvalidFilename => SfError::InvalidFilename,
            ErrorKind::Unsupported => SfError::Unsupported,
            ErrorKind::WouldBlock => SfError::WouldBlock,
            ErrorKind::OutOfMemory => SfError::OutOfMemory,
            ErrorKind::NotConnected => SfError::NotConnected,
            ErrorKind::TimedOut => SfError::TimedOut,
            _ => SfError::Other,
        }
    }
}
