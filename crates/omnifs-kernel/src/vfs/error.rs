//! VFS error types.
//!
//! Every backend translates its native failures (errno values, FTP reply
//! codes, HTTP status codes, resolver errors) into exactly one [`VfsError`]
//! variant at its boundary. Nothing backend-specific leaks past an adapter.

use std::fmt;
use std::io;
use thiserror::Error;

/// The file(s) an error is about, plus an optional reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFault {
    /// Primary path.
    pub file: String,
    /// Second path, for two-path operations (copy, move, link).
    pub other: Option<String>,
    /// Human-readable reason.
    pub reason: Option<String>,
}

impl FileFault {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            other: None,
            reason: None,
        }
    }

    pub fn with_other(mut self, other: impl Into<String>) -> Self {
        self.other = Some(other.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl fmt::Display for FileFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file)?;
        if let Some(other) = &self.other {
            write!(f, " -> {other}")?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Permission denied, or a mutation against a read-only filesystem.
    #[error("access denied: {0}")]
    AccessDenied(FileFault),

    /// File or directory not found.
    #[error("no such file: {0}")]
    NoSuchFile(FileFault),

    /// Target already exists.
    #[error("file already exists: {0}")]
    FileAlreadyExists(FileFault),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotDirectory(FileFault),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(FileFault),

    /// Symbolic link cycle or too many levels of links.
    #[error("file system loop: {0}")]
    FileSystemLoop(FileFault),

    /// Atomic move was requested but cannot be guaranteed.
    #[error("atomic move not supported: {0}")]
    AtomicMoveNotSupported(FileFault),

    /// Not a symbolic link.
    #[error("not a symbolic link: {0}")]
    NotLink(FileFault),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsDirectory(FileFault),

    /// Name rejected by the backend.
    #[error("invalid name: {0}")]
    InvalidName(FileFault),

    /// The backend has no primitive for this operation.
    ///
    /// Copy and move treat this as "fall back to the manual path" rather
    /// than as a failure.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Cancelled or interrupted I/O.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The owning filesystem has been closed.
    #[error("file system closed: {0}")]
    Closed(String),

    /// Catch-all.
    #[error("file system error: {0}")]
    FileSystem(FileFault),

    /// A primary error with secondary failures that happened while cleaning up.
    #[error("{primary}")]
    Suppressed {
        primary: Box<VfsError>,
        suppressed: Vec<VfsError>,
    },
}

/// Discriminant of [`VfsError`], looking through suppression wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsErrorKind {
    AccessDenied,
    NoSuchFile,
    FileAlreadyExists,
    NotDirectory,
    DirectoryNotEmpty,
    FileSystemLoop,
    AtomicMoveNotSupported,
    NotLink,
    IsDirectory,
    InvalidName,
    Unsupported,
    Interrupted,
    Closed,
    FileSystem,
}

impl VfsError {
    pub fn access_denied(path: impl Into<String>) -> Self {
        Self::AccessDenied(FileFault::new(path))
    }

    pub fn no_such_file(path: impl Into<String>) -> Self {
        Self::NoSuchFile(FileFault::new(path))
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::FileAlreadyExists(FileFault::new(path))
    }

    pub fn not_directory(path: impl Into<String>) -> Self {
        Self::NotDirectory(FileFault::new(path))
    }

    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(FileFault::new(path))
    }

    pub fn loop_detected(path: impl Into<String>) -> Self {
        Self::FileSystemLoop(FileFault::new(path))
    }

    pub fn atomic_move_not_supported(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::AtomicMoveNotSupported(FileFault::new(source).with_other(target))
    }

    pub fn not_link(path: impl Into<String>) -> Self {
        Self::NotLink(FileFault::new(path))
    }

    pub fn is_directory(path: impl Into<String>) -> Self {
        Self::IsDirectory(FileFault::new(path))
    }

    pub fn invalid_name(path: impl Into<String>) -> Self {
        Self::InvalidName(FileFault::new(path))
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn interrupted(what: impl Into<String>) -> Self {
        Self::Interrupted(what.into())
    }

    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed(what.into())
    }

    pub fn read_only(path: impl Into<String>) -> Self {
        Self::AccessDenied(FileFault::new(path).with_reason("read-only file system"))
    }

    /// Catch-all error about a path.
    pub fn file_system(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FileSystem(FileFault::new(path).with_reason(reason))
    }

    /// Catch-all error with no particular path.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::FileSystem(FileFault::new(msg))
    }

    /// Kind of the primary error.
    pub fn kind(&self) -> VfsErrorKind {
        match self {
            VfsError::AccessDenied(_) => VfsErrorKind::AccessDenied,
            VfsError::NoSuchFile(_) => VfsErrorKind::NoSuchFile,
            VfsError::FileAlreadyExists(_) => VfsErrorKind::FileAlreadyExists,
            VfsError::NotDirectory(_) => VfsErrorKind::NotDirectory,
            VfsError::DirectoryNotEmpty(_) => VfsErrorKind::DirectoryNotEmpty,
            VfsError::FileSystemLoop(_) => VfsErrorKind::FileSystemLoop,
            VfsError::AtomicMoveNotSupported(_) => VfsErrorKind::AtomicMoveNotSupported,
            VfsError::NotLink(_) => VfsErrorKind::NotLink,
            VfsError::IsDirectory(_) => VfsErrorKind::IsDirectory,
            VfsError::InvalidName(_) => VfsErrorKind::InvalidName,
            VfsError::Unsupported(_) => VfsErrorKind::Unsupported,
            VfsError::Interrupted(_) => VfsErrorKind::Interrupted,
            VfsError::Closed(_) => VfsErrorKind::Closed,
            VfsError::FileSystem(_) => VfsErrorKind::FileSystem,
            VfsError::Suppressed { primary, .. } => primary.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == VfsErrorKind::NoSuchFile
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind() == VfsErrorKind::Unsupported
    }

    /// Attach a secondary failure without replacing this error.
    pub fn with_suppressed(self, secondary: VfsError) -> Self {
        match self {
            VfsError::Suppressed {
                primary,
                mut suppressed,
            } => {
                suppressed.push(secondary);
                VfsError::Suppressed {
                    primary,
                    suppressed,
                }
            }
            primary => VfsError::Suppressed {
                primary: Box::new(primary),
                suppressed: vec![secondary],
            },
        }
    }

    /// Secondary failures attached via [`VfsError::with_suppressed`].
    pub fn suppressed(&self) -> &[VfsError] {
        match self {
            VfsError::Suppressed { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Translate an I/O error about `path` into the taxonomy.
    pub fn from_io(err: io::Error, path: impl Into<String>) -> Self {
        let fault = FileFault::new(path).with_reason(err.to_string());
        #[cfg(unix)]
        if let Some(errno) = rustix::io::Errno::from_io_error(&err) {
            use rustix::io::Errno;
            match errno {
                Errno::LOOP => return VfsError::FileSystemLoop(fault),
                Errno::NOTEMPTY => return VfsError::DirectoryNotEmpty(fault),
                Errno::NOTDIR => return VfsError::NotDirectory(fault),
                Errno::ISDIR => return VfsError::IsDirectory(fault),
                Errno::NAMETOOLONG | Errno::INVAL => return VfsError::InvalidName(fault),
                Errno::XDEV => return VfsError::Unsupported(fault.to_string()),
                _ => {}
            }
        }
        match err.kind() {
            io::ErrorKind::NotFound => VfsError::NoSuchFile(fault),
            io::ErrorKind::PermissionDenied => VfsError::AccessDenied(fault),
            io::ErrorKind::AlreadyExists => VfsError::FileAlreadyExists(fault),
            io::ErrorKind::NotADirectory => VfsError::NotDirectory(fault),
            io::ErrorKind::IsADirectory => VfsError::IsDirectory(fault),
            io::ErrorKind::DirectoryNotEmpty => VfsError::DirectoryNotEmpty(fault),
            io::ErrorKind::Interrupted => VfsError::Interrupted(fault.to_string()),
            io::ErrorKind::Unsupported => VfsError::Unsupported(fault.to_string()),
            _ => VfsError::FileSystem(fault),
        }
    }
}

impl From<io::Error> for VfsError {
    fn from(err: io::Error) -> Self {
        VfsError::from_io(err, "")
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        let kind = match e.kind() {
            VfsErrorKind::NoSuchFile => io::ErrorKind::NotFound,
            VfsErrorKind::AccessDenied => io::ErrorKind::PermissionDenied,
            VfsErrorKind::FileAlreadyExists => io::ErrorKind::AlreadyExists,
            VfsErrorKind::NotDirectory => io::ErrorKind::NotADirectory,
            VfsErrorKind::IsDirectory => io::ErrorKind::IsADirectory,
            VfsErrorKind::DirectoryNotEmpty => io::ErrorKind::DirectoryNotEmpty,
            VfsErrorKind::InvalidName => io::ErrorKind::InvalidInput,
            VfsErrorKind::Interrupted => io::ErrorKind::Interrupted,
            VfsErrorKind::Unsupported | VfsErrorKind::AtomicMoveNotSupported => {
                io::ErrorKind::Unsupported
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = FileFault::new("/a").with_other("/b").with_reason("busy");
        assert_eq!(fault.to_string(), "/a -> /b: busy");
        assert_eq!(FileFault::new("/a").to_string(), "/a");
    }

    #[test]
    fn test_suppressed_keeps_primary_kind() {
        let err = VfsError::no_such_file("/src")
            .with_suppressed(VfsError::access_denied("/dst"))
            .with_suppressed(VfsError::other("late"));
        assert_eq!(err.kind(), VfsErrorKind::NoSuchFile);
        assert_eq!(err.suppressed().len(), 2);
        assert_eq!(err.suppressed()[0].kind(), VfsErrorKind::AccessDenied);
    }

    #[test]
    fn test_from_io_kinds() {
        let err = VfsError::from_io(io::Error::from(io::ErrorKind::NotFound), "/x");
        assert!(err.is_not_found());

        let err = VfsError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "/x");
        assert_eq!(err.kind(), VfsErrorKind::AccessDenied);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_io_errno() {
        let err = VfsError::from_io(io::Error::from_raw_os_error(rustix::io::Errno::LOOP.raw_os_error()), "/x");
        assert_eq!(err.kind(), VfsErrorKind::FileSystemLoop);

        let err = VfsError::from_io(io::Error::from_raw_os_error(rustix::io::Errno::NOTEMPTY.raw_os_error()), "/x");
        assert_eq!(err.kind(), VfsErrorKind::DirectoryNotEmpty);
    }

    #[test]
    fn test_into_io() {
        let io_err: io::Error = VfsError::already_exists("/x").into();
        assert_eq!(io_err.kind(), io::ErrorKind::AlreadyExists);
    }
}
