//! Archive codec errors.

use std::io;

use rustix::io::Errno;
use thiserror::Error;

use crate::vfs::error::{FileFault, VfsError};

/// A failure inside the archive codec: the errno, the operation that failed
/// and the library's message.
#[derive(Debug, Error)]
#[error("{operation} failed: {message} ({errno})")]
pub struct ArchiveError {
    pub errno: Errno,
    pub operation: &'static str,
    pub message: String,
}

impl ArchiveError {
    pub fn new(errno: Errno, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            errno,
            operation,
            message: message.into(),
        }
    }

    /// Interrupted I/O becomes `EINTR`; other errors keep their OS errno or
    /// fall back to `EIO`.
    pub fn from_io(operation: &'static str, err: io::Error) -> Self {
        let errno = if err.kind() == io::ErrorKind::Interrupted {
            Errno::INTR
        } else if err.kind() == io::ErrorKind::UnexpectedEof {
            Errno::IO
        } else {
            Errno::from_io_error(&err).unwrap_or(Errno::IO)
        };
        Self::new(errno, operation, err.to_string())
    }

    pub fn from_zip(operation: &'static str, err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Self::from_io(operation, e),
            zip::result::ZipError::UnsupportedArchive(msg)
                if msg == zip::result::ZipError::PASSWORD_REQUIRED =>
            {
                Self::new(Errno::ACCESS, operation, msg)
            }
            zip::result::ZipError::UnsupportedArchive(msg) => {
                Self::new(Errno::NOTSUP, operation, msg)
            }
            zip::result::ZipError::FileNotFound => {
                Self::new(Errno::NOENT, operation, "entry not found")
            }
            other => Self::new(Errno::INVAL, operation, other.to_string()),
        }
    }

    pub fn unsupported(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(Errno::NOTSUP, operation, message)
    }

    pub fn is_interrupted(&self) -> bool {
        self.errno == Errno::INTR
    }

    /// Translate into the VFS taxonomy for `path`.
    pub fn into_vfs(self, path: impl Into<String>) -> VfsError {
        let fault = FileFault::new(path).with_reason(self.to_string());
        match self.errno {
            Errno::INTR => VfsError::Interrupted(fault.to_string()),
            Errno::NOENT => VfsError::NoSuchFile(fault),
            Errno::ACCESS | Errno::PERM => VfsError::AccessDenied(fault),
            Errno::NOTSUP => VfsError::Unsupported(fault.to_string()),
            _ => VfsError::FileSystem(fault),
        }
    }
}

impl From<ArchiveError> for io::Error {
    fn from(err: ArchiveError) -> Self {
        io::Error::from_raw_os_error(err.errno.raw_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::error::VfsErrorKind;

    #[test]
    fn test_interrupted_maps_to_eintr() {
        let err = ArchiveError::from_io("read", io::Error::from(io::ErrorKind::Interrupted));
        assert!(err.is_interrupted());
        assert_eq!(err.into_vfs("/a.tar").kind(), VfsErrorKind::Interrupted);
    }

    #[test]
    fn test_message_names_operation() {
        let err = ArchiveError::new(Errno::IO, "next_header", "truncated header");
        assert!(err.to_string().starts_with("next_header failed: truncated header"));
        assert_eq!(err.into_vfs("/a.tar").kind(), VfsErrorKind::FileSystem);
    }

    #[test]
    fn test_password_required_is_access_denied() {
        let err = ArchiveError::from_zip(
            "open_entry",
            zip::result::ZipError::UnsupportedArchive(zip::result::ZipError::PASSWORD_REQUIRED),
        );
        assert_eq!(err.into_vfs("/a.zip").kind(), VfsErrorKind::AccessDenied);
    }
}
