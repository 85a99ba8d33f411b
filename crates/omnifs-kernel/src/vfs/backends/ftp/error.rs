use std::io;

use thiserror::Error;

use crate::vfs::error::{FileFault, VfsError};

/// Errors from an FTP session.
#[derive(Debug, Error)]
pub enum FtpError {
    /// The server answered with an unexpected reply.
    #[error("{code} {message}")]
    Reply { code: u16, message: String },
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("tls error: {0}")]
    Tls(String),
}

impl FtpError {
    pub fn reply(code: u16, message: impl Into<String>) -> Self {
        FtpError::Reply {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            FtpError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The control connection can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            FtpError::Io(_) | FtpError::Protocol(_) | FtpError::Tls(_) => true,
            FtpError::Reply { code, .. } => *code == 421,
        }
    }

    pub fn into_vfs(self, path: impl Into<String>) -> VfsError {
        let path = path.into();
        match self {
            FtpError::Reply { code, message } => {
                let fault = FileFault::new(path).with_reason(format!("{code} {message}"));
                match code {
                    530 | 532 => VfsError::AccessDenied(fault),
                    550 => VfsError::NoSuchFile(fault),
                    553 => VfsError::InvalidName(fault),
                    502 | 504 => VfsError::Unsupported(format!("{}: {code} {message}", fault.file)),
                    _ => VfsError::FileSystem(fault),
                }
            }
            FtpError::Io(e) => VfsError::from_io(e, path),
            FtpError::Protocol(reason) | FtpError::Tls(reason) => VfsError::file_system(path, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::error::VfsErrorKind;

    #[test]
    fn test_reply_mapping() {
        let kind = |code| FtpError::reply(code, "x").into_vfs("/f").kind();
        assert_eq!(kind(530), VfsErrorKind::AccessDenied);
        assert_eq!(kind(532), VfsErrorKind::AccessDenied);
        assert_eq!(kind(550), VfsErrorKind::NoSuchFile);
        assert_eq!(kind(553), VfsErrorKind::InvalidName);
        assert_eq!(kind(502), VfsErrorKind::Unsupported);
        assert_eq!(kind(451), VfsErrorKind::FileSystem);
    }

    #[test]
    fn test_fatal() {
        assert!(FtpError::reply(421, "bye").is_fatal());
        assert!(!FtpError::reply(550, "nope").is_fatal());
        assert!(FtpError::Protocol("garbage".into()).is_fatal());
        assert!(FtpError::Tls("bad certificate".into()).is_fatal());
    }
}
