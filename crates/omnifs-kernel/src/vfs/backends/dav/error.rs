use std::io;

use thiserror::Error;

use crate::vfs::error::{FileFault, VfsError};

/// Errors from a WebDAV transport.
#[derive(Debug, Error)]
pub enum DavError {
    #[error("HTTP {status} for {method} {url}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Response(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DavError {
    pub fn status(method: &'static str, url: impl Into<String>, status: u16) -> Self {
        DavError::Status {
            method,
            url: url.into(),
            status,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DavError::Status { status, .. } => Some(*status),
            DavError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn into_vfs(self, path: impl Into<String>) -> VfsError {
        let path = path.into();
        let reason = self.to_string();
        let fault = FileFault::new(path).with_reason(reason);
        match self.status_code() {
            Some(401 | 403 | 423) => VfsError::AccessDenied(fault),
            // 409 Conflict: an intermediate collection is missing.
            Some(404 | 409 | 410) => VfsError::NoSuchFile(fault),
            // 412 Precondition Failed: Overwrite: F and the target exists.
            Some(412) => VfsError::FileAlreadyExists(fault),
            Some(501) => VfsError::Unsupported(fault.to_string()),
            _ => match self {
                DavError::Io(e) => VfsError::from_io(e, fault.file),
                _ => VfsError::FileSystem(fault),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::error::VfsErrorKind;

    #[test]
    fn test_status_mapping() {
        let kind = |status| DavError::status("GET", "http://h/x", status).into_vfs("/x").kind();
        assert_eq!(kind(401), VfsErrorKind::AccessDenied);
        assert_eq!(kind(403), VfsErrorKind::AccessDenied);
        assert_eq!(kind(404), VfsErrorKind::NoSuchFile);
        assert_eq!(kind(409), VfsErrorKind::NoSuchFile);
        assert_eq!(kind(412), VfsErrorKind::FileAlreadyExists);
        assert_eq!(kind(501), VfsErrorKind::Unsupported);
        assert_eq!(kind(500), VfsErrorKind::FileSystem);
        assert_eq!(
            DavError::Response("bad xml".into()).into_vfs("/x").kind(),
            VfsErrorKind::FileSystem
        );
    }
}
