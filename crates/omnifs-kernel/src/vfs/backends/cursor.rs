//! Query rows and errors shared by the platform-mediated backends.
//!
//! Platform collaborators (document providers, content resolvers) answer
//! queries with owned rows of named columns.

use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::vfs::error::{FileFault, VfsError};

/// Well-known column names.
pub mod columns {
    pub const DOCUMENT_ID: &str = "document_id";
    pub const DISPLAY_NAME: &str = "_display_name";
    pub const MIME_TYPE: &str = "mime_type";
    pub const SIZE: &str = "_size";
    /// Milliseconds since the Unix epoch.
    pub const LAST_MODIFIED: &str = "last_modified";
    pub const FLAGS: &str = "flags";
}

#[derive(Debug, Clone, PartialEq)]
pub enum CursorValue {
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for CursorValue {
    fn from(v: i64) -> Self {
        CursorValue::Integer(v)
    }
}

impl From<&str> for CursorValue {
    fn from(v: &str) -> Self {
        CursorValue::Text(v.to_string())
    }
}

impl From<String> for CursorValue {
    fn from(v: String) -> Self {
        CursorValue::Text(v)
    }
}

/// One result row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorRow {
    columns: Vec<(String, CursorValue)>,
}

impl CursorRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter. Replaces an existing column.
    pub fn with(mut self, column: &str, value: impl Into<CursorValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<CursorValue>) {
        let value = value.into();
        match self.columns.iter_mut().find(|(name, _)| name == column) {
            Some((_, slot)) => *slot = value,
            None => self.columns.push((column.to_string(), value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&CursorValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.get(column)? {
            CursorValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer column. Text holding a number is accepted too.
    pub fn integer(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            CursorValue::Integer(i) => Some(*i),
            CursorValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Millisecond timestamp column.
    pub fn time_millis(&self, column: &str) -> Option<SystemTime> {
        let millis = u64::try_from(self.integer(column)?).ok()?;
        Some(SystemTime::UNIX_EPOCH + Duration::from_millis(millis))
    }

    /// Keep only the named columns.
    pub fn project(&self, projection: &[&str]) -> CursorRow {
        CursorRow {
            columns: self
                .columns
                .iter()
                .filter(|(name, _)| projection.contains(&name.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Failure reported by a platform collaborator.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

impl ResolverError {
    pub fn into_vfs(self, path: impl Into<String>) -> VfsError {
        let path = path.into();
        match self {
            ResolverError::NotFound(reason) => {
                VfsError::NoSuchFile(FileFault::new(path).with_reason(reason))
            }
            ResolverError::PermissionDenied(reason) => {
                VfsError::AccessDenied(FileFault::new(path).with_reason(reason))
            }
            ResolverError::AlreadyExists(reason) => {
                VfsError::FileAlreadyExists(FileFault::new(path).with_reason(reason))
            }
            ResolverError::Unsupported(reason) => {
                VfsError::unsupported(format!("{path}: {reason}"))
            }
            ResolverError::Io(e) => VfsError::from_io(e, path),
            ResolverError::Failed(reason) => VfsError::file_system(path, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::error::VfsErrorKind;

    #[test]
    fn test_row_access() {
        let row = CursorRow::new()
            .with(columns::DISPLAY_NAME, "a.txt")
            .with(columns::SIZE, 12)
            .with(columns::LAST_MODIFIED, "1500")
            .with(columns::SIZE, 13);
        assert_eq!(row.text(columns::DISPLAY_NAME), Some("a.txt"));
        assert_eq!(row.integer(columns::SIZE), Some(13));
        assert_eq!(
            row.time_millis(columns::LAST_MODIFIED),
            Some(SystemTime::UNIX_EPOCH + Duration::from_millis(1500))
        );
        assert_eq!(row.text(columns::SIZE), None);
        assert_eq!(row.project(&[columns::SIZE]).get(columns::DISPLAY_NAME), None);
    }

    #[test]
    fn test_error_mapping() {
        let kind = |e: ResolverError| e.into_vfs("/x").kind();
        assert_eq!(kind(ResolverError::NotFound("gone".into())), VfsErrorKind::NoSuchFile);
        assert_eq!(
            kind(ResolverError::PermissionDenied("no".into())),
            VfsErrorKind::AccessDenied
        );
        assert_eq!(kind(ResolverError::Unsupported("copy".into())), VfsErrorKind::Unsupported);
        assert_eq!(kind(ResolverError::Failed("boom".into())), VfsErrorKind::FileSystem);
    }
}
