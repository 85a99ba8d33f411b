use std::time::SystemTime;

use crate::vfs::path::ByteString;
use crate::vfs::types::{FileKey, FileMetadata, FileType, PosixPrincipal};

/// One archive member as described by its header.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    /// Name as stored, before resolution against the archive root.
    pub name: ByteString,
    pub encrypted: bool,
    pub last_modified: Option<SystemTime>,
    pub last_access: Option<SystemTime>,
    pub creation: Option<SystemTime>,
    pub file_type: FileType,
    pub size: u64,
    pub owner: Option<PosixPrincipal>,
    pub group: Option<PosixPrincipal>,
    /// Permission bits only.
    pub mode: u32,
    pub symlink_target: Option<ByteString>,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<ByteString>, file_type: FileType, size: u64) -> Self {
        let mode = if file_type.is_dir() { 0o755 } else { 0o644 };
        Self {
            name: name.into(),
            encrypted: false,
            last_modified: None,
            last_access: None,
            creation: None,
            file_type,
            size,
            owner: None,
            group: None,
            mode,
            symlink_target: None,
        }
    }

    /// Zero-size directory standing in for an ancestor with no header.
    pub fn directory(name: impl Into<ByteString>) -> Self {
        Self::new(name, FileType::Directory, 0)
    }

    pub fn symlink(name: impl Into<ByteString>, target: impl Into<ByteString>) -> Self {
        let mut entry = Self::new(name, FileType::Symlink, 0);
        entry.mode = 0o777;
        entry.symlink_target = Some(target.into());
        entry
    }

    pub fn metadata(&self, key: FileKey) -> FileMetadata {
        FileMetadata {
            key,
            file_type: self.file_type,
            size: self.size,
            last_modified: self.last_modified.unwrap_or(SystemTime::UNIX_EPOCH),
            last_access: self.last_access,
            creation: self.creation,
            mode: Some(self.mode),
            owner: self.owner.clone(),
            group: self.group.clone(),
            mime_type: None,
            encrypted: self.encrypted,
        }
    }
}
