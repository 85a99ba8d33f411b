//! Core VFS types.
//!
//! These are the backend-neutral value types that every filesystem
//! translates its native metadata into.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::path::ByteString;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Device, socket, fifo, or anything else.
    Other,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::Regular)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }

    /// Decode the type bits of a POSIX `st_mode`.
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o100000 => FileType::Regular,
            0o040000 => FileType::Directory,
            0o120000 => FileType::Symlink,
            _ => FileType::Other,
        }
    }
}

/// Backend-defined identity used for same-file comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileKey {
    /// Device and inode number.
    Inode { dev: u64, ino: u64 },
    /// Opaque identifier such as a document id, archive entry path or URL.
    Opaque(String),
}

/// A POSIX user or group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixPrincipal {
    pub id: u32,
    pub name: Option<ByteString>,
}

/// File metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub key: FileKey,
    pub file_type: FileType,
    /// Size in bytes.
    pub size: u64,
    pub last_modified: SystemTime,
    pub last_access: Option<SystemTime>,
    pub creation: Option<SystemTime>,
    /// POSIX permission bits (e.g. `0o644`), without type bits.
    pub mode: Option<u32>,
    pub owner: Option<PosixPrincipal>,
    pub group: Option<PosixPrincipal>,
    /// MIME type, for backends that track one.
    pub mime_type: Option<String>,
    /// Entry is encrypted (archive entries).
    pub encrypted: bool,
}

impl FileMetadata {
    /// Metadata with only the required fields populated.
    pub fn new(key: FileKey, file_type: FileType, size: u64, last_modified: SystemTime) -> Self {
        Self {
            key,
            file_type,
            size,
            last_modified,
            last_access: None,
            creation: None,
            mode: None,
            owner: None,
            group: None,
            mime_type: None,
            encrypted: false,
        }
    }

    pub fn is_file(&self) -> bool {
        self.file_type.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type.is_symlink()
    }
}

/// Directory entry.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Entry name (not full path).
    pub name: ByteString,
    /// Entry type, when the backend knows it without another round-trip.
    pub file_type: Option<FileType>,
    /// Full metadata, when the listing already carried it.
    pub metadata: Option<FileMetadata>,
}

impl DirectoryEntry {
    pub fn new(name: impl Into<ByteString>) -> Self {
        Self {
            name: name.into(),
            file_type: None,
            metadata: None,
        }
    }

    pub fn with_metadata(name: impl Into<ByteString>, metadata: FileMetadata) -> Self {
        Self {
            name: name.into(),
            file_type: Some(metadata.file_type),
            metadata: Some(metadata),
        }
    }
}

/// Open options, validated per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate_existing: bool,
    /// Create if not exists.
    pub create: bool,
    /// Create, failing if the file exists.
    pub create_new: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            truncate_existing: false,
            create: false,
            create_new: false,
        }
    }
}

impl OpenOptions {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write, creating or truncating.
    pub fn write() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate_existing: true,
            ..Default::default()
        }
    }

    /// Write, failing if the file exists.
    pub fn create_new() -> Self {
        Self {
            read: false,
            write: true,
            create_new: true,
            ..Default::default()
        }
    }

    /// Append, creating if missing.
    pub fn append() -> Self {
        Self {
            read: false,
            write: true,
            append: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn is_write(&self) -> bool {
        self.write || self.append
    }

    /// Whether opening may create the file.
    pub fn may_create(&self) -> bool {
        self.create || self.create_new
    }

    /// Whether the existing content is discarded or never existed, so a
    /// backend without random-access writes can stream the whole file.
    pub fn is_whole_file_write(&self) -> bool {
        self.truncate_existing || self.create_new
    }
}

/// Progress callback receiving cumulative bytes copied.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Copy and move options.
#[derive(Clone)]
pub struct CopyOptions {
    pub replace_existing: bool,
    /// Also copy POSIX mode bits where both sides support them.
    pub copy_attributes: bool,
    /// Move only.
    pub atomic_move: bool,
    pub no_follow_links: bool,
    /// Minimum interval between progress callbacks.
    pub progress_interval: Duration,
    pub progress: Option<ProgressCallback>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            replace_existing: false,
            copy_attributes: false,
            atomic_move: false,
            no_follow_links: false,
            progress_interval: Duration::from_millis(200),
            progress: None,
        }
    }
}

impl CopyOptions {
    pub fn replace_existing(mut self) -> Self {
        self.replace_existing = true;
        self
    }

    pub fn atomic_move(mut self) -> Self {
        self.atomic_move = true;
        self
    }

    pub fn copy_attributes(mut self) -> Self {
        self.copy_attributes = true;
        self
    }

    pub fn no_follow_links(mut self) -> Self {
        self.no_follow_links = true;
        self
    }

    pub fn with_progress(mut self, interval: Duration, callback: ProgressCallback) -> Self {
        self.progress_interval = interval;
        self.progress = Some(callback);
        self
    }
}

impl fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOptions")
            .field("replace_existing", &self.replace_existing)
            .field("copy_attributes", &self.copy_attributes)
            .field("atomic_move", &self.atomic_move)
            .field("no_follow_links", &self.no_follow_links)
            .field("progress_interval", &self.progress_interval)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// File store (volume) information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStore {
    /// Store name, e.g. a device, host or archive file name.
    pub name: String,
    /// Store type, e.g. "ext4", "ftp", "zip".
    pub store_type: String,
    pub read_only: bool,
    pub total_space: u64,
    pub usable_space: u64,
    pub unallocated_space: u64,
    pub block_size: u64,
}

/// The closed set of backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    Local,
    Archive,
    Document,
    Content,
    Ftp,
    Dav,
}

impl BackendKind {
    /// URI schemes served by this kind.
    pub fn schemes(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Local => &["file"],
            BackendKind::Archive => &["archive"],
            BackendKind::Document => &["document"],
            BackendKind::Content => &["content"],
            BackendKind::Ftp => &["ftp", "ftps", "ftpes"],
            BackendKind::Dav => &["dav", "davs"],
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        const ALL: [BackendKind; 6] = [
            BackendKind::Local,
            BackendKind::Archive,
            BackendKind::Document,
            BackendKind::Content,
            BackendKind::Ftp,
            BackendKind::Dav,
        ];
        ALL.into_iter()
            .find(|kind| kind.schemes().iter().any(|s| s.eq_ignore_ascii_case(scheme)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(FileType::from_mode(0o100644), FileType::Regular);
        assert_eq!(FileType::from_mode(0o040755), FileType::Directory);
        assert_eq!(FileType::from_mode(0o120777), FileType::Symlink);
        assert_eq!(FileType::from_mode(0o020666), FileType::Other);
    }

    #[test]
    fn test_open_options() {
        let read = OpenOptions::read();
        assert!(read.read);
        assert!(!read.is_write());

        let write = OpenOptions::write();
        assert!(write.is_write());
        assert!(write.is_whole_file_write());

        let append = OpenOptions::append();
        assert!(append.is_write());
        assert!(!append.is_whole_file_write());
        assert!(append.may_create());
    }

    #[test]
    fn test_copy_options_builder() {
        let options = CopyOptions::default().replace_existing().atomic_move();
        assert!(options.replace_existing);
        assert!(options.atomic_move);
        assert!(!options.copy_attributes);
        assert!(options.progress.is_none());
    }

    #[test]
    fn test_backend_kind_schemes() {
        assert_eq!(BackendKind::from_scheme("ftpes"), Some(BackendKind::Ftp));
        assert_eq!(BackendKind::from_scheme("DAVS"), Some(BackendKind::Dav));
        assert_eq!(BackendKind::from_scheme("gopher"), None);
        assert_eq!(BackendKind::Archive.to_string(), "archive");
        assert_eq!(BackendKind::from_str("document").unwrap(), BackendKind::Document);
    }

    #[test]
    fn test_directory_entry_with_metadata() {
        let meta = FileMetadata::new(
            FileKey::Opaque("x".into()),
            FileType::Directory,
            0,
            SystemTime::UNIX_EPOCH,
        );
        let entry = DirectoryEntry::with_metadata("x", meta);
        assert_eq!(entry.file_type, Some(FileType::Directory));
        assert!(entry.metadata.is_some());
    }
}
