//! Filesystem backends.
//!
//! Each backend implements [`FileSystem`](crate::vfs::FileSystem) for one
//! family of URI schemes and ships a
//! [`FileSystemProvider`](crate::vfs::FileSystemProvider) that the registry
//! uses to construct it.

pub mod archive;
pub mod content;
pub mod cursor;
pub mod dav;
pub mod document;
#[cfg(unix)]
pub mod fd_proxy;
pub mod ftp;
pub mod local;

pub use archive::{ArchiveFileSystem, ArchiveProvider};
pub use content::{ContentFileSystem, ContentProvider, ContentResolver};
pub use dav::{DavFileSystem, DavProvider};
pub use document::{DocumentFileSystem, DocumentProvider, DocumentTreeProvider};
pub use ftp::{FtpFileSystem, FtpProvider};
pub use local::{LocalFileSystem, LocalProvider};
