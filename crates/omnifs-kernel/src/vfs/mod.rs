//! Virtual filesystem abstraction.
//!
//! Every file is addressed by a [`VfsPath`]: a byte-string path bound to the
//! root [`Uri`] of the filesystem that owns it. Key components:
//!
//! - [`FileSystem`] - per-backend operations
//! - [`Registry`] - routes root URIs to providers and caches one filesystem
//!   per root
//! - [`Transfer`] - copy and move between any two filesystems
//! - [`backends`] - local, archive, document, content, FTP and WebDAV
//!
//! ## Design Decisions
//!
//! - **Byte paths**: names are raw bytes, so non-UTF-8 local names and
//!   Latin-1 FTP listings round-trip unchanged.
//! - **Streams, not handles**: reads and writes are sequential
//!   [`ContentReader`]/[`ContentWriter`] streams. Random access exists only
//!   where a backend has it natively.
//! - **Generic fallback**: cross-backend copy and move are built from
//!   `open_reader`/`open_writer`; backends contribute native primitives
//!   when they have them.

pub mod backends;
pub mod cache;
pub mod content;
pub mod error;
pub mod files;
pub mod ops;
pub mod path;
pub mod registry;
pub mod transfer;
pub mod types;
pub mod uri;

pub use content::{
    BoxReader, BoxWriter, ContentReader, ContentWriter, DirectoryStream, read_to_end,
};
pub use error::{FileFault, VfsError, VfsErrorKind, VfsResult};
pub use ops::{FileSystem, FsHandle};
pub use path::{ByteString, VfsPath};
pub use registry::{CredentialStore, FileSystemProvider, Registry, local_uri};
pub use transfer::Transfer;
pub use types::{
    BackendKind, CopyOptions, DirectoryEntry, FileKey, FileMetadata, FileStore, FileType,
    OpenOptions, PosixPrincipal,
};
pub use uri::{Uri, UriBuilder, UriError};
