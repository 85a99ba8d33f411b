//! omnifs: one filesystem API over local disks, archives, platform document
//! trees, content resolvers, FTP and WebDAV servers.

pub mod config;
pub mod testing;
pub mod vfs;

pub use config::OmnifsConfig;
pub use vfs::{FileSystem, Registry, Uri, VfsError, VfsPath, VfsResult};
