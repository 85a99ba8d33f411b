//! Archive backend: browse tar, tar.zst, tar.xz and zip archives stored on
//! any other backend, and build new tar-family archives.

pub mod codec;
mod create;
mod entry;
mod error;
pub mod fs;
mod tree;
pub mod writer;

use std::sync::{Arc, Weak};

pub use codec::ArchiveFormat;
pub use create::create_archive;
pub use entry::ArchiveEntry;
pub use error::ArchiveError;
pub use fs::{ArchiveFileSystem, archive_of, archive_root};
pub use tree::{EntryTree, TreeEntry};

use crate::config::OmnifsConfig;
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::FileSystem;
use crate::vfs::registry::{FileSystemProvider, Registry};
use crate::vfs::types::BackendKind;
use crate::vfs::uri::Uri;

/// Provider for the `archive` scheme.
///
/// Holds the registry weakly: archive filesystems read their archive file
/// through the registry, and the registry owns this provider.
pub struct ArchiveProvider {
    registry: Weak<Registry>,
    config: OmnifsConfig,
}

impl ArchiveProvider {
    pub fn new(registry: Weak<Registry>, config: OmnifsConfig) -> Self {
        Self { registry, config }
    }
}

impl FileSystemProvider for ArchiveProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Archive
    }

    fn new_file_system(&self, root: Arc<Uri>) -> VfsResult<Arc<dyn FileSystem>> {
        if root.encoded_path() != "/" || root.encoded_query().is_some() {
            return Err(VfsError::file_system(
                root.to_string(),
                "archive root must have path / and no query",
            ));
        }
        let archive = archive_of(&root)?;
        if archive.scheme() == Some("archive") {
            tracing::debug!(root = %root, "nested archive");
        }
        Ok(Arc::new(ArchiveFileSystem::new(
            root,
            archive,
            self.registry.clone(),
            self.config.archive.clone(),
        )))
    }
}
