//! The per-backend filesystem contract.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;

use super::content::{BoxReader, BoxWriter, DirectoryStream};
use super::error::{VfsError, VfsResult};
use super::path::{ByteString, VfsPath};
use super::types::{BackendKind, CopyOptions, FileMetadata, FileStore, OpenOptions};
use super::uri::Uri;

/// Core filesystem operations.
///
/// One instance serves one root URI. Paths passed in must belong to that
/// root; relative paths are resolved against [`FileSystem::default_directory`].
///
/// The `native_*` and `rename` methods are primitives for the generic
/// copy/move algorithm in [`crate::vfs::transfer`]. They report
/// [`VfsError::Unsupported`] when the backend has no such primitive, which
/// the algorithm treats as "fall back", not as a failure.
#[async_trait]
pub trait FileSystem: Send + Sync + fmt::Debug {
    // ========================================================================
    // Identity and lifecycle
    // ========================================================================

    fn kind(&self) -> BackendKind;

    fn root_uri(&self) -> &Arc<Uri>;

    fn root_path(&self) -> VfsPath {
        VfsPath::root_of(self.root_uri().clone())
    }

    fn default_directory(&self) -> VfsPath {
        self.root_path()
    }

    /// Parse raw path bytes against this filesystem.
    fn path(&self, bytes: &[u8]) -> VfsPath {
        self.default_directory()
            .resolve(&VfsPath::parse(self.root_uri().clone(), bytes))
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn is_open(&self) -> bool;

    /// Close the filesystem. Later operations fail with [`VfsError::Closed`].
    async fn close(&self) -> VfsResult<()>;

    // ========================================================================
    // Reading
    // ========================================================================

    /// Metadata of `path`, following a final symlink when `follow_links`.
    async fn metadata(&self, path: &VfsPath, follow_links: bool) -> VfsResult<FileMetadata>;

    /// Existence is a successful metadata lookup.
    async fn exists(&self, path: &VfsPath) -> bool {
        self.metadata(path, true).await.is_ok()
    }

    async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream>;

    async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader>;

    async fn read_symlink(&self, link: &VfsPath) -> VfsResult<ByteString> {
        Err(VfsError::unsupported(format!("read_symlink {link}")))
    }

    async fn file_store(&self, path: &VfsPath) -> VfsResult<FileStore>;

    /// Two paths of this filesystem denote the same file.
    async fn is_same_file(&self, a: &VfsPath, b: &VfsPath) -> VfsResult<bool> {
        if a == b {
            return Ok(true);
        }
        let left = self.metadata(a, true).await?;
        match self.metadata(b, true).await {
            Ok(right) => Ok(left.key == right.key),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    async fn open_writer(&self, path: &VfsPath, options: OpenOptions) -> VfsResult<BoxWriter>;

    async fn create_directory(&self, path: &VfsPath) -> VfsResult<()>;

    async fn create_symlink(&self, link: &VfsPath, target: &ByteString) -> VfsResult<()> {
        let _ = target;
        Err(VfsError::unsupported(format!("create_symlink {link}")))
    }

    async fn create_link(&self, link: &VfsPath, existing: &VfsPath) -> VfsResult<()> {
        let _ = existing;
        Err(VfsError::unsupported(format!("create_link {link}")))
    }

    /// Delete a file, symlink or empty directory.
    async fn delete(&self, path: &VfsPath) -> VfsResult<()>;

    async fn set_last_modified(&self, path: &VfsPath, time: SystemTime) -> VfsResult<()> {
        let _ = time;
        Err(VfsError::unsupported(format!("set_last_modified {path}")))
    }

    async fn set_mode(&self, path: &VfsPath, mode: u32) -> VfsResult<()> {
        let _ = mode;
        Err(VfsError::unsupported(format!("set_mode {path}")))
    }

    // ========================================================================
    // Native primitives for copy/move
    // ========================================================================

    /// Whether a same-instance move can be guaranteed atomic.
    fn supports_atomic_move(&self) -> bool {
        false
    }

    /// Copy within this filesystem. The target is known to be absent.
    async fn native_copy(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        options: &CopyOptions,
    ) -> VfsResult<()> {
        let _ = options;
        Err(VfsError::unsupported(format!("copy {source} -> {target}")))
    }

    /// Move within this filesystem. The target is known to be absent.
    async fn native_move(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        options: &CopyOptions,
    ) -> VfsResult<()> {
        let _ = options;
        Err(VfsError::unsupported(format!("move {source} -> {target}")))
    }

    /// Rename within the same parent directory.
    async fn rename(&self, source: &VfsPath, target: &VfsPath) -> VfsResult<()> {
        self.native_move(source, target, &CopyOptions::default()).await
    }
}

/// Root identity and open flag shared by backend implementations.
#[derive(Debug)]
pub struct FsHandle {
    root: Arc<Uri>,
    open: AtomicBool,
}

impl FsHandle {
    pub fn new(root: Arc<Uri>) -> Self {
        Self {
            root,
            open: AtomicBool::new(true),
        }
    }

    pub fn root(&self) -> &Arc<Uri> {
        &self.root
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Returns whether this call closed it.
    pub fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    /// Check that the filesystem is open and `path` belongs to it, then
    /// return the path made absolute and normalized.
    pub fn check(&self, path: &VfsPath) -> VfsResult<VfsPath> {
        if !self.is_open() {
            return Err(VfsError::closed(self.root.to_string()));
        }
        if path.root_uri() != &self.root {
            return Err(VfsError::file_system(
                path.to_string(),
                format!("path belongs to {}, not {}", path.root_uri(), self.root),
            ));
        }
        Ok(VfsPath::root_of(self.root.clone()).resolve(path).normalize())
    }
}
