//! Read-only filesystem over one archive.
//!
//! The root URI is `archive:///` with the archive's own URI, percent-encoded,
//! as fragment. The entry tree is built on first use: local archives are
//! read in place, anything else is spooled once to a temporary file.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::codec::{ArchiveSource, Flow};
use super::error::ArchiveError;
use super::tree::{EntryTree, TreeEntry};
use crate::config::ArchiveConfig;
use crate::vfs::content::{BoxReader, BoxWriter, ChunkReader, DirectoryStream};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{FileSystem, FsHandle};
use crate::vfs::path::{ByteString, VfsPath};
use crate::vfs::registry::Registry;
use crate::vfs::types::{
    BackendKind, DirectoryEntry, FileKey, FileMetadata, FileStore, OpenOptions,
};
use crate::vfs::uri::Uri;

const MAX_SYMLINK_HOPS: usize = 40;
const CHUNK_SIZE: usize = 64 * 1024;

/// Root URI of the filesystem over `archive`.
pub fn archive_root(archive: &Uri) -> Uri {
    Uri::builder()
        .scheme("archive")
        .empty_authority()
        .path("/")
        .decoded_fragment(archive.as_str().as_bytes())
        .build()
        .unwrap_or_else(|e| unreachable!("encoded fragment is always valid: {e}"))
}

/// Archive URI named by an archive root.
pub fn archive_of(root: &Uri) -> VfsResult<Uri> {
    let fragment = root
        .decoded_fragment()
        .ok_or_else(|| VfsError::file_system(root.to_string(), "archive URI has no fragment"))?;
    let text = String::from_utf8(fragment)
        .map_err(|_| VfsError::file_system(root.to_string(), "archive fragment is not UTF-8"))?;
    Uri::parse(&text).map_err(|e| VfsError::file_system(root.to_string(), e.to_string()))
}

struct Loaded {
    source: Arc<ArchiveSource>,
    tree: EntryTree,
}

#[derive(Debug)]
pub struct ArchiveFileSystem {
    handle: FsHandle,
    archive: Uri,
    registry: Weak<Registry>,
    config: ArchiveConfig,
    passwords: Mutex<Vec<String>>,
    state: Mutex<Arc<OnceCell<Arc<Loaded>>>>,
}

impl std::fmt::Debug for Loaded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loaded")
            .field("format", &self.source.format())
            .field("entries", &self.tree.len())
            .finish()
    }
}

impl ArchiveFileSystem {
    pub fn new(
        root: Arc<Uri>,
        archive: Uri,
        registry: Weak<Registry>,
        config: ArchiveConfig,
    ) -> Self {
        let passwords = config.passwords.clone();
        Self {
            handle: FsHandle::new(root),
            archive,
            registry,
            config,
            passwords: Mutex::new(passwords),
            state: Mutex::new(Arc::new(OnceCell::new())),
        }
    }

    /// URI of the archive file itself.
    pub fn archive_uri(&self) -> &Uri {
        &self.archive
    }

    /// Add a password to try on encrypted entries. The entry tree is rebuilt
    /// on next use.
    pub fn add_password(&self, password: impl Into<String>) {
        self.passwords.lock().push(password.into());
        self.reset();
    }

    fn reset(&self) {
        *self.state.lock() = Arc::new(OnceCell::new());
    }

    fn archive_name(&self) -> Vec<u8> {
        VfsPath::from_uri(&self.archive)
            .file_name()
            .map(|n| n.as_bytes().to_vec())
            .unwrap_or_default()
    }

    async fn loaded(&self) -> VfsResult<Arc<Loaded>> {
        let cell = self.state.lock().clone();
        cell.get_or_try_init(|| self.load()).await.cloned()
    }

    async fn load(&self) -> VfsResult<Arc<Loaded>> {
        let source = self.open_source().await?;
        let passwords = self.passwords.lock().clone();
        let root = VfsPath::root_of(self.handle.root().clone());
        let archive = self.archive.to_string();
        let loaded = tokio::task::spawn_blocking(move || {
            let mut tree = EntryTree::new(root);
            source.for_each_entry(&passwords, |index, entry, _| {
                tree.insert(index, entry.clone());
                Ok(Flow::Continue)
            })?;
            Ok::<_, ArchiveError>(Loaded {
                source: Arc::new(source),
                tree,
            })
        })
        .await
        .map_err(|e| VfsError::file_system(archive.clone(), e.to_string()))?
        .map_err(|e| e.into_vfs(archive.clone()))?;
        info!(archive = %archive, entries = loaded.tree.len(), "loaded archive");
        Ok(Arc::new(loaded))
    }

    async fn open_source(&self) -> VfsResult<ArchiveSource> {
        let name = self.archive_name();
        if self.archive.scheme() == Some("file") {
            let native = PathBuf::from(OsStr::from_bytes(&self.archive.decoded_path()));
            return tokio::task::spawn_blocking(move || ArchiveSource::open(native, &name))
                .await
                .map_err(|e| VfsError::file_system(self.archive.to_string(), e.to_string()))?
                .map_err(|e| e.into_vfs(self.archive.to_string()));
        }
        let spool = self.spool().await?;
        ArchiveSource::spooled(spool, &name).map_err(|e| e.into_vfs(self.archive.to_string()))
    }

    /// Copy a non-local archive to a temporary file.
    async fn spool(&self) -> VfsResult<tempfile::TempPath> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| VfsError::closed("registry dropped"))?;
        let archive_path = registry.path(&self.archive)?;
        let spool_dir = self.config.spool_dir.clone().unwrap_or_else(std::env::temp_dir);
        let temp = tempfile::Builder::new()
            .prefix("omnifs-archive-")
            .tempfile_in(&spool_dir)
            .map_err(|e| VfsError::from_io(e, spool_dir.display().to_string()))?;
        let (file, temp_path) = temp.into_parts();
        let spool_name = temp_path.display().to_string();
        debug!(archive = %self.archive, spool = %spool_name, "spooling archive");

        let mut reader = registry.open_reader(&archive_path).await?;
        let mut out = tokio::fs::File::from_std(file);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let copied: VfsResult<()> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])
                    .await
                    .map_err(|e| VfsError::from_io(e, spool_name.clone()))?;
            }
            out.flush()
                .await
                .map_err(|e| VfsError::from_io(e, spool_name.clone()))
        }
        .await;
        let closed = reader.close().await;
        copied?;
        closed?;
        Ok(temp_path)
    }

    fn key(path: &VfsPath) -> FileKey {
        FileKey::Opaque(path.to_uri().to_string())
    }

    /// Find `path`, following symlinks when asked.
    fn lookup<'t>(
        tree: &'t EntryTree,
        path: &VfsPath,
        follow_links: bool,
    ) -> VfsResult<(VfsPath, &'t TreeEntry)> {
        let mut current = path.clone();
        for _ in 0..MAX_SYMLINK_HOPS {
            let found = tree
                .get(&current)
                .ok_or_else(|| VfsError::no_such_file(path.to_string()))?;
            let target = match &found.entry.symlink_target {
                Some(target) if follow_links && found.entry.file_type.is_symlink() => target,
                _ => return Ok((current, found)),
            };
            let base = current.parent().unwrap_or_else(|| tree.root().clone());
            current = base
                .resolve(&VfsPath::parse(tree.root().root_uri().clone(), target.as_bytes()))
                .normalize();
        }
        Err(VfsError::loop_detected(path.to_string()))
    }

    fn entry_metadata(path: &VfsPath, found: &TreeEntry) -> FileMetadata {
        found.entry.metadata(Self::key(path))
    }
}

#[async_trait]
impl FileSystem for ArchiveFileSystem {
    fn kind(&self) -> BackendKind {
        BackendKind::Archive
    }

    fn root_uri(&self) -> &Arc<Uri> {
        self.handle.root()
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn close(&self) -> VfsResult<()> {
        if self.handle.mark_closed() {
            self.reset();
        }
        Ok(())
    }

    async fn metadata(&self, path: &VfsPath, follow_links: bool) -> VfsResult<FileMetadata> {
        let path = self.handle.check(path)?;
        let loaded = self.loaded().await?;
        let (resolved, found) = Self::lookup(&loaded.tree, &path, follow_links)?;
        Ok(Self::entry_metadata(&resolved, found))
    }

    async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream> {
        let checked = self.handle.check(dir)?;
        let loaded = self.loaded().await?;
        let (resolved, found) = Self::lookup(&loaded.tree, &checked, true)?;
        if !found.entry.file_type.is_dir() {
            return Err(VfsError::not_directory(dir.to_string()));
        }
        let entries = loaded
            .tree
            .children(&resolved)
            .iter()
            .filter_map(|child| {
                let name = child.file_name()?.clone();
                let found = loaded.tree.get(child)?;
                Some(DirectoryEntry::with_metadata(
                    name,
                    Self::entry_metadata(child, found),
                ))
            })
            .collect();
        Ok(DirectoryStream::from_entries(dir.clone(), entries))
    }

    async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader> {
        let checked = self.handle.check(path)?;
        let loaded = self.loaded().await?;
        let (_, found) = Self::lookup(&loaded.tree, &checked, true)?;
        if found.entry.file_type.is_dir() {
            return Err(VfsError::is_directory(path.to_string()));
        }
        let Some(index) = found.index.filter(|_| found.entry.file_type.is_file()) else {
            return Err(VfsError::unsupported(format!("not a regular file: {path}")));
        };
        let size = found.entry.size;
        let source = loaded.source.clone();
        let passwords = self.passwords.lock().clone();
        let name = path.to_string();
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        tokio::task::spawn_blocking(move || {
            use std::io::Read as _;
            let mut found = false;
            let result = source.for_each_entry(&passwords, |i, _, data| {
                if i != index {
                    return Ok(Flow::Continue);
                }
                found = true;
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    let n = data
                        .read(&mut buf)
                        .map_err(|e| ArchiveError::from_io("read_data", e))?;
                    if n == 0 {
                        break;
                    }
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        // Reader closed early.
                        break;
                    }
                }
                Ok(Flow::Stop)
            });
            let failure = match result {
                Err(e) => Some(e.into_vfs(name)),
                Ok(()) if !found => Some(VfsError::no_such_file(name)),
                Ok(()) => None,
            };
            if let Some(e) = failure {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(Box::new(ChunkReader::from_channel(rx, Some(size))))
    }

    async fn read_symlink(&self, link: &VfsPath) -> VfsResult<ByteString> {
        let checked = self.handle.check(link)?;
        let loaded = self.loaded().await?;
        let (_, found) = Self::lookup(&loaded.tree, &checked, false)?;
        match (&found.entry.symlink_target, found.entry.file_type.is_symlink()) {
            (Some(target), true) => Ok(target.clone()),
            _ => Err(VfsError::not_link(link.to_string())),
        }
    }

    async fn file_store(&self, path: &VfsPath) -> VfsResult<FileStore> {
        self.handle.check(path)?;
        let loaded = self.loaded().await?;
        let source = loaded.source.clone();
        let total = tokio::task::spawn_blocking(move || source.size())
            .await
            .map_err(|e| VfsError::file_system(path.to_string(), e.to_string()))?
            .map_err(|e| e.into_vfs(self.archive.to_string()))?;
        Ok(FileStore {
            name: self.archive.to_string(),
            store_type: loaded.source.format().to_string(),
            read_only: true,
            total_space: total,
            usable_space: 0,
            unallocated_space: 0,
            block_size: 512,
        })
    }

    async fn open_writer(&self, path: &VfsPath, _options: OpenOptions) -> VfsResult<BoxWriter> {
        Err(VfsError::read_only(path.to_string()))
    }

    async fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        Err(VfsError::read_only(path.to_string()))
    }

    async fn create_symlink(&self, link: &VfsPath, _target: &ByteString) -> VfsResult<()> {
        Err(VfsError::read_only(link.to_string()))
    }

    async fn create_link(&self, link: &VfsPath, _existing: &VfsPath) -> VfsResult<()> {
        Err(VfsError::read_only(link.to_string()))
    }

    async fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        Err(VfsError::read_only(path.to_string()))
    }

    async fn set_last_modified(&self, path: &VfsPath, _time: SystemTime) -> VfsResult<()> {
        Err(VfsError::read_only(path.to_string()))
    }

    async fn set_mode(&self, path: &VfsPath, _mode: u32) -> VfsResult<()> {
        Err(VfsError::read_only(path.to_string()))
    }
}
