//! Document-tree backend over a platform [`DocumentProvider`].
//!
//! Roots look like `document://<authority>/?tree=<tree document id>`. Paths
//! are resolved to document ids by walking children by display name; the
//! ids and the rows of the latest listing are cached.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::cursor::{CursorRow, ResolverError, columns};
use crate::config::CacheConfig;
use crate::vfs::cache::BoundedCache;
use crate::vfs::content::{BoxReader, BoxWriter, DirectoryStream};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{FileSystem, FsHandle};
use crate::vfs::path::VfsPath;
use crate::vfs::registry::FileSystemProvider;
use crate::vfs::types::{
    BackendKind, CopyOptions, DirectoryEntry, FileKey, FileMetadata, FileStore, FileType,
    OpenOptions,
};
use crate::vfs::uri::Uri;

/// MIME type marking a directory document.
pub const DIRECTORY_MIME_TYPE: &str = "vnd.android.document/directory";

/// Capability bits in the `flags` column.
pub mod flags {
    pub const SUPPORTS_WRITE: i64 = 1 << 1;
    pub const SUPPORTS_DELETE: i64 = 1 << 2;
    pub const DIR_SUPPORTS_CREATE: i64 = 1 << 3;
    pub const SUPPORTS_RENAME: i64 = 1 << 6;
    pub const SUPPORTS_COPY: i64 = 1 << 7;
    pub const SUPPORTS_MOVE: i64 = 1 << 8;
}

/// How an existing document is opened for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Discard existing content.
    Truncate,
    Append,
    /// Write from the start without truncating.
    Overwrite,
}

impl WriteMode {
    fn for_options(options: &OpenOptions) -> Self {
        if options.append {
            WriteMode::Append
        } else if options.truncate_existing {
            WriteMode::Truncate
        } else {
            WriteMode::Overwrite
        }
    }
}

/// Platform document provider. Every call names the provider authority the
/// tree lives under.
#[async_trait]
pub trait DocumentProvider: Send + Sync + fmt::Debug {
    /// Row with [`columns::DOCUMENT_ID`], display name, MIME type, size,
    /// last-modified and flags.
    async fn query_document(&self, authority: &str, id: &str) -> Result<CursorRow, ResolverError>;

    async fn query_children(
        &self,
        authority: &str,
        parent_id: &str,
    ) -> Result<Vec<CursorRow>, ResolverError>;

    /// Returns the new document's id.
    async fn create_document(
        &self,
        authority: &str,
        parent_id: &str,
        mime_type: &str,
        display_name: &str,
    ) -> Result<String, ResolverError>;

    async fn delete_document(&self, authority: &str, id: &str) -> Result<(), ResolverError>;

    /// Returns the document's id after the rename, which may change.
    async fn rename_document(
        &self,
        authority: &str,
        id: &str,
        display_name: &str,
    ) -> Result<String, ResolverError>;

    async fn copy_document(
        &self,
        authority: &str,
        id: &str,
        target_parent_id: &str,
    ) -> Result<String, ResolverError> {
        let _ = (authority, target_parent_id);
        Err(ResolverError::Unsupported(format!("copy {id}")))
    }

    async fn move_document(
        &self,
        authority: &str,
        id: &str,
        source_parent_id: &str,
        target_parent_id: &str,
    ) -> Result<String, ResolverError> {
        let _ = (authority, source_parent_id, target_parent_id);
        Err(ResolverError::Unsupported(format!("move {id}")))
    }

    async fn open_read(&self, authority: &str, id: &str) -> Result<BoxReader, ResolverError>;

    async fn open_write(
        &self,
        authority: &str,
        id: &str,
        mode: WriteMode,
    ) -> Result<BoxWriter, ResolverError>;
}

/// Root URI for a document tree.
pub fn document_root(authority: &str, tree_id: &str) -> Result<Uri, crate::vfs::uri::UriError> {
    Uri::builder()
        .scheme("document")
        .host(authority)
        .path("/")
        .append_query_parameter("tree", tree_id)
        .build()
}

pub(crate) fn mime_for(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Provider for the `document` scheme.
#[derive(Debug)]
pub struct DocumentTreeProvider {
    documents: Arc<dyn DocumentProvider>,
    cache: CacheConfig,
}

impl DocumentTreeProvider {
    pub fn new(documents: Arc<dyn DocumentProvider>, cache: CacheConfig) -> Self {
        Self { documents, cache }
    }
}

impl FileSystemProvider for DocumentTreeProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn new_file_system(&self, root: Arc<Uri>) -> VfsResult<Arc<dyn FileSystem>> {
        let authority = root
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| VfsError::file_system(root.to_string(), "document root needs an authority"))?
            .to_string();
        let tree_id = root
            .query_parameter("tree")
            .ok_or_else(|| VfsError::file_system(root.to_string(), "document root needs a tree"))?;
        Ok(Arc::new(DocumentFileSystem {
            handle: FsHandle::new(root),
            authority,
            tree_id,
            documents: self.documents.clone(),
            ids: BoundedCache::new(self.cache.id_capacity),
            listed: BoundedCache::new(self.cache.listing_capacity),
        }))
    }
}

#[derive(Debug)]
pub struct DocumentFileSystem {
    handle: FsHandle,
    authority: String,
    tree_id: String,
    documents: Arc<dyn DocumentProvider>,
    ids: BoundedCache<VfsPath, String>,
    /// Rows from the latest listing, consumed by the next metadata lookup.
    listed: BoundedCache<VfsPath, CursorRow>,
}

impl DocumentFileSystem {
    fn display_name(path: &VfsPath) -> VfsResult<&str> {
        let name = path
            .file_name()
            .ok_or_else(|| VfsError::invalid_name(path.to_string()))?;
        std::str::from_utf8(name.as_bytes()).map_err(|_| VfsError::invalid_name(path.to_string()))
    }

    fn invalidate(&self, path: &VfsPath) {
        self.ids.remove_where(|p| p.starts_with(path));
        self.listed.remove_where(|p| p.starts_with(path));
    }

    /// Translate a provider failure. Cached ids may be what made it fail,
    /// so everything cached is dropped.
    fn fail(&self, err: ResolverError, path: &VfsPath) -> VfsError {
        debug!(path = %path, error = %err, "document provider failed, dropping caches");
        self.ids.clear();
        self.listed.clear();
        err.into_vfs(path.to_string())
    }

    fn row_metadata(row: &CursorRow, id: &str) -> FileMetadata {
        let mime = row.text(columns::MIME_TYPE);
        let file_type = if mime == Some(DIRECTORY_MIME_TYPE) {
            FileType::Directory
        } else {
            FileType::Regular
        };
        let mut meta = FileMetadata::new(
            FileKey::Opaque(id.to_string()),
            file_type,
            row.integer(columns::SIZE)
                .and_then(|s| u64::try_from(s).ok())
                .unwrap_or(0),
            row.time_millis(columns::LAST_MODIFIED)
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        );
        meta.mime_type = mime.map(str::to_string);
        meta
    }

    fn row_flags(row: &CursorRow) -> i64 {
        row.integer(columns::FLAGS).unwrap_or(0)
    }

    /// Document id of `path`, walking down from the tree root.
    async fn resolve_id(&self, path: &VfsPath) -> VfsResult<String> {
        let mut current = VfsPath::root_of(self.handle.root().clone());
        let mut id = self.tree_id.clone();
        for name in path.names() {
            current = current.resolve_name(name.as_bytes());
            id = match self.ids.get(&current) {
                Some(id) => id,
                None => self.find_child(&id, &current).await?,
            };
        }
        Ok(id)
    }

    async fn find_child(&self, parent_id: &str, child: &VfsPath) -> VfsResult<String> {
        let name = Self::display_name(child)?;
        let parent = child.parent().unwrap_or_else(|| child.clone());
        let rows = self
            .documents
            .query_children(&self.authority, parent_id)
            .await
            .map_err(|e| self.fail(e, &parent))?;
        let mut found = None;
        for row in rows {
            let (Some(row_name), Some(row_id)) =
                (row.text(columns::DISPLAY_NAME), row.text(columns::DOCUMENT_ID))
            else {
                continue;
            };
            let sibling = match parent.try_resolve_name(row_name) {
                Ok(sibling) => sibling,
                Err(_) => {
                    debug!(name = row_name, id = row_id, "skipping document with unusable name");
                    continue;
                }
            };
            self.ids.insert(sibling, row_id.to_string());
            if row_name == name {
                found = Some(row_id.to_string());
            }
        }
        found.ok_or_else(|| VfsError::no_such_file(child.to_string()))
    }

    async fn query(&self, path: &VfsPath) -> VfsResult<(String, CursorRow)> {
        let id = self.resolve_id(path).await?;
        let row = self
            .documents
            .query_document(&self.authority, &id)
            .await
            .map_err(|e| self.fail(e, path))?;
        Ok((id, row))
    }

    fn parent_of(path: &VfsPath) -> VfsResult<VfsPath> {
        path.parent()
            .ok_or_else(|| VfsError::already_exists(path.to_string()))
    }

    async fn create(&self, path: &VfsPath, mime_type: &str) -> VfsResult<String> {
        let name = Self::display_name(path)?;
        let parent = Self::parent_of(path)?;
        let parent_id = self.resolve_id(&parent).await?;
        let id = self
            .documents
            .create_document(&self.authority, &parent_id, mime_type, name)
            .await
            .map_err(|e| self.fail(e, path))?;
        self.listed.remove(path);
        self.ids.insert(path.clone(), id.clone());
        Ok(id)
    }

    /// Rename after a copy or move landed under the source's name.
    async fn finish_placement(&self, id: String, source: &VfsPath, target: &VfsPath) -> VfsResult<String> {
        if source.file_name() == target.file_name() {
            return Ok(id);
        }
        let name = Self::display_name(target)?;
        self.documents
            .rename_document(&self.authority, &id, name)
            .await
            .map_err(|e| self.fail(e, target))
    }
}

#[async_trait]
impl FileSystem for DocumentFileSystem {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn root_uri(&self) -> &Arc<Uri> {
        self.handle.root()
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn close(&self) -> VfsResult<()> {
        self.handle.mark_closed();
        self.ids.clear();
        self.listed.clear();
        Ok(())
    }

    async fn metadata(&self, path: &VfsPath, _follow_links: bool) -> VfsResult<FileMetadata> {
        let path = self.handle.check(path)?;
        if let Some(row) = self.listed.take(&path) {
            if let Some(id) = row.text(columns::DOCUMENT_ID) {
                return Ok(Self::row_metadata(&row, id));
            }
        }
        let (id, row) = self.query(&path).await?;
        Ok(Self::row_metadata(&row, &id))
    }

    async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream> {
        let checked = self.handle.check(dir)?;
        let (id, row) = self.query(&checked).await?;
        if row.text(columns::MIME_TYPE) != Some(DIRECTORY_MIME_TYPE) {
            return Err(VfsError::not_directory(dir.to_string()));
        }
        let rows = self
            .documents
            .query_children(&self.authority, &id)
            .await
            .map_err(|e| self.fail(e, &checked))?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let (Some(name), Some(child_id)) =
                (row.text(columns::DISPLAY_NAME), row.text(columns::DOCUMENT_ID))
            else {
                continue;
            };
            let child = match checked.try_resolve_name(name) {
                Ok(child) => child,
                Err(_) => {
                    debug!(name, id = child_id, "skipping document with unusable name");
                    continue;
                }
            };
            let meta = Self::row_metadata(&row, child_id);
            self.ids.insert(child.clone(), child_id.to_string());
            entries.push(DirectoryEntry::with_metadata(name, meta));
            self.listed.insert(child, row);
        }
        Ok(DirectoryStream::from_entries(dir.clone(), entries))
    }

    async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader> {
        let path = self.handle.check(path)?;
        let (id, row) = self.query(&path).await?;
        if row.text(columns::MIME_TYPE) == Some(DIRECTORY_MIME_TYPE) {
            return Err(VfsError::is_directory(path.to_string()));
        }
        self.documents
            .open_read(&self.authority, &id)
            .await
            .map_err(|e| self.fail(e, &path))
    }

    async fn file_store(&self, path: &VfsPath) -> VfsResult<FileStore> {
        self.handle.check(path)?;
        Ok(FileStore {
            name: self.authority.clone(),
            store_type: "document".to_string(),
            ..FileStore::default()
        })
    }

    async fn open_writer(&self, path: &VfsPath, options: OpenOptions) -> VfsResult<BoxWriter> {
        let path = self.handle.check(path)?;
        let (id, mode) = match self.query(&path).await {
            Ok((id, row)) => {
                if options.create_new {
                    return Err(VfsError::already_exists(path.to_string()));
                }
                if row.text(columns::MIME_TYPE) == Some(DIRECTORY_MIME_TYPE) {
                    return Err(VfsError::is_directory(path.to_string()));
                }
                self.listed.remove(&path);
                (id, WriteMode::for_options(&options))
            }
            Err(e) if e.is_not_found() && options.may_create() => {
                let mime = mime_for(Self::display_name(&path)?);
                (self.create(&path, mime).await?, WriteMode::Truncate)
            }
            Err(e) => return Err(e),
        };
        self.documents
            .open_write(&self.authority, &id, mode)
            .await
            .map_err(|e| self.fail(e, &path))
    }

    async fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        match self.resolve_id(&path).await {
            Ok(_) => return Err(VfsError::already_exists(path.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.create(&path, DIRECTORY_MIME_TYPE).await.map(|_| ())
    }

    async fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        if path.name_count() == 0 {
            return Err(VfsError::access_denied(path.to_string()));
        }
        let (id, row) = self.query(&path).await?;
        if row.text(columns::MIME_TYPE) == Some(DIRECTORY_MIME_TYPE) {
            let children = self
                .documents
                .query_children(&self.authority, &id)
                .await
                .map_err(|e| self.fail(e, &path))?;
            if !children.is_empty() {
                return Err(VfsError::directory_not_empty(path.to_string()));
            }
        }
        let result = self.documents.delete_document(&self.authority, &id).await;
        self.invalidate(&path);
        result.map_err(|e| self.fail(e, &path))
    }

    async fn rename(&self, source: &VfsPath, target: &VfsPath) -> VfsResult<()> {
        let source = self.handle.check(source)?;
        let target = self.handle.check(target)?;
        let (id, row) = self.query(&source).await?;
        if Self::row_flags(&row) & flags::SUPPORTS_RENAME == 0 {
            return Err(VfsError::unsupported(format!("rename {source}")));
        }
        let name = Self::display_name(&target)?;
        let renamed = self.documents.rename_document(&self.authority, &id, name).await;
        self.invalidate(&source);
        self.invalidate(&target);
        let new_id = renamed.map_err(|e| self.fail(e, &source))?;
        self.ids.insert(target, new_id);
        Ok(())
    }

    async fn native_copy(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        _options: &CopyOptions,
    ) -> VfsResult<()> {
        let source = self.handle.check(source)?;
        let target = self.handle.check(target)?;
        let (id, row) = self.query(&source).await?;
        // Provider copies are recursive; directories are copied entry by entry.
        if row.text(columns::MIME_TYPE) == Some(DIRECTORY_MIME_TYPE)
            || Self::row_flags(&row) & flags::SUPPORTS_COPY == 0
        {
            return Err(VfsError::unsupported(format!("copy {source}")));
        }
        let target_parent = Self::parent_of(&target)?;
        let parent_id = self.resolve_id(&target_parent).await?;
        let copied = self
            .documents
            .copy_document(&self.authority, &id, &parent_id)
            .await
            .map_err(|e| self.fail(e, &source))?;
        self.invalidate(&target);
        let new_id = match self.finish_placement(copied.clone(), &source, &target).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = self.documents.delete_document(&self.authority, &copied).await {
                    return Err(e.with_suppressed(cleanup.into_vfs(target.to_string())));
                }
                return Err(e);
            }
        };
        self.ids.insert(target, new_id);
        Ok(())
    }

    async fn native_move(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        _options: &CopyOptions,
    ) -> VfsResult<()> {
        let source = self.handle.check(source)?;
        let target = self.handle.check(target)?;
        if source.parent() == target.parent() {
            return self.rename(&source, &target).await;
        }
        let (id, row) = self.query(&source).await?;
        if Self::row_flags(&row) & flags::SUPPORTS_MOVE == 0 {
            return Err(VfsError::unsupported(format!("move {source}")));
        }
        let source_parent_id = self.resolve_id(&Self::parent_of(&source)?).await?;
        let target_parent_id = self.resolve_id(&Self::parent_of(&target)?).await?;
        let moved = self
            .documents
            .move_document(&self.authority, &id, &source_parent_id, &target_parent_id)
            .await;
        self.invalidate(&source);
        self.invalidate(&target);
        let moved = moved.map_err(|e| self.fail(e, &source))?;
        let new_id = self.finish_placement(moved, &source, &target).await?;
        self.ids.insert(target, new_id);
        Ok(())
    }
}
