//! `DavFileSystem`: VFS operations as WebDAV requests.
//!
//! Collections are addressed with a trailing slash. A depth-1 PROPFIND
//! fills a one-shot cache so the `metadata` call that usually follows a
//! listing costs no request. Uploads stream through a channel into a
//! spawned PUT; aborting the writer fails the body so nothing lands.

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::error::DavError;
use super::transport::{DavTransport, Depth};
use super::xml::DavResource;
use crate::vfs::cache::BoundedCache;
use crate::vfs::content::{BoxReader, BoxWriter, ChunkReader, ContentWriter, DirectoryStream};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{FileSystem, FsHandle};
use crate::vfs::path::VfsPath;
use crate::vfs::types::{
    BackendKind, CopyOptions, DirectoryEntry, FileKey, FileMetadata, FileStore, FileType,
    OpenOptions,
};
use crate::vfs::uri::Uri;

/// Streams a PUT body to a request running on its own task.
struct DavWriter {
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
    request: Option<JoinHandle<Result<(), DavError>>>,
    path: String,
}

impl DavWriter {
    async fn join(&mut self) -> VfsResult<()> {
        self.tx = None;
        let Some(request) = self.request.take() else {
            return Err(VfsError::closed(self.path.clone()));
        };
        match request.await {
            Ok(result) => result.map_err(|e| e.into_vfs(self.path.clone())),
            Err(e) => Err(VfsError::file_system(
                self.path.clone(),
                format!("upload task failed: {e}"),
            )),
        }
    }
}

#[async_trait]
impl ContentWriter for DavWriter {
    async fn write_all(&mut self, buf: &[u8]) -> VfsResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(VfsError::closed(self.path.clone()));
        };
        if tx.send(Ok(Bytes::copy_from_slice(buf))).await.is_ok() {
            return Ok(());
        }
        // The request ended early; its result says why.
        self.join().await?;
        Err(VfsError::file_system(self.path.clone(), "upload closed early"))
    }

    async fn finish(self: Box<Self>) -> VfsResult<()> {
        let mut this = *self;
        this.join().await
    }

    async fn abort(self: Box<Self>) {
        let mut this = *self;
        if let Some(tx) = this.tx.take() {
            let _ = tx
                .send(Err(io::Error::new(io::ErrorKind::Interrupted, "upload aborted")))
                .await;
        }
        if let Err(e) = this.join().await {
            debug!(path = %this.path, error = %e, "aborted upload");
        }
    }
}

/// A WebDAV server as a filesystem.
#[derive(Debug)]
pub struct DavFileSystem {
    handle: FsHandle,
    /// `http`/`https` root the paths are resolved against.
    base: Uri,
    transport: Arc<dyn DavTransport>,
    propagate_last_modified: bool,
    listed: BoundedCache<VfsPath, DavResource>,
}

impl DavFileSystem {
    pub(crate) fn new(
        root: Arc<Uri>,
        base: Uri,
        transport: Arc<dyn DavTransport>,
        propagate_last_modified: bool,
        listing_capacity: usize,
    ) -> Self {
        Self {
            handle: FsHandle::new(root),
            base,
            transport,
            propagate_last_modified,
            listed: BoundedCache::new(listing_capacity),
        }
    }

    fn url(&self, path: &VfsPath, collection: bool) -> Uri {
        let mut bytes = path.to_byte_string().into_bytes();
        if collection && bytes.last() != Some(&b'/') {
            bytes.push(b'/');
        }
        self.base.with_decoded_path(&bytes)
    }

    fn invalidate(&self, path: &VfsPath) {
        self.listed.remove_where(|p| p.starts_with(path));
    }

    fn fail(&self, err: DavError, path: &VfsPath) -> VfsError {
        self.listed.clear();
        err.into_vfs(path.to_string())
    }

    fn resource_metadata(&self, path: &VfsPath, resource: &DavResource) -> FileMetadata {
        let file_type = if resource.is_collection {
            FileType::Directory
        } else {
            FileType::Regular
        };
        let mut meta = FileMetadata::new(
            FileKey::Opaque(self.url(path, false).to_string()),
            file_type,
            resource.size.unwrap_or(0),
            resource.modified.unwrap_or(SystemTime::UNIX_EPOCH),
        );
        meta.creation = resource.created;
        meta.mime_type = resource.content_type.clone();
        meta
    }

    async fn stat(&self, path: &VfsPath) -> VfsResult<DavResource> {
        if let Some(resource) = self.listed.take(path) {
            return Ok(resource);
        }
        let url = self.url(path, path.name_count() == 0);
        let resources = self
            .transport
            .propfind(&url, Depth::Zero)
            .await
            .map_err(|e| e.into_vfs(path.to_string()))?;
        resources
            .into_iter()
            .next()
            .ok_or_else(|| VfsError::no_such_file(path.to_string()))
    }

    async fn stat_optional(&self, path: &VfsPath) -> VfsResult<Option<DavResource>> {
        match self.stat(path).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Members of a collection, excluding the collection itself.
    async fn members(&self, dir: &VfsPath) -> VfsResult<Vec<(VfsPath, DavResource)>> {
        let url = self.url(dir, true);
        let resources = self
            .transport
            .propfind(&url, Depth::One)
            .await
            .map_err(|e| e.into_vfs(dir.to_string()))?;
        let dir_bytes = dir.to_byte_string();
        let mut members = Vec::new();
        let mut saw_self = false;
        for resource in resources {
            if resource.path == dir_bytes.as_bytes() {
                if !resource.is_collection {
                    return Err(VfsError::not_directory(dir.to_string()));
                }
                saw_self = true;
                continue;
            }
            let child = VfsPath::parse(self.handle.root().clone(), &resource.path).normalize();
            if child.parent().as_ref() != Some(dir) {
                debug!(href = %String::from_utf8_lossy(&resource.path), "skipping foreign member");
                continue;
            }
            members.push((child, resource));
        }
        if !saw_self && members.is_empty() {
            return Err(VfsError::not_directory(dir.to_string()));
        }
        Ok(members)
    }
}

#[async_trait]
impl FileSystem for DavFileSystem {
    fn kind(&self) -> BackendKind {
        BackendKind::Dav
    }

    fn root_uri(&self) -> &Arc<Uri> {
        self.handle.root()
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn close(&self) -> VfsResult<()> {
        self.handle.mark_closed();
        self.listed.clear();
        Ok(())
    }

    async fn metadata(&self, path: &VfsPath, _follow_links: bool) -> VfsResult<FileMetadata> {
        let path = self.handle.check(path)?;
        let resource = self.stat(&path).await?;
        Ok(self.resource_metadata(&path, &resource))
    }

    async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream> {
        let checked = self.handle.check(dir)?;
        let mut entries = Vec::new();
        for (child, resource) in self.members(&checked).await? {
            let Some(name) = child.file_name().cloned() else {
                continue;
            };
            entries.push(DirectoryEntry::with_metadata(
                name,
                self.resource_metadata(&child, &resource),
            ));
            self.listed.insert(child, resource);
        }
        Ok(DirectoryStream::from_entries(dir.clone(), entries))
    }

    async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader> {
        let path = self.handle.check(path)?;
        if self.stat(&path).await?.is_collection {
            return Err(VfsError::is_directory(path.to_string()));
        }
        let download = self
            .transport
            .get(&self.url(&path, false))
            .await
            .map_err(|e| e.into_vfs(path.to_string()))?;
        let name = path.to_string();
        let body = download
            .body
            .map(move |chunk| chunk.map_err(|e| e.into_vfs(name.clone())))
            .boxed();
        Ok(Box::new(ChunkReader::new(body, download.length)))
    }

    async fn file_store(&self, path: &VfsPath) -> VfsResult<FileStore> {
        self.handle.check(path)?;
        Ok(FileStore {
            name: self.base.host().unwrap_or_default().to_string(),
            store_type: "dav".to_string(),
            ..FileStore::default()
        })
    }

    async fn open_writer(&self, path: &VfsPath, options: OpenOptions) -> VfsResult<BoxWriter> {
        let path = self.handle.check(path)?;
        if !options.is_whole_file_write() {
            return Err(VfsError::unsupported(format!(
                "{path}: WebDAV writes replace the whole resource"
            )));
        }
        match self.stat_optional(&path).await? {
            Some(_) if options.create_new => {
                return Err(VfsError::already_exists(path.to_string()));
            }
            Some(resource) if resource.is_collection => {
                return Err(VfsError::is_directory(path.to_string()));
            }
            None if !options.may_create() => return Err(VfsError::no_such_file(path.to_string())),
            _ => {}
        }
        self.invalidate(&path);

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
        let body = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        let transport = self.transport.clone();
        let url = self.url(&path, false);
        let request = tokio::spawn(async move { transport.put(&url, body).await });
        Ok(Box::new(DavWriter {
            tx: Some(tx),
            request: Some(request),
            path: path.to_string(),
        }))
    }

    async fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        if self.stat_optional(&path).await?.is_some() {
            return Err(VfsError::already_exists(path.to_string()));
        }
        let result = self.transport.mkcol(&self.url(&path, true)).await;
        self.invalidate(&path);
        match result {
            Ok(()) => Ok(()),
            // 405: something appeared at the path in the meantime.
            Err(e) if e.status_code() == Some(405) => {
                self.listed.clear();
                Err(VfsError::already_exists(path.to_string()))
            }
            Err(e) => Err(self.fail(e, &path)),
        }
    }

    async fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        if path.name_count() == 0 {
            return Err(VfsError::access_denied(path.to_string()));
        }
        let resource = self.stat(&path).await?;
        if resource.is_collection && !self.members(&path).await?.is_empty() {
            return Err(VfsError::directory_not_empty(path.to_string()));
        }
        let result = self
            .transport
            .delete(&self.url(&path, resource.is_collection))
            .await;
        self.invalidate(&path);
        result.map_err(|e| self.fail(e, &path))
    }

    async fn set_last_modified(&self, path: &VfsPath, time: SystemTime) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        if !self.propagate_last_modified {
            debug!(path = %path, "last-modified propagation disabled");
            return Ok(());
        }
        let result = self
            .transport
            .proppatch_modified(&self.url(&path, false), time)
            .await;
        self.invalidate(&path);
        result.map_err(|e| self.fail(e, &path))
    }

    fn supports_atomic_move(&self) -> bool {
        true
    }

    async fn native_copy(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        _options: &CopyOptions,
    ) -> VfsResult<()> {
        let source = self.handle.check(source)?;
        let target = self.handle.check(target)?;
        let resource = self.stat(&source).await?;
        // COPY of a collection is recursive; directories go entry by entry.
        if resource.is_collection {
            return Err(VfsError::unsupported(format!("copy collection {source}")));
        }
        let result = self
            .transport
            .copy(&self.url(&source, false), &self.url(&target, false), false)
            .await;
        self.invalidate(&target);
        result.map_err(|e| self.fail(e, &source))
    }

    async fn native_move(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        _options: &CopyOptions,
    ) -> VfsResult<()> {
        let source = self.handle.check(source)?;
        let target = self.handle.check(target)?;
        let collection = self.stat(&source).await?.is_collection;
        let result = self
            .transport
            .move_to(
                &self.url(&source, collection),
                &self.url(&target, collection),
                false,
            )
            .await;
        self.invalidate(&source);
        self.invalidate(&target);
        result.map_err(|e| self.fail(e, &source))
    }
}
