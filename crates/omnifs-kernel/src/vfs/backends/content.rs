//! Content-resolver backend: flat, non-hierarchical `content://` items.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use super::cursor::{CursorRow, ResolverError, columns};
use super::document::WriteMode;
use crate::vfs::content::{BoxReader, BoxWriter, DirectoryStream};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{FileSystem, FsHandle};
use crate::vfs::path::VfsPath;
use crate::vfs::registry::FileSystemProvider;
use crate::vfs::types::{
    BackendKind, FileKey, FileMetadata, FileStore, FileType, OpenOptions,
};
use crate::vfs::uri::Uri;

const PROJECTION: &[&str] = &[
    columns::DISPLAY_NAME,
    columns::SIZE,
    columns::LAST_MODIFIED,
    columns::MIME_TYPE,
];

/// Platform content resolver.
#[async_trait]
pub trait ContentResolver: Send + Sync + fmt::Debug {
    /// The row for `uri` restricted to `projection`, or `None` if there is
    /// no such item.
    async fn query(&self, uri: &Uri, projection: &[&str])
    -> Result<Option<CursorRow>, ResolverError>;

    async fn open_read(&self, uri: &Uri) -> Result<BoxReader, ResolverError>;

    async fn open_write(&self, uri: &Uri, mode: WriteMode) -> Result<BoxWriter, ResolverError>;

    async fn delete(&self, uri: &Uri) -> Result<(), ResolverError>;
}

/// Provider for the `content` scheme.
#[derive(Debug)]
pub struct ContentProvider {
    resolver: Arc<dyn ContentResolver>,
}

impl ContentProvider {
    pub fn new(resolver: Arc<dyn ContentResolver>) -> Self {
        Self { resolver }
    }
}

impl FileSystemProvider for ContentProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Content
    }

    fn new_file_system(&self, root: Arc<Uri>) -> VfsResult<Arc<dyn FileSystem>> {
        if root.host().is_none_or(str::is_empty) {
            return Err(VfsError::file_system(
                root.to_string(),
                "content root needs an authority",
            ));
        }
        Ok(Arc::new(ContentFileSystem {
            handle: FsHandle::new(root),
            resolver: self.resolver.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct ContentFileSystem {
    handle: FsHandle,
    resolver: Arc<dyn ContentResolver>,
}

impl ContentFileSystem {
    async fn query(&self, path: &VfsPath, uri: &Uri) -> VfsResult<CursorRow> {
        self.resolver
            .query(uri, PROJECTION)
            .await
            .map_err(|e| e.into_vfs(path.to_string()))?
            .ok_or_else(|| VfsError::no_such_file(path.to_string()))
    }
}

#[async_trait]
impl FileSystem for ContentFileSystem {
    fn kind(&self) -> BackendKind {
        BackendKind::Content
    }

    fn root_uri(&self) -> &Arc<Uri> {
        self.handle.root()
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn close(&self) -> VfsResult<()> {
        self.handle.mark_closed();
        Ok(())
    }

    async fn metadata(&self, path: &VfsPath, _follow_links: bool) -> VfsResult<FileMetadata> {
        let path = self.handle.check(path)?;
        let uri = path.to_uri();
        let row = self.query(&path, &uri).await?;
        let mut meta = FileMetadata::new(
            FileKey::Opaque(uri.to_string()),
            FileType::Regular,
            row.integer(columns::SIZE)
                .and_then(|s| u64::try_from(s).ok())
                .unwrap_or(0),
            row.time_millis(columns::LAST_MODIFIED)
                .unwrap_or(SystemTime::UNIX_EPOCH),
        );
        meta.mime_type = row.text(columns::MIME_TYPE).map(str::to_string);
        Ok(meta)
    }

    async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream> {
        self.handle.check(dir)?;
        Err(VfsError::not_directory(dir.to_string()))
    }

    async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader> {
        let path = self.handle.check(path)?;
        self.resolver
            .open_read(&path.to_uri())
            .await
            .map_err(|e| e.into_vfs(path.to_string()))
    }

    async fn file_store(&self, path: &VfsPath) -> VfsResult<FileStore> {
        self.handle.check(path)?;
        Ok(FileStore {
            name: self.handle.root().host().unwrap_or_default().to_string(),
            store_type: "content".to_string(),
            ..FileStore::default()
        })
    }

    async fn open_writer(&self, path: &VfsPath, options: OpenOptions) -> VfsResult<BoxWriter> {
        let path = self.handle.check(path)?;
        let uri = path.to_uri();
        match self.query(&path, &uri).await {
            Ok(_) if options.create_new => {
                return Err(VfsError::already_exists(path.to_string()));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() && options.may_create() => {
                return Err(VfsError::unsupported(format!("creating {path}")));
            }
            Err(e) => return Err(e),
        }
        let mode = if options.append {
            WriteMode::Append
        } else if options.truncate_existing {
            WriteMode::Truncate
        } else {
            WriteMode::Overwrite
        };
        self.resolver
            .open_write(&uri, mode)
            .await
            .map_err(|e| e.into_vfs(path.to_string()))
    }

    async fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        Err(VfsError::unsupported(format!("create_directory {path}")))
    }

    async fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        self.resolver
            .delete(&path.to_uri())
            .await
            .map_err(|e| e.into_vfs(path.to_string()))
    }
}
