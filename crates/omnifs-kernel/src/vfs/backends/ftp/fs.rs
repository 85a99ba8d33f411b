use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::error::FtpError;
use super::listing::FtpEntry;
use super::session::{DataReader, DataWriter, Encoding, FtpConnector, FtpSession, FtpTarget};
use crate::vfs::cache::BoundedCache;
use crate::vfs::content::{BoxReader, BoxWriter, ContentReader, ContentWriter, DirectoryStream};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{FileSystem, FsHandle};
use crate::vfs::path::{ByteString, VfsPath};
use crate::vfs::types::{
    BackendKind, CopyOptions, DirectoryEntry, FileKey, FileMetadata, FileStore, FileType,
    OpenOptions, PosixPrincipal,
};
use crate::vfs::uri::Uri;

const MAX_LINK_HOPS: usize = 40;

/// Idle sessions older than this get a NOOP before reuse.
const NOOP_AFTER: Duration = Duration::from_secs(15);

fn healthy<T>(result: &Result<T, FtpError>) -> bool {
    !matches!(result, Err(e) if e.is_fatal())
}

/// Logged-in sessions for one server.
pub(crate) struct SessionPool {
    connector: Arc<dyn FtpConnector>,
    target: FtpTarget,
    idle: Mutex<Vec<(Instant, Box<dyn FtpSession>)>>,
    max_idle: usize,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("target", &self.target)
            .field("idle", &self.idle.lock().len())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

impl SessionPool {
    pub(crate) fn new(connector: Arc<dyn FtpConnector>, target: FtpTarget, max_idle: usize) -> Self {
        Self {
            connector,
            target,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    async fn acquire(&self) -> Result<Box<dyn FtpSession>, FtpError> {
        loop {
            let Some((since, mut session)) = self.idle.lock().pop() else {
                break;
            };
            if since.elapsed() < NOOP_AFTER {
                return Ok(session);
            }
            match session.noop().await {
                Ok(()) => return Ok(session),
                Err(e) => debug!(host = %self.target.host, error = %e, "dropping stale ftp session"),
            }
        }
        self.connector.connect(&self.target).await
    }

    async fn release(&self, mut session: Box<dyn FtpSession>, healthy: bool) {
        if !healthy {
            return;
        }
        {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push((Instant::now(), session));
                return;
            }
        }
        if let Err(e) = session.quit().await {
            debug!(error = %e, "ftp QUIT failed");
        }
    }

    async fn drain(&self) {
        let sessions: Vec<_> = self.idle.lock().drain(..).collect();
        for (_, mut session) in sessions {
            let _ = session.quit().await;
        }
    }
}

/// Reader over a RETR data connection. The session goes back to the pool
/// once the transfer completes.
struct FtpReader {
    session: Box<dyn FtpSession>,
    data: DataReader,
    pool: Arc<SessionPool>,
    path: String,
    size: u64,
    eof: bool,
}

#[async_trait]
impl ContentReader for FtpReader {
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let n = self
            .data
            .read(buf)
            .await
            .map_err(|e| VfsError::from_io(e, self.path.clone()))?;
        if n == 0 && !buf.is_empty() {
            self.eof = true;
        }
        Ok(n)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn close(self: Box<Self>) -> VfsResult<()> {
        let this = *self;
        let FtpReader {
            mut session,
            data,
            pool,
            path,
            eof,
            ..
        } = this;
        drop(data);
        if !eof {
            // The server is still sending; the control connection is in an
            // unknown state.
            debug!(path = %path, "discarding ftp session after partial read");
            return Ok(());
        }
        let result = session.finish_transfer().await;
        pool.release(session, healthy(&result)).await;
        result.map_err(|e| e.into_vfs(path))
    }
}

/// Writer over a STOR/APPE data connection.
struct FtpWriter {
    session: Box<dyn FtpSession>,
    data: DataWriter,
    pool: Arc<SessionPool>,
    path: String,
}

#[async_trait]
impl ContentWriter for FtpWriter {
    async fn write_all(&mut self, buf: &[u8]) -> VfsResult<()> {
        self.data
            .write_all(buf)
            .await
            .map_err(|e| VfsError::from_io(e, self.path.clone()))
    }

    async fn finish(self: Box<Self>) -> VfsResult<()> {
        let this = *self;
        let FtpWriter {
            mut session,
            mut data,
            pool,
            path,
        } = this;
        if let Err(e) = data.shutdown().await {
            return Err(VfsError::from_io(e, path));
        }
        drop(data);
        let result = session.finish_transfer().await;
        pool.release(session, healthy(&result)).await;
        result.map_err(|e| e.into_vfs(path))
    }

    async fn abort(self: Box<Self>) {
        debug!(path = %self.path, "aborting ftp upload");
    }
}

/// An FTP server as a filesystem.
#[derive(Debug)]
pub struct FtpFileSystem {
    handle: FsHandle,
    pool: Arc<SessionPool>,
    encoding: Encoding,
    /// Entries from the latest listings, consumed by the next lookup.
    listed: BoundedCache<VfsPath, FtpEntry>,
}

impl FtpFileSystem {
    pub(crate) fn new(
        root: Arc<Uri>,
        pool: SessionPool,
        encoding: Encoding,
        listing_capacity: usize,
    ) -> Self {
        Self {
            handle: FsHandle::new(root),
            pool: Arc::new(pool),
            encoding,
            listed: BoundedCache::new(listing_capacity),
        }
    }

    fn wire(&self, path: &VfsPath) -> VfsResult<Vec<u8>> {
        self.encoding
            .encode(path.to_byte_string().as_bytes())
            .ok_or_else(|| VfsError::invalid_name(path.to_string()))
    }

    fn invalidate(&self, path: &VfsPath) {
        self.listed.remove_where(|p| p.starts_with(path));
    }

    /// Map a failure of a possibly-mutating command.
    fn fail(&self, err: FtpError, path: &VfsPath) -> VfsError {
        self.listed.clear();
        err.into_vfs(path.to_string())
    }

    async fn session(&self, path: &VfsPath) -> VfsResult<Box<dyn FtpSession>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| e.into_vfs(path.to_string()))
    }

    fn principal(name: Option<&str>) -> Option<PosixPrincipal> {
        let name = name?;
        name.parse().ok().map(|id| PosixPrincipal { id, name: None })
    }

    fn entry_metadata(&self, path: &VfsPath, entry: &FtpEntry) -> FileMetadata {
        let mut meta = FileMetadata::new(
            FileKey::Opaque(path.to_uri().to_string()),
            entry.file_type,
            entry.size,
            entry.modified.unwrap_or(SystemTime::UNIX_EPOCH),
        );
        meta.mode = entry.mode;
        meta.owner = Self::principal(entry.owner.as_deref());
        meta.group = Self::principal(entry.group.as_deref());
        meta
    }

    /// Raw listing of `dir`, names decoded to path bytes.
    async fn list(&self, dir: &VfsPath) -> VfsResult<Vec<FtpEntry>> {
        let wire = self.wire(dir)?;
        let mut session = self.session(dir).await?;
        let result = session.list(&wire).await;
        self.pool.release(session, healthy(&result)).await;
        let mut entries = result.map_err(|e| e.into_vfs(dir.to_string()))?;
        for entry in &mut entries {
            entry.name = self.encoding.decode(&entry.name);
            if let Some(target) = entry.symlink_target.take() {
                entry.symlink_target = Some(self.encoding.decode(&target));
            }
        }
        Ok(entries)
    }

    /// The listing entry for `path`, without following links.
    async fn lookup(&self, path: &VfsPath) -> VfsResult<FtpEntry> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(FtpEntry::new(Vec::new(), FileType::Directory));
        };
        if let Some(entry) = self.listed.take(path) {
            return Ok(entry);
        }
        self.list(&parent)
            .await?
            .into_iter()
            .find(|entry| entry.name == name.as_bytes())
            .ok_or_else(|| VfsError::no_such_file(path.to_string()))
    }

    /// Follow symlinks from `path` to a non-link entry.
    async fn resolve(&self, path: VfsPath) -> VfsResult<(VfsPath, FtpEntry)> {
        let mut current = path;
        for _ in 0..MAX_LINK_HOPS {
            let entry = self.lookup(&current).await?;
            let target = match (&entry.file_type, &entry.symlink_target) {
                (FileType::Symlink, Some(target)) => target.clone(),
                _ => return Ok((current, entry)),
            };
            let base = current.parent().unwrap_or_else(|| current.clone());
            current = base
                .resolve(&VfsPath::parse(self.handle.root().clone(), &target))
                .normalize();
        }
        Err(VfsError::loop_detected(current.to_string()))
    }

    async fn metadata_of(&self, path: &VfsPath, follow_links: bool) -> VfsResult<FileMetadata> {
        if !follow_links {
            let entry = self.lookup(path).await?;
            return Ok(self.entry_metadata(path, &entry));
        }
        let (resolved, entry) = self.resolve(path.clone()).await?;
        Ok(self.entry_metadata(&resolved, &entry))
    }
}

#[async_trait]
impl FileSystem for FtpFileSystem {
    fn kind(&self) -> BackendKind {
        BackendKind::Ftp
    }

    fn root_uri(&self) -> &Arc<Uri> {
        self.handle.root()
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn close(&self) -> VfsResult<()> {
        if self.handle.mark_closed() {
            self.pool.drain().await;
            self.listed.clear();
        }
        Ok(())
    }

    async fn metadata(&self, path: &VfsPath, follow_links: bool) -> VfsResult<FileMetadata> {
        let path = self.handle.check(path)?;
        self.metadata_of(&path, follow_links).await
    }

    async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream> {
        let checked = self.handle.check(dir)?;
        // LIST on a plain file lists the file itself.
        if checked.name_count() > 0 && !self.metadata_of(&checked, true).await?.is_dir() {
            return Err(VfsError::not_directory(dir.to_string()));
        }
        let mut entries = Vec::new();
        for entry in self.list(&checked).await? {
            let child = match checked.try_resolve_name(&entry.name) {
                Ok(child) => child,
                Err(_) => {
                    let name = String::from_utf8_lossy(&entry.name);
                    debug!(%name, "skipping listing entry with unusable name");
                    continue;
                }
            };
            let meta = self.entry_metadata(&child, &entry);
            entries.push(DirectoryEntry::with_metadata(entry.name.clone(), meta));
            self.listed.insert(child, entry);
        }
        Ok(DirectoryStream::from_entries(dir.clone(), entries))
    }

    async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader> {
        let path = self.handle.check(path)?;
        let (resolved, entry) = self.resolve(path.clone()).await?;
        if entry.file_type.is_dir() {
            return Err(VfsError::is_directory(path.to_string()));
        }
        let wire = self.wire(&resolved)?;
        let mut session = self.session(&path).await?;
        let data = match session.retrieve(&wire).await {
            Ok(data) => data,
            Err(e) => {
                let keep = !e.is_fatal();
                self.pool.release(session, keep).await;
                return Err(e.into_vfs(path.to_string()));
            }
        };
        Ok(Box::new(FtpReader {
            session,
            data,
            pool: self.pool.clone(),
            path: path.to_string(),
            size: entry.size,
            eof: false,
        }))
    }

    async fn read_symlink(&self, link: &VfsPath) -> VfsResult<ByteString> {
        let link = self.handle.check(link)?;
        let entry = self.lookup(&link).await?;
        match (entry.file_type, entry.symlink_target) {
            (FileType::Symlink, Some(target)) => Ok(ByteString::new(target)),
            _ => Err(VfsError::not_link(link.to_string())),
        }
    }

    async fn file_store(&self, path: &VfsPath) -> VfsResult<FileStore> {
        self.handle.check(path)?;
        Ok(FileStore {
            name: self.handle.root().host().unwrap_or_default().to_string(),
            store_type: "ftp".to_string(),
            ..FileStore::default()
        })
    }

    async fn open_writer(&self, path: &VfsPath, options: OpenOptions) -> VfsResult<BoxWriter> {
        let path = self.handle.check(path)?;
        if !(options.is_whole_file_write() || options.append) {
            return Err(VfsError::unsupported(format!(
                "{path}: random-access writes need truncate, create-new or append"
            )));
        }
        let existing = match self.metadata_of(&path, true).await {
            Ok(meta) => Some(meta),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        match &existing {
            Some(_) if options.create_new => {
                return Err(VfsError::already_exists(path.to_string()));
            }
            Some(meta) if meta.is_dir() => return Err(VfsError::is_directory(path.to_string())),
            None if !options.may_create() => return Err(VfsError::no_such_file(path.to_string())),
            _ => {}
        }
        let wire = self.wire(&path)?;
        self.invalidate(&path);
        let mut session = self.session(&path).await?;
        let append = options.append && existing.is_some();
        let data = match session.store(&wire, append).await {
            Ok(data) => data,
            Err(e) => {
                let keep = !e.is_fatal();
                self.pool.release(session, keep).await;
                return Err(self.fail(e, &path));
            }
        };
        Ok(Box::new(FtpWriter {
            session,
            data,
            pool: self.pool.clone(),
            path: path.to_string(),
        }))
    }

    async fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        match self.lookup(&path).await {
            Ok(_) => return Err(VfsError::already_exists(path.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let wire = self.wire(&path)?;
        let mut session = self.session(&path).await?;
        let result = session.make_directory(&wire).await;
        self.pool.release(session, healthy(&result)).await;
        self.invalidate(&path);
        result.map_err(|e| self.fail(e, &path))
    }

    async fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        if path.name_count() == 0 {
            return Err(VfsError::access_denied(path.to_string()));
        }
        let entry = self.lookup(&path).await?;
        let is_dir = entry.file_type.is_dir();
        if is_dir && !self.list(&path).await?.is_empty() {
            return Err(VfsError::directory_not_empty(path.to_string()));
        }
        let wire = self.wire(&path)?;
        let mut session = self.session(&path).await?;
        let result = if is_dir {
            session.remove_directory(&wire).await
        } else {
            session.delete_file(&wire).await
        };
        self.pool.release(session, healthy(&result)).await;
        self.invalidate(&path);
        result.map_err(|e| self.fail(e, &path))
    }

    async fn set_last_modified(&self, path: &VfsPath, time: SystemTime) -> VfsResult<()> {
        let path = self.handle.check(path)?;
        let wire = self.wire(&path)?;
        let mut session = self.session(&path).await?;
        let result = session.set_modified(&wire, time).await;
        self.pool.release(session, healthy(&result)).await;
        self.invalidate(&path);
        result.map_err(|e| self.fail(e, &path))
    }

    fn supports_atomic_move(&self) -> bool {
        true
    }

    async fn native_move(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        _options: &CopyOptions,
    ) -> VfsResult<()> {
        let source = self.handle.check(source)?;
        let target = self.handle.check(target)?;
        let from = self.wire(&source)?;
        let to = self.wire(&target)?;
        let mut session = self.session(&source).await?;
        let result = session.rename(&from, &to).await;
        self.pool.release(session, healthy(&result)).await;
        self.invalidate(&source);
        self.invalidate(&target);
        result.map_err(|e| match self.fail(e, &source) {
            VfsError::FileSystem(fault) => VfsError::FileSystem(fault.with_other(target.to_string())),
            other => other,
        })
    }
}
