//! Copy and move between any two filesystems.
//!
//! Every writable backend goes through the same steps:
//!
//! 1. An explicitly requested atomic move that cannot be guaranteed fails
//!    with `AtomicMoveNotSupported` before anything is touched.
//! 2. Same file: report the source size, do nothing.
//! 3. Existing target: `FileAlreadyExists` unless `replace_existing`, in
//!    which case it is deleted first.
//! 4. Same instance: try the backend's native primitive, falling back on
//!    `Unsupported` only.
//! 5. Manual path: create a directory, or stream bytes with throttled
//!    progress. A failure or cancellation deletes the partial target.
//! 6. Best-effort timestamp (and optionally mode) copy.
//!
//! Moves prefer a sibling rename, then a native move, then copy plus
//! delete of the source with rollback of the new target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{VfsError, VfsResult};
use super::ops::FileSystem;
use super::path::VfsPath;
use super::types::{CopyOptions, FileMetadata, FileType, OpenOptions, ProgressCallback};

/// Default chunk size for manual copies.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// One side of a transfer: a filesystem and a path inside it.
pub type Endpoint<'a> = (&'a Arc<dyn FileSystem>, &'a VfsPath);

/// Throttled progress reporting with cumulative, strictly increasing counts.
struct ProgressReporter {
    callback: Option<ProgressCallback>,
    interval: Duration,
    last_at: Instant,
    last_value: Option<u64>,
}

impl ProgressReporter {
    fn new(options: &CopyOptions) -> Self {
        Self {
            callback: options.progress.clone(),
            interval: options.progress_interval,
            last_at: Instant::now(),
            last_value: None,
        }
    }

    fn advance(&mut self, copied: u64) {
        let Some(callback) = &self.callback else {
            return;
        };
        if self.last_at.elapsed() >= self.interval && self.last_value.is_none_or(|v| v < copied) {
            callback(copied);
            self.last_at = Instant::now();
            self.last_value = Some(copied);
        }
    }

    fn finish(&mut self, copied: u64) {
        let Some(callback) = &self.callback else {
            return;
        };
        if self.last_value != Some(copied) {
            callback(copied);
            self.last_value = Some(copied);
        }
    }
}

/// Runs copies and moves with a shared buffer size and cancellation token.
#[derive(Debug, Clone)]
pub struct Transfer {
    buffer_size: usize,
    cancel: CancellationToken,
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl Transfer {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            cancel,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn check_cancelled(&self, what: &VfsPath) -> VfsResult<()> {
        if self.cancel.is_cancelled() {
            return Err(VfsError::interrupted(format!("cancelled: {what}")));
        }
        Ok(())
    }

    /// Copy `source` to `target`.
    #[tracing::instrument(skip(self, source, target, options), fields(source = %source.1, target = %target.1))]
    pub async fn copy(
        &self,
        source: Endpoint<'_>,
        target: Endpoint<'_>,
        options: &CopyOptions,
    ) -> VfsResult<()> {
        let (src_fs, src) = source;
        let (tgt_fs, tgt) = target;
        if options.atomic_move {
            return Err(VfsError::unsupported("atomic_move is only valid for move"));
        }
        self.check_cancelled(src)?;
        let src_meta = src_fs.metadata(src, !options.no_follow_links).await?;
        let same_instance = same_instance(src_fs, tgt_fs);

        if same_instance && is_same_file(src_fs, src, tgt).await? {
            ProgressReporter::new(options).finish(src_meta.size);
            return Ok(());
        }
        prepare_target(tgt_fs, tgt, options).await?;

        if same_instance {
            match src_fs.native_copy(src, tgt, options).await {
                Ok(()) => {
                    ProgressReporter::new(options).finish(src_meta.size);
                    return Ok(());
                }
                Err(e) if e.is_unsupported() => {
                    debug!(error = %e, "native copy unsupported, copying manually");
                }
                Err(e) => return Err(e),
            }
        }
        self.copy_manually(source, target, &src_meta, options).await
    }

    /// Move `source` to `target`.
    #[tracing::instrument(skip(self, source, target, options), fields(source = %source.1, target = %target.1))]
    pub async fn move_file(
        &self,
        source: Endpoint<'_>,
        target: Endpoint<'_>,
        options: &CopyOptions,
    ) -> VfsResult<()> {
        let (src_fs, src) = source;
        let (tgt_fs, tgt) = target;
        let same_instance = same_instance(src_fs, tgt_fs);
        if options.atomic_move && !(same_instance && src_fs.supports_atomic_move()) {
            return Err(VfsError::atomic_move_not_supported(
                src.to_string(),
                tgt.to_string(),
            ));
        }
        self.check_cancelled(src)?;
        let src_meta = src_fs.metadata(src, false).await?;

        if same_instance && is_same_file(src_fs, src, tgt).await? {
            ProgressReporter::new(options).finish(src_meta.size);
            return Ok(());
        }
        prepare_target(tgt_fs, tgt, options).await?;

        if same_instance {
            let mut result = Err(VfsError::unsupported("rename"));
            if src.parent().is_some() && src.parent() == tgt.parent() {
                result = src_fs.rename(src, tgt).await;
            }
            if matches!(&result, Err(e) if e.is_unsupported()) {
                result = src_fs.native_move(src, tgt, options).await;
            }
            match result {
                Ok(()) => {
                    ProgressReporter::new(options).finish(src_meta.size);
                    return Ok(());
                }
                Err(e) if e.is_unsupported() => {
                    if options.atomic_move {
                        return Err(VfsError::atomic_move_not_supported(
                            src.to_string(),
                            tgt.to_string(),
                        ));
                    }
                    debug!(error = %e, "native move unsupported, copying and deleting");
                }
                Err(e) => return Err(e),
            }
        }

        let mut copy_options = options.clone();
        copy_options.no_follow_links = true;
        self.copy_manually(source, target, &src_meta, &copy_options)
            .await?;

        match src_fs.delete(src).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(rollback(tgt_fs, tgt, e).await),
        }
    }

    async fn copy_manually(
        &self,
        source: Endpoint<'_>,
        target: Endpoint<'_>,
        src_meta: &FileMetadata,
        options: &CopyOptions,
    ) -> VfsResult<()> {
        let (src_fs, src) = source;
        let (tgt_fs, tgt) = target;
        let mut progress = ProgressReporter::new(options);
        match src_meta.file_type {
            FileType::Directory => {
                tgt_fs.create_directory(tgt).await?;
                progress.finish(src_meta.size);
            }
            FileType::Symlink => {
                return Err(VfsError::unsupported(format!(
                    "copying symbolic link {src} across file systems"
                )));
            }
            FileType::Regular | FileType::Other => {
                if let Err(e) = self.stream(source, target, &mut progress).await {
                    return Err(rollback(tgt_fs, tgt, e).await);
                }
            }
        }
        copy_attributes(src_fs, src_meta, tgt_fs, tgt, options).await;
        Ok(())
    }

    async fn stream(
        &self,
        (src_fs, src): Endpoint<'_>,
        (tgt_fs, tgt): Endpoint<'_>,
        progress: &mut ProgressReporter,
    ) -> VfsResult<()> {
        let mut reader = src_fs.open_reader(src).await?;
        let mut writer = match tgt_fs.open_writer(tgt, OpenOptions::create_new()).await {
            Ok(writer) => writer,
            Err(e) => {
                let _ = reader.close().await;
                return Err(e);
            }
        };

        let mut buf = vec![0u8; self.buffer_size];
        let mut copied = 0u64;
        let result: VfsResult<()> = async {
            loop {
                self.check_cancelled(src)?;
                let n = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        return Err(VfsError::interrupted(format!("cancelled: {src}")));
                    }
                    read = reader.read(&mut buf) => read?,
                };
                if n == 0 {
                    return Ok(());
                }
                writer.write_all(&buf[..n]).await?;
                copied += n as u64;
                progress.advance(copied);
            }
        }
        .await;

        let closed = reader.close().await;
        match result {
            Ok(()) => {
                writer.finish().await?;
                if let Err(e) = closed {
                    warn!(path = %src, error = %e, "failed to close source after copy");
                }
                progress.finish(copied);
                Ok(())
            }
            Err(e) => {
                writer.abort().await;
                Err(e)
            }
        }
    }
}

fn same_instance(a: &Arc<dyn FileSystem>, b: &Arc<dyn FileSystem>) -> bool {
    Arc::ptr_eq(a, b) || a.root_uri() == b.root_uri()
}

async fn is_same_file(fs: &Arc<dyn FileSystem>, a: &VfsPath, b: &VfsPath) -> VfsResult<bool> {
    match fs.is_same_file(a, b).await {
        Ok(same) => Ok(same),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

async fn prepare_target(
    fs: &Arc<dyn FileSystem>,
    target: &VfsPath,
    options: &CopyOptions,
) -> VfsResult<()> {
    match fs.metadata(target, false).await {
        Ok(_) if !options.replace_existing => Err(VfsError::already_exists(target.to_string())),
        Ok(_) => {
            debug!(path = %target, "deleting existing target");
            fs.delete(target).await
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete a partially created target, keeping `primary` as the reported
/// error.
async fn rollback(fs: &Arc<dyn FileSystem>, target: &VfsPath, primary: VfsError) -> VfsError {
    match fs.delete(target).await {
        Ok(()) => primary,
        Err(e) if e.is_not_found() => primary,
        Err(e) => {
            warn!(path = %target, error = %e, "failed to roll back partial target");
            primary.with_suppressed(e)
        }
    }
}

async fn copy_attributes(
    src_fs: &Arc<dyn FileSystem>,
    src_meta: &FileMetadata,
    tgt_fs: &Arc<dyn FileSystem>,
    target: &VfsPath,
    options: &CopyOptions,
) {
    if let Err(e) = tgt_fs.set_last_modified(target, src_meta.last_modified).await {
        if e.is_unsupported() {
            debug!(path = %target, kind = %tgt_fs.kind(), "last-modified time not supported");
        } else {
            warn!(path = %target, error = %e, "failed to copy last-modified time");
        }
    }
    let Some(mode) = src_meta.mode.filter(|_| options.copy_attributes) else {
        return;
    };
    if let Err(e) = tgt_fs.set_mode(target, mode).await {
        debug!(path = %target, source_kind = %src_fs.kind(), error = %e, "mode not copied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::UNIX_EPOCH;

    use async_trait::async_trait;

    use crate::vfs::content::{BoxReader, BoxWriter, ContentWriter, DirectoryStream, memory_reader};
    use crate::vfs::error::VfsErrorKind;
    use crate::vfs::ops::FsHandle;
    use crate::vfs::types::{BackendKind, DirectoryEntry, FileKey, FileStore};
    use crate::vfs::uri::Uri;

    #[derive(Debug, Clone, PartialEq)]
    enum Node {
        File(Vec<u8>),
        Dir,
        Symlink,
    }

    type Nodes = Arc<Mutex<BTreeMap<String, Node>>>;

    /// In-memory filesystem whose writes and deletes fail on demand.
    #[derive(Debug)]
    struct ScratchFs {
        handle: FsHandle,
        nodes: Nodes,
        ops: Mutex<Vec<String>>,
        /// Writers accept this many chunks, then fail.
        writes_before_failure: Option<usize>,
        fail_deletes: bool,
        can_rename: bool,
        can_move: bool,
        /// Cancelled after the first chunk lands.
        cancel_on_write: Option<CancellationToken>,
    }

    impl ScratchFs {
        fn new(host: &str) -> Self {
            let root = Arc::new(Uri::parse(&format!("dav://{host}/")).unwrap());
            let nodes = BTreeMap::from([("/".to_string(), Node::Dir)]);
            Self {
                handle: FsHandle::new(root),
                nodes: Arc::new(Mutex::new(nodes)),
                ops: Mutex::new(Vec::new()),
                writes_before_failure: None,
                fail_deletes: false,
                can_rename: false,
                can_move: false,
                cancel_on_write: None,
            }
        }

        fn put(self, path: &str, node: Node) -> Self {
            self.nodes.lock().unwrap().insert(path.to_string(), node);
            self
        }

        fn node(&self, path: &str) -> Option<Node> {
            self.nodes.lock().unwrap().get(path).cloned()
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn key(&self, path: &VfsPath) -> VfsResult<String> {
            Ok(self.handle.check(path)?.to_byte_string().to_string_lossy())
        }

        fn take(&self, source: &VfsPath, target: &VfsPath, op: &str) -> VfsResult<()> {
            let (from, to) = (self.key(source)?, self.key(target)?);
            self.ops.lock().unwrap().push(format!("{op} {from} -> {to}"));
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes.remove(&from).ok_or_else(|| VfsError::no_such_file(from))?;
            nodes.insert(to, node);
            Ok(())
        }
    }

    struct ScratchWriter {
        nodes: Nodes,
        key: String,
        remaining: Option<usize>,
        cancel: Option<CancellationToken>,
    }

    #[async_trait]
    impl ContentWriter for ScratchWriter {
        async fn write_all(&mut self, buf: &[u8]) -> VfsResult<()> {
            if let Some(remaining) = &mut self.remaining {
                if *remaining == 0 {
                    return Err(VfsError::file_system(self.key.clone(), "device full"));
                }
                *remaining -= 1;
            }
            if let Some(Node::File(data)) = self.nodes.lock().unwrap().get_mut(&self.key) {
                data.extend_from_slice(buf);
            }
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
            Ok(())
        }

        async fn finish(self: Box<Self>) -> VfsResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl FileSystem for ScratchFs {
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
            Ok(())
        }

        async fn metadata(&self, path: &VfsPath, _follow_links: bool) -> VfsResult<FileMetadata> {
            let key = self.key(path)?;
            let (file_type, size) = match self.node(&key) {
                Some(Node::File(data)) => (FileType::Regular, data.len() as u64),
                Some(Node::Dir) => (FileType::Directory, 0),
                Some(Node::Symlink) => (FileType::Symlink, 0),
                None => return Err(VfsError::no_such_file(key)),
            };
            Ok(FileMetadata::new(FileKey::Opaque(key), file_type, size, UNIX_EPOCH))
        }

        async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream> {
            let checked = self.handle.check(dir)?;
            let entries = self
                .nodes
                .lock()
                .unwrap()
                .keys()
                .map(|key| self.handle.check(&self.path(key.as_bytes())))
                .filter_map(Result::ok)
                .filter(|path| path.parent().as_ref() == Some(&checked))
                .filter_map(|path| path.file_name().cloned())
                .map(DirectoryEntry::new)
                .collect();
            Ok(DirectoryStream::from_entries(checked, entries))
        }

        async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader> {
            let key = self.key(path)?;
            match self.node(&key) {
                Some(Node::File(data)) => Ok(memory_reader(data, key)),
                Some(_) => Err(VfsError::is_directory(key)),
                None => Err(VfsError::no_such_file(key)),
            }
        }

        async fn file_store(&self, _path: &VfsPath) -> VfsResult<FileStore> {
            Ok(FileStore::default())
        }

        async fn open_writer(&self, path: &VfsPath, options: OpenOptions) -> VfsResult<BoxWriter> {
            let key = self.key(path)?;
            self.ops.lock().unwrap().push(format!("write {key}"));
            {
                let mut nodes = self.nodes.lock().unwrap();
                if options.create_new && nodes.contains_key(&key) {
                    return Err(VfsError::already_exists(key));
                }
                nodes.insert(key.clone(), Node::File(Vec::new()));
            }
            Ok(Box::new(ScratchWriter {
                nodes: self.nodes.clone(),
                key,
                remaining: self.writes_before_failure,
                cancel: self.cancel_on_write.clone(),
            }))
        }

        async fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
            let key = self.key(path)?;
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&key) {
                return Err(VfsError::already_exists(key));
            }
            nodes.insert(key, Node::Dir);
            Ok(())
        }

        async fn delete(&self, path: &VfsPath) -> VfsResult<()> {
            let key = self.key(path)?;
            self.ops.lock().unwrap().push(format!("delete {key}"));
            if self.fail_deletes {
                return Err(VfsError::access_denied(key));
            }
            match self.nodes.lock().unwrap().remove(&key) {
                Some(_) => Ok(()),
                None => Err(VfsError::no_such_file(key)),
            }
        }

        fn supports_atomic_move(&self) -> bool {
            self.can_move
        }

        async fn native_move(
            &self,
            source: &VfsPath,
            target: &VfsPath,
            _options: &CopyOptions,
        ) -> VfsResult<()> {
            if !self.can_move {
                return Err(VfsError::unsupported("move"));
            }
            self.take(source, target, "move")
        }

        async fn rename(&self, source: &VfsPath, target: &VfsPath) -> VfsResult<()> {
            if !self.can_rename {
                return Err(VfsError::unsupported("rename"));
            }
            self.take(source, target, "rename")
        }
    }

    fn endpoint(fs: &Arc<ScratchFs>) -> Arc<dyn FileSystem> {
        fs.clone()
    }

    const DATA: &[u8] = b"twelve bytes";

    #[tokio::test]
    async fn test_failed_stream_removes_partial_target() {
        let source = Arc::new(ScratchFs::new("a").put("/in.bin", Node::File(DATA.to_vec())));
        let mut target = ScratchFs::new("b");
        target.writes_before_failure = Some(1);
        let target = Arc::new(target);
        let (src_fs, tgt_fs) = (endpoint(&source), endpoint(&target));
        let (src, tgt) = (src_fs.path(b"/in.bin"), tgt_fs.path(b"/out.bin"));

        let err = Transfer::default()
            .with_buffer_size(4)
            .copy((&src_fs, &src), (&tgt_fs, &tgt), &CopyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::FileSystem);
        assert!(err.suppressed().is_empty());
        assert_eq!(target.node("/out.bin"), None);
        assert_eq!(target.ops(), vec!["write /out.bin", "delete /out.bin"]);
        assert_eq!(source.node("/in.bin"), Some(Node::File(DATA.to_vec())));
    }

    #[tokio::test]
    async fn test_failed_rollback_is_attached_to_the_copy_error() {
        let source = Arc::new(ScratchFs::new("a").put("/in.bin", Node::File(DATA.to_vec())));
        let mut target = ScratchFs::new("b");
        target.writes_before_failure = Some(1);
        target.fail_deletes = true;
        let target = Arc::new(target);
        let (src_fs, tgt_fs) = (endpoint(&source), endpoint(&target));
        let (src, tgt) = (src_fs.path(b"/in.bin"), tgt_fs.path(b"/out.bin"));

        let err = Transfer::default()
            .with_buffer_size(4)
            .copy((&src_fs, &src), (&tgt_fs, &tgt), &CopyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::FileSystem);
        assert_eq!(err.suppressed().len(), 1);
        assert_eq!(err.suppressed()[0].kind(), VfsErrorKind::AccessDenied);
        assert_eq!(target.node("/out.bin"), Some(Node::File(b"twel".to_vec())));
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream_removes_partial_target() {
        let source = Arc::new(ScratchFs::new("a").put("/in.bin", Node::File(DATA.to_vec())));
        let cancel = CancellationToken::new();
        let mut target = ScratchFs::new("b");
        target.cancel_on_write = Some(cancel.clone());
        let target = Arc::new(target);
        let (src_fs, tgt_fs) = (endpoint(&source), endpoint(&target));
        let (src, tgt) = (src_fs.path(b"/in.bin"), tgt_fs.path(b"/out.bin"));

        let err = Transfer::new(cancel)
            .with_buffer_size(4)
            .copy((&src_fs, &src), (&tgt_fs, &tgt), &CopyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::Interrupted);
        assert_eq!(target.node("/out.bin"), None);
        assert!(target.ops().contains(&"delete /out.bin".to_string()));
    }

    #[tokio::test]
    async fn test_move_across_file_systems_copies_then_deletes() {
        let source = Arc::new(ScratchFs::new("a").put("/in.txt", Node::File(DATA.to_vec())));
        let target = Arc::new(ScratchFs::new("b"));
        let (src_fs, tgt_fs) = (endpoint(&source), endpoint(&target));
        let (src, tgt) = (src_fs.path(b"/in.txt"), tgt_fs.path(b"/out.txt"));

        Transfer::default()
            .move_file((&src_fs, &src), (&tgt_fs, &tgt), &CopyOptions::default())
            .await
            .unwrap();
        assert_eq!(target.node("/out.txt"), Some(Node::File(DATA.to_vec())));
        assert_eq!(source.node("/in.txt"), None);
        assert_eq!(source.ops(), vec!["delete /in.txt"]);
    }

    #[tokio::test]
    async fn test_failed_source_delete_rolls_back_moved_copy() {
        let mut source = ScratchFs::new("a").put("/in.txt", Node::File(DATA.to_vec()));
        source.fail_deletes = true;
        let source = Arc::new(source);
        let target = Arc::new(ScratchFs::new("b"));
        let (src_fs, tgt_fs) = (endpoint(&source), endpoint(&target));
        let (src, tgt) = (src_fs.path(b"/in.txt"), tgt_fs.path(b"/out.txt"));

        let err = Transfer::default()
            .move_file((&src_fs, &src), (&tgt_fs, &tgt), &CopyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::AccessDenied);
        assert!(err.suppressed().is_empty());
        assert_eq!(source.node("/in.txt"), Some(Node::File(DATA.to_vec())));
        assert_eq!(target.node("/out.txt"), None);
        assert_eq!(target.ops(), vec!["write /out.txt", "delete /out.txt"]);
    }

    #[tokio::test]
    async fn test_move_prefers_sibling_rename() {
        let mut scratch = ScratchFs::new("a")
            .put("/d", Node::Dir)
            .put("/e", Node::Dir)
            .put("/d/a.txt", Node::File(DATA.to_vec()));
        scratch.can_rename = true;
        scratch.can_move = true;
        let scratch = Arc::new(scratch);
        let fs = endpoint(&scratch);
        let transfer = Transfer::default();
        let options = CopyOptions::default().atomic_move();

        let (a, b) = (fs.path(b"/d/a.txt"), fs.path(b"/d/b.txt"));
        transfer.move_file((&fs, &a), (&fs, &b), &options).await.unwrap();
        let elsewhere = fs.path(b"/e/b.txt");
        transfer.move_file((&fs, &b), (&fs, &elsewhere), &options).await.unwrap();

        assert_eq!(
            scratch.ops(),
            vec!["rename /d/a.txt -> /d/b.txt", "move /d/b.txt -> /e/b.txt"]
        );
        assert_eq!(scratch.node("/e/b.txt"), Some(Node::File(DATA.to_vec())));
    }

    #[tokio::test]
    async fn test_same_file_reports_source_size() {
        let scratch = Arc::new(ScratchFs::new("a").put("/in.txt", Node::File(DATA.to_vec())));
        let fs = endpoint(&scratch);
        let path = fs.path(b"/in.txt");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CopyOptions::default()
            .with_progress(Duration::ZERO, Arc::new(move |n| sink.lock().unwrap().push(n)));

        let transfer = Transfer::default();
        transfer.copy((&fs, &path), (&fs, &path), &options).await.unwrap();
        transfer.move_file((&fs, &path), (&fs, &path), &options).await.unwrap();

        let size = DATA.len() as u64;
        assert_eq!(*seen.lock().unwrap(), vec![size, size]);
        assert!(scratch.ops().is_empty());
        assert_eq!(scratch.node("/in.txt"), Some(Node::File(DATA.to_vec())));
    }

    #[tokio::test]
    async fn test_symlink_copy_across_file_systems_is_unsupported() {
        let source = Arc::new(ScratchFs::new("a").put("/link", Node::Symlink));
        let target = Arc::new(ScratchFs::new("b"));
        let (src_fs, tgt_fs) = (endpoint(&source), endpoint(&target));
        let (src, tgt) = (src_fs.path(b"/link"), tgt_fs.path(b"/link"));

        let err = Transfer::default()
            .copy(
                (&src_fs, &src),
                (&tgt_fs, &tgt),
                &CopyOptions::default().no_follow_links(),
            )
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(target.node("/link"), None);
        assert!(target.ops().is_empty());
    }

    #[test]
    fn test_progress_is_throttled_and_final() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CopyOptions::default().with_progress(
            Duration::from_secs(3600),
            Arc::new(move |n| sink.lock().unwrap().push(n)),
        );
        let mut progress = ProgressReporter::new(&options);
        progress.advance(10);
        progress.advance(20);
        progress.finish(30);
        progress.finish(30);
        assert_eq!(*seen.lock().unwrap(), vec![30]);
    }

    #[test]
    fn test_progress_without_interval_reports_each_step() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CopyOptions::default()
            .with_progress(Duration::ZERO, Arc::new(move |n| sink.lock().unwrap().push(n)));
        let mut progress = ProgressReporter::new(&options);
        progress.advance(10);
        progress.advance(10);
        progress.advance(20);
        progress.finish(20);
        assert_eq!(*seen.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_progress_reports_empty_file_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CopyOptions::default()
            .with_progress(Duration::ZERO, Arc::new(move |n| sink.lock().unwrap().push(n)));
        ProgressReporter::new(&options).finish(0);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }
}
