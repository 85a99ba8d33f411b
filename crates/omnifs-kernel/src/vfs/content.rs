//! Content and directory handles.
//!
//! Handles own their backend resources until closed. Callers should call
//! `close`/`finish`/`abort` on every path; dropping a handle releases what
//! it can synchronously but may skip backend-side cleanup (an FTP session
//! is not returned to the pool, a half-written upload is not committed).

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{VfsError, VfsResult};
use super::path::VfsPath;
use super::types::DirectoryEntry;

/// Sequential read access to one file's bytes.
#[async_trait]
pub trait ContentReader: Send {
    /// Read up to `buf.len()` bytes. Returns 0 at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;

    /// Total size, if known up front.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Release backend resources.
    async fn close(self: Box<Self>) -> VfsResult<()> {
        Ok(())
    }
}

/// Sequential write access to one file.
#[async_trait]
pub trait ContentWriter: Send {
    async fn write_all(&mut self, buf: &[u8]) -> VfsResult<()>;

    /// Flush and commit everything written.
    async fn finish(self: Box<Self>) -> VfsResult<()>;

    /// Give up without committing, where the backend allows it.
    async fn abort(self: Box<Self>) {}
}

pub type BoxReader = Box<dyn ContentReader>;
pub type BoxWriter = Box<dyn ContentWriter>;

/// Read everything left in `reader`, then close it.
pub async fn read_to_end(mut reader: BoxReader) -> VfsResult<Vec<u8>> {
    let mut out = Vec::with_capacity(reader.size_hint().unwrap_or(0) as usize);
    let mut buf = vec![0u8; 64 * 1024];
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => break Err(e),
        }
    };
    let closed = reader.close().await;
    result?;
    closed?;
    Ok(out)
}

/// Reader over any [`AsyncRead`].
pub struct IoReader<R> {
    inner: R,
    path: String,
    size: Option<u64>,
}

impl<R: AsyncRead + Unpin + Send> IoReader<R> {
    pub fn new(inner: R, path: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            inner,
            path: path.into(),
            size,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ContentReader for IoReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.inner
            .read(buf)
            .await
            .map_err(|e| VfsError::from_io(e, self.path.clone()))
    }

    fn size_hint(&self) -> Option<u64> {
        self.size
    }
}

/// Writer over any [`AsyncWrite`]. `finish` flushes and shuts down.
pub struct IoWriter<W> {
    inner: W,
    path: String,
}

impl<W: AsyncWrite + Unpin + Send> IoWriter<W> {
    pub fn new(inner: W, path: impl Into<String>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ContentWriter for IoWriter<W> {
    async fn write_all(&mut self, buf: &[u8]) -> VfsResult<()> {
        self.inner
            .write_all(buf)
            .await
            .map_err(|e| VfsError::from_io(e, self.path.clone()))
    }

    async fn finish(self: Box<Self>) -> VfsResult<()> {
        let mut this = *self;
        let path = this.path.clone();
        this.inner
            .flush()
            .await
            .map_err(|e| VfsError::from_io(e, path.clone()))?;
        this.inner
            .shutdown()
            .await
            .map_err(|e| VfsError::from_io(e, path))
    }
}

/// Reader over a stream of byte chunks, such as an HTTP body or a channel
/// fed by a blocking decoder.
pub struct ChunkReader {
    stream: BoxStream<'static, VfsResult<Bytes>>,
    pending: Bytes,
    size: Option<u64>,
    done: bool,
}

impl ChunkReader {
    pub fn new(stream: BoxStream<'static, VfsResult<Bytes>>, size: Option<u64>) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
            size,
            done: false,
        }
    }

    /// Reader fed by an mpsc channel. The producer sees a closed channel
    /// once the reader is dropped or closed.
    pub fn from_channel(
        rx: tokio::sync::mpsc::Receiver<VfsResult<Bytes>>,
        size: Option<u64>,
    ) -> Self {
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Self::new(stream.boxed(), size)
    }
}

#[async_trait]
impl ContentReader for ChunkReader {
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        while self.pending.is_empty() {
            if self.done {
                return Ok(0);
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                None => self.done = true,
            }
        }
        let n = buf.len().min(self.pending.len());
        let chunk = self.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }

    fn size_hint(&self) -> Option<u64> {
        self.size
    }
}

/// Reader over an in-memory buffer.
pub fn memory_reader(data: Vec<u8>, path: impl Into<String>) -> BoxReader {
    let size = data.len() as u64;
    Box::new(IoReader::new(std::io::Cursor::new(data), path, Some(size)))
}

/// Source of directory entries behind a [`DirectoryStream`].
#[async_trait]
pub trait EntrySource: Send {
    async fn next_entry(&mut self) -> VfsResult<Option<DirectoryEntry>>;

    async fn close(self: Box<Self>) -> VfsResult<()> {
        Ok(())
    }
}

struct ListedEntries(std::vec::IntoIter<DirectoryEntry>);

#[async_trait]
impl EntrySource for ListedEntries {
    async fn next_entry(&mut self) -> VfsResult<Option<DirectoryEntry>> {
        Ok(self.0.next())
    }
}

/// Entries of one directory, in backend order.
pub struct DirectoryStream {
    directory: VfsPath,
    source: Box<dyn EntrySource>,
}

impl DirectoryStream {
    pub fn new(directory: VfsPath, source: Box<dyn EntrySource>) -> Self {
        Self { directory, source }
    }

    /// Stream over a listing that is already in memory.
    pub fn from_entries(directory: VfsPath, entries: Vec<DirectoryEntry>) -> Self {
        Self::new(directory, Box::new(ListedEntries(entries.into_iter())))
    }

    pub fn directory(&self) -> &VfsPath {
        &self.directory
    }

    pub async fn next_entry(&mut self) -> VfsResult<Option<DirectoryEntry>> {
        self.source.next_entry().await
    }

    /// Next entry as a full path under the listed directory.
    pub async fn next_path(&mut self) -> VfsResult<Option<VfsPath>> {
        Ok(self
            .next_entry()
            .await?
            .map(|entry| self.directory.resolve_name(entry.name.as_bytes())))
    }

    /// Drain the remaining entries. The stream is closed either way.
    pub async fn collect(mut self) -> VfsResult<Vec<DirectoryEntry>> {
        let mut entries = Vec::new();
        let result = loop {
            match self.source.next_entry().await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let closed = self.source.close().await;
        result?;
        closed?;
        Ok(entries)
    }

    pub async fn close(self) -> VfsResult<()> {
        self.source.close().await
    }
}

impl std::fmt::Debug for DirectoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryStream")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::uri::Uri;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_reader_reads_all() {
        let reader = memory_reader(b"hello world".to_vec(), "/x");
        assert_eq!(reader.size_hint(), Some(11));
        assert_eq!(read_to_end(reader).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_chunk_reader_splits_and_propagates_errors() {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"defg"))).await.unwrap();
        tx.send(Err(VfsError::interrupted("stop"))).await.unwrap();
        drop(tx);

        let mut reader = ChunkReader::from_channel(rx, None);
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 1);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(VfsError::Interrupted(_))
        ));
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_directory_stream_paths() {
        let root = Arc::new(Uri::parse("file:///").unwrap());
        let dir = VfsPath::parse(root, b"/d");
        let mut stream = DirectoryStream::from_entries(
            dir.clone(),
            vec![DirectoryEntry::new("a"), DirectoryEntry::new("b")],
        );
        assert_eq!(stream.next_path().await.unwrap(), Some(dir.resolve_name("a")));
        let rest = stream.collect().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name.as_bytes(), b"b");
    }
}
