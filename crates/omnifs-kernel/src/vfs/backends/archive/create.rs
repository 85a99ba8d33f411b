//! Building a new archive from any set of VFS paths.
//!
//! Sources are walked on the async side and fed to a blocking
//! [`ArchiveSink`] over a channel. The archive is written to a spool file
//! and only copied to the target once complete, so a failure never leaves a
//! partial target behind.

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::codec::ArchiveFormat;
use super::entry::ArchiveEntry;
use super::error::ArchiveError;
use super::writer::ArchiveSink;
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path::VfsPath;
use crate::vfs::registry::Registry;
use crate::vfs::types::{FileMetadata, FileType, OpenOptions};

const CHUNK_SIZE: usize = 64 * 1024;

enum Record {
    Entry(Box<ArchiveEntry>),
    Data(Bytes),
}

/// Content of one entry, pulled from the channel.
struct ChannelContent<'a> {
    rx: &'a mut mpsc::Receiver<Record>,
    pending: Bytes,
    remaining: u64,
}

impl io::Read for ChannelContent<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.rx.blocking_recv() {
                Some(Record::Data(chunk)) => self.pending = chunk,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "entry content ended early",
                    ));
                }
            }
        }
        let n = buf
            .len()
            .min(self.pending.len())
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn write_records(
    file: std::fs::File,
    format: ArchiveFormat,
    mut rx: mpsc::Receiver<Record>,
) -> Result<std::fs::File, ArchiveError> {
    let mut sink = ArchiveSink::new(file, format)?;
    while let Some(record) = rx.blocking_recv() {
        let Record::Entry(entry) = record else {
            return Err(ArchiveError::new(
                rustix::io::Errno::INVAL,
                "write_entry",
                "content without a header",
            ));
        };
        if entry.file_type.is_file() {
            let mut content = ChannelContent {
                rx: &mut rx,
                pending: Bytes::new(),
                remaining: entry.size,
            };
            sink.write_entry(&entry, Some(&mut content))?;
        } else {
            sink.write_entry(&entry, None)?;
        }
    }
    sink.finish()
}

fn entry_for(name: Vec<u8>, meta: &FileMetadata) -> ArchiveEntry {
    let file_type = match meta.file_type {
        FileType::Other => FileType::Regular,
        other => other,
    };
    let mut entry = ArchiveEntry::new(name, file_type, meta.size);
    if let Some(mode) = meta.mode {
        entry.mode = mode & 0o7777;
    }
    entry.last_modified = Some(meta.last_modified);
    entry.last_access = meta.last_access;
    entry.creation = meta.creation;
    entry.owner = meta.owner.clone();
    entry.group = meta.group.clone();
    entry
}

fn send_failed() -> VfsError {
    VfsError::interrupted("archive writer stopped")
}

/// Feed every source tree into `tx`.
async fn walk(
    registry: &Registry,
    sources: &[VfsPath],
    tx: &mpsc::Sender<Record>,
    cancel: &CancellationToken,
) -> VfsResult<usize> {
    let mut count = 0;
    for source in sources {
        let base = source
            .file_name()
            .map(|n| n.as_bytes().to_vec())
            .unwrap_or_default();
        let mut stack = vec![(source.clone(), base)];
        while let Some((path, name)) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(VfsError::interrupted(format!("cancelled: {path}")));
            }
            let meta = registry.metadata(&path, false).await?;
            if meta.is_dir() {
                let mut children = registry.list(&path).await?;
                children.sort_by(|a, b| b.name.as_bytes().cmp(a.name.as_bytes()));
                for child in children {
                    let mut child_name = name.clone();
                    if !child_name.is_empty() {
                        child_name.push(b'/');
                    }
                    child_name.extend_from_slice(child.name.as_bytes());
                    stack.push((path.resolve_name(child.name.as_bytes()), child_name));
                }
                if name.is_empty() {
                    continue;
                }
            }

            let mut entry = entry_for(name, &meta);
            if meta.is_symlink() {
                entry.symlink_target = Some(registry.read_symlink(&path).await?);
            }
            let is_file = entry.file_type.is_file();
            let size = entry.size;
            tx.send(Record::Entry(Box::new(entry)))
                .await
                .map_err(|_| send_failed())?;
            count += 1;
            if is_file {
                send_content(registry, &path, size, tx, cancel).await?;
            }
        }
    }
    Ok(count)
}

async fn send_content(
    registry: &Registry,
    path: &VfsPath,
    size: u64,
    tx: &mpsc::Sender<Record>,
    cancel: &CancellationToken,
) -> VfsResult<()> {
    let mut reader = registry.open_reader(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    let result = loop {
        if cancel.is_cancelled() {
            break Err(VfsError::interrupted(format!("cancelled: {path}")));
        }
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if sent + n as u64 > size {
            break Err(VfsError::file_system(path.to_string(), "file grew while archiving"));
        }
        sent += n as u64;
        if tx
            .send(Record::Data(Bytes::copy_from_slice(&buf[..n])))
            .await
            .is_err()
        {
            break Err(send_failed());
        }
    };
    let closed = reader.close().await;
    result?;
    closed?;
    if sent != size {
        return Err(VfsError::file_system(path.to_string(), "file shrank while archiving"));
    }
    Ok(())
}

/// Write `sources` (recursively) into a new archive at `target`.
///
/// Each source is stored under its own file name; a root source contributes
/// its children directly.
#[tracing::instrument(skip_all, fields(sources = sources.len(), %format))]
pub async fn create_archive(
    registry: &Registry,
    sources: &[VfsPath],
    target: &VfsPath,
    format: ArchiveFormat,
    cancel: &CancellationToken,
) -> VfsResult<()> {
    if !format.is_writable() {
        return Err(VfsError::unsupported(format!("writing {format} archives")));
    }
    let spool_dir = registry
        .config()
        .archive
        .spool_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let (file, spool) = tempfile::Builder::new()
        .prefix("omnifs-create-")
        .tempfile_in(&spool_dir)
        .map_err(|e| VfsError::from_io(e, spool_dir.display().to_string()))?
        .into_parts();
    let spool_name = spool.display().to_string();

    let (tx, rx) = mpsc::channel(8);
    let writer = tokio::task::spawn_blocking(move || write_records(file, format, rx));
    let walked = walk(registry, sources, &tx, cancel).await;
    drop(tx);
    let written = writer
        .await
        .map_err(|e| VfsError::file_system(spool_name.clone(), e.to_string()))?;

    // A walk error is the root cause of any writer failure it triggered.
    let count = walked?;
    let file = written.map_err(|e| e.into_vfs(target.to_string()))?;
    debug!(entries = count, spool = %spool_name, "archive spooled");

    copy_spool(registry, file, &spool_name, target).await?;
    info!(target = %target, entries = count, %format, "created archive");
    Ok(())
}

async fn copy_spool(
    registry: &Registry,
    file: std::fs::File,
    spool_name: &str,
    target: &VfsPath,
) -> VfsResult<()> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut input = tokio::fs::File::from_std(file);
    input
        .seek(io::SeekFrom::Start(0))
        .await
        .map_err(|e| VfsError::from_io(e, spool_name))?;
    let mut writer = registry.open_writer(target, OpenOptions::write()).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let copied: VfsResult<()> = async {
        loop {
            let n = input
                .read(&mut buf)
                .await
                .map_err(|e| VfsError::from_io(e, spool_name))?;
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
        }
    }
    .await;
    if let Err(e) = copied {
        writer.abort().await;
        return Err(e);
    }
    writer.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OmnifsConfig;
    use crate::vfs::backends::archive::fs::archive_root;
    use crate::vfs::registry::local_uri;

    #[tokio::test]
    async fn test_create_then_browse() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/docs/img")).unwrap();
        std::fs::write(tmp.path().join("src/docs/report.txt"), b"quarterly").unwrap();
        std::os::unix::fs::symlink("report.txt", tmp.path().join("src/docs/latest")).unwrap();

        let registry = Registry::with_default_providers(OmnifsConfig::default());
        let source = registry.path(&local_uri(&tmp.path().join("src")).unwrap()).unwrap();
        let target_uri = local_uri(&tmp.path().join("out.tar.zst")).unwrap();
        let target = registry.path(&target_uri).unwrap();
        create_archive(
            &registry,
            &[source],
            &target,
            ArchiveFormat::TarZstd,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let root = registry.path(&archive_root(&target_uri)).unwrap();
        let report = root.resolve(&VfsPath::parse(
            root.root_uri().clone(),
            b"src/docs/report.txt",
        ));
        assert_eq!(registry.read_all(&report).await.unwrap(), b"quarterly");
        let img = report.resolve_sibling("img");
        assert!(registry.metadata(&img, true).await.unwrap().is_dir());
        let latest = report.resolve_sibling("latest");
        assert_eq!(
            registry.read_symlink(&latest).await.unwrap().as_bytes(),
            b"report.txt"
        );
    }

    #[tokio::test]
    async fn test_zip_and_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"a").unwrap();
        let registry = Registry::with_default_providers(OmnifsConfig::default());
        let source = registry.path(&local_uri(&tmp.path().join("a")).unwrap()).unwrap();
        let target = registry
            .path(&local_uri(&tmp.path().join("out.zip")).unwrap())
            .unwrap();

        let err = create_archive(
            &registry,
            &[source.clone()],
            &target,
            ArchiveFormat::Zip,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_unsupported());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let tar = registry
            .path(&local_uri(&tmp.path().join("out.tar")).unwrap())
            .unwrap();
        let err = create_archive(&registry, &[source], &tar, ArchiveFormat::Tar, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::Interrupted(_)));
        assert!(!tmp.path().join("out.tar").exists());
    }
}
