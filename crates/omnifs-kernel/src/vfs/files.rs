//! Path-level convenience operations on the registry.
//!
//! Each call routes its path(s) to the owning filesystem. Copies and moves
//! between filesystems go through [`Transfer`].

use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::content::{BoxReader, BoxWriter, DirectoryStream, read_to_end};
use super::error::{FileFault, VfsError, VfsResult};
use super::ops::FileSystem;
use super::path::{ByteString, VfsPath};
use super::registry::Registry;
use super::transfer::Transfer;
use super::types::{CopyOptions, DirectoryEntry, FileMetadata, FileStore, OpenOptions};

impl Registry {
    fn transfer(&self, cancel: &CancellationToken) -> Transfer {
        Transfer::new(cancel.clone()).with_buffer_size(self.config().transfer.buffer_size)
    }

    /// Copy options carrying the configured progress interval.
    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            progress_interval: self.config().transfer.progress_interval(),
            ..CopyOptions::default()
        }
    }

    pub async fn metadata(&self, path: &VfsPath, follow_links: bool) -> VfsResult<FileMetadata> {
        self.file_system_of(path)?.metadata(path, follow_links).await
    }

    /// Existence is a successful metadata lookup.
    pub async fn exists(&self, path: &VfsPath) -> bool {
        self.metadata(path, true).await.is_ok()
    }

    pub async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream> {
        self.file_system_of(dir)?.read_directory(dir).await
    }

    pub async fn list(&self, dir: &VfsPath) -> VfsResult<Vec<DirectoryEntry>> {
        self.read_directory(dir).await?.collect().await
    }

    pub async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader> {
        self.file_system_of(path)?.open_reader(path).await
    }

    pub async fn open_writer(&self, path: &VfsPath, options: OpenOptions) -> VfsResult<BoxWriter> {
        self.file_system_of(path)?.open_writer(path, options).await
    }

    pub async fn read_all(&self, path: &VfsPath) -> VfsResult<Vec<u8>> {
        read_to_end(self.open_reader(path).await?).await
    }

    /// Create or truncate `path` and write `data`.
    pub async fn write_all(&self, path: &VfsPath, data: &[u8]) -> VfsResult<()> {
        let mut writer = self.open_writer(path, OpenOptions::write()).await?;
        if let Err(e) = writer.write_all(data).await {
            writer.abort().await;
            return Err(e);
        }
        writer.finish().await
    }

    pub async fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        self.file_system_of(path)?.create_directory(path).await
    }

    /// Create `path` and any missing ancestors.
    pub async fn create_directories(&self, path: &VfsPath) -> VfsResult<()> {
        let fs = self.file_system_of(path)?;
        let path = fs.root_path().resolve(path).normalize();
        let mut missing = Vec::new();
        let mut current = Some(path.clone());
        while let Some(dir) = current {
            match fs.metadata(&dir, true).await {
                Ok(meta) if meta.is_dir() => break,
                Ok(_) => return Err(VfsError::not_directory(dir.to_string())),
                Err(e) if e.is_not_found() => {
                    current = dir.parent();
                    missing.push(dir);
                }
                Err(e) => return Err(e),
            }
        }
        for dir in missing.into_iter().rev() {
            if let Err(e) = fs.create_directory(&dir).await {
                // Lost a race with another creator.
                let raced = matches!(e, VfsError::FileAlreadyExists(_))
                    && fs.metadata(&dir, true).await.is_ok_and(|m| m.is_dir());
                if !raced {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn create_symlink(&self, link: &VfsPath, target: &ByteString) -> VfsResult<()> {
        self.file_system_of(link)?.create_symlink(link, target).await
    }

    /// Hard link. Both paths must be on the same filesystem.
    pub async fn create_link(&self, link: &VfsPath, existing: &VfsPath) -> VfsResult<()> {
        if link.root_uri() != existing.root_uri() {
            return Err(VfsError::FileSystem(
                FileFault::new(link.to_string())
                    .with_other(existing.to_string())
                    .with_reason("hard links cannot cross file systems"),
            ));
        }
        self.file_system_of(link)?.create_link(link, existing).await
    }

    pub async fn read_symlink(&self, link: &VfsPath) -> VfsResult<ByteString> {
        self.file_system_of(link)?.read_symlink(link).await
    }

    pub async fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        self.file_system_of(path)?.delete(path).await
    }

    /// Returns whether something was deleted.
    pub async fn delete_if_exists(&self, path: &VfsPath) -> VfsResult<bool> {
        match self.delete(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete `path` and, if it is a directory, everything below it.
    /// Symbolic links are deleted, never followed.
    pub async fn delete_recursively(
        &self,
        path: &VfsPath,
        cancel: &CancellationToken,
    ) -> VfsResult<()> {
        let fs = self.file_system_of(path)?;
        let mut stack = vec![(path.clone(), false)];
        while let Some((current, listed)) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(VfsError::interrupted(format!("cancelled: {current}")));
            }
            if listed {
                fs.delete(&current).await?;
                continue;
            }
            let meta = fs.metadata(&current, false).await?;
            if !meta.is_dir() {
                fs.delete(&current).await?;
                continue;
            }
            stack.push((current.clone(), true));
            let mut entries = fs.read_directory(&current).await?;
            let mut children = Vec::new();
            while let Some(child) = entries.next_path().await? {
                children.push((child, false));
            }
            entries.close().await?;
            stack.extend(children);
        }
        Ok(())
    }

    pub async fn set_last_modified(&self, path: &VfsPath, time: SystemTime) -> VfsResult<()> {
        self.file_system_of(path)?.set_last_modified(path, time).await
    }

    pub async fn file_store(&self, path: &VfsPath) -> VfsResult<FileStore> {
        self.file_system_of(path)?.file_store(path).await
    }

    /// Paths on different filesystems are never the same file.
    pub async fn is_same_file(&self, a: &VfsPath, b: &VfsPath) -> VfsResult<bool> {
        if a.root_uri() != b.root_uri() {
            return Ok(false);
        }
        self.file_system_of(a)?.is_same_file(a, b).await
    }

    fn endpoints(
        &self,
        source: &VfsPath,
        target: &VfsPath,
    ) -> VfsResult<(Arc<dyn FileSystem>, Arc<dyn FileSystem>)> {
        Ok((self.file_system_of(source)?, self.file_system_of(target)?))
    }

    /// Copy one file or an empty directory.
    pub async fn copy(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> VfsResult<()> {
        let (src_fs, tgt_fs) = self.endpoints(source, target)?;
        self.transfer(cancel)
            .copy((&src_fs, source), (&tgt_fs, target), options)
            .await
    }

    pub async fn move_file(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> VfsResult<()> {
        let (src_fs, tgt_fs) = self.endpoints(source, target)?;
        self.transfer(cancel)
            .move_file((&src_fs, source), (&tgt_fs, target), options)
            .await
    }

    /// Copy a tree, one entry at a time, parents before children.
    pub async fn copy_recursively(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> VfsResult<()> {
        let (src_fs, tgt_fs) = self.endpoints(source, target)?;
        let transfer = self.transfer(cancel);
        let mut queue = vec![(source.clone(), target.clone())];
        while let Some((src, tgt)) = queue.pop() {
            transfer
                .copy((&src_fs, &src), (&tgt_fs, &tgt), options)
                .await?;
            let meta = src_fs.metadata(&src, !options.no_follow_links).await?;
            if !meta.is_dir() {
                continue;
            }
            let entries = src_fs.read_directory(&src).await?.collect().await?;
            debug!(dir = %src, count = entries.len(), "copying directory children");
            for entry in entries.into_iter().rev() {
                let name = entry.name.as_bytes();
                queue.push((src.resolve_name(name), tgt.resolve_name(name)));
            }
        }
        Ok(())
    }
}
