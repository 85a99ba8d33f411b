//! Local filesystem backend.
//!
//! One instance serves the whole local namespace at `file:///`. Path names
//! map byte-for-byte onto OS path components, so non-UTF-8 names survive.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;

use crate::vfs::content::{BoxReader, BoxWriter, DirectoryStream, EntrySource, IoReader, IoWriter};
use crate::vfs::error::{FileFault, VfsError, VfsResult};
use crate::vfs::ops::{FileSystem, FsHandle};
use crate::vfs::path::{ByteString, VfsPath};
use crate::vfs::registry::FileSystemProvider;
use crate::vfs::types::{
    BackendKind, CopyOptions, DirectoryEntry, FileKey, FileMetadata, FileStore, FileType,
    OpenOptions, PosixPrincipal,
};
use crate::vfs::uri::Uri;

pub const ROOT_URI: &str = "file:///";

/// Provider for the `file` scheme.
#[derive(Debug, Default)]
pub struct LocalProvider;

impl FileSystemProvider for LocalProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn new_file_system(&self, root: Arc<Uri>) -> VfsResult<Arc<dyn FileSystem>> {
        if root.as_str() != ROOT_URI {
            return Err(VfsError::file_system(
                root.to_string(),
                format!("local root must be {ROOT_URI}"),
            ));
        }
        Ok(Arc::new(LocalFileSystem::new(root)))
    }
}

/// Local filesystem.
#[derive(Debug)]
pub struct LocalFileSystem {
    handle: FsHandle,
}

impl LocalFileSystem {
    /// Best-effort timestamp and mode copy after a native copy. Failures
    /// (chmod on vfat, say) are logged and the copy still succeeds.
    async fn copy_attributes_to(&self, target: &VfsPath, modified: Option<SystemTime>, mode: u32) {
        if let Some(modified) = modified {
            if let Err(e) = self.set_last_modified(target, modified).await {
                tracing::warn!(path = %target, error = %e, "failed to copy last-modified time");
            }
        }
        if let Err(e) = self.set_mode(target, mode).await {
            tracing::warn!(path = %target, error = %e, "failed to copy permissions");
        }
    }

    pub fn new(root: Arc<Uri>) -> Self {
        Self {
            handle: FsHandle::new(root),
        }
    }

    /// Native path for a VFS path.
    pub fn native_path(&self, path: &VfsPath) -> VfsResult<PathBuf> {
        let path = self.handle.check(path)?;
        Ok(PathBuf::from(OsStr::from_bytes(path.to_byte_string().as_bytes())))
    }

    fn io_error(err: std::io::Error, path: &VfsPath) -> VfsError {
        VfsError::from_io(err, path.to_string())
    }

    fn convert_type(file_type: std::fs::FileType) -> FileType {
        if file_type.is_dir() {
            FileType::Directory
        } else if file_type.is_symlink() {
            FileType::Symlink
        } else if file_type.is_file() {
            FileType::Regular
        } else {
            FileType::Other
        }
    }

    /// Convert std::fs::Metadata to FileMetadata.
    fn convert_metadata(meta: &std::fs::Metadata) -> FileMetadata {
        FileMetadata {
            key: FileKey::Inode {
                dev: meta.dev(),
                ino: meta.ino(),
            },
            file_type: Self::convert_type(meta.file_type()),
            size: meta.len(),
            last_modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            last_access: meta.accessed().ok(),
            creation: meta.created().ok(),
            mode: Some(meta.permissions().mode() & 0o7777),
            owner: Some(PosixPrincipal {
                id: meta.uid(),
                name: None,
            }),
            group: Some(PosixPrincipal {
                id: meta.gid(),
                name: None,
            }),
            mime_type: None,
            encrypted: false,
        }
    }

    fn two_path_error(err: std::io::Error, source: &VfsPath, target: &VfsPath) -> VfsError {
        match VfsError::from_io(err, source.to_string()) {
            VfsError::FileSystem(fault) => {
                VfsError::FileSystem(FileFault { other: Some(target.to_string()), ..fault })
            }
            other => other,
        }
    }
}

struct LocalEntries {
    dir: fs::ReadDir,
    path: String,
}

#[async_trait]
impl EntrySource for LocalEntries {
    async fn next_entry(&mut self) -> VfsResult<Option<DirectoryEntry>> {
        let Some(entry) = self
            .dir
            .next_entry()
            .await
            .map_err(|e| VfsError::from_io(e, self.path.clone()))?
        else {
            return Ok(None);
        };
        let mut result = DirectoryEntry::new(entry.file_name().as_bytes());
        result.file_type = entry
            .file_type()
            .await
            .ok()
            .map(LocalFileSystem::convert_type);
        Ok(Some(result))
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
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

    async fn metadata(&self, path: &VfsPath, follow_links: bool) -> VfsResult<FileMetadata> {
        let native = self.native_path(path)?;
        let meta = if follow_links {
            fs::metadata(&native).await
        } else {
            fs::symlink_metadata(&native).await
        };
        meta.map(|m| Self::convert_metadata(&m))
            .map_err(|e| Self::io_error(e, path))
    }

    async fn read_directory(&self, dir: &VfsPath) -> VfsResult<DirectoryStream> {
        let native = self.native_path(dir)?;
        let read_dir = fs::read_dir(&native)
            .await
            .map_err(|e| Self::io_error(e, dir))?;
        Ok(DirectoryStream::new(
            dir.clone(),
            Box::new(LocalEntries {
                dir: read_dir,
                path: dir.to_string(),
            }),
        ))
    }

    async fn open_reader(&self, path: &VfsPath) -> VfsResult<BoxReader> {
        let native = self.native_path(path)?;
        let file = fs::File::open(&native)
            .await
            .map_err(|e| Self::io_error(e, path))?;
        let meta = file.metadata().await.map_err(|e| Self::io_error(e, path))?;
        if meta.is_dir() {
            return Err(VfsError::is_directory(path.to_string()));
        }
        Ok(Box::new(IoReader::new(file, path.to_string(), Some(meta.len()))))
    }

    async fn read_symlink(&self, link: &VfsPath) -> VfsResult<ByteString> {
        let native = self.native_path(link)?;
        match fs::read_link(&native).await {
            Ok(target) => Ok(ByteString::from(target.as_os_str().as_bytes())),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                Err(VfsError::not_link(link.to_string()))
            }
            Err(e) => Err(Self::io_error(e, link)),
        }
    }

    async fn file_store(&self, path: &VfsPath) -> VfsResult<FileStore> {
        let native = self.native_path(path)?;
        let stat = tokio::task::spawn_blocking({
            let native = native.clone();
            move || rustix::fs::statvfs(&native)
        })
        .await
        .map_err(|e| VfsError::file_system(path.to_string(), e.to_string()))?
        .map_err(|errno| Self::io_error(errno.into(), path))?;

        let fragment = stat.f_frsize.max(1);
        Ok(FileStore {
            name: native.display().to_string(),
            store_type: "local".to_string(),
            read_only: stat.f_flag.contains(rustix::fs::StatVfsMountFlags::RDONLY),
            total_space: stat.f_blocks.saturating_mul(fragment),
            usable_space: stat.f_bavail.saturating_mul(fragment),
            unallocated_space: stat.f_bfree.saturating_mul(fragment),
            block_size: stat.f_bsize,
        })
    }

    async fn open_writer(&self, path: &VfsPath, options: OpenOptions) -> VfsResult<BoxWriter> {
        let native = self.native_path(path)?;
        let file = fs::OpenOptions::new()
            .read(options.read)
            .write(options.write || options.append)
            .append(options.append)
            .truncate(options.truncate_existing && !options.append)
            .create(options.create)
            .create_new(options.create_new)
            .open(&native)
            .await
            .map_err(|e| Self::io_error(e, path))?;
        Ok(Box::new(IoWriter::new(file, path.to_string())))
    }

    async fn create_directory(&self, path: &VfsPath) -> VfsResult<()> {
        let native = self.native_path(path)?;
        fs::create_dir(&native)
            .await
            .map_err(|e| Self::io_error(e, path))
    }

    async fn create_symlink(&self, link: &VfsPath, target: &ByteString) -> VfsResult<()> {
        let native = self.native_path(link)?;
        fs::symlink(OsStr::from_bytes(target.as_bytes()), &native)
            .await
            .map_err(|e| Self::io_error(e, link))
    }

    async fn create_link(&self, link: &VfsPath, existing: &VfsPath) -> VfsResult<()> {
        let native_link = self.native_path(link)?;
        let native_existing = self.native_path(existing)?;
        fs::hard_link(&native_existing, &native_link)
            .await
            .map_err(|e| Self::two_path_error(e, link, existing))
    }

    async fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        let native = self.native_path(path)?;
        let meta = fs::symlink_metadata(&native)
            .await
            .map_err(|e| Self::io_error(e, path))?;
        let result = if meta.is_dir() {
            fs::remove_dir(&native).await
        } else {
            fs::remove_file(&native).await
        };
        result.map_err(|e| Self::io_error(e, path))
    }

    async fn set_last_modified(&self, path: &VfsPath, time: SystemTime) -> VfsResult<()> {
        let native = self.native_path(path)?;
        tokio::task::spawn_blocking(move || {
            std::fs::File::open(&native).and_then(|file| file.set_modified(time))
        })
        .await
        .map_err(|e| VfsError::file_system(path.to_string(), e.to_string()))?
        .map_err(|e| Self::io_error(e, path))
    }

    async fn set_mode(&self, path: &VfsPath, mode: u32) -> VfsResult<()> {
        let native = self.native_path(path)?;
        fs::set_permissions(&native, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(|e| Self::io_error(e, path))
    }

    fn supports_atomic_move(&self) -> bool {
        true
    }

    async fn native_copy(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        options: &CopyOptions,
    ) -> VfsResult<()> {
        let native_source = self.native_path(source)?;
        let native_target = self.native_path(target)?;
        let meta = if options.no_follow_links {
            fs::symlink_metadata(&native_source).await
        } else {
            fs::metadata(&native_source).await
        }
        .map_err(|e| Self::io_error(e, source))?;

        if meta.file_type().is_symlink() {
            let link_target = fs::read_link(&native_source)
                .await
                .map_err(|e| Self::io_error(e, source))?;
            return fs::symlink(link_target, &native_target)
                .await
                .map_err(|e| Self::io_error(e, target));
        }
        if meta.is_dir() {
            fs::create_dir(&native_target)
                .await
                .map_err(|e| Self::io_error(e, target))?;
        } else {
            fs::copy(&native_source, &native_target)
                .await
                .map_err(|e| Self::two_path_error(e, source, target))?;
        }
        if options.copy_attributes {
            self.copy_attributes_to(target, meta.modified().ok(), meta.permissions().mode())
                .await;
        }
        Ok(())
    }

    /// `rename(2)`. Crossing devices reports `Unsupported` so the caller can
    /// fall back to copy and delete.
    async fn native_move(
        &self,
        source: &VfsPath,
        target: &VfsPath,
        _options: &CopyOptions,
    ) -> VfsResult<()> {
        let native_source = self.native_path(source)?;
        let native_target = self.native_path(target)?;
        fs::rename(&native_source, &native_target)
            .await
            .map_err(|e| Self::two_path_error(e, source, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::content::read_to_end;
    use crate::vfs::error::VfsErrorKind;
    use tempfile::TempDir;

    fn setup() -> (LocalFileSystem, TempDir) {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(Arc::new(Uri::parse(ROOT_URI).unwrap()));
        (fs, dir)
    }

    fn path(fs: &LocalFileSystem, p: &std::path::Path) -> VfsPath {
        fs.path(p.as_os_str().as_bytes())
    }

    async fn write(fs: &LocalFileSystem, p: &VfsPath, data: &[u8]) {
        let mut writer = fs.open_writer(p, OpenOptions::write()).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (fs, dir) = setup();
        let file = path(&fs, &dir.path().join("test.txt"));
        write(&fs, &file, b"hello world").await;

        let reader = fs.open_reader(&file).await.unwrap();
        assert_eq!(reader.size_hint(), Some(11));
        assert_eq!(read_to_end(reader).await.unwrap(), b"hello world");

        let meta = fs.metadata(&file, true).await.unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.size, 11);
        assert!(matches!(meta.key, FileKey::Inode { .. }));
    }

    #[tokio::test]
    async fn test_create_new_refuses_existing() {
        let (fs, dir) = setup();
        let file = path(&fs, &dir.path().join("x"));
        write(&fs, &file, b"1").await;
        let err = fs
            .open_writer(&file, OpenOptions::create_new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), VfsErrorKind::FileAlreadyExists);
    }

    #[tokio::test]
    async fn test_non_utf8_names() {
        let (fs, dir) = setup();
        let base = path(&fs, dir.path());
        let file = base.resolve_name(b"caf\xe9");
        write(&fs, &file, b"x").await;
        let entries = fs.read_directory(&base).await.unwrap().collect().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name.as_bytes(), b"caf\xe9");
        assert_eq!(entries[0].file_type, Some(FileType::Regular));
    }

    #[tokio::test]
    async fn test_delete_directory_not_empty() {
        let (fs, dir) = setup();
        let sub = path(&fs, &dir.path().join("sub"));
        fs.create_directory(&sub).await.unwrap();
        write(&fs, &sub.resolve_name("f"), b"").await;
        let err = fs.delete(&sub).await.unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::DirectoryNotEmpty);
        fs.delete(&sub.resolve_name("f")).await.unwrap();
        fs.delete(&sub).await.unwrap();
        assert!(!fs.exists(&sub).await);
    }

    #[tokio::test]
    async fn test_symlink_and_links() {
        let (fs, dir) = setup();
        let target = path(&fs, &dir.path().join("target.txt"));
        write(&fs, &target, b"content").await;

        let link = path(&fs, &dir.path().join("link.txt"));
        fs.create_symlink(&link, &ByteString::from("target.txt"))
            .await
            .unwrap();
        assert_eq!(
            fs.read_symlink(&link).await.unwrap(),
            ByteString::from("target.txt")
        );
        assert!(fs.metadata(&link, false).await.unwrap().is_symlink());
        assert!(fs.metadata(&link, true).await.unwrap().is_file());
        assert_eq!(
            fs.read_symlink(&target).await.unwrap_err().kind(),
            VfsErrorKind::NotLink
        );

        let hard = path(&fs, &dir.path().join("hard.txt"));
        fs.create_link(&hard, &target).await.unwrap();
        assert!(fs.is_same_file(&hard, &target).await.unwrap());
        assert!(!fs.is_same_file(&hard, &link.resolve_sibling("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_native_move_and_copy() {
        let (fs, dir) = setup();
        let a = path(&fs, &dir.path().join("a"));
        let b = path(&fs, &dir.path().join("b"));
        let c = path(&fs, &dir.path().join("c"));
        write(&fs, &a, b"data").await;

        fs.native_move(&a, &b, &CopyOptions::default()).await.unwrap();
        assert!(!fs.exists(&a).await);
        fs.native_copy(&b, &c, &CopyOptions::default().copy_attributes())
            .await
            .unwrap();
        let b_meta = fs.metadata(&b, true).await.unwrap();
        let c_meta = fs.metadata(&c, true).await.unwrap();
        assert_eq!(b_meta.last_modified, c_meta.last_modified);
        assert_eq!(std::fs::read(dir.path().join("c")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_attribute_copy_failure_is_not_fatal() {
        let (fs, dir) = setup();
        let missing = path(&fs, &dir.path().join("gone"));
        // Both the utimes and the chmod fail; neither surfaces.
        fs.copy_attributes_to(&missing, Some(SystemTime::UNIX_EPOCH), 0o600)
            .await;

        let a = path(&fs, &dir.path().join("a"));
        let b = path(&fs, &dir.path().join("b"));
        write(&fs, &a, b"data").await;
        std::fs::set_permissions(dir.path().join("a"), std::fs::Permissions::from_mode(0o640))
            .unwrap();
        fs.native_copy(&a, &b, &CopyOptions::default().copy_attributes())
            .await
            .unwrap();
        assert_eq!(fs.metadata(&b, true).await.unwrap().mode, Some(0o640));
    }

    #[tokio::test]
    async fn test_file_store() {
        let (fs, dir) = setup();
        let store = fs.file_store(&path(&fs, dir.path())).await.unwrap();
        assert!(store.total_space > 0);
        assert_eq!(store.store_type, "local");
    }

    #[tokio::test]
    async fn test_closed_file_system_fails() {
        let (fs, dir) = setup();
        fs.close().await.unwrap();
        let err = fs.metadata(&path(&fs, dir.path()), true).await.unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::Closed);
    }

    #[test]
    fn test_provider_rejects_other_roots() {
        let provider = LocalProvider;
        assert!(
            provider
                .new_file_system(Arc::new(Uri::parse("file:///tmp/").unwrap()))
                .is_err()
        );
        assert!(
            provider
                .new_file_system(Arc::new(Uri::parse(ROOT_URI).unwrap()))
                .is_ok()
        );
    }
}
