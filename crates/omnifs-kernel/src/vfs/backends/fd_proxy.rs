//! Proxy file descriptor callbacks over a local file.
//!
//! A host that hands out proxied descriptors calls back with positional
//! reads and writes on its own threads. Each callback runs synchronously and
//! reports failure as an errno.

use std::fs::File;
use std::os::unix::fs::FileExt;

use parking_lot::Mutex;
use rustix::io::Errno;
use tracing::debug;

use super::local::LocalFileSystem;
use crate::vfs::error::{VfsError, VfsErrorKind, VfsResult};
use crate::vfs::path::VfsPath;
use crate::vfs::types::OpenOptions;

/// Errno reported to the proxy host for an error.
pub fn errno_for(err: &VfsError) -> Errno {
    match err.kind() {
        VfsErrorKind::AccessDenied => Errno::PERM,
        VfsErrorKind::FileSystemLoop => Errno::LOOP,
        VfsErrorKind::InvalidName => Errno::INVAL,
        VfsErrorKind::IsDirectory => Errno::ISDIR,
        VfsErrorKind::NoSuchFile => Errno::NOENT,
        VfsErrorKind::Interrupted => Errno::INTR,
        _ => Errno::IO,
    }
}

/// One proxied descriptor.
#[derive(Debug)]
pub struct FdProxy {
    file: Mutex<Option<File>>,
    path: String,
}

impl FdProxy {
    /// Open `path` on the local filesystem for proxying.
    pub fn open(fs: &LocalFileSystem, path: &VfsPath, options: OpenOptions) -> VfsResult<Self> {
        let native = fs.native_path(path)?;
        let file = std::fs::OpenOptions::new()
            .read(options.read)
            .write(options.write || options.append)
            .append(options.append)
            .truncate(options.truncate_existing && !options.append)
            .create(options.create)
            .create_new(options.create_new)
            .open(&native)
            .map_err(|e| VfsError::from_io(e, path.to_string()))?;
        if file
            .metadata()
            .map_err(|e| VfsError::from_io(e, path.to_string()))?
            .is_dir()
        {
            return Err(VfsError::is_directory(path.to_string()));
        }
        Ok(Self::from_file(file, path.to_string()))
    }

    pub fn from_file(file: File, path: impl Into<String>) -> Self {
        Self {
            file: Mutex::new(Some(file)),
            path: path.into(),
        }
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> std::io::Result<T>) -> Result<T, Errno> {
        let guard = self.file.lock();
        let Some(file) = guard.as_ref() else {
            return Err(errno_for(&VfsError::closed(self.path.clone())));
        };
        f(file).map_err(|e| errno_for(&VfsError::from_io(e, self.path.clone())))
    }

    pub fn size(&self) -> Result<u64, Errno> {
        self.with_file(|file| file.metadata().map(|m| m.len()))
    }

    /// Read at `offset`, filling as much of `buf` as the file allows.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        self.with_file(|file| {
            let mut filled = 0;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(filled)
        })
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, Errno> {
        self.with_file(|file| file.write_all_at(data, offset).map(|()| data.len()))
    }

    pub fn fsync(&self) -> Result<(), Errno> {
        self.with_file(File::sync_all)
    }

    /// Close the descriptor. Later callbacks fail with `EIO`.
    pub fn release(&self) {
        if self.file.lock().take().is_some() {
            debug!(path = %self.path, "released proxy descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ops::FileSystem;
    use crate::vfs::uri::Uri;
    use std::os::unix::ffi::OsStrExt;
    use std::sync::Arc;

    fn local() -> LocalFileSystem {
        LocalFileSystem::new(Arc::new(Uri::parse("file:///").unwrap()))
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno_for(&VfsError::access_denied("/x")), Errno::PERM);
        assert_eq!(errno_for(&VfsError::loop_detected("/x")), Errno::LOOP);
        assert_eq!(errno_for(&VfsError::invalid_name("/x")), Errno::INVAL);
        assert_eq!(errno_for(&VfsError::is_directory("/x")), Errno::ISDIR);
        assert_eq!(errno_for(&VfsError::no_such_file("/x")), Errno::NOENT);
        assert_eq!(errno_for(&VfsError::interrupted("x")), Errno::INTR);
        assert_eq!(errno_for(&VfsError::already_exists("/x")), Errno::IO);
        assert_eq!(
            errno_for(&VfsError::no_such_file("/x").with_suppressed(VfsError::other("y"))),
            Errno::NOENT
        );
    }

    #[test]
    fn test_read_write_fsync_release() {
        let dir = tempfile::tempdir().unwrap();
        let fs = local();
        let path = fs.path(dir.path().join("proxied").as_os_str().as_bytes());
        let proxy = FdProxy::open(&fs, &path, OpenOptions::write()).unwrap();

        assert_eq!(proxy.write(0, b"hello").unwrap(), 5);
        assert_eq!(proxy.write(5, b" world").unwrap(), 6);
        proxy.fsync().unwrap();
        assert_eq!(proxy.size().unwrap(), 11);
        drop(proxy);

        let proxy = FdProxy::open(&fs, &path, OpenOptions::read()).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(proxy.read(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(proxy.read(20, &mut buf).unwrap(), 0);

        proxy.release();
        assert_eq!(proxy.read(0, &mut buf), Err(Errno::IO));
    }

    #[test]
    fn test_open_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fs = local();
        let missing = fs.path(dir.path().join("missing").as_os_str().as_bytes());
        let err = FdProxy::open(&fs, &missing, OpenOptions::read()).unwrap_err();
        assert_eq!(errno_for(&err), Errno::NOENT);

        let directory = fs.path(dir.path().as_os_str().as_bytes());
        let err = FdProxy::open(&fs, &directory, OpenOptions::read()).unwrap_err();
        assert_eq!(errno_for(&err), Errno::ISDIR);
    }
}
