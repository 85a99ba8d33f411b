//! WebDAV backend for `dav` and `davs` roots.
//!
//! `dav://user@host:port/` talks plain HTTP and `davs://` talks HTTPS.
//! Server paths map one to one onto VFS paths.

mod error;
mod fs;
pub mod transport;
pub mod xml;

use std::sync::Arc;
use std::time::Duration;

pub use error::DavError;
pub use fs::DavFileSystem;
pub use transport::{DavDownload, DavTransport, Depth, HttpDavTransport, UploadStream};
pub use xml::DavResource;

use crate::config::OmnifsConfig;
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::FileSystem;
use crate::vfs::registry::{CredentialStore, FileSystemProvider};
use crate::vfs::types::BackendKind;
use crate::vfs::uri::Uri;

/// Provider for the WebDAV schemes.
#[derive(Debug)]
pub struct DavProvider {
    credentials: Arc<CredentialStore>,
    config: OmnifsConfig,
    /// Shared transport; when unset each root gets its own HTTP client.
    transport: Option<Arc<dyn DavTransport>>,
}

impl DavProvider {
    pub fn new(credentials: Arc<CredentialStore>, config: OmnifsConfig) -> Self {
        Self {
            credentials,
            config,
            transport: None,
        }
    }

    pub fn with_transport(
        credentials: Arc<CredentialStore>,
        config: OmnifsConfig,
        transport: Arc<dyn DavTransport>,
    ) -> Self {
        Self {
            credentials,
            config,
            transport: Some(transport),
        }
    }

    /// The `http`/`https` base a root talks to.
    fn http_base(root: &Uri) -> VfsResult<Uri> {
        let invalid = |reason: String| VfsError::file_system(root.to_string(), reason);
        let scheme = match root.scheme().map(str::to_ascii_lowercase).as_deref() {
            Some("dav") => "http",
            Some("davs") => "https",
            other => return Err(invalid(format!("not a dav scheme: {other:?}"))),
        };
        let host = root
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("dav root needs a host".into()))?;
        if root.encoded_path() != "/"
            || root.encoded_query().is_some()
            || root.encoded_fragment().is_some()
        {
            return Err(invalid("dav root must be path / only".into()));
        }
        Uri::builder()
            .scheme(scheme)
            .host(host)
            .port(root.port())
            .path("/")
            .build()
            .map_err(|e| invalid(e.to_string()))
    }

    fn transport_for(&self, root: &Uri) -> VfsResult<Arc<dyn DavTransport>> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }
        let user = match root.decoded_user_info() {
            Some(bytes) => Some(String::from_utf8(bytes).map_err(|_| {
                VfsError::file_system(root.to_string(), "dav user name is not UTF-8")
            })?),
            None => None,
        };
        let password = self.credentials.password(root);
        let transport = HttpDavTransport::new(
            user,
            password,
            Duration::from_secs(self.config.dav.timeout_secs),
        )
        .map_err(|e| e.into_vfs(root.to_string()))?;
        Ok(Arc::new(transport))
    }
}

impl FileSystemProvider for DavProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Dav
    }

    fn new_file_system(&self, root: Arc<Uri>) -> VfsResult<Arc<dyn FileSystem>> {
        let base = Self::http_base(&root)?;
        let transport = self.transport_for(&root)?;
        Ok(Arc::new(DavFileSystem::new(
            root,
            base,
            transport,
            self.config.dav.propagate_last_modified,
            self.config.cache.listing_capacity,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::testing::MemoryDavTransport;
    use crate::vfs::content::read_to_end;
    use crate::vfs::error::VfsErrorKind;
    use crate::vfs::types::{CopyOptions, OpenOptions};

    fn mount(transport: &Arc<MemoryDavTransport>, config: OmnifsConfig) -> Arc<dyn FileSystem> {
        DavProvider::with_transport(Arc::new(CredentialStore::default()), config, transport.clone())
            .new_file_system(Arc::new(Uri::parse("davs://dav.example/").unwrap()))
            .unwrap()
    }

    async fn write(fs: &Arc<dyn FileSystem>, path: &[u8], data: &[u8]) {
        let mut writer = fs.open_writer(&fs.path(path), OpenOptions::write()).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[test]
    fn test_http_base() {
        let base = DavProvider::http_base(&Uri::parse("davs://u@h:8443/").unwrap()).unwrap();
        assert_eq!(base.as_str(), "https://h:8443/");
        let base = DavProvider::http_base(&Uri::parse("dav://h/").unwrap()).unwrap();
        assert_eq!(base.as_str(), "http://h/");
        for bad in ["dav://h/sub", "dav:///", "dav://h/?x=1", "ftp://h/"] {
            assert!(DavProvider::http_base(&Uri::parse(bad).unwrap()).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_write_list_read() {
        let transport = Arc::new(MemoryDavTransport::new());
        let fs = mount(&transport, OmnifsConfig::default());
        fs.create_directory(&fs.path(b"/docs")).await.unwrap();
        write(&fs, b"/docs/My Report.txt", b"quarterly numbers").await;

        let entries = fs
            .read_directory(&fs.path(b"/docs"))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name.as_bytes(), b"My Report.txt");
        let meta = entries[0].metadata.as_ref().unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.size, 17);

        let file = fs.path(b"/docs/My Report.txt");
        assert!(fs.metadata(&fs.path(b"/docs"), true).await.unwrap().is_dir());
        let reader = fs.open_reader(&file).await.unwrap();
        assert_eq!(reader.size_hint(), Some(17));
        assert_eq!(read_to_end(reader).await.unwrap(), b"quarterly numbers");
    }

    #[tokio::test]
    async fn test_errors() {
        let transport = Arc::new(MemoryDavTransport::new());
        let fs = mount(&transport, OmnifsConfig::default());
        fs.create_directory(&fs.path(b"/d")).await.unwrap();
        write(&fs, b"/d/f", b"x").await;

        assert_eq!(
            fs.create_directory(&fs.path(b"/d")).await.unwrap_err().kind(),
            VfsErrorKind::FileAlreadyExists
        );
        assert_eq!(
            fs.create_directory(&fs.path(b"/missing/child")).await.unwrap_err().kind(),
            VfsErrorKind::NoSuchFile
        );
        assert_eq!(
            fs.delete(&fs.path(b"/d")).await.unwrap_err().kind(),
            VfsErrorKind::DirectoryNotEmpty
        );
        assert_eq!(
            fs.read_directory(&fs.path(b"/d/f")).await.unwrap_err().kind(),
            VfsErrorKind::NotDirectory
        );
        assert_eq!(
            fs.open_reader(&fs.path(b"/d")).await.err().unwrap().kind(),
            VfsErrorKind::IsDirectory
        );
        assert!(
            fs.open_writer(&fs.path(b"/d/f"), OpenOptions::append())
                .await
                .err()
                .unwrap()
                .is_unsupported()
        );
        assert_eq!(
            fs.open_writer(&fs.path(b"/d/f"), OpenOptions::create_new())
                .await
                .err()
                .unwrap()
                .kind(),
            VfsErrorKind::FileAlreadyExists
        );

        fs.delete(&fs.path(b"/d/f")).await.unwrap();
        fs.delete(&fs.path(b"/d")).await.unwrap();
        assert!(!fs.exists(&fs.path(b"/d")).await);
    }

    #[tokio::test]
    async fn test_native_copy_and_move() {
        let transport = Arc::new(MemoryDavTransport::new());
        let fs = mount(&transport, OmnifsConfig::default());
        write(&fs, b"/a.txt", b"alpha").await;
        let options = CopyOptions::default();

        fs.native_copy(&fs.path(b"/a.txt"), &fs.path(b"/b.txt"), &options)
            .await
            .unwrap();
        assert!(!fs.is_same_file(&fs.path(b"/a.txt"), &fs.path(b"/b.txt")).await.unwrap());
        fs.native_move(&fs.path(b"/b.txt"), &fs.path(b"/c.txt"), &options)
            .await
            .unwrap();
        assert!(!fs.exists(&fs.path(b"/b.txt")).await);
        let reader = fs.open_reader(&fs.path(b"/c.txt")).await.unwrap();
        assert_eq!(read_to_end(reader).await.unwrap(), b"alpha");

        fs.create_directory(&fs.path(b"/dir")).await.unwrap();
        assert!(
            fs.native_copy(&fs.path(b"/dir"), &fs.path(b"/dir2"), &options)
                .await
                .unwrap_err()
                .is_unsupported()
        );
        assert!(fs.supports_atomic_move());
    }

    #[tokio::test]
    async fn test_last_modified_propagation() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let transport = Arc::new(MemoryDavTransport::new());
        let fs = mount(&transport, OmnifsConfig::default());
        write(&fs, b"/f", b"x").await;
        fs.set_last_modified(&fs.path(b"/f"), time).await.unwrap();
        assert_ne!(fs.metadata(&fs.path(b"/f"), true).await.unwrap().last_modified, time);

        let mut config = OmnifsConfig::default();
        config.dav.propagate_last_modified = true;
        let fs = mount(&transport, config);
        fs.set_last_modified(&fs.path(b"/f"), time).await.unwrap();
        assert_eq!(fs.metadata(&fs.path(b"/f"), true).await.unwrap().last_modified, time);
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_nothing() {
        let transport = Arc::new(MemoryDavTransport::new());
        let fs = mount(&transport, OmnifsConfig::default());
        let mut writer = fs.open_writer(&fs.path(b"/partial"), OpenOptions::write()).await.unwrap();
        writer.write_all(b"half").await.unwrap();
        writer.abort().await;
        assert!(!fs.exists(&fs.path(b"/partial")).await);
    }
}
