//! FTP backend for `ftp`, `ftps` and `ftpes` roots.
//!
//! Roots look like `ftp://user@host:port/?mode=passive&encoding=UTF-8`.
//! Passwords come from the registry's [`CredentialStore`].

mod error;
mod fs;
pub mod listing;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

pub use error::FtpError;
pub use fs::FtpFileSystem;
pub use listing::FtpEntry;
pub use session::{
    DataReader, DataWriter, Encoding, FtpConnector, FtpSecurity, FtpSession, FtpTarget,
    TcpFtpConnector,
};

use crate::config::{FtpMode, OmnifsConfig};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::FileSystem;
use crate::vfs::registry::{CredentialStore, FileSystemProvider};
use crate::vfs::types::BackendKind;
use crate::vfs::uri::Uri;

const ANONYMOUS: &str = "anonymous";

/// Provider for the FTP schemes.
#[derive(Debug)]
pub struct FtpProvider {
    credentials: Arc<CredentialStore>,
    config: OmnifsConfig,
    connector: Arc<dyn FtpConnector>,
}

impl FtpProvider {
    pub fn new(credentials: Arc<CredentialStore>, config: OmnifsConfig) -> Self {
        Self::with_connector(credentials, config, Arc::new(TcpFtpConnector::new()))
    }

    pub fn with_connector(
        credentials: Arc<CredentialStore>,
        config: OmnifsConfig,
        connector: Arc<dyn FtpConnector>,
    ) -> Self {
        Self {
            credentials,
            config,
            connector,
        }
    }

    fn target(&self, root: &Uri) -> VfsResult<FtpTarget> {
        let invalid = |reason: String| VfsError::file_system(root.to_string(), reason);
        let (security, default_port) = match root.scheme().map(str::to_ascii_lowercase).as_deref() {
            Some("ftp") => (FtpSecurity::Plain, 21),
            Some("ftps") => (FtpSecurity::Implicit, 990),
            Some("ftpes") => (FtpSecurity::Explicit, 21),
            other => return Err(invalid(format!("not an ftp scheme: {other:?}"))),
        };
        let host = root
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("ftp root needs a host".into()))?;
        if root.encoded_path() != "/" || root.encoded_fragment().is_some() {
            return Err(invalid("ftp root must have path / and no fragment".into()));
        }

        let mut mode = self.config.ftp.mode;
        let mut encoding = Encoding::from_label(&self.config.ftp.encoding).unwrap_or_else(Encoding::utf8);
        for (key, value) in root.query_parameters() {
            match key.as_str() {
                "mode" => {
                    mode = match value.to_ascii_lowercase().as_str() {
                        "passive" => FtpMode::Passive,
                        "active" => FtpMode::Active,
                        _ => return Err(invalid(format!("unknown ftp mode {value:?}"))),
                    }
                }
                "encoding" => {
                    encoding = Encoding::from_label(&value)
                        .ok_or_else(|| invalid(format!("unsupported encoding {value:?}")))?;
                }
                _ => return Err(invalid(format!("unknown ftp parameter {key:?}"))),
            }
        }

        let user = match root.decoded_user_info() {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|_| invalid("ftp user name is not UTF-8".into()))?,
            None => ANONYMOUS.to_string(),
        };
        let password = self.credentials.password(root).or_else(|| {
            (user == ANONYMOUS).then(|| format!("{ANONYMOUS}@"))
        });
        Ok(FtpTarget {
            security,
            host: host.to_string(),
            port: root.port().unwrap_or(default_port),
            user,
            password,
            mode,
            encoding,
            connect_timeout: Duration::from_secs(self.config.ftp.connect_timeout_secs),
        })
    }
}

impl FileSystemProvider for FtpProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Ftp
    }

    fn new_file_system(&self, root: Arc<Uri>) -> VfsResult<Arc<dyn FileSystem>> {
        let target = self.target(&root)?;
        let encoding = target.encoding;
        let pool = fs::SessionPool::new(
            self.connector.clone(),
            target,
            self.config.ftp.max_idle_sessions,
        );
        Ok(Arc::new(FtpFileSystem::new(
            root,
            pool,
            encoding,
            self.config.cache.listing_capacity,
        )))
    }
}
