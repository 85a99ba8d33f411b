//! Scheme-keyed provider registry.
//!
//! One provider per URI scheme, registered at startup. The registry caches
//! one live [`FileSystem`] per root URI: the first reference constructs it,
//! later references share it, and closing or removing evicts it so the next
//! reference builds a fresh one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::error::{FileFault, VfsError, VfsResult};
use super::ops::FileSystem;
use super::path::VfsPath;
use super::types::BackendKind;
use super::uri::Uri;
use crate::config::OmnifsConfig;

/// Builds filesystems for one backend kind.
pub trait FileSystemProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn schemes(&self) -> &'static [&'static str] {
        self.kind().schemes()
    }

    /// Construct the filesystem for `root`. Called with the registry lock
    /// held, so it must not do I/O or call back into the registry;
    /// connections and archive loading happen lazily on first use.
    fn new_file_system(&self, root: Arc<Uri>) -> VfsResult<Arc<dyn FileSystem>>;
}

/// Passwords for network backends, keyed by `scheme://user@host:port`.
#[derive(Debug, Default)]
pub struct CredentialStore {
    passwords: Mutex<HashMap<String, String>>,
}

impl CredentialStore {
    fn key(uri: &Uri) -> String {
        format!(
            "{}://{}",
            uri.scheme().unwrap_or_default(),
            uri.encoded_authority().unwrap_or_default()
        )
    }

    pub fn set_password(&self, root: &Uri, password: impl Into<String>) {
        self.passwords.lock().insert(Self::key(root), password.into());
    }

    pub fn password(&self, root: &Uri) -> Option<String> {
        self.passwords.lock().get(&Self::key(root)).cloned()
    }

    pub fn remove(&self, root: &Uri) {
        self.passwords.lock().remove(&Self::key(root));
    }
}

/// Routes URIs to providers and caches filesystems by root URI.
pub struct Registry {
    providers: Mutex<HashMap<String, Arc<dyn FileSystemProvider>>>,
    file_systems: Mutex<HashMap<Uri, Arc<dyn FileSystem>>>,
    credentials: Arc<CredentialStore>,
    config: OmnifsConfig,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("schemes", &self.providers.lock().keys().cloned().collect::<Vec<_>>())
            .field("file_systems", &self.file_systems.lock().len())
            .finish()
    }
}

impl Registry {
    /// Empty registry.
    pub fn new(config: OmnifsConfig) -> Arc<Self> {
        Arc::new(Self::empty(config))
    }

    fn empty(config: OmnifsConfig) -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            file_systems: Mutex::new(HashMap::new()),
            credentials: Arc::new(CredentialStore::default()),
            config,
        }
    }

    /// Registry with every built-in provider. `register` can still replace
    /// or add providers afterwards, e.g. platform document providers.
    pub fn with_default_providers(config: OmnifsConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Registry>| {
            let registry = Self::empty(config);
            registry.register(Arc::new(super::backends::local::LocalProvider));
            registry.register(Arc::new(super::backends::archive::ArchiveProvider::new(
                weak.clone(),
                registry.config.clone(),
            )));
            registry.register(Arc::new(super::backends::ftp::FtpProvider::new(
                registry.credentials.clone(),
                registry.config.clone(),
            )));
            registry.register(Arc::new(super::backends::dav::DavProvider::new(
                registry.credentials.clone(),
                registry.config.clone(),
            )));
            registry
        })
    }

    /// Register a provider for each of its schemes, replacing any earlier
    /// provider for the same scheme.
    pub fn register(&self, provider: Arc<dyn FileSystemProvider>) {
        let mut providers = self.providers.lock();
        for scheme in provider.schemes() {
            debug!(scheme, kind = %provider.kind(), "registering provider");
            providers.insert(scheme.to_string(), provider.clone());
        }
    }

    pub fn config(&self) -> &OmnifsConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    fn provider(&self, scheme: &str) -> VfsResult<Arc<dyn FileSystemProvider>> {
        self.providers
            .lock()
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| VfsError::other(format!("no provider for scheme {scheme:?}")))
    }

    /// The filesystem for `root`, constructing it on first use.
    ///
    /// Construction happens under the registry lock, so concurrent callers
    /// for the same root observe exactly one instance.
    pub fn get_or_create(&self, root: &Uri) -> VfsResult<Arc<dyn FileSystem>> {
        let scheme = root
            .scheme()
            .ok_or_else(|| VfsError::other(format!("URI has no scheme: {root}")))?;
        let provider = self.provider(scheme)?;

        let mut file_systems = self.file_systems.lock();
        if let Some(fs) = file_systems.get(root) {
            if fs.is_open() {
                return Ok(fs.clone());
            }
            debug!(root = %root, "dropping closed file system");
            file_systems.remove(root);
        }
        let fs = provider.new_file_system(Arc::new(root.clone()))?;
        info!(root = %root, kind = %provider.kind(), "created file system");
        file_systems.insert(root.clone(), fs.clone());
        Ok(fs)
    }

    /// An existing filesystem, without constructing one.
    pub fn get(&self, root: &Uri) -> Option<Arc<dyn FileSystem>> {
        self.file_systems.lock().get(root).cloned()
    }

    /// Evict a filesystem without closing it.
    pub fn remove(&self, root: &Uri) -> Option<Arc<dyn FileSystem>> {
        self.file_systems.lock().remove(root)
    }

    /// Evict and close a filesystem.
    pub async fn close(&self, root: &Uri) -> VfsResult<()> {
        let Some(fs) = self.remove(root) else {
            return Ok(());
        };
        info!(root = %root, "closing file system");
        fs.close().await
    }

    /// Close every cached filesystem, returning the first error.
    pub async fn close_all(&self) -> VfsResult<()> {
        let all: Vec<_> = self.file_systems.lock().drain().collect();
        let mut first_error = None;
        for (root, fs) in all {
            if let Err(e) = fs.close().await {
                tracing::warn!(root = %root, error = %e, "failed to close file system");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Roots of all cached filesystems.
    pub fn roots(&self) -> Vec<Uri> {
        let mut roots: Vec<_> = self.file_systems.lock().keys().cloned().collect();
        roots.sort();
        roots
    }

    /// The filesystem that owns `path`.
    pub fn file_system_of(&self, path: &VfsPath) -> VfsResult<Arc<dyn FileSystem>> {
        self.get_or_create(path.root_uri())
    }

    /// Absolute path for a full URI.
    pub fn path(&self, uri: &Uri) -> VfsResult<VfsPath> {
        let path = VfsPath::from_uri(uri);
        self.file_system_of(&path)?;
        Ok(path)
    }

    /// Parse a URI string or a local filesystem path.
    pub fn parse(&self, input: &str) -> VfsResult<VfsPath> {
        if looks_like_uri(input) {
            let uri = Uri::parse(input).map_err(|e| {
                VfsError::InvalidName(FileFault::new(input).with_reason(e.to_string()))
            })?;
            return self.path(&uri);
        }
        self.path(&local_uri(Path::new(input))?)
    }
}

fn looks_like_uri(input: &str) -> bool {
    match input.split_once(':') {
        Some((scheme, _)) => {
            scheme.len() > 1
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// `file:` URI for a local path, made absolute against the working
/// directory.
pub fn local_uri(path: &Path) -> VfsResult<Uri> {
    let absolute = std::path::absolute(path)
        .map_err(|e| VfsError::from_io(e, path.display().to_string()))?;
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        absolute.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = absolute.to_string_lossy().replace('\\', "/").into_bytes();
    Uri::builder()
        .scheme("file")
        .empty_authority()
        .decoded_path(&bytes)
        .build()
        .map_err(|e| VfsError::file_system(path.display().to_string(), e.to_string()))
}
