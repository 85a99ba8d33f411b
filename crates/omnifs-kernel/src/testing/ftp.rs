use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use crate::vfs::backends::ftp::{
    DataReader, DataWriter, FtpConnector, FtpEntry, FtpError, FtpSession, FtpTarget,
};
use crate::vfs::types::FileType;

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, modified: SystemTime },
    Directory { modified: SystemTime },
    Symlink { target: Vec<u8> },
}

type Tree = BTreeMap<Vec<u8>, Node>;

fn parent_of(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(0) | None => b"/",
        Some(i) => &path[..i],
    }
}

fn name_of(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn is_within(path: &[u8], dir: &[u8]) -> bool {
    path == dir || (path.starts_with(dir) && path.get(dir.len()) == Some(&b'/'))
}

fn unavailable(path: &[u8]) -> FtpError {
    FtpError::reply(550, format!("{}: No such file or directory", String::from_utf8_lossy(path)))
}

fn is_dir(tree: &Tree, path: &[u8]) -> bool {
    matches!(tree.get(path), Some(Node::Directory { .. }))
}

/// Connector to a shared in-memory FTP server. Every connection sees the
/// same tree.
#[derive(Debug)]
pub struct MemoryFtpConnector {
    tree: Arc<Mutex<Tree>>,
    odd_entries: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
    password: Option<String>,
    connections: AtomicUsize,
}

impl Default for MemoryFtpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFtpConnector {
    /// Server accepting any login.
    pub fn new() -> Self {
        let mut tree = Tree::new();
        tree.insert(
            b"/".to_vec(),
            Node::Directory {
                modified: SystemTime::now(),
            },
        );
        Self {
            tree: Arc::new(Mutex::new(tree)),
            odd_entries: Arc::new(Mutex::new(Vec::new())),
            password: None,
            connections: AtomicUsize::new(0),
        }
    }

    /// Server rejecting logins without this password.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::new()
        }
    }

    /// Connections opened so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn make_parents(tree: &mut Tree, path: &[u8]) {
        let parent = parent_of(path);
        if parent != b"/" && !tree.contains_key(parent) {
            Self::make_parents(tree, parent);
            tree.insert(
                parent.to_vec(),
                Node::Directory {
                    modified: SystemTime::now(),
                },
            );
        }
    }

    /// Add a file, creating missing parent directories.
    pub fn insert_file(&self, path: &[u8], data: &[u8]) {
        let mut tree = self.tree.lock();
        Self::make_parents(&mut tree, path);
        tree.insert(
            path.to_vec(),
            Node::File {
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
    }

    /// Make LIST of `dir` also report a file named `name` verbatim, even
    /// one no real path could have (empty, or containing `/`).
    pub fn insert_odd_listing_entry(&self, dir: &[u8], name: &[u8]) {
        self.odd_entries.lock().push((dir.to_vec(), name.to_vec()));
    }

    pub fn insert_symlink(&self, path: &[u8], target: &[u8]) {
        let mut tree = self.tree.lock();
        Self::make_parents(&mut tree, path);
        tree.insert(
            path.to_vec(),
            Node::Symlink {
                target: target.to_vec(),
            },
        );
    }
}

#[async_trait]
impl FtpConnector for MemoryFtpConnector {
    async fn connect(&self, target: &FtpTarget) -> Result<Box<dyn FtpSession>, FtpError> {
        self.connections.fetch_add(1, Ordering::Relaxed);
        if let Some(expected) = &self.password {
            if target.password.as_deref() != Some(expected.as_str()) {
                return Err(FtpError::reply(530, "Login incorrect."));
            }
        }
        Ok(Box::new(MemoryFtpSession {
            tree: self.tree.clone(),
            odd_entries: self.odd_entries.clone(),
        }))
    }
}

struct MemoryFtpSession {
    tree: Arc<Mutex<Tree>>,
    odd_entries: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
}

impl MemoryFtpSession {
    fn entry(path: &[u8], node: &Node) -> FtpEntry {
        let name = name_of(path);
        match node {
            Node::File { data, modified } => {
                let mut entry = FtpEntry::new(name, FileType::Regular);
                entry.size = data.len() as u64;
                entry.modified = Some(*modified);
                entry.mode = Some(0o644);
                entry
            }
            Node::Directory { modified } => {
                let mut entry = FtpEntry::new(name, FileType::Directory);
                entry.modified = Some(*modified);
                entry.mode = Some(0o755);
                entry
            }
            Node::Symlink { target } => {
                let mut entry = FtpEntry::new(name, FileType::Symlink);
                entry.size = target.len() as u64;
                entry.mode = Some(0o777);
                entry.symlink_target = Some(target.clone());
                entry
            }
        }
    }
}

#[async_trait]
impl FtpSession for MemoryFtpSession {
    async fn list(&mut self, dir: &[u8]) -> Result<Vec<FtpEntry>, FtpError> {
        let tree = self.tree.lock();
        if !is_dir(&tree, dir) {
            return Err(unavailable(dir));
        }
        let mut entries: Vec<FtpEntry> = tree
            .iter()
            .filter(|(path, _)| path.as_slice() != b"/" && parent_of(path) == dir)
            .map(|(path, node)| Self::entry(path, node))
            .collect();
        entries.extend(
            self.odd_entries
                .lock()
                .iter()
                .filter(|(odd_dir, _)| odd_dir.as_slice() == dir)
                .map(|(_, name)| FtpEntry::new(name.as_slice(), FileType::Regular)),
        );
        Ok(entries)
    }

    async fn retrieve(&mut self, path: &[u8]) -> Result<DataReader, FtpError> {
        match self.tree.lock().get(path) {
            Some(Node::File { data, .. }) => Ok(Box::new(io::Cursor::new(data.clone()))),
            _ => Err(unavailable(path)),
        }
    }

    async fn store(&mut self, path: &[u8], append: bool) -> Result<DataWriter, FtpError> {
        let tree = self.tree.lock();
        if !is_dir(&tree, parent_of(path)) || is_dir(&tree, path) {
            return Err(unavailable(path));
        }
        Ok(Box::new(Upload {
            tree: self.tree.clone(),
            path: path.to_vec(),
            append,
            buffer: Vec::new(),
            committed: false,
        }))
    }

    async fn finish_transfer(&mut self) -> Result<(), FtpError> {
        Ok(())
    }

    async fn size(&mut self, path: &[u8]) -> Result<u64, FtpError> {
        match self.tree.lock().get(path) {
            Some(Node::File { data, .. }) => Ok(data.len() as u64),
            _ => Err(unavailable(path)),
        }
    }

    async fn modified(&mut self, path: &[u8]) -> Result<SystemTime, FtpError> {
        match self.tree.lock().get(path) {
            Some(Node::File { modified, .. } | Node::Directory { modified }) => Ok(*modified),
            _ => Err(unavailable(path)),
        }
    }

    async fn set_modified(&mut self, path: &[u8], time: SystemTime) -> Result<(), FtpError> {
        match self.tree.lock().get_mut(path) {
            Some(Node::File { modified, .. } | Node::Directory { modified }) => {
                *modified = time;
                Ok(())
            }
            _ => Err(unavailable(path)),
        }
    }

    async fn make_directory(&mut self, path: &[u8]) -> Result<(), FtpError> {
        let mut tree = self.tree.lock();
        if tree.contains_key(path) {
            return Err(FtpError::reply(550, "File exists"));
        }
        if !is_dir(&tree, parent_of(path)) {
            return Err(unavailable(parent_of(path)));
        }
        tree.insert(
            path.to_vec(),
            Node::Directory {
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn remove_directory(&mut self, path: &[u8]) -> Result<(), FtpError> {
        let mut tree = self.tree.lock();
        if !is_dir(&tree, path) || path == b"/" {
            return Err(unavailable(path));
        }
        if tree.keys().any(|p| p.as_slice() != path && is_within(p, path)) {
            return Err(FtpError::reply(550, "Directory not empty"));
        }
        tree.remove(path);
        Ok(())
    }

    async fn delete_file(&mut self, path: &[u8]) -> Result<(), FtpError> {
        let mut tree = self.tree.lock();
        match tree.get(path) {
            Some(Node::File { .. } | Node::Symlink { .. }) => {
                tree.remove(path);
                Ok(())
            }
            _ => Err(unavailable(path)),
        }
    }

    async fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<(), FtpError> {
        let mut tree = self.tree.lock();
        if !tree.contains_key(from) || from == b"/" {
            return Err(unavailable(from));
        }
        if !is_dir(&tree, parent_of(to)) || is_within(to, from) {
            return Err(FtpError::reply(553, "Requested action not taken"));
        }
        let moved: Vec<Vec<u8>> = tree.keys().filter(|p| is_within(p, from)).cloned().collect();
        for old in moved {
            if let Some(node) = tree.remove(&old) {
                let mut new = to.to_vec();
                new.extend_from_slice(&old[from.len()..]);
                tree.insert(new, node);
            }
        }
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), FtpError> {
        Ok(())
    }

    async fn quit(&mut self) -> Result<(), FtpError> {
        Ok(())
    }
}

/// STOR/APPE data channel. The upload lands in the tree on shutdown.
struct Upload {
    tree: Arc<Mutex<Tree>>,
    path: Vec<u8>,
    append: bool,
    buffer: Vec<u8>,
    committed: bool,
}

impl AsyncWrite for Upload {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.committed {
            this.committed = true;
            let written = std::mem::take(&mut this.buffer);
            let mut tree = this.tree.lock();
            let data = match (this.append, tree.remove(&this.path)) {
                (true, Some(Node::File { mut data, .. })) => {
                    data.extend_from_slice(&written);
                    data
                }
                _ => written,
            };
            tree.insert(
                this.path.clone(),
                Node::File {
                    data,
                    modified: SystemTime::now(),
                },
            );
        }
        Poll::Ready(Ok(()))
    }
}
