use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CommitWriter, apply_write, millis};
use crate::vfs::backends::cursor::{CursorRow, ResolverError, columns};
use crate::vfs::backends::document::{DIRECTORY_MIME_TYPE, DocumentProvider, WriteMode, flags};
use crate::vfs::content::{BoxReader, BoxWriter, memory_reader};

const FILE_FLAGS: i64 = flags::SUPPORTS_WRITE
    | flags::SUPPORTS_DELETE
    | flags::SUPPORTS_RENAME
    | flags::SUPPORTS_COPY
    | flags::SUPPORTS_MOVE;

const DIRECTORY_FLAGS: i64 = flags::DIR_SUPPORTS_CREATE
    | flags::SUPPORTS_DELETE
    | flags::SUPPORTS_RENAME
    | flags::SUPPORTS_MOVE;

#[derive(Debug, Clone)]
struct Document {
    parent: Option<String>,
    name: String,
    mime_type: String,
    data: Vec<u8>,
    modified: SystemTime,
}

impl Document {
    fn is_dir(&self) -> bool {
        self.mime_type == DIRECTORY_MIME_TYPE
    }
}

#[derive(Debug)]
struct Tree {
    documents: HashMap<String, Document>,
    next_id: u64,
}

impl Tree {
    fn get(&self, id: &str) -> Result<&Document, ResolverError> {
        self.documents
            .get(id)
            .ok_or_else(|| ResolverError::NotFound(id.to_string()))
    }

    fn directory(&self, id: &str) -> Result<&Document, ResolverError> {
        let doc = self.get(id)?;
        if !doc.is_dir() {
            return Err(ResolverError::Failed(format!("{id} is not a directory")));
        }
        Ok(doc)
    }

    fn name_taken(&self, parent: &str, name: &str, except: Option<&str>) -> bool {
        self.documents.iter().any(|(id, doc)| {
            doc.parent.as_deref() == Some(parent) && doc.name == name && Some(id.as_str()) != except
        })
    }

    fn allocate(&mut self) -> String {
        self.next_id += 1;
        format!("doc:{}", self.next_id)
    }

    fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = vec![id.to_string()];
        let mut i = 0;
        while i < out.len() {
            let current = out[i].clone();
            out.extend(
                self.documents
                    .iter()
                    .filter(|(_, doc)| doc.parent.as_deref() == Some(current.as_str()))
                    .map(|(child, _)| child.clone()),
            );
            i += 1;
        }
        out
    }

    fn row(id: &str, doc: &Document) -> CursorRow {
        let flags = if doc.is_dir() { DIRECTORY_FLAGS } else { FILE_FLAGS };
        CursorRow::new()
            .with(columns::DOCUMENT_ID, id)
            .with(columns::DISPLAY_NAME, doc.name.as_str())
            .with(columns::MIME_TYPE, doc.mime_type.as_str())
            .with(columns::SIZE, doc.data.len() as i64)
            .with(columns::LAST_MODIFIED, millis(doc.modified))
            .with(columns::FLAGS, flags)
    }
}

/// Document provider holding a single tree rooted at [`Self::ROOT_ID`].
/// Ids are stable across renames; copies get fresh ids.
#[derive(Debug)]
pub struct MemoryDocumentProvider {
    tree: Arc<Mutex<Tree>>,
    queries: AtomicUsize,
}

impl Default for MemoryDocumentProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentProvider {
    pub const ROOT_ID: &'static str = "root";

    pub fn new() -> Self {
        let mut documents = HashMap::new();
        documents.insert(
            Self::ROOT_ID.to_string(),
            Document {
                parent: None,
                name: String::new(),
                mime_type: DIRECTORY_MIME_TYPE.to_string(),
                data: Vec::new(),
                modified: SystemTime::now(),
            },
        );
        Self {
            tree: Arc::new(Mutex::new(Tree {
                documents,
                next_id: 0,
            })),
            queries: AtomicUsize::new(0),
        }
    }

    /// Number of `query_document` calls served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentProvider for MemoryDocumentProvider {
    async fn query_document(&self, _authority: &str, id: &str) -> Result<CursorRow, ResolverError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let tree = self.tree.lock();
        Ok(Tree::row(id, tree.get(id)?))
    }

    async fn query_children(
        &self,
        _authority: &str,
        parent_id: &str,
    ) -> Result<Vec<CursorRow>, ResolverError> {
        let tree = self.tree.lock();
        tree.directory(parent_id)?;
        let mut children: Vec<_> = tree
            .documents
            .iter()
            .filter(|(_, doc)| doc.parent.as_deref() == Some(parent_id))
            .collect();
        children.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        Ok(children.into_iter().map(|(id, doc)| Tree::row(id, doc)).collect())
    }

    async fn create_document(
        &self,
        _authority: &str,
        parent_id: &str,
        mime_type: &str,
        display_name: &str,
    ) -> Result<String, ResolverError> {
        let mut tree = self.tree.lock();
        tree.directory(parent_id)?;
        if tree.name_taken(parent_id, display_name, None) {
            return Err(ResolverError::AlreadyExists(display_name.to_string()));
        }
        let id = tree.allocate();
        tree.documents.insert(
            id.clone(),
            Document {
                parent: Some(parent_id.to_string()),
                name: display_name.to_string(),
                mime_type: mime_type.to_string(),
                data: Vec::new(),
                modified: SystemTime::now(),
            },
        );
        Ok(id)
    }

    async fn delete_document(&self, _authority: &str, id: &str) -> Result<(), ResolverError> {
        let mut tree = self.tree.lock();
        if id == Self::ROOT_ID {
            return Err(ResolverError::PermissionDenied(id.to_string()));
        }
        tree.get(id)?;
        for doomed in tree.descendants(id) {
            tree.documents.remove(&doomed);
        }
        Ok(())
    }

    async fn rename_document(
        &self,
        _authority: &str,
        id: &str,
        display_name: &str,
    ) -> Result<String, ResolverError> {
        let mut tree = self.tree.lock();
        let parent = tree.get(id)?.parent.clone().unwrap_or_default();
        if tree.name_taken(&parent, display_name, Some(id)) {
            return Err(ResolverError::AlreadyExists(display_name.to_string()));
        }
        if let Some(doc) = tree.documents.get_mut(id) {
            doc.name = display_name.to_string();
        }
        Ok(id.to_string())
    }

    async fn copy_document(
        &self,
        _authority: &str,
        id: &str,
        target_parent_id: &str,
    ) -> Result<String, ResolverError> {
        let mut tree = self.tree.lock();
        let source = tree.get(id)?.clone();
        if source.is_dir() {
            return Err(ResolverError::Unsupported(format!("copy directory {id}")));
        }
        tree.directory(target_parent_id)?;
        let copy_id = tree.allocate();
        tree.documents.insert(
            copy_id.clone(),
            Document {
                parent: Some(target_parent_id.to_string()),
                modified: SystemTime::now(),
                ..source
            },
        );
        Ok(copy_id)
    }

    async fn move_document(
        &self,
        _authority: &str,
        id: &str,
        source_parent_id: &str,
        target_parent_id: &str,
    ) -> Result<String, ResolverError> {
        let mut tree = self.tree.lock();
        if tree.get(id)?.parent.as_deref() != Some(source_parent_id) {
            return Err(ResolverError::NotFound(format!("{id} in {source_parent_id}")));
        }
        tree.directory(target_parent_id)?;
        if tree.descendants(id).iter().any(|d| d == target_parent_id) {
            return Err(ResolverError::Failed(format!("move {id} into itself")));
        }
        if let Some(doc) = tree.documents.get_mut(id) {
            doc.parent = Some(target_parent_id.to_string());
        }
        Ok(id.to_string())
    }

    async fn open_read(&self, _authority: &str, id: &str) -> Result<BoxReader, ResolverError> {
        let tree = self.tree.lock();
        let doc = tree.get(id)?;
        if doc.is_dir() {
            return Err(ResolverError::Failed(format!("{id} is a directory")));
        }
        Ok(memory_reader(doc.data.clone(), id))
    }

    async fn open_write(
        &self,
        _authority: &str,
        id: &str,
        mode: WriteMode,
    ) -> Result<BoxWriter, ResolverError> {
        if self.tree.lock().get(id)?.is_dir() {
            return Err(ResolverError::Failed(format!("{id} is a directory")));
        }
        let tree = self.tree.clone();
        let id = id.to_string();
        Ok(Box::new(CommitWriter::new(Box::new(move |written| {
            if let Some(doc) = tree.lock().documents.get_mut(&id) {
                apply_write(&mut doc.data, mode, written);
                doc.modified = SystemTime::now();
            }
        }))))
    }
}
