use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CommitWriter, apply_write, millis};
use crate::vfs::backends::content::ContentResolver;
use crate::vfs::backends::cursor::{CursorRow, ResolverError, columns};
use crate::vfs::backends::document::{WriteMode, mime_for};
use crate::vfs::content::{BoxReader, BoxWriter, memory_reader};
use crate::vfs::uri::Uri;

#[derive(Debug, Clone)]
struct Item {
    display_name: String,
    mime_type: String,
    data: Vec<u8>,
    modified: SystemTime,
}

/// Content resolver over a map of item URIs.
#[derive(Debug, Default)]
pub struct MemoryContentResolver {
    items: Arc<Mutex<HashMap<String, Item>>>,
}

impl MemoryContentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an item. The MIME type follows the display name.
    pub fn insert(&self, uri: &str, display_name: &str, data: &[u8]) {
        let key = Uri::parse(uri)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| uri.to_string());
        self.items.lock().insert(
            key,
            Item {
                display_name: display_name.to_string(),
                mime_type: mime_for(display_name).to_string(),
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn item(&self, uri: &Uri) -> Result<Item, ResolverError> {
        self.items
            .lock()
            .get(uri.as_str())
            .cloned()
            .ok_or_else(|| ResolverError::NotFound(uri.to_string()))
    }
}

#[async_trait]
impl ContentResolver for MemoryContentResolver {
    async fn query(
        &self,
        uri: &Uri,
        projection: &[&str],
    ) -> Result<Option<CursorRow>, ResolverError> {
        let Some(item) = self.items.lock().get(uri.as_str()).cloned() else {
            return Ok(None);
        };
        let row = CursorRow::new()
            .with(columns::DISPLAY_NAME, item.display_name)
            .with(columns::SIZE, item.data.len() as i64)
            .with(columns::LAST_MODIFIED, millis(item.modified))
            .with(columns::MIME_TYPE, item.mime_type);
        Ok(Some(row.project(projection)))
    }

    async fn open_read(&self, uri: &Uri) -> Result<BoxReader, ResolverError> {
        let item = self.item(uri)?;
        Ok(memory_reader(item.data, uri.to_string()))
    }

    async fn open_write(&self, uri: &Uri, mode: WriteMode) -> Result<BoxWriter, ResolverError> {
        self.item(uri)?;
        let items = self.items.clone();
        let key = uri.to_string();
        Ok(Box::new(CommitWriter::new(Box::new(move |written| {
            if let Some(item) = items.lock().get_mut(&key) {
                apply_write(&mut item.data, mode, written);
                item.modified = SystemTime::now();
            }
        }))))
    }

    async fn delete(&self, uri: &Uri) -> Result<(), ResolverError> {
        self.items
            .lock()
            .remove(uri.as_str())
            .map(|_| ())
            .ok_or_else(|| ResolverError::NotFound(uri.to_string()))
    }
}
