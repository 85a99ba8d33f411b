use std::collections::BTreeMap;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::vfs::backends::dav::xml::href_path;
use crate::vfs::backends::dav::{
    DavDownload, DavError, DavResource, DavTransport, Depth, UploadStream,
};
use crate::vfs::uri::Uri;

#[derive(Debug, Clone)]
struct Resource {
    collection: bool,
    data: Vec<u8>,
    modified: SystemTime,
    created: SystemTime,
}

impl Resource {
    fn new(collection: bool, data: Vec<u8>) -> Self {
        let now = SystemTime::now();
        Self {
            collection,
            data,
            modified: now,
            created: now,
        }
    }
}

fn parent_of(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(0) | None => b"/",
        Some(i) => &path[..i],
    }
}

fn is_within(path: &[u8], dir: &[u8]) -> bool {
    path == dir || (path.starts_with(dir) && path.get(dir.len()) == Some(&b'/'))
}

/// In-memory WebDAV server. Every method call is logged as
/// `"METHOD /path"` for tests that check request order.
#[derive(Debug)]
pub struct MemoryDavTransport {
    resources: Mutex<BTreeMap<Vec<u8>, Resource>>,
    operations: Mutex<Vec<String>>,
}

impl Default for MemoryDavTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDavTransport {
    pub fn new() -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(b"/".to_vec(), Resource::new(true, Vec::new()));
        Self {
            resources: Mutex::new(resources),
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Requests served so far.
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }

    /// Stored bytes of a resource, if it is a non-collection.
    pub fn contents(&self, path: &[u8]) -> Option<Vec<u8>> {
        match self.resources.lock().get(path) {
            Some(resource) if !resource.collection => Some(resource.data.clone()),
            _ => None,
        }
    }

    fn path(&self, method: &'static str, url: &Uri) -> Result<Vec<u8>, DavError> {
        let path = href_path(url.as_str())?;
        self.operations
            .lock()
            .push(format!("{method} {}", String::from_utf8_lossy(&path)));
        Ok(path)
    }

    fn describe(path: &[u8], resource: &Resource) -> DavResource {
        DavResource {
            path: path.to_vec(),
            is_collection: resource.collection,
            size: (!resource.collection).then_some(resource.data.len() as u64),
            modified: Some(resource.modified),
            created: Some(resource.created),
            content_type: None,
            etag: None,
        }
    }

    fn transfer(
        &self,
        method: &'static str,
        from: &Uri,
        to: &Uri,
        overwrite: bool,
        keep_source: bool,
    ) -> Result<(), DavError> {
        let source = self.path(method, from)?;
        let target = href_path(to.as_str())?;
        let mut resources = self.resources.lock();
        if source == b"/" || !resources.contains_key(&source) {
            return Err(DavError::status(method, from.as_str(), 404));
        }
        if !resources.get(parent_of(&target)).is_some_and(|r| r.collection) {
            return Err(DavError::status(method, from.as_str(), 409));
        }
        if resources.contains_key(&target) {
            if !overwrite {
                return Err(DavError::status(method, from.as_str(), 412));
            }
            resources.retain(|p, _| !is_within(p, &target));
        }
        let subtree: Vec<(Vec<u8>, Resource)> = resources
            .iter()
            .filter(|(p, _)| is_within(p, &source))
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect();
        for (old, mut resource) in subtree {
            if !keep_source {
                resources.remove(&old);
            } else {
                resource.created = SystemTime::now();
            }
            let mut new = target.clone();
            new.extend_from_slice(&old[source.len()..]);
            resources.insert(new, resource);
        }
        Ok(())
    }
}

#[async_trait]
impl DavTransport for MemoryDavTransport {
    async fn propfind(&self, url: &Uri, depth: Depth) -> Result<Vec<DavResource>, DavError> {
        let path = self.path("PROPFIND", url)?;
        let resources = self.resources.lock();
        let Some(resource) = resources.get(&path) else {
            return Err(DavError::status("PROPFIND", url.as_str(), 404));
        };
        let mut out = vec![Self::describe(&path, resource)];
        if depth == Depth::One && resource.collection {
            out.extend(
                resources
                    .iter()
                    .filter(|(p, _)| p.as_slice() != b"/" && parent_of(p) == path.as_slice())
                    .map(|(p, r)| Self::describe(p, r)),
            );
        }
        Ok(out)
    }

    async fn get(&self, url: &Uri) -> Result<DavDownload, DavError> {
        let path = self.path("GET", url)?;
        let data = match self.resources.lock().get(&path) {
            Some(resource) if !resource.collection => resource.data.clone(),
            Some(_) => return Err(DavError::status("GET", url.as_str(), 405)),
            None => return Err(DavError::status("GET", url.as_str(), 404)),
        };
        Ok(DavDownload {
            length: Some(data.len() as u64),
            body: stream::once(async move { Ok(Bytes::from(data)) }).boxed(),
        })
    }

    async fn put(&self, url: &Uri, mut body: UploadStream) -> Result<(), DavError> {
        let path = self.path("PUT", url)?;
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }
        let mut resources = self.resources.lock();
        if !resources.get(parent_of(&path)).is_some_and(|r| r.collection) {
            return Err(DavError::status("PUT", url.as_str(), 409));
        }
        if resources.get(&path).is_some_and(|r| r.collection) {
            return Err(DavError::status("PUT", url.as_str(), 405));
        }
        resources.insert(path, Resource::new(false, data));
        Ok(())
    }

    async fn mkcol(&self, url: &Uri) -> Result<(), DavError> {
        let path = self.path("MKCOL", url)?;
        let mut resources = self.resources.lock();
        if resources.contains_key(&path) {
            return Err(DavError::status("MKCOL", url.as_str(), 405));
        }
        if !resources.get(parent_of(&path)).is_some_and(|r| r.collection) {
            return Err(DavError::status("MKCOL", url.as_str(), 409));
        }
        resources.insert(path, Resource::new(true, Vec::new()));
        Ok(())
    }

    async fn delete(&self, url: &Uri) -> Result<(), DavError> {
        let path = self.path("DELETE", url)?;
        let mut resources = self.resources.lock();
        if path == b"/" || !resources.contains_key(&path) {
            return Err(DavError::status("DELETE", url.as_str(), 404));
        }
        resources.retain(|p, _| !is_within(p, &path));
        Ok(())
    }

    async fn copy(&self, from: &Uri, to: &Uri, overwrite: bool) -> Result<(), DavError> {
        self.transfer("COPY", from, to, overwrite, true)
    }

    async fn move_to(&self, from: &Uri, to: &Uri, overwrite: bool) -> Result<(), DavError> {
        self.transfer("MOVE", from, to, overwrite, false)
    }

    async fn proppatch_modified(&self, url: &Uri, modified: SystemTime) -> Result<(), DavError> {
        let path = self.path("PROPPATCH", url)?;
        match self.resources.lock().get_mut(&path) {
            Some(resource) => {
                resource.modified = modified;
                Ok(())
            }
            None => Err(DavError::status("PROPPATCH", url.as_str(), 404)),
        }
    }
}
