//! Byte-string path algebra.
//!
//! A [`VfsPath`] is a root URI, an absoluteness flag and a list of opaque
//! byte-string names. Names are never empty and never contain `/`. Every
//! operation returns a new value.
//!
//! Mixing paths from different roots in `resolve` or `relativize` is a
//! programming error and panics.

use std::fmt;
use std::sync::Arc;

use super::error::{FileFault, VfsError, VfsResult};
use super::uri::Uri;

pub const SEPARATOR: u8 = b'/';

/// An owned byte string that is not required to be valid UTF-8.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteString(Vec<u8>);

impl ByteString {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy UTF-8 rendering, for display and logging.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    fn is_dot(&self) -> bool {
        self.0 == b"."
    }

    fn is_dot_dot(&self) -> bool {
        self.0 == b".."
    }
}

impl AsRef<[u8]> for ByteString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ByteString {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for ByteString {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&[u8]> for ByteString {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(b: Vec<u8>) -> Self {
        Self(b)
    }
}

impl fmt::Display for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// A path inside one filesystem, identified by that filesystem's root URI.
///
/// Ordering compares the root URI, then absoluteness, then names byte-wise
/// with a shorter common prefix sorting first.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VfsPath {
    root: Arc<Uri>,
    absolute: bool,
    names: Vec<ByteString>,
}

fn check_name(name: &[u8]) {
    assert!(!name.is_empty(), "path names must not be empty");
    assert!(
        !name.contains(&SEPARATOR),
        "path names must not contain '/': {:?}",
        String::from_utf8_lossy(name)
    );
}

impl VfsPath {
    /// Build a path from already-split names.
    ///
    /// # Panics
    ///
    /// If any name is empty or contains `/`.
    pub fn new(root: Arc<Uri>, absolute: bool, names: Vec<ByteString>) -> Self {
        for name in &names {
            check_name(name.as_bytes());
        }
        Self {
            root,
            absolute,
            names,
        }
    }

    /// Absolute path with no names.
    pub fn root_of(root: Arc<Uri>) -> Self {
        Self {
            root,
            absolute: true,
            names: Vec::new(),
        }
    }

    /// Split `bytes` on `/`, skipping empty names. A leading `/` makes the
    /// path absolute.
    pub fn parse(root: Arc<Uri>, bytes: &[u8]) -> Self {
        let absolute = bytes.first() == Some(&SEPARATOR);
        let names = bytes
            .split(|&b| b == SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(ByteString::from)
            .collect();
        Self {
            root,
            absolute,
            names,
        }
    }

    /// Absolute path for a full URI. The root is the URI with its path
    /// replaced by `/`; query and fragment stay part of the root identity.
    pub fn from_uri(uri: &Uri) -> Self {
        let root = uri.with_decoded_path(b"/");
        let mut path = Self::parse(Arc::new(root), &uri.decoded_path());
        path.absolute = true;
        path
    }

    pub fn root_uri(&self) -> &Arc<Uri> {
        &self.root
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn names(&self) -> &[ByteString] {
        &self.names
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, index: usize) -> Option<&ByteString> {
        self.names.get(index)
    }

    pub fn file_name(&self) -> Option<&ByteString> {
        self.names.last()
    }

    /// Absolute root of this path's filesystem, or `None` for a relative path.
    pub fn root(&self) -> Option<VfsPath> {
        self.absolute.then(|| Self::root_of(self.root.clone()))
    }

    /// `None` for a root or a single-name relative path.
    pub fn parent(&self) -> Option<VfsPath> {
        let (_, init) = self.names.split_last()?;
        if init.is_empty() && !self.absolute {
            return None;
        }
        Some(self.with_names(self.absolute, init.to_vec()))
    }

    fn with_names(&self, absolute: bool, names: Vec<ByteString>) -> Self {
        Self {
            root: self.root.clone(),
            absolute,
            names,
        }
    }

    fn assert_same_root(&self, other: &VfsPath, op: &str) {
        assert!(
            self.root == other.root,
            "{op}: paths belong to different roots ({} vs {})",
            self.root,
            other.root
        );
    }

    /// `other` unchanged if absolute, otherwise this path with `other`'s
    /// names appended.
    ///
    /// # Panics
    ///
    /// If `other` is relative and has a different root.
    pub fn resolve(&self, other: &VfsPath) -> VfsPath {
        if other.absolute {
            return other.clone();
        }
        self.assert_same_root(other, "resolve");
        let mut names = self.names.clone();
        names.extend(other.names.iter().cloned());
        self.with_names(self.absolute, names)
    }

    /// Append one name. No normalization is applied, so `.` and `..` are
    /// kept as ordinary names.
    ///
    /// # Panics
    ///
    /// If `name` is empty or contains `/`.
    pub fn resolve_name(&self, name: impl AsRef<[u8]>) -> VfsPath {
        let name = name.as_ref();
        check_name(name);
        let mut names = self.names.clone();
        names.push(ByteString::from(name));
        self.with_names(self.absolute, names)
    }

    /// Append a name that came from outside (a listing row, a server
    /// reply). Empty names and names containing `/` are `InvalidName`.
    pub fn try_resolve_name(&self, name: impl AsRef<[u8]>) -> VfsResult<VfsPath> {
        let name = name.as_ref();
        if name.is_empty() || name.contains(&SEPARATOR) {
            return Err(VfsError::InvalidName(
                FileFault::new(self.to_string())
                    .with_reason(format!("bad name {:?}", String::from_utf8_lossy(name))),
            ));
        }
        Ok(self.resolve_name(name))
    }

    /// Replace the last name.
    pub fn resolve_sibling(&self, name: impl AsRef<[u8]>) -> VfsPath {
        self.parent()
            .unwrap_or_else(|| self.with_names(self.absolute, Vec::new()))
            .resolve_name(name)
    }

    /// Collapse `.` and walk `..` against preceding real names. An absolute
    /// path never climbs above its root; a relative path keeps leading `..`.
    pub fn normalize(&self) -> VfsPath {
        let mut names: Vec<ByteString> = Vec::with_capacity(self.names.len());
        for name in &self.names {
            if name.is_dot() {
                continue;
            }
            if name.is_dot_dot() {
                match names.last() {
                    Some(last) if !last.is_dot_dot() => {
                        names.pop();
                    }
                    _ if self.absolute => {}
                    _ => names.push(name.clone()),
                }
                continue;
            }
            names.push(name.clone());
        }
        self.with_names(self.absolute, names)
    }

    /// Relative path that leads from this path to `other`. Both are
    /// normalized first.
    ///
    /// # Panics
    ///
    /// If the roots or absoluteness differ.
    pub fn relativize(&self, other: &VfsPath) -> VfsPath {
        self.assert_same_root(other, "relativize");
        assert!(
            self.absolute == other.absolute,
            "relativize: cannot mix absolute and relative paths"
        );
        let from = self.normalize();
        let to = other.normalize();
        let common = from
            .names
            .iter()
            .zip(&to.names)
            .take_while(|(a, b)| a == b)
            .count();
        let mut names: Vec<ByteString> = std::iter::repeat_n(
            ByteString::from(".."),
            from.names.len() - common,
        )
        .collect();
        names.extend(to.names[common..].iter().cloned());
        self.with_names(false, names)
    }

    pub fn starts_with(&self, other: &VfsPath) -> bool {
        self.root == other.root
            && self.absolute == other.absolute
            && self.names.starts_with(&other.names)
    }

    /// An absolute `other` must equal this path; a relative one must match
    /// a trailing run of names.
    pub fn ends_with(&self, other: &VfsPath) -> bool {
        if self.root != other.root {
            return false;
        }
        if other.absolute {
            return self.absolute && self.names == other.names;
        }
        self.names.ends_with(&other.names)
    }

    /// Relative path of names `begin..end`.
    ///
    /// # Panics
    ///
    /// If the range is empty or out of bounds.
    pub fn sub_path(&self, begin: usize, end: usize) -> VfsPath {
        assert!(
            begin < end && end <= self.names.len(),
            "sub_path: invalid range {begin}..{end} for {} names",
            self.names.len()
        );
        self.with_names(false, self.names[begin..end].to_vec())
    }

    /// Raw joined bytes, with a leading `/` when absolute.
    pub fn to_byte_string(&self) -> ByteString {
        let mut out = Vec::new();
        if self.absolute {
            out.push(SEPARATOR);
        }
        for (i, name) in self.names.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            out.extend_from_slice(name.as_bytes());
        }
        ByteString(out)
    }

    /// Full URI: the root with its path replaced by this path.
    ///
    /// # Panics
    ///
    /// If the path is relative.
    pub fn to_uri(&self) -> Uri {
        assert!(self.absolute, "to_uri: path is not absolute: {self}");
        self.root.with_decoded_path(self.to_byte_string().as_bytes())
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_byte_string().to_string_lossy())
    }
}

impl fmt::Debug for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VfsPath({} {:?})", self.root, self.to_byte_string())
    }
}
