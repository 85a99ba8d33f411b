//! Directory tree reconstruction from a flat entry stream.
//!
//! Archives list members in any order, may omit directory headers, and may
//! repeat names. Each name is resolved against the archive root and
//! normalized; missing ancestors get zero-size directory entries; a later
//! member with the same path replaces the earlier one.

use std::collections::HashMap;

use super::entry::ArchiveEntry;
use crate::vfs::path::VfsPath;

/// An entry placed in the tree.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub entry: ArchiveEntry,
    /// Position in the archive, `None` for synthesized directories.
    pub index: Option<usize>,
}

#[derive(Debug)]
pub struct EntryTree {
    root: VfsPath,
    entries: HashMap<VfsPath, TreeEntry>,
    children: HashMap<VfsPath, Vec<VfsPath>>,
}

impl EntryTree {
    pub fn new(root: VfsPath) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            root.clone(),
            TreeEntry {
                entry: ArchiveEntry::directory(""),
                index: None,
            },
        );
        Self {
            root,
            entries,
            children: HashMap::new(),
        }
    }

    pub fn root(&self) -> &VfsPath {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Where a stored member name lands in the tree.
    pub fn resolve_name(&self, name: &[u8]) -> VfsPath {
        self.root
            .resolve(&VfsPath::parse(self.root.root_uri().clone(), name))
            .normalize()
    }

    pub fn insert(&mut self, index: usize, entry: ArchiveEntry) {
        let path = self.resolve_name(entry.name.as_bytes());
        let placed = TreeEntry {
            entry,
            index: Some(index),
        };
        if path == self.root {
            if placed.entry.file_type.is_dir() {
                self.entries.insert(path, placed);
            }
            return;
        }
        if self.entries.insert(path.clone(), placed).is_some() {
            return;
        }

        let mut child = path;
        while let Some(parent) = child.parent() {
            self.children.entry(parent.clone()).or_default().push(child);
            if self.entries.contains_key(&parent) {
                break;
            }
            let name = parent.to_byte_string();
            self.entries.insert(
                parent.clone(),
                TreeEntry {
                    entry: ArchiveEntry::directory(name),
                    index: None,
                },
            );
            child = parent;
        }
    }

    pub fn get(&self, path: &VfsPath) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    /// Child paths of `dir`, in archive order.
    pub fn children(&self, dir: &VfsPath) -> &[VfsPath] {
        self.children.get(dir).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn paths(&self) -> impl Iterator<Item = &VfsPath> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::types::FileType;
    use crate::vfs::uri::Uri;
    use std::sync::Arc;

    fn tree() -> EntryTree {
        let root = Arc::new(Uri::parse("archive:///#file%3A%2F%2F%2Fa.tar").unwrap());
        EntryTree::new(VfsPath::root_of(root))
    }

    fn file(name: &str) -> ArchiveEntry {
        ArchiveEntry::new(name, FileType::Regular, 3)
    }

    #[test]
    fn test_synthesizes_missing_ancestors_once() {
        let mut tree = tree();
        tree.insert(0, file("docs/report.txt"));
        tree.insert(1, ArchiveEntry::directory("docs/img/"));

        let docs = tree.resolve_name(b"docs");
        let synthesized = tree.get(&docs).unwrap();
        assert!(synthesized.entry.file_type.is_dir());
        assert_eq!(synthesized.entry.size, 0);
        assert_eq!(synthesized.index, None);

        let root = tree.root().clone();
        assert_eq!(tree.children(&root), &[docs.clone()]);
        assert_eq!(
            tree.children(&docs),
            &[tree.resolve_name(b"docs/report.txt"), tree.resolve_name(b"docs/img")]
        );
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_explicit_directory_after_children_replaces_synthesized() {
        let mut tree = tree();
        tree.insert(0, file("a/b"));
        let mut dir = ArchiveEntry::directory("a/");
        dir.mode = 0o700;
        tree.insert(1, dir);
        let a = tree.resolve_name(b"a");
        assert_eq!(tree.get(&a).unwrap().entry.mode, 0o700);
        assert_eq!(tree.get(&a).unwrap().index, Some(1));
        assert_eq!(tree.children(tree.root()).len(), 1);
    }

    #[test]
    fn test_root_and_escaping_names() {
        let mut tree = tree();
        tree.insert(0, file("./"));
        tree.insert(1, ArchiveEntry::directory("./"));
        tree.insert(2, file("../../etc/passwd"));
        tree.insert(3, file("/abs/x"));

        assert_eq!(tree.get(tree.root()).unwrap().index, Some(1));
        assert!(tree.get(&tree.resolve_name(b"etc/passwd")).is_some());
        assert!(tree.get(&tree.resolve_name(b"abs")).unwrap().entry.file_type.is_dir());
    }

    #[test]
    fn test_later_duplicate_wins() {
        let mut tree = tree();
        tree.insert(0, file("x"));
        let mut newer = file("x");
        newer.size = 10;
        tree.insert(1, newer);
        let x = tree.resolve_name(b"x");
        assert_eq!(tree.get(&x).unwrap().entry.size, 10);
        assert_eq!(tree.children(tree.root()), &[x]);
    }
}
