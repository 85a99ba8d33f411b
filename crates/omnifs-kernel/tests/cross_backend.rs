//! Transfers and lookups that span more than one backend.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use omnifs_kernel::OmnifsConfig;
use omnifs_kernel::testing::{MemoryContentResolver, MemoryDavTransport};
use omnifs_kernel::vfs::backends::archive::{ArchiveProvider, archive_root};
use omnifs_kernel::vfs::backends::content::ContentProvider;
use omnifs_kernel::vfs::backends::dav::DavProvider;
use omnifs_kernel::vfs::backends::local::LocalProvider;
use omnifs_kernel::vfs::{CopyOptions, Registry, Uri, VfsErrorKind, local_uri};

fn registry_with_dav(transport: &Arc<MemoryDavTransport>) -> Arc<Registry> {
    let registry = Registry::new(OmnifsConfig::default());
    registry.register(Arc::new(LocalProvider));
    registry.register(Arc::new(DavProvider::with_transport(
        registry.credentials().clone(),
        registry.config().clone(),
        transport.clone(),
    )));
    registry
}

#[tokio::test]
async fn test_local_to_dav_copy_replaces_and_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    let source_file = dir.path().join("big.bin");
    let data: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&source_file, &data).unwrap();

    let transport = Arc::new(MemoryDavTransport::new());
    let registry = registry_with_dav(&transport);
    let source = registry.parse(source_file.to_str().unwrap()).unwrap();
    let target = registry.parse("davs://dav.example/big.bin").unwrap();
    registry.write_all(&target, b"stale").await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let seen = seen.clone();
        CopyOptions::default().replace_existing().with_progress(
            std::time::Duration::from_millis(1000),
            Arc::new(move |copied| seen.lock().push(copied)),
        )
    };
    registry
        .copy(&source, &target, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(transport.contents(b"/big.bin").as_deref(), Some(data.as_slice()));
    let seen = seen.lock().clone();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    assert_eq!(seen.last().copied(), Some(data.len() as u64));

    let ops = transport.operations();
    let delete = ops.iter().rposition(|op| op == "DELETE /big.bin").unwrap();
    let put = ops.iter().rposition(|op| op == "PUT /big.bin").unwrap();
    assert!(delete < put, "{ops:?}");
}

#[tokio::test]
async fn test_copy_without_replace_keeps_existing_target() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"new contents").unwrap();

    let transport = Arc::new(MemoryDavTransport::new());
    let registry = registry_with_dav(&transport);
    let source = registry.parse(dir.path().join("a.txt").to_str().unwrap()).unwrap();
    let target = registry.parse("davs://dav.example/a.txt").unwrap();
    registry.write_all(&target, b"keep me").await.unwrap();
    let before = registry.metadata(&target, true).await.unwrap();

    let err = registry
        .copy(&source, &target, &CopyOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), VfsErrorKind::FileAlreadyExists);
    assert_eq!(transport.contents(b"/a.txt").as_deref(), Some(&b"keep me"[..]));
    let after = registry.metadata(&target, true).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.size, 7);
    assert!(!transport.operations().iter().any(|op| op == "DELETE /a.txt"));
}

#[tokio::test]
async fn test_atomic_move_between_content_items_is_refused() {
    let resolver = Arc::new(MemoryContentResolver::new());
    resolver.insert("content://media/file/1", "a.txt", b"first");
    resolver.insert("content://media/file/2", "b.txt", b"second");
    let registry = Registry::new(OmnifsConfig::default());
    registry.register(Arc::new(ContentProvider::new(resolver.clone())));

    let source = registry.parse("content://media/file/1").unwrap();
    let target = registry.parse("content://media/file/2").unwrap();
    let err = registry
        .move_file(
            &source,
            &target,
            &CopyOptions::default().replace_existing().atomic_move(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), VfsErrorKind::AtomicMoveNotSupported);
    assert_eq!(registry.read_all(&source).await.unwrap(), b"first");
    assert_eq!(registry.read_all(&target).await.unwrap(), b"second");
    assert_eq!(resolver.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_share_one_file_system() {
    let registry = Registry::with_default_providers(OmnifsConfig::default());
    let root = Uri::parse("ftp://mirror.example/").unwrap();
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            let root = root.clone();
            tokio::spawn(async move { registry.get_or_create(&root).unwrap() })
        })
        .collect();
    let mut file_systems = Vec::new();
    for task in tasks {
        file_systems.push(task.await.unwrap());
    }
    assert!(file_systems.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(registry.roots(), vec![root]);
}

#[tokio::test]
async fn test_archive_synthesizes_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let tar_path = dir.path().join("bundle.tar");
    {
        let mut builder = tar::Builder::new(std::fs::File::create(&tar_path).unwrap());
        let body = b"all good";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "docs/report.txt", &body[..])
            .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "docs/img/", std::io::empty())
            .unwrap();
        builder.into_inner().unwrap().flush().unwrap();
    }

    let registry = Registry::new(OmnifsConfig::default());
    registry.register(Arc::new(LocalProvider));
    registry.register(Arc::new(ArchiveProvider::new(
        Arc::downgrade(&registry),
        registry.config().clone(),
    )));
    let root = archive_root(&local_uri(&tar_path).unwrap());
    let top = registry.path(&root).unwrap();

    let names: Vec<_> = registry
        .list(&top)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name.to_string())
        .collect();
    assert_eq!(names, vec!["docs"]);

    let docs = top.resolve_name("docs");
    assert!(registry.metadata(&docs, true).await.unwrap().is_dir());
    let mut children: Vec<_> = registry
        .list(&docs)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name.to_string())
        .collect();
    children.sort();
    assert_eq!(children, vec!["img", "report.txt"]);
    assert_eq!(
        registry.read_all(&docs.resolve_name("report.txt")).await.unwrap(),
        b"all good"
    );
}
