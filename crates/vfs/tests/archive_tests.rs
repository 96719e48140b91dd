//! Archive-level behavior against a range-serving fixture store.

mod common;

use common::store::FixtureStore;
use common::{build_archive, site_archive, Entry};
use pagoda_core::config::ZipConfig;
use pagoda_vfs::{VfsError, ZipVfs};
use tokio::io::AsyncReadExt;
use zip::CompressionMethod;

fn test_config() -> ZipConfig {
    ZipConfig {
        open_timeout_secs: 5,
        ..Default::default()
    }
}

async fn read_all(reader: &mut pagoda_vfs::FileReader) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.expect("read file");
    buf
}

#[tokio::test]
async fn serves_stored_and_deflated_files() {
    let store = FixtureStore::new();
    store.put("/site.zip", site_archive());
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let archive = vfs.root(&format!("{base}/site.zip")).await.unwrap();

    let mut reader = archive.open("index.html").await.unwrap();
    assert_eq!(read_all(&mut reader).await, b"hello\n");

    let mut reader = archive.open("app.js").await.unwrap();
    assert_eq!(
        read_all(&mut reader).await,
        "console.log('hi');\n".repeat(64).into_bytes()
    );

    let mut reader = archive.open("subdir/hello.html").await.unwrap();
    assert_eq!(read_all(&mut reader).await, b"sub hello\n");
}

#[tokio::test]
async fn lstat_files_directories_and_missing() {
    let store = FixtureStore::new();
    store.put("/site.zip", site_archive());
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let archive = vfs.root(&format!("{base}/site.zip")).await.unwrap();

    let stat = archive.lstat("index.html").unwrap();
    assert!(stat.is_regular());
    assert_eq!(stat.size, 6);
    assert!(stat.modified.is_some());

    // subdir was never written as an explicit directory record.
    let stat = archive.lstat("subdir").unwrap();
    assert!(stat.is_dir);

    // The public root itself stats as a directory.
    let stat = archive.lstat("").unwrap();
    assert!(stat.is_dir);

    let stat = archive.lstat("link.html").unwrap();
    assert!(stat.is_symlink);

    assert!(matches!(archive.lstat("missing.html"), Err(VfsError::NotFound)));
}

#[tokio::test]
async fn open_on_directory_and_symlink_is_not_file() {
    let store = FixtureStore::new();
    store.put("/site.zip", site_archive());
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let archive = vfs.root(&format!("{base}/site.zip")).await.unwrap();

    assert!(matches!(archive.open("subdir").await, Err(VfsError::NotFile)));
    assert!(matches!(
        archive.open("link.html").await,
        Err(VfsError::NotFile)
    ));
}

#[tokio::test]
async fn readlink_resolves_and_bounds_targets() {
    let long_target = "x".repeat(300);
    let store = FixtureStore::new();
    store.put(
        "/links.zip",
        build_archive(vec![
            Entry::stored("public/index.html", "hello\n"),
            Entry::symlink("public/ok.html", "index.html"),
            Entry::symlink("public/long.html", &long_target),
        ]),
    );
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let archive = vfs.root(&format!("{base}/links.zip")).await.unwrap();

    assert_eq!(archive.readlink("ok.html").await.unwrap(), "index.html");
    // Cached second read returns the same value.
    assert_eq!(archive.readlink("ok.html").await.unwrap(), "index.html");

    assert!(matches!(
        archive.readlink("long.html").await,
        Err(VfsError::SymlinkTooLong)
    ));
    assert!(matches!(
        archive.readlink("index.html").await,
        Err(VfsError::NotSymlink)
    ));
    assert!(matches!(
        archive.readlink("missing").await,
        Err(VfsError::NotFound)
    ));
}

#[tokio::test]
async fn dotdot_segments_cannot_escape_the_public_prefix() {
    let store = FixtureStore::new();
    store.put(
        "/site.zip",
        build_archive(vec![
            Entry::stored("public/index.html", "public\n"),
            Entry::stored("secret.txt", "secret\n"),
        ]),
    );
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let archive = vfs.root(&format!("{base}/site.zip")).await.unwrap();

    assert!(matches!(
        archive.open("../secret.txt").await,
        Err(VfsError::NotFound)
    ));
    assert!(matches!(
        archive.open("a/../../secret.txt").await,
        Err(VfsError::NotFound)
    ));
    // Benign dot segments still resolve.
    let mut reader = archive.open("a/../index.html").await.unwrap();
    assert_eq!(read_all(&mut reader).await, b"public\n");
}

#[tokio::test]
async fn archive_without_known_prefix_serves_from_root() {
    let store = FixtureStore::new();
    store.put(
        "/flat.zip",
        build_archive(vec![
            Entry::stored("index.html", "flat\n"),
            Entry::stored("assets/app.css", "css\n"),
        ]),
    );
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let archive = vfs.root(&format!("{base}/flat.zip")).await.unwrap();

    let mut reader = archive.open("index.html").await.unwrap();
    assert_eq!(read_all(&mut reader).await, b"flat\n");
    assert!(archive.lstat("assets").unwrap().is_dir);
}

#[tokio::test]
async fn missing_archive_fails_open_with_not_found() {
    let store = FixtureStore::new();
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let err = vfs.root(&format!("{base}/absent.zip")).await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound));
}

#[tokio::test]
async fn backend_ignoring_ranges_corrupts_the_open() {
    let store = FixtureStore::new();
    store.put("/site.zip", site_archive());
    store.set_ignore_ranges(true);
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let err = vfs.root(&format!("{base}/site.zip")).await.unwrap_err();
    assert!(matches!(err, VfsError::Corrupted(_)), "got {err:?}");
}

#[tokio::test]
async fn garbage_bytes_are_a_bad_archive() {
    let store = FixtureStore::new();
    store.put("/junk.zip", vec![0u8; 4096]);
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let err = vfs.root(&format!("{base}/junk.zip")).await.unwrap_err();
    assert!(matches!(err, VfsError::BadArchive(_)), "got {err:?}");
}

#[tokio::test]
async fn concurrent_readers_share_chunk_fetches() {
    // A body large enough that file data falls outside the 64 KiB tail the
    // open already cached.
    let big = vec![b'a'; 400 * 1024];
    let store = FixtureStore::new();
    store.put(
        "/big.zip",
        build_archive(vec![Entry {
            name: "public/blob.bin",
            content: big.clone(),
            method: CompressionMethod::Stored,
            unix_mode: None,
        }]),
    );
    let base = store.serve().await;

    let vfs = ZipVfs::new(&test_config());
    let archive = vfs.root(&format!("{base}/big.zip")).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let archive = archive.clone();
        tasks.push(tokio::spawn(async move {
            let mut reader = archive.open("blob.bin").await.unwrap();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            buf
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), big);
    }

    // Every range was fetched at most once: eight concurrent readers of the
    // same chunks cost the same round trips as one.
    let ranges = store.ranges_for("/big.zip");
    let mut deduped = ranges.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(ranges.len(), deduped.len(), "duplicate range fetch: {ranges:?}");
}
