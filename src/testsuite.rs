//! Reusable conformance battery for [`StorageEngine`] implementations.
//!
//! Driver tests call [`storage_engine_suite`] against a fresh engine to
//! verify the shared contract semantics:
//!
//! ```ignore
//! #[tokio::test]
//! async fn test_conformance_suite() {
//!     let engine = MyEngine::new();
//!     shardfs::testsuite::storage_engine_suite(&engine).await;
//! }
//! ```

use std::io::{self, SeekFrom};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::engine::{OpenFlags, StorageEngine};
use crate::walk::{WalkControl, walk};

/// Run every contract check against `engine`. Panics on the first failure.
///
/// The engine should be empty; the suite creates and removes its own
/// fixtures.
pub async fn storage_engine_suite(engine: &dyn StorageEngine) {
    create_open_stat_remove(engine).await;
    mkdir_all_and_read_dir(engine).await;
    rename(engine).await;
    open_file_append(engine).await;
    walk_tree(engine).await;
    copier(engine).await;
    hasher(engine).await;
    stream_reader(engine).await;
}

async fn write_string(engine: &dyn StorageEngine, path: &str, content: &str) {
    let mut w = engine
        .create(path)
        .await
        .unwrap_or_else(|e| panic!("create {path}: {e}"));
    w.write_all(content.as_bytes())
        .await
        .unwrap_or_else(|e| panic!("write {path}: {e}"));
    w.shutdown()
        .await
        .unwrap_or_else(|e| panic!("close writer {path}: {e}"));
}

async fn read_string(engine: &dyn StorageEngine, path: &str) -> String {
    let mut r = engine
        .open(path)
        .await
        .unwrap_or_else(|e| panic!("open {path}: {e}"));
    let mut out = String::new();
    r.read_to_string(&mut out)
        .await
        .unwrap_or_else(|e| panic!("read {path}: {e}"));
    out
}

async fn create_open_stat_remove(engine: &dyn StorageEngine) {
    let path = "test/hello.txt";
    let content = "hello world";
    write_string(engine, path, content).await;

    let info = engine.stat(path).await.expect("stat after create");
    assert_eq!(info.name, "hello.txt");
    assert_eq!(info.size, content.len() as u64);
    assert!(!info.is_dir);

    assert_eq!(read_string(engine, path).await, content);

    let mut r = engine.open(path).await.expect("open for seek");
    r.seek(SeekFrom::Start(6)).await.expect("seek");
    let mut partial = String::new();
    r.read_to_string(&mut partial).await.expect("read after seek");
    assert_eq!(partial, "world");
    drop(r);

    engine.remove(path).await.expect("remove");
    assert!(
        engine.stat(path).await.is_err(),
        "stat after remove should fail"
    );
    engine.remove("test").await.expect("cleanup");
}

async fn mkdir_all_and_read_dir(engine: &dyn StorageEngine) {
    let dir = "test/dirops";
    engine.mkdir_all(dir).await.expect("mkdir_all");

    for name in ["a.txt", "b.txt"] {
        write_string(engine, &format!("{dir}/{name}"), name).await;
    }

    let entries = engine.read_dir(dir).await.expect("read_dir");
    assert_eq!(entries.len(), 2, "read_dir entries: {entries:?}");
    assert_eq!(entries[0].name, "a.txt");
    assert_eq!(entries[1].name, "b.txt");

    engine.remove("test").await.expect("cleanup");
}

async fn rename(engine: &dyn StorageEngine) {
    write_string(engine, "rename_src.txt", "data").await;

    engine
        .rename("rename_src.txt", "rename_dst.txt")
        .await
        .expect("rename");

    assert!(
        engine.stat("rename_src.txt").await.is_err(),
        "source should be gone after rename"
    );
    let info = engine.stat("rename_dst.txt").await.expect("stat dst");
    assert_eq!(info.size, 4);

    engine.remove("rename_dst.txt").await.expect("cleanup");
}

async fn open_file_append(engine: &dyn StorageEngine) {
    let path = "append_test.txt";
    write_string(engine, path, "hello").await;

    let mut w = engine
        .open_file(path, OpenFlags::new().write(true).append(true))
        .await
        .expect("open_file append");
    w.write_all(b" world").await.expect("append write");
    w.shutdown().await.expect("append close");

    assert_eq!(read_string(engine, path).await, "hello world");
    engine.remove(path).await.expect("cleanup");
}

async fn walk_tree(engine: &dyn StorageEngine) {
    engine.mkdir_all("walk/sub").await.expect("mkdir_all");
    write_string(engine, "walk/f1.txt", "1").await;
    write_string(engine, "walk/sub/f2.txt", "2").await;

    let mut files = Vec::new();
    walk(engine, "walk", &mut |info| {
        if !info.is_dir {
            files.push(info.name.clone());
        }
        WalkControl::Continue
    })
    .await
    .expect("walk");

    files.sort();
    assert_eq!(files, vec!["f1.txt".to_string(), "f2.txt".to_string()]);

    engine.remove("walk").await.expect("cleanup");
}

async fn copier(engine: &dyn StorageEngine) {
    let Some(copier) = engine.as_copier() else {
        return;
    };

    write_string(engine, "copy_src.txt", "copy me").await;
    copier.copy("copy_src.txt", "copy_dst.txt").await.expect("copy");
    assert_eq!(read_string(engine, "copy_dst.txt").await, "copy me");

    engine.remove("copy_src.txt").await.expect("cleanup");
    engine.remove("copy_dst.txt").await.expect("cleanup");
}

async fn hasher(engine: &dyn StorageEngine) {
    let Some(hasher) = engine.as_hasher() else {
        return;
    };

    let path = "hash_test.txt";
    write_string(engine, path, "hash me").await;

    match hasher.hash(path, "sha256").await {
        Ok(digest) => {
            assert!(!digest.is_empty(), "hash returned empty digest");
            let again = hasher.hash(path, "sha256").await.expect("hash again");
            assert_eq!(digest, again, "hash not deterministic");
        }
        Err(e) if e.kind() == io::ErrorKind::Unsupported => {}
        Err(e) => panic!("hash: {e}"),
    }

    engine.remove(path).await.expect("cleanup");
}

async fn stream_reader(engine: &dyn StorageEngine) {
    let Some(stream_reader) = engine.as_stream_reader() else {
        return;
    };

    let path = "stream_test.txt";
    write_string(engine, path, "stream data").await;

    let mut stream = stream_reader.get(path).await.expect("get");
    let mut data = Vec::new();
    stream
        .read_to_end(&mut data)
        .await
        .expect("read stream");
    assert_eq!(data, b"stream data");

    engine.remove(path).await.expect("cleanup");
}
