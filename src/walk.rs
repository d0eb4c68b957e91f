//! Recursive tree walk over any [`StorageEngine`].

use std::io;

use futures::future::BoxFuture;

use crate::engine::{EntryInfo, StorageEngine};

/// Returned by the visit callback to steer the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Skip the contents of the directory just visited.
    SkipDir,
}

/// Walk the tree rooted at `root`, calling `visit` for every file and
/// directory including the root itself. Returning [`WalkControl::SkipDir`]
/// from a directory visit skips its children; I/O errors abort the walk.
pub async fn walk<F>(engine: &dyn StorageEngine, root: &str, visit: &mut F) -> io::Result<()>
where
    F: FnMut(&EntryInfo) -> WalkControl + Send,
{
    let info = engine.stat(root).await?;
    walk_entry(engine, info, visit).await
}

fn walk_entry<'a, F>(
    engine: &'a dyn StorageEngine,
    info: EntryInfo,
    visit: &'a mut F,
) -> BoxFuture<'a, io::Result<()>>
where
    F: FnMut(&EntryInfo) -> WalkControl + Send,
{
    Box::pin(async move {
        let control = visit(&info);
        if !info.is_dir || control == WalkControl::SkipDir {
            return Ok(());
        }
        for entry in engine.read_dir(&info.path).await? {
            walk_entry(engine, entry, visit).await?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemEngine;
    use tokio::io::AsyncWriteExt;

    async fn put(engine: &MemEngine, path: &str, data: &[u8]) {
        let mut w = engine.create(path).await.unwrap();
        w.write_all(data).await.unwrap();
        w.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_walk_visits_all_files() {
        let engine = MemEngine::new();
        engine.mkdir_all("walk/sub").await.unwrap();
        put(&engine, "walk/f1.txt", b"1").await;
        put(&engine, "walk/sub/f2.txt", b"2").await;

        let mut files = Vec::new();
        walk(&engine, "walk", &mut |info| {
            if !info.is_dir {
                files.push(info.name.clone());
            }
            WalkControl::Continue
        })
        .await
        .unwrap();

        files.sort();
        assert_eq!(files, vec!["f1.txt".to_string(), "f2.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_walk_skip_dir() {
        let engine = MemEngine::new();
        engine.mkdir_all("walk/sub").await.unwrap();
        put(&engine, "walk/f1.txt", b"1").await;
        put(&engine, "walk/sub/f2.txt", b"2").await;

        let mut files = Vec::new();
        walk(&engine, "walk", &mut |info| {
            if info.is_dir && info.name == "sub" {
                return WalkControl::SkipDir;
            }
            if !info.is_dir {
                files.push(info.name.clone());
            }
            WalkControl::Continue
        })
        .await
        .unwrap();

        assert_eq!(files, vec!["f1.txt".to_string()]);
    }
}
