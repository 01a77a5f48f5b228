use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::*;
use crate::backend::{Backend, Capabilities};
use crate::config::PoolConfig;
use crate::core::ConflictPolicy;

fn manager_in(dir: &Path) -> FileManager {
    let base = SingleRef::from_local_path(dir, true).unwrap();
    let config = ManagerConfig {
        base_uri: Some(base.to_string()),
        ..ManagerConfig::default()
    };
    FileManager::from_config(&config).unwrap()
}

async fn put(manager: &FileManager, expr: &str, content: &str) {
    let cx = CancellationToken::new();
    let opts = WriteOptions {
        make_parents: true,
        ..WriteOptions::default()
    };
    let opened = manager.get_output(expr, &opts, &cx).await;
    assert!(opened.success(), "{:?}", opened.first_error());
    for mut output in opened.into_values() {
        output.stream.write_all(content.as_bytes()).await.unwrap();
        output.stream.shutdown().await.unwrap();
    }
}

async fn get(manager: &FileManager, expr: &str) -> String {
    let cx = CancellationToken::new();
    let opened = manager.get_input(expr, &cx).await;
    assert!(opened.success(), "{:?}", opened.first_error());
    let mut input = opened.into_values().remove(0);
    let mut out = String::new();
    input.stream.read_to_string(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn test_copy_directory_contents_into_existing_directory() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "srcdir/file.tmp", "hello").await;
    put(&manager, "srcdir/subdir/found.tmp", "world").await;
    std::fs::create_dir(temp.path().join("targetdir")).unwrap();

    let result = manager
        .copy("srcdir/", "targetdir/", &CopyOptions::recursive(), &cx)
        .await;

    assert!(result.success(), "{:?}", result.first_error());
    assert_eq!(result.total_count(), 4);
    assert_eq!(get(&manager, "targetdir/file.tmp").await, "hello");
    assert_eq!(get(&manager, "targetdir/subdir/found.tmp").await, "world");
}

#[tokio::test]
async fn test_resolve_glob_matches_only_pattern() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    for name in ["f.tmp", "found.tmp", "other.txt"] {
        put(&manager, &format!("dir/{}", name), name).await;
    }

    let result = manager.resolve("dir/f*.tmp", &cx).await;

    assert!(result.success());
    let mut names: Vec<String> = result.values().iter().map(|r| r.name()).collect();
    names.sort();
    assert_eq!(names, vec!["f.tmp", "found.tmp"]);
    assert!(result.values().iter().all(|r| r.is_within(&manager.base().child("dir"))));
}

#[tokio::test]
async fn test_copy_onto_itself_fails_without_io() {
    let manager = FileManager::from_config(&ManagerConfig::default()).unwrap();
    let cx = CancellationToken::new();

    let result = manager
        .copy("mem://v/a", "mem://v/a", &CopyOptions::default(), &cx)
        .await;

    assert!(!result.success());
    assert!(matches!(
        result.first_error(),
        Some(FileOpError::SourceEqualsTarget(_))
    ));
    let memory = manager.memory().unwrap();
    assert_eq!(
        memory.pool().connector().connections_opened(),
        0,
        "No session should be opened for a self-copy"
    );
}

#[tokio::test]
async fn test_move_onto_itself_keeps_file() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "a.tmp", "keep").await;

    let result = manager
        .move_to("a.tmp", "a.tmp", &MoveOptions::default(), &cx)
        .await;

    assert!(!result.success());
    assert_eq!(get(&manager, "a.tmp").await, "keep");
}

#[tokio::test]
async fn test_create_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();

    let first = manager.create("newdir/", &CreateOptions::default(), &cx).await;
    let second = manager.create("newdir/", &CreateOptions::default(), &cx).await;

    assert!(first.success(), "{:?}", first.first_error());
    assert!(second.success(), "Creating an existing directory should succeed");
    assert!(manager.info("newdir", &cx).await.is_directory());
}

#[tokio::test]
async fn test_conflict_policies() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "src.txt", "new").await;
    put(&manager, "dst.txt", "old").await;

    let past = FileTime::from_unix_time(1_000_000, 0);
    filetime::set_file_mtime(temp.path().join("src.txt"), past).unwrap();
    let update = CopyOptions::default().with_conflict(ConflictPolicy::Update);

    let skipped = manager.copy("src.txt", "dst.txt", &update, &cx).await;
    assert!(skipped.success());
    assert_eq!(get(&manager, "dst.txt").await, "old", "Older source should be skipped");

    let refused = manager
        .copy(
            "src.txt",
            "dst.txt",
            &CopyOptions::default().with_conflict(ConflictPolicy::NoOverwrite),
            &cx,
        )
        .await;
    assert!(matches!(refused.first_error(), Some(FileOpError::AlreadyExists(_))));

    let future = FileTime::from_unix_time(Utc::now().timestamp() + 3600, 0);
    filetime::set_file_mtime(temp.path().join("src.txt"), future).unwrap();
    let copied = manager.copy("src.txt", "dst.txt", &update, &cx).await;
    assert!(copied.success());
    assert_eq!(get(&manager, "dst.txt").await, "new");
}

#[tokio::test]
async fn test_failed_move_keeps_source() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "src/a.txt", "a").await;
    put(&manager, "src/b.txt", "b").await;
    manager
        .memory()
        .unwrap()
        .inject_fault(&SingleRef::parse("mem://v/dst/b.txt").unwrap());

    let result = manager
        .move_to("src", "mem://v/dst", &MoveOptions::recursive(), &cx)
        .await;

    assert!(!result.success());
    assert_eq!(result.fail_count(), 1);
    assert!(!temp.path().join("src/a.txt").exists());
    assert!(temp.path().join("src/b.txt").exists(), "Unmoved file should stay");
    assert!(temp.path().join("src").is_dir());
    assert_eq!(get(&manager, "mem://v/dst/a.txt").await, "a");
}

#[tokio::test]
async fn test_slash_target_on_existing_file_is_not_a_directory() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();

    for (source, target) in [("a.txt", "b.txt"), ("mem://v/a.txt", "mem://v/b.txt")] {
        put(&manager, source, "new").await;
        put(&manager, target, "old").await;

        let slashed = format!("{}/", target);
        let copied = manager
            .copy(source, &slashed, &CopyOptions::default(), &cx)
            .await;
        assert!(
            matches!(copied.first_error(), Some(FileOpError::NotADirectory(_))),
            "Copy onto {} should fail, got {:?}",
            slashed,
            copied.first_error()
        );

        let moved = manager
            .move_to(source, &slashed, &MoveOptions::default(), &cx)
            .await;
        assert!(!moved.success(), "Move onto {} should fail", slashed);

        assert_eq!(get(&manager, target).await, "old", "Existing file should be kept");
        assert_eq!(get(&manager, source).await, "new", "Source should be kept");
    }
}

#[tokio::test]
async fn test_cross_scheme_copy() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "note.txt", "remember").await;

    let to_memory = manager
        .copy(
            "note.txt",
            "mem://v/notes/",
            &CopyOptions::default().with_make_parents(true),
            &cx,
        )
        .await;
    assert!(to_memory.success(), "{:?}", to_memory.first_error());
    assert_eq!(get(&manager, "mem://v/notes/note.txt").await, "remember");

    let back = manager
        .copy("mem://v/notes/note.txt", "copy.txt", &CopyOptions::default(), &cx)
        .await;
    assert!(back.success(), "{:?}", back.first_error());
    assert_eq!(get(&manager, "copy.txt").await, "remember");
}

#[tokio::test]
async fn test_multiple_sources_need_directory_target() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "a.txt", "a").await;
    put(&manager, "b.txt", "b").await;

    let refused = manager
        .copy("a.txt;b.txt", "out.txt", &CopyOptions::default(), &cx)
        .await;
    assert_eq!(refused.total_count(), 1);
    assert!(matches!(refused.first_error(), Some(FileOpError::NotADirectory(_))));
    assert!(!temp.path().join("out.txt").exists());

    let opts = CopyOptions::default().with_make_parents(true);
    let copied = manager.copy("a.txt;b.txt", "outdir/", &opts, &cx).await;
    assert!(copied.success(), "{:?}", copied.first_error());
    assert_eq!(copied.total_count(), 2);
    assert_eq!(get(&manager, "outdir/b.txt").await, "b");
}

#[tokio::test]
async fn test_target_inside_source_is_fatal() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "src/a.txt", "a").await;

    let result = manager
        .copy("src", "src/inner", &CopyOptions::recursive(), &cx)
        .await;

    assert!(!result.success());
    assert!(matches!(
        result.first_error(),
        Some(FileOpError::TargetInsideSource { .. })
    ));
    assert!(!temp.path().join("src/inner").exists());
}

#[tokio::test]
async fn test_info_and_list() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "dir/f.tmp", "12345").await;
    put(&manager, "dir/sub/g.tmp", "x").await;

    let info = manager.info("dir/f.tmp", &cx).await;
    assert!(info.exists() && info.is_file());
    assert_eq!(info.size(), Some(5));

    let missing = manager.info("dir/none", &cx).await;
    assert!(missing.success(), "A missing entry is not an error");
    assert!(!missing.exists());

    let multi = manager.info("a;b", &cx).await;
    assert!(matches!(
        multi.first_error(),
        Some(FileOpError::MalformedReference { .. })
    ));

    let listed = manager
        .list("dir", &ListOptions { recursive: true }, &cx)
        .await;
    assert!(listed.success());
    let names: Vec<&str> = listed.values().iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["f.tmp", "sub", "g.tmp"]);
}

#[tokio::test]
async fn test_info_glob_needs_exactly_one_match() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "dir/one.tmp", "1").await;
    put(&manager, "dir/two.tmp", "22").await;

    let one = manager.info("dir/o*.tmp", &cx).await;
    assert!(one.success(), "{:?}", one.first_error());
    assert_eq!(one.size(), Some(1));

    let several = manager.info("dir/*.tmp", &cx).await;
    assert!(!several.success(), "A glob matching two entries should fail");
    assert!(matches!(
        several.first_error(),
        Some(FileOpError::MalformedReference { .. })
    ));
    assert!(several.values().is_empty());

    let none = manager.info("dir/*.none", &cx).await;
    assert!(none.first_error().is_some_and(|e| e.is_not_found()));
}

#[tokio::test]
async fn test_delete() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();
    put(&manager, "dir/a.tmp", "a").await;

    let no_match = manager.delete("dir/*.none", &DeleteOptions::default(), &cx).await;
    assert!(!no_match.success(), "Deleting nothing should fail");
    assert!(no_match.first_error().is_some_and(|e| e.is_not_found()));

    let refused = manager.delete("dir", &DeleteOptions::default(), &cx).await;
    assert!(matches!(
        refused.first_error(),
        Some(FileOpError::DirectoryRequiresRecursive(_))
    ));

    let deleted = manager
        .delete("dir", &DeleteOptions { recursive: true }, &cx)
        .await;
    assert!(deleted.success(), "{:?}", deleted.first_error());
    assert_eq!(deleted.total_count(), 2);
    assert!(!temp.path().join("dir").exists());
}

#[tokio::test]
async fn test_get_output_opens_every_target() {
    let temp = TempDir::new().unwrap();
    let manager = manager_in(temp.path());
    let cx = CancellationToken::new();

    put(&manager, "one.txt;two.txt", "same").await;
    assert_eq!(get(&manager, "one.txt").await, "same");
    assert_eq!(get(&manager, "two.txt").await, "same");

    let dir = manager
        .get_output("folder/", &WriteOptions::default(), &cx)
        .await;
    assert!(matches!(dir.first_error(), Some(FileOpError::NotADirectory(_))));

    let missing = manager.get_input("absent.txt", &cx).await;
    assert!(!missing.success());
}

/// Memory backend that cancels a token once a given number of files have
/// been opened for writing.
struct CancelAfterWrites {
    inner: MemoryBackend,
    writes: AtomicUsize,
    limit: usize,
    cx: CancellationToken,
}

#[async_trait]
impl Backend for CancelAfterWrites {
    fn scheme(&self) -> &str {
        self.inner.scheme()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_rename: false,
            native_copy: false,
            ..self.inner.capabilities()
        }
    }

    async fn info(&self, target: &SingleRef) -> FileOpResult<Option<Info>> {
        self.inner.info(target).await
    }

    async fn list(&self, dir: &SingleRef) -> FileOpResult<Vec<Info>> {
        self.inner.list(dir).await
    }

    async fn create_file(&self, target: &SingleRef) -> FileOpResult<()> {
        self.inner.create_file(target).await
    }

    async fn make_dir(&self, target: &SingleRef) -> FileOpResult<()> {
        self.inner.make_dir(target).await
    }

    async fn delete_file(&self, target: &SingleRef) -> FileOpResult<()> {
        self.inner.delete_file(target).await
    }

    async fn remove_dir(&self, target: &SingleRef) -> FileOpResult<()> {
        self.inner.remove_dir(target).await
    }

    async fn read(&self, target: &SingleRef) -> FileOpResult<BoxReader> {
        self.inner.read(target).await
    }

    async fn write(&self, target: &SingleRef, append: bool) -> FileOpResult<BoxWriter> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
            self.cx.cancel();
        }
        self.inner.write(target, append).await
    }

    async fn set_last_modified(&self, target: &SingleRef, at: DateTime<Utc>) -> FileOpResult<()> {
        self.inner.set_last_modified(target, at).await
    }
}

#[tokio::test]
async fn test_cancel_mid_copy_keeps_finished_files() {
    let cx = CancellationToken::new();
    let inner = MemoryBackend::new(&PoolConfig::default());
    let mem = |path: &str| SingleRef::parse(&format!("mem://v{}", path)).unwrap();

    inner.make_dir(&mem("/src")).await.unwrap();
    for i in 0..20 {
        let mut w = inner.write(&mem(&format!("/src/f{:02}", i)), false).await.unwrap();
        w.write_all(b"payload").await.unwrap();
        w.shutdown().await.unwrap();
    }

    let backend = Arc::new(CancelAfterWrites {
        inner: inner.clone(),
        writes: AtomicUsize::new(0),
        limit: 5,
        cx: cx.clone(),
    });
    let dispatcher = HandlerRegistry::new(TreeEngine::default())
        .register(PrimitiveHandler::new(backend, TreeEngine::default()))
        .build();
    let manager = FileManager::new(dispatcher, mem("/"));

    let result = manager
        .copy("mem://v/src", "mem://v/dst", &CopyOptions::recursive(), &cx)
        .await;

    assert!(!result.success());
    assert_eq!(result.success_count() + result.fail_count(), result.total_count());
    assert!(result.errors().any(|e| e.is_cancelled()), "Cancellation should be reported");

    let copied: Vec<&SingleRef> = result
        .outcomes()
        .iter()
        .filter(|o| o.is_success() && o.target.name().starts_with('f'))
        .map(|o| &o.target)
        .collect();
    assert_eq!(copied.len(), 4);
    for target in copied {
        assert!(inner.info(target).await.unwrap().is_some(), "{} should remain", target);
    }
    assert!(
        inner.info(&mem("/dst/f04")).await.unwrap().is_none(),
        "Partial file should be removed"
    );
    assert!(inner.info(&mem("/dst/f19")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_parallel_copy_keeps_finished_files() {
    let cx = CancellationToken::new();
    let inner = MemoryBackend::new(&PoolConfig::default());
    let mem = |path: &str| SingleRef::parse(&format!("mem://v{}", path)).unwrap();

    inner.make_dir(&mem("/src")).await.unwrap();
    for i in 0..20 {
        let mut w = inner.write(&mem(&format!("/src/f{:02}", i)), false).await.unwrap();
        w.write_all(b"payload").await.unwrap();
        w.shutdown().await.unwrap();
    }

    let engine = TreeEngine::new(8 * 1024, 4);
    let backend = Arc::new(CancelAfterWrites {
        inner: inner.clone(),
        writes: AtomicUsize::new(0),
        limit: 5,
        cx: cx.clone(),
    });
    let dispatcher = HandlerRegistry::new(engine.clone())
        .register(PrimitiveHandler::new(backend, engine))
        .build();
    let manager = FileManager::new(dispatcher, mem("/"));

    let result = manager
        .copy("mem://v/src", "mem://v/dst", &CopyOptions::recursive(), &cx)
        .await;

    assert!(!result.success());
    assert_eq!(result.success_count() + result.fail_count(), result.total_count());
    assert!(result.errors().any(|e| e.is_cancelled()), "Cancellation should be reported");

    let files: Vec<_> = result
        .outcomes()
        .iter()
        .filter(|o| o.target.name().starts_with('f'))
        .collect();
    let copied = files.iter().filter(|o| o.is_success()).count();
    assert!(copied < 20, "Workers should stop after cancellation");
    for outcome in files {
        let present = inner.info(&outcome.target).await.unwrap().is_some();
        assert_eq!(
            present,
            outcome.is_success(),
            "{} should exist only if it was copied",
            outcome.target
        );
    }
}

#[tokio::test]
async fn test_concurrent_copies_share_pool() {
    let config = PoolConfig {
        max_per_authority: 1,
        idle_ttl_secs: 60.0,
    };
    let memory = MemoryBackend::new(&config);
    let engine = TreeEngine::new(8 * 1024, 4);
    let dispatcher = HandlerRegistry::new(engine.clone())
        .register(PrimitiveHandler::new(Arc::new(memory.clone()), engine))
        .build();
    let mem = |path: &str| SingleRef::parse(&format!("mem://v{}", path)).unwrap();
    let manager = FileManager::new(dispatcher, mem("/"));
    let cx = CancellationToken::new();

    for dir in ["a", "b"] {
        memory.make_dir(&mem(&format!("/{}", dir))).await.unwrap();
        for i in 0..6 {
            let mut w = memory
                .write(&mem(&format!("/{}/f{}", dir, i)), false)
                .await
                .unwrap();
            w.write_all(dir.as_bytes()).await.unwrap();
            w.shutdown().await.unwrap();
        }
    }

    let opts = CopyOptions::recursive();
    let (first, second) = tokio::join!(
        manager.copy("mem://v/a", "mem://v/a2", &opts, &cx),
        manager.copy("mem://v/b", "mem://v/b2", &opts, &cx),
    );

    assert!(first.success(), "{:?}", first.first_error());
    assert!(second.success(), "{:?}", second.first_error());
    assert_eq!(first.total_count(), 7);
    assert_eq!(second.total_count(), 7);
    for i in 0..6 {
        assert!(memory.info(&mem(&format!("/a2/f{}", i))).await.unwrap().is_some());
        assert!(memory.info(&mem(&format!("/b2/f{}", i))).await.unwrap().is_some());
    }

    let pool = memory.pool();
    assert_eq!(pool.in_use(&mem("/").authority_key()), 0, "Every session should be returned");
    assert_eq!(pool.connector().connections_opened(), 1, "One session should be shared");
}

#[tokio::test]
async fn test_cancel_while_waiting_for_session() {
    let config = ManagerConfig {
        pool: PoolConfig {
            max_per_authority: 1,
            idle_ttl_secs: 60.0,
        },
        ..ManagerConfig::default()
    };
    let manager = FileManager::from_config(&config).unwrap();
    let memory = manager.memory().unwrap();
    let authority = SingleRef::parse("mem://v/").unwrap().authority_key();
    let held = memory.pool().acquire(&authority).await.unwrap();

    let cx = CancellationToken::new();
    let trigger = cx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), manager.info("mem://v/x", &cx))
        .await
        .expect("Info should stop waiting once cancelled");
    assert!(
        result.errors().any(|e| e.is_cancelled()),
        "Info should report cancellation, got {:?}",
        result.first_error()
    );
    drop(held);
}
