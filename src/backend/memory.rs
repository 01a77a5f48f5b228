//! In-process backend under the `mem` scheme.
//!
//! Each `host:port` is a separate volume. Every primitive checks out a pooled
//! session first, so the backend behaves like a remote one with respect to
//! connection limits and failure handling. Paths registered with
//! [`MemoryBackend::inject_fault`] fail with a protocol fault.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tracing::warn;

use super::{Backend, BoxReader, BoxWriter, Capabilities, EntryKind, Info, Permissions};
use crate::config::PoolConfig;
use crate::error::{FileOpError, FileOpResult};
use crate::pool::{ConnectionPool, Connector};
use crate::uri::{Authority, SingleRef, decode, encode_name};

pub const MEMORY_SCHEME: &str = "mem";

type Bytes = Arc<Mutex<Vec<u8>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
enum Node {
    Dir {
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    },
    File {
        data: Bytes,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    },
}

impl Node {
    fn dir() -> Self {
        let now = Utc::now();
        Node::Dir {
            created: now,
            modified: now,
        }
    }

    fn file(data: Vec<u8>) -> Self {
        let now = Utc::now();
        Node::File {
            data: Arc::new(Mutex::new(data)),
            created: now,
            modified: now,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }

    fn describe(&self, reference: &SingleRef) -> Info {
        let (kind, size, created, modified) = match self {
            Node::Dir { created, modified } => (EntryKind::Directory, 0, *created, *modified),
            Node::File {
                data,
                created,
                modified,
            } => (EntryKind::File, lock(data).len() as u64, *created, *modified),
        };
        let mut info = Info::new(reference, kind);
        info.size = size;
        info.created = Some(created);
        info.last_modified = Some(modified);
        info.permissions = Some(Permissions {
            readable: true,
            writable: true,
            executable: false,
        });
        info
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        match self {
            Node::Dir { modified, .. } | Node::File { modified, .. } => *modified = at,
        }
    }
}

/// Nodes keyed by canonically encoded path without trailing slash; the
/// root is `/`. An encoded `/` inside a name stays inside that segment.
type Volume = BTreeMap<String, Node>;

fn new_volume() -> Volume {
    let mut volume = Volume::new();
    volume.insert("/".to_string(), Node::dir());
    volume
}

fn node_key(target: &SingleRef) -> String {
    let segments = target.segments();
    if segments.is_empty() {
        return "/".to_string();
    }
    segments
        .iter()
        .map(|segment| format!("/{}", encode_name(&decode(segment))))
        .collect()
}

fn parent_key(key: &str) -> Option<String> {
    if key == "/" {
        return None;
    }
    match key.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(key[..idx].to_string()),
        None => None,
    }
}

fn child_prefix(key: &str) -> String {
    if key == "/" {
        "/".to_string()
    } else {
        format!("{}/", key)
    }
}

fn has_children(volume: &Volume, key: &str) -> bool {
    let prefix = child_prefix(key);
    volume
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(k, _)| k.starts_with(&prefix))
}

fn require_parent_dir(volume: &Volume, key: &str, target: &SingleRef) -> FileOpResult<()> {
    let parent = parent_key(key).ok_or_else(|| FileOpError::AlreadyExists(target.redacted()))?;
    match volume.get(&parent) {
        Some(node) if node.is_dir() => Ok(()),
        Some(_) => Err(FileOpError::NotADirectory(target.redacted())),
        None => Err(FileOpError::NotFound(target.redacted())),
    }
}

/// Handle to an opened session.
#[derive(Debug)]
pub struct MemorySession {
    pub id: usize,
}

/// Opens sessions to in-memory volumes.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    opened: AtomicUsize,
    closed: AtomicUsize,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make new connection attempts fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemorySession;

    async fn connect(&self, authority: &Authority) -> FileOpResult<MemorySession> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FileOpError::ConnectionFailed {
                authority: authority.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession { id })
    }

    fn close(&self, _conn: MemorySession) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Store {
    volumes: Mutex<HashMap<String, Volume>>,
    faults: Mutex<HashSet<String>>,
}

/// Pooled in-memory backend.
#[derive(Clone)]
pub struct MemoryBackend {
    store: Arc<Store>,
    pool: ConnectionPool<MemoryConnector>,
}

impl MemoryBackend {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            store: Arc::new(Store::default()),
            pool: ConnectionPool::new(MemoryConnector::default(), config),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<MemoryConnector> {
        &self.pool
    }

    /// Make every primitive touching `target` fail.
    pub fn inject_fault(&self, target: &SingleRef) {
        lock(&self.store.faults).insert(target.without_trailing_slash().to_string());
    }

    pub fn clear_faults(&self) {
        lock(&self.store.faults).clear();
    }

    fn is_faulted(&self, target: &SingleRef) -> bool {
        lock(&self.store.faults).contains(&target.without_trailing_slash().to_string())
    }

    /// Run `op` on the target's volume inside a pooled session.
    async fn with_session<T, F>(&self, target: &SingleRef, op: F) -> FileOpResult<T>
    where
        F: FnOnce(&mut Volume) -> FileOpResult<T>,
    {
        let session = self.pool.checkout(&target.authority_key()).await?;
        if self.is_faulted(target) {
            warn!("Injected fault on {}", target.redacted());
            self.pool.release(session, false);
            return Err(FileOpError::backend(format!(
                "injected fault on {}",
                target.redacted()
            )));
        }

        let result = {
            let mut volumes = lock(&self.store.volumes);
            let volume = volumes
                .entry(volume_key(target))
                .or_insert_with(new_volume);
            op(volume)
        };

        let valid = !matches!(&result, Err(e) if e.is_protocol_fault());
        self.pool.release(session, valid);
        result
    }
}

fn volume_key(target: &SingleRef) -> String {
    format!(
        "{}:{}",
        target.host().unwrap_or_default(),
        target.port().unwrap_or(0)
    )
}

/// Appends to a file node's buffer.
struct MemoryWriter {
    data: Bytes,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        lock(&self.data).extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_rename: true,
            native_copy: true,
            set_last_modified: true,
            case_insensitive: false,
        }
    }

    fn same_instance(&self, a: &SingleRef, b: &SingleRef) -> bool {
        a.scheme() == b.scheme() && volume_key(a) == volume_key(b)
    }

    async fn info(&self, target: &SingleRef) -> FileOpResult<Option<Info>> {
        self.with_session(target, |volume| {
            Ok(volume.get(&node_key(target)).map(|node| node.describe(target)))
        })
        .await
    }

    async fn list(&self, dir: &SingleRef) -> FileOpResult<Vec<Info>> {
        self.with_session(dir, |volume| {
            let key = node_key(dir);
            match volume.get(&key) {
                None => return Err(FileOpError::NotFound(dir.redacted())),
                Some(node) if !node.is_dir() => {
                    return Err(FileOpError::NotADirectory(dir.redacted()));
                }
                Some(_) => {}
            }

            let prefix = child_prefix(&key);
            let children = volume
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .filter(|(k, _)| !k[prefix.len()..].contains('/'))
                .map(|(k, node)| node.describe(&dir.join_encoded(&k[prefix.len()..])))
                .collect();
            Ok(children)
        })
        .await
    }

    async fn create_file(&self, target: &SingleRef) -> FileOpResult<()> {
        self.with_session(target, |volume| {
            let key = node_key(target);
            if volume.contains_key(&key) {
                return Err(FileOpError::AlreadyExists(target.redacted()));
            }
            require_parent_dir(volume, &key, target)?;
            volume.insert(key, Node::file(Vec::new()));
            Ok(())
        })
        .await
    }

    async fn make_dir(&self, target: &SingleRef) -> FileOpResult<()> {
        self.with_session(target, |volume| {
            let key = node_key(target);
            if volume.contains_key(&key) {
                return Err(FileOpError::AlreadyExists(target.redacted()));
            }
            require_parent_dir(volume, &key, target)?;
            volume.insert(key, Node::dir());
            Ok(())
        })
        .await
    }

    async fn delete_file(&self, target: &SingleRef) -> FileOpResult<()> {
        self.with_session(target, |volume| {
            let key = node_key(target);
            match volume.get(&key) {
                None => Err(FileOpError::NotFound(target.redacted())),
                Some(node) if node.is_dir() => Err(FileOpError::Unsupported(format!(
                    "{} is a directory",
                    target.redacted()
                ))),
                Some(_) => {
                    volume.remove(&key);
                    Ok(())
                }
            }
        })
        .await
    }

    async fn remove_dir(&self, target: &SingleRef) -> FileOpResult<()> {
        self.with_session(target, |volume| {
            let key = node_key(target);
            match volume.get(&key) {
                None => Err(FileOpError::NotFound(target.redacted())),
                Some(node) if !node.is_dir() => Err(FileOpError::NotADirectory(target.redacted())),
                Some(_) if key == "/" || has_children(volume, &key) => Err(
                    FileOpError::Unsupported(format!("{} is not empty", target.redacted())),
                ),
                Some(_) => {
                    volume.remove(&key);
                    Ok(())
                }
            }
        })
        .await
    }

    async fn read(&self, target: &SingleRef) -> FileOpResult<BoxReader> {
        let snapshot = self
            .with_session(target, |volume| match volume.get(&node_key(target)) {
                Some(Node::File { data, .. }) => Ok(lock(data).clone()),
                Some(Node::Dir { .. }) => Err(FileOpError::Unsupported(format!(
                    "cannot read directory {}",
                    target.redacted()
                ))),
                None => Err(FileOpError::NotFound(target.redacted())),
            })
            .await?;
        Ok(Box::pin(Cursor::new(snapshot)))
    }

    async fn write(&self, target: &SingleRef, append: bool) -> FileOpResult<BoxWriter> {
        let data = self
            .with_session(target, |volume| {
                let key = node_key(target);
                if let Some(node) = volume.get_mut(&key) {
                    return match node {
                        Node::File { data, modified, .. } => {
                            if !append {
                                lock(data).clear();
                            }
                            *modified = Utc::now();
                            Ok(data.clone())
                        }
                        Node::Dir { .. } => Err(FileOpError::AlreadyExists(target.redacted())),
                    };
                }
                require_parent_dir(volume, &key, target)?;
                let data: Bytes = Arc::new(Mutex::new(Vec::new()));
                let now = Utc::now();
                volume.insert(
                    key,
                    Node::File {
                        data: data.clone(),
                        created: now,
                        modified: now,
                    },
                );
                Ok(data)
            })
            .await?;
        Ok(Box::pin(MemoryWriter { data }))
    }

    async fn set_last_modified(&self, target: &SingleRef, at: DateTime<Utc>) -> FileOpResult<()> {
        self.with_session(target, |volume| match volume.get_mut(&node_key(target)) {
            Some(node) => {
                node.touch(at);
                Ok(())
            }
            None => Err(FileOpError::NotFound(target.redacted())),
        })
        .await
    }

    async fn rename(&self, source: &SingleRef, target: &SingleRef) -> FileOpResult<()> {
        if !self.same_instance(source, target) {
            return Err(FileOpError::Unsupported(format!(
                "rename across volumes {} -> {}",
                source.redacted(),
                target.redacted()
            )));
        }
        if self.is_faulted(target) {
            return Err(FileOpError::backend(format!(
                "injected fault on {}",
                target.redacted()
            )));
        }
        self.with_session(source, |volume| {
            let from = node_key(source);
            let to = node_key(target);
            let moving_dir = match volume.get(&from) {
                Some(node) => node.is_dir(),
                None => return Err(FileOpError::NotFound(source.redacted())),
            };
            if from == to {
                return Ok(());
            }
            if to.starts_with(&child_prefix(&from)) {
                return Err(FileOpError::TargetInsideSource {
                    source_ref: source.redacted(),
                    target_ref: target.redacted(),
                });
            }
            match volume.get(&to) {
                Some(existing) if existing.is_dir() != moving_dir => {
                    return Err(FileOpError::AlreadyExists(target.redacted()));
                }
                Some(_) if moving_dir && has_children(volume, &to) => {
                    return Err(FileOpError::AlreadyExists(target.redacted()));
                }
                _ => {}
            }
            require_parent_dir(volume, &to, target)?;

            let from_prefix = child_prefix(&from);
            let moved: Vec<String> = volume
                .range(from_prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&from_prefix))
                .map(|(k, _)| k.clone())
                .collect();
            if let Some(node) = volume.remove(&from) {
                volume.insert(to.clone(), node);
            }
            let to_prefix = child_prefix(&to);
            for key in moved {
                if let Some(node) = volume.remove(&key) {
                    volume.insert(format!("{}{}", to_prefix, &key[from_prefix.len()..]), node);
                }
            }
            Ok(())
        })
        .await
    }

    async fn copy_native(&self, source: &SingleRef, target: &SingleRef) -> FileOpResult<()> {
        if !self.same_instance(source, target) {
            return Err(FileOpError::Unsupported(format!(
                "copy across volumes {} -> {}",
                source.redacted(),
                target.redacted()
            )));
        }
        if self.is_faulted(target) {
            return Err(FileOpError::backend(format!(
                "injected fault on {}",
                target.redacted()
            )));
        }
        self.with_session(source, |volume| {
            let bytes = match volume.get(&node_key(source)) {
                Some(Node::File { data, .. }) => lock(data).clone(),
                Some(Node::Dir { .. }) => {
                    return Err(FileOpError::Unsupported(format!(
                        "server-side copy of directory {}",
                        source.redacted()
                    )));
                }
                None => return Err(FileOpError::NotFound(source.redacted())),
            };
            let to = node_key(target);
            if volume.get(&to).is_some_and(Node::is_dir) {
                return Err(FileOpError::AlreadyExists(target.redacted()));
            }
            require_parent_dir(volume, &to, target)?;
            volume.insert(to, Node::file(bytes));
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn mem(path: &str) -> SingleRef {
        SingleRef::parse(&format!("mem://vol{}", path)).unwrap()
    }

    async fn put(backend: &MemoryBackend, path: &str, content: &str) {
        let mut w = backend.write(&mem(path), false).await.unwrap();
        w.write_all(content.as_bytes()).await.unwrap();
        w.shutdown().await.unwrap();
    }

    async fn get(backend: &MemoryBackend, path: &str) -> String {
        let mut r = backend.read(&mem(path)).await.unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_write_read_and_list() {
        let backend = MemoryBackend::new(&PoolConfig::default());
        backend.make_dir(&mem("/d")).await.unwrap();
        put(&backend, "/d/b.txt", "bee").await;
        put(&backend, "/d/a.txt", "ay").await;
        backend.make_dir(&mem("/d/sub")).await.unwrap();
        put(&backend, "/d/sub/deep.txt", "x").await;

        let names: Vec<String> = backend
            .list(&mem("/d/"))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(get(&backend, "/d/b.txt").await, "bee");

        let info = backend.info(&mem("/d/a.txt")).await.unwrap().unwrap();
        assert_eq!(info.size, 2);
    }

    #[tokio::test]
    async fn test_missing_parent_and_existing_entries() {
        let backend = MemoryBackend::new(&PoolConfig::default());
        let err = backend.make_dir(&mem("/x/y")).await.unwrap_err();
        assert!(err.is_not_found());

        backend.create_file(&mem("/f")).await.unwrap();
        let err = backend.create_file(&mem("/f")).await.unwrap_err();
        assert!(matches!(err, FileOpError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_encoded_slash_stays_in_name() {
        let backend = MemoryBackend::new(&PoolConfig::default());
        put(&backend, "/a%2Fb", "flat").await;

        let err = backend.list(&mem("/a/")).await.unwrap_err();
        assert!(err.is_not_found(), "Encoded slash should not create a directory");

        let names: Vec<String> = backend
            .list(&mem("/"))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["a/b"]);
        assert_eq!(get(&backend, "/a%2fb").await, "flat", "Escapes should be canonical");
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let backend = MemoryBackend::new(&PoolConfig::default());
        backend.make_dir(&mem("/a")).await.unwrap();
        put(&backend, "/a/one", "1").await;

        backend.rename(&mem("/a"), &mem("/b")).await.unwrap();
        assert!(backend.info(&mem("/a")).await.unwrap().is_none());
        assert_eq!(get(&backend, "/b/one").await, "1");
    }

    #[tokio::test]
    async fn test_sessions_are_reused() {
        let backend = MemoryBackend::new(&PoolConfig::default());
        for i in 0..5 {
            put(&backend, &format!("/f{}", i), "x").await;
        }
        assert_eq!(backend.pool().connector().connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_injected_fault_invalidates_session() {
        let backend = MemoryBackend::new(&PoolConfig::default());
        backend.inject_fault(&mem("/bad"));

        let err = backend.info(&mem("/bad")).await.unwrap_err();
        assert!(err.is_protocol_fault());
        assert_eq!(backend.pool().connector().connections_closed(), 1);

        backend.info(&mem("/good")).await.unwrap();
        assert_eq!(backend.pool().connector().connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let backend = MemoryBackend::new(&PoolConfig::default());
        backend.pool().connector().set_refuse(true);
        let err = backend.info(&mem("/x")).await.unwrap_err();
        assert!(matches!(err, FileOpError::ConnectionFailed { .. }));
    }
}
