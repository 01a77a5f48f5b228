//! Storage backends: the primitive operations the engine composes.

pub mod local;
pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{FileOpError, FileOpResult};
use crate::uri::SingleRef;

pub use local::LocalBackend;
pub use memory::{MemoryBackend, MemoryConnector};

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// Metadata of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    /// Directories carry a trailing slash.
    pub reference: SingleRef,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub permissions: Option<Permissions>,
    pub hidden: bool,
}

impl Info {
    pub fn new(reference: &SingleRef, kind: EntryKind) -> Self {
        let reference = match kind {
            EntryKind::Directory => reference.as_directory(),
            _ => reference.without_trailing_slash(),
        };
        let name = reference.name();
        Self {
            hidden: name.starts_with('.'),
            reference,
            name,
            kind,
            size: 0,
            last_modified: None,
            last_accessed: None,
            created: None,
            permissions: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// What a backend can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub native_rename: bool,
    pub native_copy: bool,
    pub set_last_modified: bool,
    pub case_insensitive: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            native_rename: false,
            native_copy: false,
            set_last_modified: true,
            case_insensitive: false,
        }
    }
}

/// Primitive operations of one storage scheme.
///
/// Implementations report failures through [`FileOpError`] and never panic.
/// Listings do not follow links.
#[async_trait]
pub trait Backend: Send + Sync {
    fn scheme(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Whether two references live on the same storage instance, so that
    /// native rename and copy can span them.
    fn same_instance(&self, a: &SingleRef, b: &SingleRef) -> bool {
        a.authority_key() == b.authority_key()
    }

    /// `None` when the entry does not exist.
    async fn info(&self, target: &SingleRef) -> FileOpResult<Option<Info>>;

    /// Direct children of a directory.
    async fn list(&self, dir: &SingleRef) -> FileOpResult<Vec<Info>>;

    /// Create an empty file; fails if anything exists at `target`.
    async fn create_file(&self, target: &SingleRef) -> FileOpResult<()>;

    /// Create one directory; the parent must exist.
    async fn make_dir(&self, target: &SingleRef) -> FileOpResult<()>;

    async fn delete_file(&self, target: &SingleRef) -> FileOpResult<()>;

    /// Remove an empty directory.
    async fn remove_dir(&self, target: &SingleRef) -> FileOpResult<()>;

    async fn read(&self, target: &SingleRef) -> FileOpResult<BoxReader>;

    /// Open for writing, truncating unless `append`. Creates a missing file.
    async fn write(&self, target: &SingleRef, append: bool) -> FileOpResult<BoxWriter>;

    async fn set_last_modified(&self, target: &SingleRef, at: DateTime<Utc>) -> FileOpResult<()>;

    async fn rename(&self, source: &SingleRef, _target: &SingleRef) -> FileOpResult<()> {
        Err(FileOpError::Unsupported(format!(
            "rename on {}",
            source.redacted()
        )))
    }

    async fn copy_native(&self, source: &SingleRef, _target: &SingleRef) -> FileOpResult<()> {
        Err(FileOpError::Unsupported(format!(
            "server-side copy on {}",
            source.redacted()
        )))
    }
}
