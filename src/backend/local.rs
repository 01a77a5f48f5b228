use std::fs::Metadata;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use tokio::fs;
use tracing::debug;

use super::{Backend, BoxReader, BoxWriter, Capabilities, EntryKind, Info, Permissions};
use crate::error::{FileOpError, FileOpResult};
use crate::uri::{FILE_SCHEME, SingleRef};

/// Local filesystem under the `file` scheme.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    case_insensitive: bool,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            case_insensitive: cfg!(any(windows, target_os = "macos")),
        }
    }

    pub fn with_case_insensitive(case_insensitive: bool) -> Self {
        Self { case_insensitive }
    }
}

fn to_utc(time: std::io::Result<SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

fn describe(target: &SingleRef, meta: &Metadata) -> Info {
    let kind = if meta.file_type().is_symlink() {
        EntryKind::Link
    } else if meta.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };

    #[cfg(unix)]
    let executable = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    };
    #[cfg(not(unix))]
    let executable = false;

    let mut info = Info::new(target, kind);
    info.size = if kind == EntryKind::Directory { 0 } else { meta.len() };
    info.last_modified = to_utc(meta.modified());
    info.last_accessed = to_utc(meta.accessed());
    info.created = to_utc(meta.created());
    info.permissions = Some(Permissions {
        readable: true,
        writable: !meta.permissions().readonly(),
        executable,
    });
    info
}

#[async_trait]
impl Backend for LocalBackend {
    fn scheme(&self) -> &str {
        FILE_SCHEME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_rename: true,
            native_copy: false,
            set_last_modified: true,
            case_insensitive: self.case_insensitive,
        }
    }

    async fn info(&self, target: &SingleRef) -> FileOpResult<Option<Info>> {
        match fs::symlink_metadata(target.to_local_path()).await {
            Ok(meta) => Ok(Some(describe(target, &meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => Ok(None),
            Err(e) => Err(FileOpError::from_io(e, target)),
        }
    }

    async fn list(&self, dir: &SingleRef) -> FileOpResult<Vec<Info>> {
        let path = dir.to_local_path();
        let mut entries = fs::read_dir(&path)
            .await
            .map_err(|e| FileOpError::from_io(e, dir))?;

        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FileOpError::from_io(e, dir))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = dir.child(&name);
            match fs::symlink_metadata(entry.path()).await {
                Ok(meta) => children.push(describe(&child, &meta)),
                // Removed between read_dir and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FileOpError::from_io(e, &child)),
            }
        }

        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn create_file(&self, target: &SingleRef) -> FileOpResult<()> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target.to_local_path())
            .await
            .map(|_| ())
            .map_err(|e| FileOpError::from_io(e, target))
    }

    async fn make_dir(&self, target: &SingleRef) -> FileOpResult<()> {
        fs::create_dir(target.to_local_path())
            .await
            .map_err(|e| FileOpError::from_io(e, target))
    }

    async fn delete_file(&self, target: &SingleRef) -> FileOpResult<()> {
        fs::remove_file(target.to_local_path())
            .await
            .map_err(|e| FileOpError::from_io(e, target))
    }

    async fn remove_dir(&self, target: &SingleRef) -> FileOpResult<()> {
        fs::remove_dir(target.to_local_path())
            .await
            .map_err(|e| FileOpError::from_io(e, target))
    }

    async fn read(&self, target: &SingleRef) -> FileOpResult<BoxReader> {
        let path = target.to_local_path();
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| FileOpError::from_io(e, target))?;
        if meta.is_dir() {
            return Err(FileOpError::Unsupported(format!(
                "cannot read directory {}",
                target.redacted()
            )));
        }
        let file = fs::File::open(&path)
            .await
            .map_err(|e| FileOpError::from_io(e, target))?;
        Ok(Box::pin(file))
    }

    async fn write(&self, target: &SingleRef, append: bool) -> FileOpResult<BoxWriter> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let file = options
            .open(target.to_local_path())
            .await
            .map_err(|e| FileOpError::from_io(e, target))?;
        Ok(Box::pin(file))
    }

    async fn set_last_modified(&self, target: &SingleRef, at: DateTime<Utc>) -> FileOpResult<()> {
        let path = target.to_local_path();
        let stamp = FileTime::from_unix_time(at.timestamp(), at.timestamp_subsec_nanos());
        let owned = target.clone();
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, stamp))
            .await
            .map_err(|e| FileOpError::backend(format!("mtime task failed: {}", e)))?
            .map_err(|e| FileOpError::from_io(e, &owned))
    }

    async fn rename(&self, source: &SingleRef, target: &SingleRef) -> FileOpResult<()> {
        debug!("Renaming {} -> {}", source.redacted(), target.redacted());
        fs::rename(source.to_local_path(), target.to_local_path())
            .await
            .map_err(|e| FileOpError::from_io(e, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn reference(dir: &TempDir, name: &str) -> SingleRef {
        SingleRef::from_local_path(&dir.path().join(name), false).unwrap()
    }

    #[tokio::test]
    async fn test_info_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let info = backend.info(&reference(&temp, "nope")).await.unwrap();
        assert!(info.is_none(), "Missing entry should report None");
    }

    #[tokio::test]
    async fn test_write_read_and_list_sorted() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();

        for name in ["b.txt", "a.txt"] {
            let mut w = backend.write(&reference(&temp, name), false).await.unwrap();
            w.write_all(name.as_bytes()).await.unwrap();
            w.shutdown().await.unwrap();
        }
        backend.make_dir(&reference(&temp, "sub")).await.unwrap();

        let root = SingleRef::from_local_path(temp.path(), true).unwrap();
        let names: Vec<String> = backend
            .list(&root)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

        let mut r = backend.read(&reference(&temp, "a.txt")).await.unwrap();
        let mut content = String::new();
        r.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "a.txt");

        let sub = backend.info(&reference(&temp, "sub")).await.unwrap().unwrap();
        assert!(sub.is_directory());
        assert!(sub.reference.has_trailing_slash());
    }

    #[tokio::test]
    async fn test_create_file_refuses_existing() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let target = reference(&temp, "x");
        backend.create_file(&target).await.unwrap();
        let err = backend.create_file(&target).await.unwrap_err();
        assert!(matches!(err, FileOpError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_set_last_modified() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let target = reference(&temp, "stamped");
        backend.create_file(&target).await.unwrap();

        let at = DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        backend.set_last_modified(&target, at).await.unwrap();

        let info = backend.info(&target).await.unwrap().unwrap();
        assert_eq!(info.last_modified, Some(at));
    }
}
