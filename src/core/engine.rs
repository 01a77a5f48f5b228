//! Generic tree operations built only from backend primitives.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::options::{ConflictPolicy, CreateOptions, DeleteOptions, ListOptions, TransferOptions};
use super::transfer::{missing_parent, stream_file};
use super::validation::{is_newer, validate_transfer};
use crate::backend::{Backend, Info};
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{FileOpError, FileOpResult};
use crate::result::ResultBuilder;
use crate::uri::SingleRef;

type WalkFuture<'a> = Pin<Box<dyn Future<Output = ResultBuilder> + Send + 'a>>;

/// Source and destination primitives of one transfer.
#[derive(Clone, Copy)]
pub struct Endpoints<'a> {
    pub source: &'a dyn Backend,
    pub target: &'a dyn Backend,
}

impl<'a> Endpoints<'a> {
    pub fn new(source: &'a dyn Backend, target: &'a dyn Backend) -> Self {
        Self { source, target }
    }

    /// Same backend object, and the backend says both paths share storage.
    fn same_instance(&self, a: &SingleRef, b: &SingleRef) -> bool {
        std::ptr::addr_eq(
            self.source as *const dyn Backend,
            self.target as *const dyn Backend,
        ) && self.source.same_instance(a, b)
    }

    fn native_rename(&self, a: &SingleRef, b: &SingleRef) -> bool {
        self.same_instance(a, b) && self.source.capabilities().native_rename
    }

    fn native_copy(&self, a: &SingleRef, b: &SingleRef) -> bool {
        self.same_instance(a, b) && self.source.capabilities().native_copy
    }
}

enum FileAction {
    Transfer,
    Skip,
}

enum RenameOutcome {
    Done,
    Fallback,
}

/// Recursive copy/move/delete engine.
#[derive(Debug, Clone)]
pub struct TreeEngine {
    chunk_size: usize,
    max_workers: usize,
}

impl Default for TreeEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, 1)
    }
}

impl TreeEngine {
    pub fn new(chunk_size: usize, max_workers: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    /// Copy `source` to `target`; one outcome per copied entry, the root included.
    pub async fn copy(
        &self,
        ep: Endpoints<'_>,
        source: &SingleRef,
        target: &SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        let (info, dest, contents) = match self.plan(ep, source, target, opts).await {
            Ok(plan) => plan,
            Err(e) => return ResultBuilder::failed_transfer(source, target, e),
        };
        debug!("Copying {} -> {}", source.redacted(), dest.redacted());

        if contents {
            self.copy_contents(ep, info, dest, opts, cx).await
        } else {
            self.copy_entry(ep, info, dest, opts, cx).await
        }
    }

    /// Move `source` to `target`. Native rename is used per entry when both
    /// sides share a backend instance; otherwise copy then delete.
    pub async fn move_to(
        &self,
        ep: Endpoints<'_>,
        source: &SingleRef,
        target: &SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        let (info, dest, contents) = match self.plan(ep, source, target, opts).await {
            Ok(plan) => plan,
            Err(e) => return ResultBuilder::failed_transfer(source, target, e),
        };
        debug!("Moving {} -> {}", source.redacted(), dest.redacted());

        if contents {
            self.move_contents(ep, info, dest, opts, cx).await
        } else {
            self.move_entry(ep, info, dest, opts, cx).await
        }
    }

    /// Work out the effective destination of a transfer.
    ///
    /// Returns the source info, the destination and whether the source
    /// directory's contents (rather than the directory) are transferred.
    async fn plan(
        &self,
        ep: Endpoints<'_>,
        source: &SingleRef,
        target: &SingleRef,
        opts: &TransferOptions,
    ) -> FileOpResult<(Info, SingleRef, bool)> {
        if ep.same_instance(source, target) && source.same_location(target) {
            return Err(FileOpError::SourceEqualsTarget(source.redacted()));
        }

        let info = ep
            .source
            .info(source)
            .await?
            .ok_or_else(|| FileOpError::NotFound(source.redacted()))?;

        let contents = info.is_directory() && source.has_trailing_slash();
        let dest = if contents {
            target.without_trailing_slash()
        } else {
            match ep.target.info(target).await? {
                Some(existing) if existing.is_directory() => target.child(&info.name),
                Some(_) if target.has_trailing_slash() => {
                    return Err(FileOpError::NotADirectory(target.redacted()));
                }
                Some(_) => target.without_trailing_slash(),
                None if target.has_trailing_slash() => {
                    if opts.make_parents {
                        target.child(&info.name)
                    } else if info.is_directory() {
                        target.without_trailing_slash()
                    } else {
                        return Err(FileOpError::NotADirectory(target.redacted()));
                    }
                }
                None => target.clone(),
            }
        };

        if ep.same_instance(source, &dest) {
            validate_transfer(source, &dest)?;
        }
        Ok((info, dest, contents))
    }

    fn copy_entry<'a>(
        &'a self,
        ep: Endpoints<'a>,
        info: Info,
        target: SingleRef,
        opts: &'a TransferOptions,
        cx: &'a CancellationToken,
    ) -> WalkFuture<'a> {
        Box::pin(async move {
            let source = info.reference.clone();
            if cx.is_cancelled() {
                let err = FileOpError::cancelled(&target);
                return ResultBuilder::failed_transfer(&source, &target, err);
            }

            if info.is_directory() {
                if !opts.recursive {
                    let err = FileOpError::DirectoryRequiresRecursive(source.redacted());
                    return ResultBuilder::failed_transfer(&source, &target, err);
                }
                return self.copy_contents(ep, info, target, opts, cx).await;
            }

            let mut result = ResultBuilder::new();
            match self.transfer_file(ep, &info, &target, opts, cx).await {
                Ok(_) => result.add_transfer(&source, &target),
                Err(e) => {
                    warn!("Failed to copy file {}: {}", source.redacted(), e);
                    result.add_transfer_failure(&source, &target, e);
                }
            }
            result
        })
    }

    /// Create the destination directory and copy every child into it.
    async fn copy_contents(
        &self,
        ep: Endpoints<'_>,
        info: Info,
        target: SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        let source = info.reference;
        let mut result = ResultBuilder::new();

        let children = match self.prepare_dir(ep, &source, &target, opts).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Failed to copy directory {}: {}", source.redacted(), e);
                result.add_transfer_failure(&source, &target, e);
                return result;
            }
        };
        result.add_transfer(&source, &target);

        let children = children
            .into_iter()
            .map(|child| {
                let dest = target.child(&child.name);
                (child, dest)
            })
            .collect();
        let sub = self
            .fan_out(children, |child, dest| {
                self.copy_entry(ep, child, dest, opts, cx)
            })
            .await;
        result.merge(sub);
        result
    }

    fn move_entry<'a>(
        &'a self,
        ep: Endpoints<'a>,
        info: Info,
        target: SingleRef,
        opts: &'a TransferOptions,
        cx: &'a CancellationToken,
    ) -> WalkFuture<'a> {
        Box::pin(async move {
            let source = info.reference.clone();
            if cx.is_cancelled() {
                let err = FileOpError::cancelled(&target);
                return ResultBuilder::failed_transfer(&source, &target, err);
            }
            if info.is_directory() && !opts.recursive {
                let err = FileOpError::DirectoryRequiresRecursive(source.redacted());
                return ResultBuilder::failed_transfer(&source, &target, err);
            }

            if ep.native_rename(&source, &target) {
                match self.try_rename(ep, &info, &target, opts).await {
                    Ok(RenameOutcome::Done) => {
                        let mut result = ResultBuilder::new();
                        result.add_transfer(&source, &target);
                        return result;
                    }
                    Ok(RenameOutcome::Fallback) => {
                        debug!("Native rename declined, moving by copy: {}", source.redacted());
                    }
                    Err(e) => return ResultBuilder::failed_transfer(&source, &target, e),
                }
            }

            if info.is_directory() {
                return self.move_contents(ep, info, target, opts, cx).await;
            }

            let mut result = ResultBuilder::new();
            match self.transfer_file(ep, &info, &target, opts, cx).await {
                Ok(FileAction::Transfer) => match ep.source.delete_file(&source).await {
                    Ok(()) => result.add_transfer(&source, &target),
                    Err(e) => {
                        warn!("Copied but could not remove {}: {}", source.redacted(), e);
                        result.add_transfer_failure(&source, &target, e);
                    }
                },
                Ok(FileAction::Skip) => result.add_transfer(&source, &target),
                Err(e) => {
                    warn!("Failed to move file {}: {}", source.redacted(), e);
                    result.add_transfer_failure(&source, &target, e);
                }
            }
            result
        })
    }

    /// Move every child into the destination directory, then remove the
    /// source directory if all children made it.
    async fn move_contents(
        &self,
        ep: Endpoints<'_>,
        info: Info,
        target: SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        let source = info.reference;
        let mut result = ResultBuilder::new();

        let children = match self.prepare_dir(ep, &source, &target, opts).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Failed to move directory {}: {}", source.redacted(), e);
                result.add_transfer_failure(&source, &target, e);
                return result;
            }
        };

        let children = children
            .into_iter()
            .map(|child| {
                let dest = target.child(&child.name);
                (child, dest)
            })
            .collect();
        let sub = self
            .fan_out(children, |child, dest| {
                self.move_entry(ep, child, dest, opts, cx)
            })
            .await;

        if sub.has_failures() {
            debug!("Keeping {}: not every child was moved", source.redacted());
            result.add_transfer(&source, &target);
        } else {
            match ep.source.remove_dir(&source).await {
                Ok(()) => result.add_transfer(&source, &target),
                Err(e) => result.add_transfer_failure(&source, &target, e),
            }
        }
        result.merge(sub);
        result
    }

    /// Rename one entry natively, honouring the conflict policy.
    async fn try_rename(
        &self,
        ep: Endpoints<'_>,
        info: &Info,
        target: &SingleRef,
        opts: &TransferOptions,
    ) -> FileOpResult<RenameOutcome> {
        let backend = ep.target;
        match backend.info(target).await? {
            Some(existing) if existing.is_directory() != info.is_directory() => {
                return Err(FileOpError::AlreadyExists(target.redacted()));
            }
            Some(_) if info.is_directory() => {
                if !backend.list(target).await?.is_empty() {
                    return Err(FileOpError::AlreadyExists(target.redacted()));
                }
                backend.remove_dir(target).await?;
            }
            Some(existing) => match opts.conflict {
                ConflictPolicy::Overwrite => {}
                ConflictPolicy::NoOverwrite => {
                    return Err(FileOpError::AlreadyExists(target.redacted()));
                }
                ConflictPolicy::Update => {
                    if !is_newer(info.last_modified, existing.last_modified) {
                        debug!("Skipping {}: target is not older", target.redacted());
                        return Ok(RenameOutcome::Done);
                    }
                }
            },
            None => ensure_parent(backend, target, opts.make_parents).await?,
        }

        match ep.source.rename(&info.reference, target).await {
            Ok(()) => Ok(RenameOutcome::Done),
            Err(FileOpError::Unsupported(reason)) => {
                debug!("Rename unsupported: {}", reason);
                Ok(RenameOutcome::Fallback)
            }
            Err(e) => Err(missing_parent(e, target)),
        }
    }

    /// Make sure `target` is a directory and list the children of `source`.
    async fn prepare_dir(
        &self,
        ep: Endpoints<'_>,
        source: &SingleRef,
        target: &SingleRef,
        opts: &TransferOptions,
    ) -> FileOpResult<Vec<Info>> {
        ensure_dir(ep.target, target, opts.make_parents).await?;
        ep.source.list(source).await
    }

    /// Apply the conflict policy and copy one file.
    async fn transfer_file(
        &self,
        ep: Endpoints<'_>,
        info: &Info,
        target: &SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> FileOpResult<FileAction> {
        match ep.target.info(target).await? {
            Some(existing) if existing.is_directory() => {
                return Err(FileOpError::AlreadyExists(target.redacted()));
            }
            Some(existing) => match opts.conflict {
                ConflictPolicy::Overwrite => {}
                ConflictPolicy::NoOverwrite => {
                    return Err(FileOpError::AlreadyExists(target.redacted()));
                }
                ConflictPolicy::Update => {
                    if !is_newer(info.last_modified, existing.last_modified) {
                        debug!("Skipping {}: target is not older", target.redacted());
                        return Ok(FileAction::Skip);
                    }
                }
            },
            None => ensure_parent(ep.target, target, opts.make_parents).await?,
        }

        self.copy_file(ep, &info.reference, target, cx).await?;
        Ok(FileAction::Transfer)
    }

    /// Copy bytes, natively when both sides share a backend instance.
    async fn copy_file(
        &self,
        ep: Endpoints<'_>,
        source: &SingleRef,
        target: &SingleRef,
        cx: &CancellationToken,
    ) -> FileOpResult<()> {
        if cx.is_cancelled() {
            return Err(FileOpError::cancelled(target));
        }
        if ep.native_copy(source, target) {
            match ep.source.copy_native(source, target).await {
                Err(FileOpError::Unsupported(reason)) => {
                    debug!("Native copy unsupported, streaming: {}", reason);
                }
                other => return other.map_err(|e| missing_parent(e, target)),
            }
        }
        stream_file(ep.source, source, ep.target, target, self.chunk_size, cx)
            .await
            .map(|_| ())
    }

    /// Run `step` for every child, sequentially or with bounded concurrency.
    ///
    /// A sequential walk stops after the first cancelled child.
    async fn fan_out<'a, F>(&self, children: Vec<(Info, SingleRef)>, step: F) -> ResultBuilder
    where
        F: Fn(Info, SingleRef) -> WalkFuture<'a> + Send + Sync,
    {
        let mut merged = ResultBuilder::new();
        if self.max_workers <= 1 {
            for (child, dest) in children {
                let sub = step(child, dest).await;
                let stop = sub.has_cancelled();
                merged.merge(sub);
                if stop {
                    break;
                }
            }
        } else {
            let mut running = stream::iter(children)
                .map(|(child, dest)| step(child, dest))
                .buffer_unordered(self.max_workers);
            while let Some(sub) = running.next().await {
                merged.merge(sub);
            }
        }
        merged
    }

    /// Delete `target`; directories need `recursive` and go children first.
    pub async fn delete(
        &self,
        backend: &dyn Backend,
        target: &SingleRef,
        opts: &DeleteOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        match backend.info(target).await {
            Ok(Some(info)) => self.delete_entry(backend, info, opts, cx).await,
            Ok(None) => failed(target, FileOpError::NotFound(target.redacted())),
            Err(e) => failed(target, e),
        }
    }

    fn delete_entry<'a>(
        &'a self,
        backend: &'a dyn Backend,
        info: Info,
        opts: &'a DeleteOptions,
        cx: &'a CancellationToken,
    ) -> WalkFuture<'a> {
        Box::pin(async move {
            let target = info.reference.clone();
            if cx.is_cancelled() {
                return failed(&target, FileOpError::cancelled(&target));
            }

            if !info.is_directory() {
                return match backend.delete_file(&target).await {
                    Ok(()) => succeeded(&target),
                    Err(e) => {
                        warn!("Failed to delete {}: {}", target.redacted(), e);
                        failed(&target, e)
                    }
                };
            }

            if !opts.recursive {
                return failed(
                    &target,
                    FileOpError::DirectoryRequiresRecursive(target.redacted()),
                );
            }

            let children = match backend.list(&target).await {
                Ok(children) => children,
                Err(e) => return failed(&target, e),
            };
            let children = children
                .into_iter()
                .map(|child| {
                    let at = child.reference.clone();
                    (child, at)
                })
                .collect();
            let sub = self
                .fan_out(children, |child, _| {
                    self.delete_entry(backend, child, opts, cx)
                })
                .await;

            let mut result = ResultBuilder::new();
            match sub.first_failure().cloned() {
                Some(e) => {
                    debug!("Keeping directory {}: a child failed", target.redacted());
                    result.add_failure(&target, e);
                }
                None => match backend.remove_dir(&target).await {
                    Ok(()) => result.add_success(&target),
                    Err(e) => result.add_failure(&target, e),
                },
            }
            result.merge(sub);
            result
        })
    }

    /// Create a file or directory, or touch an existing one of the same type.
    pub async fn create(
        &self,
        backend: &dyn Backend,
        target: &SingleRef,
        opts: &CreateOptions,
    ) -> FileOpResult<SingleRef> {
        let directory = opts.directory || target.has_trailing_slash();
        let reference = if directory {
            target.as_directory()
        } else {
            target.without_trailing_slash()
        };

        match backend.info(target).await? {
            Some(existing) if existing.is_directory() != directory => {
                Err(FileOpError::AlreadyExists(target.redacted()))
            }
            Some(_) => {
                if backend.capabilities().set_last_modified {
                    let at = opts.last_modified.unwrap_or_else(Utc::now);
                    backend.set_last_modified(&reference, at).await?;
                }
                Ok(reference)
            }
            None => {
                ensure_parent(backend, &reference, opts.make_parents).await?;
                let created = if directory {
                    backend.make_dir(&reference).await
                } else {
                    backend.create_file(&reference).await
                };
                match created {
                    Ok(()) => {}
                    // Lost a race with a concurrent create of the same directory
                    Err(FileOpError::AlreadyExists(_)) if directory => {}
                    Err(e) => return Err(missing_parent(e, &reference)),
                }
                if let Some(at) = opts.last_modified {
                    backend.set_last_modified(&reference, at).await?;
                }
                Ok(reference)
            }
        }
    }

    /// Entries of a directory, or the entry itself for a file.
    pub async fn list(
        &self,
        backend: &dyn Backend,
        target: &SingleRef,
        opts: &ListOptions,
        cx: &CancellationToken,
    ) -> FileOpResult<Vec<Info>> {
        let info = backend
            .info(target)
            .await?
            .ok_or_else(|| FileOpError::NotFound(target.redacted()))?;

        if !info.is_directory() {
            if target.has_trailing_slash() {
                return Err(FileOpError::NotADirectory(target.redacted()));
            }
            return Ok(vec![info]);
        }

        let mut entries = Vec::new();
        self.list_into(backend, info.reference, opts.recursive, cx, &mut entries)
            .await?;
        Ok(entries)
    }

    fn list_into<'a>(
        &'a self,
        backend: &'a dyn Backend,
        dir: SingleRef,
        recursive: bool,
        cx: &'a CancellationToken,
        out: &'a mut Vec<Info>,
    ) -> Pin<Box<dyn Future<Output = FileOpResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if cx.is_cancelled() {
                return Err(FileOpError::cancelled(&dir));
            }
            for child in backend.list(&dir).await? {
                let descend = recursive && child.is_directory();
                let child_ref = child.reference.clone();
                out.push(child);
                if descend {
                    self.list_into(backend, child_ref, true, cx, out).await?;
                }
            }
            Ok(())
        })
    }
}

fn succeeded(target: &SingleRef) -> ResultBuilder {
    let mut result = ResultBuilder::new();
    result.add_success(target);
    result
}

fn failed(target: &SingleRef, error: FileOpError) -> ResultBuilder {
    let mut result = ResultBuilder::new();
    result.add_failure(target, error);
    result
}

/// Ensure `target` exists as a directory, creating it (and, with
/// `make_parents`, its ancestors) when missing.
pub(crate) async fn ensure_dir(
    backend: &dyn Backend,
    target: &SingleRef,
    make_parents: bool,
) -> FileOpResult<()> {
    match backend.info(target).await? {
        Some(existing) if existing.is_directory() => Ok(()),
        Some(_) => Err(FileOpError::AlreadyExists(target.redacted())),
        None => {
            ensure_parent(backend, target, make_parents).await?;
            match backend.make_dir(target).await {
                Ok(()) | Err(FileOpError::AlreadyExists(_)) => Ok(()),
                Err(e) => Err(missing_parent(e, target)),
            }
        }
    }
}

/// With `make_parents`, create every missing ancestor of `target` top-down.
/// Without it nothing is checked here: the primitive that needs the parent
/// reports `MissingParent`.
pub(crate) async fn ensure_parent(
    backend: &dyn Backend,
    target: &SingleRef,
    make_parents: bool,
) -> FileOpResult<()> {
    if !make_parents {
        return Ok(());
    }

    let mut missing = Vec::new();
    let mut cursor = target.parent();
    while let Some(dir) = cursor {
        match backend.info(&dir).await? {
            Some(existing) if existing.is_directory() => break,
            Some(_) => return Err(FileOpError::NotADirectory(dir.redacted())),
            None => {
                cursor = dir.parent();
                missing.push(dir);
            }
        }
    }

    for dir in missing.into_iter().rev() {
        debug!("Creating parent directory {}", dir.redacted());
        match backend.make_dir(&dir).await {
            Ok(()) | Err(FileOpError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
