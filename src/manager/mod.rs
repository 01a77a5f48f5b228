//! Public entry point.
//!
//! [`FileManager`] parses reference expressions against a base, expands
//! wildcards, routes each concrete reference to a handler and folds the
//! outcomes into one [`OpResult`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{BoxReader, BoxWriter, Info, LocalBackend, MemoryBackend};
use crate::config::ManagerConfig;
use crate::core::{
    CopyOptions, CreateOptions, DeleteOptions, ListOptions, MoveOptions, TransferOptions,
    TreeEngine, WriteOptions,
};
use crate::dispatch::{
    Dispatcher, Handler, HandlerRegistry, OperationKind, PerformFuture, PrimitiveHandler,
    TOP_PRIORITY,
};
use crate::error::{FileOpError, FileOpResult};
use crate::pool::with_cancellation;
use crate::result::{Content, OpResult, ResultBuilder};
use crate::uri::{Reference, SingleRef};

#[cfg(test)]
mod tests;

/// Builds a single-entry sub-result from a handler call.
fn single<T>(target: &SingleRef, outcome: FileOpResult<T>) -> ResultBuilder<T> {
    let mut result = ResultBuilder::new();
    match outcome {
        Ok(value) => {
            result.add_success(target);
            result.push_value(value);
        }
        Err(e) => result.add_failure(target, e),
    }
    result
}

/// Backend-agnostic file operations.
#[derive(Clone)]
pub struct FileManager {
    dispatcher: Dispatcher,
    base: SingleRef,
    memory: Option<MemoryBackend>,
}

impl FileManager {
    pub fn new(dispatcher: Dispatcher, base: SingleRef) -> Self {
        Self {
            dispatcher,
            base,
            memory: None,
        }
    }

    /// Manager with the built-in `file` and `mem` handlers.
    pub fn from_config(config: &ManagerConfig) -> FileOpResult<Self> {
        let base = match &config.base_uri {
            Some(base) => SingleRef::parse(base)?,
            None => {
                let cwd = std::env::current_dir().map_err(|e| {
                    FileOpError::backend(format!("Cannot determine working directory: {}", e))
                })?;
                SingleRef::from_local_path(&cwd, true)?
            }
        };

        let engine = TreeEngine::new(config.chunk_size, config.max_workers);
        let local = match config.case_insensitive_local {
            Some(insensitive) => LocalBackend::with_case_insensitive(insensitive),
            None => LocalBackend::new(),
        };
        let memory = MemoryBackend::new(&config.pool);

        let dispatcher = HandlerRegistry::new(engine.clone())
            .register(
                PrimitiveHandler::new(Arc::new(local), engine.clone()).with_priority(TOP_PRIORITY),
            )
            .register(PrimitiveHandler::new(Arc::new(memory.clone()), engine))
            .build();

        info!("File manager ready (base {})", base.redacted());
        Ok(Self {
            dispatcher,
            base,
            memory: Some(memory),
        })
    }

    pub fn base(&self) -> &SingleRef {
        &self.base
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The built-in `mem` backend, when built from config.
    pub fn memory(&self) -> Option<&MemoryBackend> {
        self.memory.as_ref()
    }

    /// Start closing idle pooled sessions in the background.
    pub fn spawn_reaper(&self, cx: CancellationToken) -> Option<JoinHandle<()>> {
        self.memory.as_ref().map(|memory| memory.pool().spawn_reaper(cx))
    }

    pub fn parse(&self, expr: &str) -> FileOpResult<Reference> {
        Reference::parse_with_base(expr, &self.base)
    }

    /// Parse `expr`, dispatch every reference and build the result.
    async fn run<'a, T, F>(
        &self,
        kind: OperationKind,
        expr: &str,
        cx: &CancellationToken,
        perform: F,
    ) -> OpResult<T>
    where
        T: Send,
        F: FnMut(Arc<dyn Handler>, SingleRef) -> PerformFuture<'a, T> + Send,
    {
        debug!("{} {}", kind, expr);
        let reference = match self.parse(expr) {
            Ok(reference) => reference,
            Err(e) => return ResultBuilder::failed(e).build(kind),
        };
        self.dispatcher
            .dispatch(kind, &reference.into_refs(), None, cx, perform)
            .await
            .build(kind)
    }

    /// Create a file or directory. Succeeds without change when an entry of
    /// the requested kind already exists.
    pub async fn create(
        &self,
        expr: &str,
        opts: &CreateOptions,
        cx: &CancellationToken,
    ) -> OpResult<SingleRef> {
        self.run(OperationKind::Create, expr, cx, move |handler, target| {
            Box::pin(async move { single(&target, handler.create(&target, opts).await) })
        })
        .await
    }

    /// Metadata of a single entry; a missing entry is a successful `None`.
    /// A wildcard must match exactly one entry.
    pub async fn info(&self, expr: &str, cx: &CancellationToken) -> OpResult<Option<Info>> {
        let kind = OperationKind::Info;
        debug!("{} {}", kind, expr);
        let target = match self.parse(expr) {
            Ok(Reference::Single(target)) => target,
            Ok(Reference::Multi(_)) => {
                let err = FileOpError::malformed(expr, "info takes a single reference");
                return ResultBuilder::failed(err).build(kind);
            }
            Err(e) => return ResultBuilder::failed(e).build(kind),
        };
        let target = match self.single_match(&target, cx).await {
            Ok(target) => target,
            Err(e) => return ResultBuilder::failed(e).build(kind),
        };
        self.dispatcher
            .dispatch_expanded(kind, vec![target], None, cx, |handler, target| {
                Box::pin(async move { single(&target, handler.info(&target).await) })
            })
            .await
            .build(kind)
    }

    /// Children of each directory (pre-order when recursive).
    pub async fn list(
        &self,
        expr: &str,
        opts: &ListOptions,
        cx: &CancellationToken,
    ) -> OpResult<Info> {
        self.run(OperationKind::List, expr, cx, move |handler, target| {
            Box::pin(async move {
                let mut result = ResultBuilder::new();
                match handler.list(&target, opts, cx).await {
                    Ok(entries) => {
                        result.add_success(&target);
                        entries.into_iter().for_each(|entry| result.push_value(entry));
                    }
                    Err(e) => result.add_failure(&target, e),
                }
                result
            })
        })
        .await
    }

    /// Expand wildcards only; one value per match.
    pub async fn resolve(&self, expr: &str, cx: &CancellationToken) -> OpResult<SingleRef> {
        let kind = OperationKind::Resolve;
        let reference = match self.parse(expr) {
            Ok(reference) => reference,
            Err(e) => return ResultBuilder::failed(e).build(kind),
        };
        let (items, mut result) = self
            .dispatcher
            .expand_all(kind, &reference.into_refs(), cx)
            .await;
        for item in items {
            result.add_success(&item);
            result.push_value(item);
        }
        result.build(kind)
    }

    pub async fn copy(
        &self,
        source: &str,
        target: &str,
        opts: &CopyOptions,
        cx: &CancellationToken,
    ) -> OpResult {
        self.transfer(OperationKind::Copy, source, target, opts, cx).await
    }

    pub async fn move_to(
        &self,
        source: &str,
        target: &str,
        opts: &MoveOptions,
        cx: &CancellationToken,
    ) -> OpResult {
        self.transfer(OperationKind::Move, source, target, opts, cx).await
    }

    pub async fn delete(
        &self,
        expr: &str,
        opts: &DeleteOptions,
        cx: &CancellationToken,
    ) -> OpResult {
        self.run(OperationKind::Delete, expr, cx, move |handler, target| {
            Box::pin(async move { handler.delete(&target, opts, cx).await })
        })
        .await
    }

    /// Open every referenced file for reading.
    pub async fn get_input(
        &self,
        expr: &str,
        cx: &CancellationToken,
    ) -> OpResult<Content<BoxReader>> {
        self.run(OperationKind::Read, expr, cx, |handler, target| {
            Box::pin(async move {
                let opened = handler.open_read(&target).await.map(|stream| Content {
                    reference: target.clone(),
                    stream,
                });
                single(&target, opened)
            })
        })
        .await
    }

    /// Open every referenced file for writing.
    pub async fn get_output(
        &self,
        expr: &str,
        opts: &WriteOptions,
        cx: &CancellationToken,
    ) -> OpResult<Content<BoxWriter>> {
        self.run(OperationKind::Write, expr, cx, move |handler, target| {
            Box::pin(async move {
                let opened = handler.open_write(&target, opts).await.map(|stream| Content {
                    reference: target.clone(),
                    stream,
                });
                single(&target, opened)
            })
        })
        .await
    }

    async fn transfer(
        &self,
        kind: OperationKind,
        source: &str,
        target: &str,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> OpResult {
        debug!("{} {} -> {}", kind, source, target);
        let sources = match self.parse(source) {
            Ok(reference) => reference.into_refs(),
            Err(e) => return ResultBuilder::failed(e).build(kind),
        };
        let target = match self.parse(target) {
            Ok(Reference::Single(target)) => target,
            Ok(Reference::Multi(_)) => {
                let err = FileOpError::malformed(target, "target must be a single reference");
                return ResultBuilder::failed(err).build(kind);
            }
            Err(e) => return ResultBuilder::failed(e).build(kind),
        };

        let (items, mut result) = self.dispatcher.expand_all(kind, &sources, cx).await;
        let target = match self.plan_target(&target, items.len(), opts, cx).await {
            Ok(target) => target,
            Err(e) => {
                result.set_fatal(e);
                return result.build(kind);
            }
        };
        if let Some(item) = items.iter().find(|item| target.is_within(item)) {
            result.set_fatal(FileOpError::TargetInsideSource {
                source_ref: item.redacted(),
                target_ref: target.redacted(),
            });
            return result.build(kind);
        }

        let scheme = target.scheme().to_string();
        let target = &target;
        let routed = self
            .dispatcher
            .dispatch_expanded(kind, items, Some(scheme.as_str()), cx, move |handler, source| {
                Box::pin(async move {
                    match kind {
                        OperationKind::Move => handler.move_to(&source, target, opts, cx).await,
                        _ => handler.copy(&source, target, opts, cx).await,
                    }
                })
            })
            .await;
        result.merge(routed);

        let result = result.build(kind);
        info!(
            "{} finished: {} succeeded, {} failed",
            kind,
            result.success_count(),
            result.fail_count()
        );
        result
    }

    /// The one entry a wildcard reference matches; literals pass through.
    async fn single_match(
        &self,
        target: &SingleRef,
        cx: &CancellationToken,
    ) -> FileOpResult<SingleRef> {
        if !target.is_wildcard() {
            return Ok(target.clone());
        }
        let mut matches = self.dispatcher.expand(target, cx).await?;
        match matches.len() {
            0 => Err(FileOpError::NotFound(format!("no match for {}", target.redacted()))),
            1 => Ok(matches.remove(0)),
            n => {
                let reason = format!("matches {} entries", n);
                Err(FileOpError::malformed(target.redacted(), reason))
            }
        }
    }

    /// Resolve a wildcard target to its single match and make sure a
    /// multi-entry transfer lands in a directory.
    async fn plan_target(
        &self,
        target: &SingleRef,
        source_count: usize,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> FileOpResult<SingleRef> {
        let target = self.single_match(target, cx).await?;

        if source_count <= 1 {
            return Ok(target);
        }
        let handler = self.dispatcher.handler_for(OperationKind::Info, &target)?;
        match with_cancellation(cx, handler.info(&target)).await? {
            Some(existing) if existing.is_directory() => Ok(target.as_directory()),
            None if target.has_trailing_slash() && opts.make_parents => Ok(target),
            _ => Err(FileOpError::NotADirectory(target.redacted())),
        }
    }
}
