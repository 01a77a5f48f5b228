use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::operation::{Operation, OperationKind};
use crate::backend::{Backend, BoxReader, BoxWriter, Info};
use crate::core::engine::{Endpoints, ensure_parent};
use crate::core::resolver;
use crate::core::transfer::missing_parent;
use crate::core::{
    CreateOptions, DeleteOptions, ListOptions, TransferOptions, TreeEngine, WriteOptions,
};
use crate::error::{FileOpError, FileOpResult};
use crate::result::ResultBuilder;
use crate::uri::SingleRef;

/// Priority of handlers that should win over everything else.
pub const TOP_PRIORITY: i32 = 1000;
pub const DEFAULT_PRIORITY: i32 = 0;

fn unsupported(kind: OperationKind, target: &SingleRef) -> FileOpError {
    FileOpError::no_handler(format!("{} on {}", kind, target.redacted()))
}

/// Performs some operation kinds for some schemes.
///
/// Every operation has a default that reports `NoHandlerAvailable`, so a
/// handler only implements what it claims through [`can_perform`].
///
/// [`can_perform`]: Handler::can_perform
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self, op: &Operation) -> i32;

    fn can_perform(&self, op: &Operation) -> bool;

    /// Primitives for `scheme`, used to compose cross-scheme transfers.
    fn primitives(&self, _scheme: &str) -> Option<Arc<dyn Backend>> {
        None
    }

    async fn copy(
        &self,
        source: &SingleRef,
        target: &SingleRef,
        _opts: &TransferOptions,
        _cx: &CancellationToken,
    ) -> ResultBuilder {
        ResultBuilder::failed_transfer(source, target, unsupported(OperationKind::Copy, source))
    }

    async fn move_to(
        &self,
        source: &SingleRef,
        target: &SingleRef,
        _opts: &TransferOptions,
        _cx: &CancellationToken,
    ) -> ResultBuilder {
        ResultBuilder::failed_transfer(source, target, unsupported(OperationKind::Move, source))
    }

    async fn delete(
        &self,
        target: &SingleRef,
        _opts: &DeleteOptions,
        _cx: &CancellationToken,
    ) -> ResultBuilder {
        let mut result = ResultBuilder::new();
        result.add_failure(target, unsupported(OperationKind::Delete, target));
        result
    }

    async fn create(&self, target: &SingleRef, _opts: &CreateOptions) -> FileOpResult<SingleRef> {
        Err(unsupported(OperationKind::Create, target))
    }

    async fn info(&self, target: &SingleRef) -> FileOpResult<Option<Info>> {
        Err(unsupported(OperationKind::Info, target))
    }

    async fn list(
        &self,
        target: &SingleRef,
        _opts: &ListOptions,
        _cx: &CancellationToken,
    ) -> FileOpResult<Vec<Info>> {
        Err(unsupported(OperationKind::List, target))
    }

    async fn resolve(
        &self,
        pattern: &SingleRef,
        _cx: &CancellationToken,
    ) -> FileOpResult<Vec<SingleRef>> {
        Err(unsupported(OperationKind::Resolve, pattern))
    }

    async fn open_read(&self, target: &SingleRef) -> FileOpResult<BoxReader> {
        Err(unsupported(OperationKind::Read, target))
    }

    async fn open_write(
        &self,
        target: &SingleRef,
        _opts: &WriteOptions,
    ) -> FileOpResult<BoxWriter> {
        Err(unsupported(OperationKind::Write, target))
    }
}

/// Adapts one backend's primitives to every operation kind.
pub struct PrimitiveHandler {
    name: String,
    backend: Arc<dyn Backend>,
    engine: TreeEngine,
    priority: i32,
}

impl PrimitiveHandler {
    pub fn new(backend: Arc<dyn Backend>, engine: TreeEngine) -> Self {
        Self {
            name: format!("{}-primitives", backend.scheme()),
            backend,
            engine,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn endpoints(&self) -> Endpoints<'_> {
        Endpoints::new(self.backend.as_ref(), self.backend.as_ref())
    }
}

#[async_trait]
impl Handler for PrimitiveHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self, _op: &Operation) -> i32 {
        self.priority
    }

    fn can_perform(&self, op: &Operation) -> bool {
        let scheme = self.backend.scheme();
        op.source_scheme == scheme && op.target_scheme() == scheme
    }

    fn primitives(&self, scheme: &str) -> Option<Arc<dyn Backend>> {
        (self.backend.scheme() == scheme).then(|| self.backend.clone())
    }

    async fn copy(
        &self,
        source: &SingleRef,
        target: &SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        self.engine
            .copy(self.endpoints(), source, target, opts, cx)
            .await
    }

    async fn move_to(
        &self,
        source: &SingleRef,
        target: &SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        self.engine
            .move_to(self.endpoints(), source, target, opts, cx)
            .await
    }

    async fn delete(
        &self,
        target: &SingleRef,
        opts: &DeleteOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        self.engine
            .delete(self.backend.as_ref(), target, opts, cx)
            .await
    }

    async fn create(&self, target: &SingleRef, opts: &CreateOptions) -> FileOpResult<SingleRef> {
        self.engine.create(self.backend.as_ref(), target, opts).await
    }

    async fn info(&self, target: &SingleRef) -> FileOpResult<Option<Info>> {
        self.backend.info(target).await
    }

    async fn list(
        &self,
        target: &SingleRef,
        opts: &ListOptions,
        cx: &CancellationToken,
    ) -> FileOpResult<Vec<Info>> {
        self.engine
            .list(self.backend.as_ref(), target, opts, cx)
            .await
    }

    async fn resolve(
        &self,
        pattern: &SingleRef,
        cx: &CancellationToken,
    ) -> FileOpResult<Vec<SingleRef>> {
        resolver::resolve(self.backend.as_ref(), pattern, cx).await
    }

    async fn open_read(&self, target: &SingleRef) -> FileOpResult<BoxReader> {
        self.backend.read(target).await
    }

    async fn open_write(&self, target: &SingleRef, opts: &WriteOptions) -> FileOpResult<BoxWriter> {
        if target.has_trailing_slash() {
            return Err(FileOpError::NotADirectory(target.redacted()));
        }
        ensure_parent(self.backend.as_ref(), target, opts.make_parents).await?;
        self.backend
            .write(target, opts.append)
            .await
            .map_err(|e| missing_parent(e, target))
    }
}

/// Streams a cross-scheme copy or move through two backends' primitives.
///
/// Built per routing decision when no registered handler claims the pair.
pub struct DefaultHandler {
    source: Arc<dyn Backend>,
    target: Arc<dyn Backend>,
    engine: TreeEngine,
}

impl DefaultHandler {
    pub fn new(source: Arc<dyn Backend>, target: Arc<dyn Backend>, engine: TreeEngine) -> Self {
        Self {
            source,
            target,
            engine,
        }
    }

    fn endpoints(&self) -> Endpoints<'_> {
        Endpoints::new(self.source.as_ref(), self.target.as_ref())
    }
}

#[async_trait]
impl Handler for DefaultHandler {
    fn name(&self) -> &str {
        "default"
    }

    fn priority(&self, _op: &Operation) -> i32 {
        i32::MIN
    }

    fn can_perform(&self, op: &Operation) -> bool {
        op.kind.is_transfer()
            && op.source_scheme == self.source.scheme()
            && op.target_scheme() == self.target.scheme()
    }

    async fn copy(
        &self,
        source: &SingleRef,
        target: &SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        self.engine
            .copy(self.endpoints(), source, target, opts, cx)
            .await
    }

    async fn move_to(
        &self,
        source: &SingleRef,
        target: &SingleRef,
        opts: &TransferOptions,
        cx: &CancellationToken,
    ) -> ResultBuilder {
        self.engine
            .move_to(self.endpoints(), source, target, opts, cx)
            .await
    }
}
