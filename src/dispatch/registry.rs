use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::handler::{DefaultHandler, Handler};
use super::operation::{Operation, OperationKind};
use crate::backend::Backend;
use crate::core::TreeEngine;
use crate::error::{FileOpError, FileOpResult};
use crate::pool::with_cancellation;
use crate::result::ResultBuilder;
use crate::uri::SingleRef;

pub type PerformFuture<'a, T> = Pin<Box<dyn Future<Output = ResultBuilder<T>> + Send + 'a>>;

/// Collects handlers in registration order before use.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
    engine: TreeEngine,
}

impl HandlerRegistry {
    /// `engine` drives the composed cross-scheme fallback.
    pub fn new(engine: TreeEngine) -> Self {
        Self {
            handlers: Vec::new(),
            engine,
        }
    }

    pub fn register<H: Handler + 'static>(self, handler: H) -> Self {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(mut self, handler: Arc<dyn Handler>) -> Self {
        debug!("Registered handler: {}", handler.name());
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            handlers: self.handlers.into(),
            engine: self.engine,
        }
    }
}

/// Immutable routing table. Performs no I/O of its own.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<[Arc<dyn Handler>]>,
    engine: TreeEngine,
}

impl Dispatcher {
    /// Highest-priority capable handler; ties go to the earliest registered.
    /// Cross-scheme transfers nobody claims are composed from primitives.
    pub fn select(&self, op: &Operation) -> Option<Arc<dyn Handler>> {
        let mut best: Option<(i32, &Arc<dyn Handler>)> = None;
        for handler in self.handlers.iter() {
            if !handler.can_perform(op) {
                continue;
            }
            let priority = handler.priority(op);
            if best.is_none_or(|(current, _)| priority > current) {
                best = Some((priority, handler));
            }
        }

        if let Some((_, handler)) = best {
            return Some(handler.clone());
        }
        if op.kind.is_transfer() {
            return self.compose(op);
        }
        None
    }

    fn compose(&self, op: &Operation) -> Option<Arc<dyn Handler>> {
        let source = self.primitives(&op.source_scheme)?;
        let target = self.primitives(op.target_scheme())?;
        trace!("Composing default handler for {}", op);
        Some(Arc::new(DefaultHandler::new(
            source,
            target,
            self.engine.clone(),
        )))
    }

    /// First registered handler exposing primitives for `scheme`.
    pub fn primitives(&self, scheme: &str) -> Option<Arc<dyn Backend>> {
        self.handlers.iter().find_map(|h| h.primitives(scheme))
    }

    /// Handler for a single-scheme operation on `target`.
    pub fn handler_for(
        &self,
        kind: OperationKind,
        target: &SingleRef,
    ) -> FileOpResult<Arc<dyn Handler>> {
        let op = Operation::new(kind, target.scheme());
        self.select(&op).ok_or_else(|| FileOpError::no_handler(&op))
    }

    /// Expand one expression into concrete references.
    ///
    /// Glob-free expressions come back unchanged without touching a backend.
    pub async fn expand(
        &self,
        expr: &SingleRef,
        cx: &CancellationToken,
    ) -> FileOpResult<Vec<SingleRef>> {
        if !expr.is_wildcard() {
            return Ok(vec![expr.clone()]);
        }
        let handler = self.handler_for(OperationKind::Resolve, expr)?;
        with_cancellation(cx, handler.resolve(expr, cx)).await
    }

    /// Expand every expression. Expansion failures, and empty expansions of
    /// mutating operations, are recorded in the returned builder.
    pub async fn expand_all<T>(
        &self,
        kind: OperationKind,
        expressions: &[SingleRef],
        cx: &CancellationToken,
    ) -> (Vec<SingleRef>, ResultBuilder<T>) {
        let mut items = Vec::new();
        let mut result = ResultBuilder::new();

        for expr in expressions {
            match self.expand(expr, cx).await {
                Ok(matches) if matches.is_empty() => {
                    if kind.is_mutating() {
                        let err =
                            FileOpError::NotFound(format!("no match for {}", expr.redacted()));
                        result.add_failure(expr, err);
                    }
                }
                Ok(matches) => items.extend(matches),
                Err(e) => result.add_failure(expr, e),
            }
        }
        (items, result)
    }

    /// Expand `expressions`, route every concrete reference and merge the
    /// outcomes. `target_scheme` is set for copy and move.
    pub async fn dispatch<'a, T, F>(
        &self,
        kind: OperationKind,
        expressions: &[SingleRef],
        target_scheme: Option<&str>,
        cx: &CancellationToken,
        perform: F,
    ) -> ResultBuilder<T>
    where
        T: Send,
        F: FnMut(Arc<dyn Handler>, SingleRef) -> PerformFuture<'a, T> + Send,
    {
        let (items, mut result) = self.expand_all(kind, expressions, cx).await;
        let routed = self
            .dispatch_expanded(kind, items, target_scheme, cx, perform)
            .await;
        result.merge(routed);
        result
    }

    /// Route already-concrete references. A reference nobody can handle
    /// fails alone; the loop stops after a cancelled sub-result.
    pub async fn dispatch_expanded<'a, T, F>(
        &self,
        kind: OperationKind,
        items: Vec<SingleRef>,
        target_scheme: Option<&str>,
        cx: &CancellationToken,
        mut perform: F,
    ) -> ResultBuilder<T>
    where
        T: Send,
        F: FnMut(Arc<dyn Handler>, SingleRef) -> PerformFuture<'a, T> + Send,
    {
        let mut result = ResultBuilder::new();

        for item in items {
            if cx.is_cancelled() {
                result.add_failure(&item, FileOpError::cancelled(&item));
                break;
            }

            let op = match target_scheme {
                Some(target) => Operation::transfer(kind, item.scheme(), target),
                None => Operation::new(kind, item.scheme()),
            };
            let Some(handler) = self.select(&op) else {
                debug!("No handler for {}", op);
                result.add_failure(&item, FileOpError::no_handler(&op));
                continue;
            };

            trace!("Routing {} on {} to {}", op, item.redacted(), handler.name());
            let sub = with_cancellation(cx, perform(handler, item)).await;
            let stop = sub.has_cancelled();
            result.merge(sub);
            if stop {
                break;
            }
        }
        result
    }
}
