//! Handler registry and priority dispatch.

pub mod handler;
pub mod operation;
pub mod registry;

pub use handler::{DEFAULT_PRIORITY, DefaultHandler, Handler, PrimitiveHandler, TOP_PRIORITY};
pub use operation::{Operation, OperationKind};
pub use registry::{Dispatcher, HandlerRegistry, PerformFuture};
