//! Backend-agnostic file operations over URI-style references.

pub mod backend;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod observability;
pub mod pool;
pub mod result;
pub mod service;
pub mod uri;

pub use error::{FileOpError, FileOpResult};
pub use manager::FileManager;
pub use result::{Content, OpResult, Outcome};
pub use uri::{Reference, SingleRef};
