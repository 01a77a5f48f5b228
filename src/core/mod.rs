pub mod engine;
pub mod options;
pub mod resolver;
pub(crate) mod transfer;
pub mod validation;

pub use engine::{Endpoints, TreeEngine};
pub use options::{
    ConflictPolicy, CopyOptions, CreateOptions, DeleteOptions, ListOptions, MoveOptions,
    TransferOptions, WriteOptions,
};
pub use resolver::resolve;
pub use validation::{is_newer, validate_transfer};
