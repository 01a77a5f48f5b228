use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::uri::SingleRef;

pub type FileOpResult<T> = std::result::Result<T, FileOpError>;

/// Per-target failure taxonomy.
///
/// Errors are values: they are attached to the outcome of the target they
/// belong to and never abort sibling targets.
#[derive(Debug, Clone, Error)]
pub enum FileOpError {
    #[error("Malformed reference '{input}': {reason}")]
    MalformedReference { input: String, reason: String },

    #[error("No handler available for {operation}")]
    NoHandlerAvailable { operation: String },

    #[error("Source and target are the same: {0}")]
    SourceEqualsTarget(String),

    #[error("Target {target_ref} is inside source {source_ref}")]
    TargetInsideSource { source_ref: String, target_ref: String },

    #[error("Cannot process directory {0} without the recursive flag")]
    DirectoryRequiresRecursive(String),

    #[error("Parent directory does not exist: {0}")]
    MissingParent(String),

    #[error("Target already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection to {authority} failed: {reason}")]
    ConnectionFailed { authority: String, reason: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Not supported natively: {0}")]
    Unsupported(String),

    #[error("{message}")]
    Backend {
        message: String,
        #[source]
        cause: Option<Arc<io::Error>>,
    },
}

impl FileOpError {
    pub fn malformed(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedReference {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn no_handler(operation: impl ToString) -> Self {
        Self::NoHandlerAvailable {
            operation: operation.to_string(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            cause: None,
        }
    }

    pub fn cancelled(target: &SingleRef) -> Self {
        Self::Cancelled(target.redacted())
    }

    /// Translate an I/O failure that happened while touching `target`.
    pub fn from_io(err: io::Error, target: &SingleRef) -> Self {
        let shown = target.redacted();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(shown),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(shown),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(shown),
            io::ErrorKind::NotADirectory => Self::NotADirectory(shown),
            io::ErrorKind::CrossesDevices | io::ErrorKind::Unsupported => {
                Self::Unsupported(format!("{}: {}", shown, err))
            }
            _ => Self::Backend {
                message: format!("I/O failure on {}: {}", shown, err),
                cause: Some(Arc::new(err)),
            },
        }
    }

    /// Failures that leave a remote session in an unknown state.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::Backend { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
