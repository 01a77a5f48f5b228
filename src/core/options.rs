use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What to do when a file already exists at the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Overwrite,
    /// Fail the entry with `AlreadyExists`
    NoOverwrite,
    /// Copy only when the source is strictly newer
    Update,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub recursive: bool,
    pub make_parents: bool,
    pub conflict: ConflictPolicy,
}

impl TransferOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Self::default()
        }
    }

    pub fn with_make_parents(mut self, make_parents: bool) -> Self {
        self.make_parents = make_parents;
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }
}

pub type CopyOptions = TransferOptions;
pub type MoveOptions = TransferOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Create a directory even without a trailing slash
    pub directory: bool,
    pub make_parents: bool,
    /// Stamp the entry with this time instead of now
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub append: bool,
    pub make_parents: bool,
}
