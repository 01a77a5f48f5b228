use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Copy,
    Move,
    Delete,
    Create,
    Info,
    List,
    Resolve,
    Read,
    Write,
}

impl OperationKind {
    /// Mutating operations fail when nothing was processed.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::Copy | Self::Move | Self::Delete | Self::Create | Self::Write
        )
    }

    /// Copy and move involve two schemes.
    pub fn is_transfer(self) -> bool {
        matches!(self, Self::Copy | Self::Move)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Create => "create",
            Self::Info => "info",
            Self::List => "list",
            Self::Resolve => "resolve",
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One routing decision: what to do and on which schemes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operation {
    pub kind: OperationKind,
    pub source_scheme: String,
    /// Only set for copy and move
    pub target_scheme: Option<String>,
}

impl Operation {
    pub fn new(kind: OperationKind, scheme: &str) -> Self {
        Self {
            kind,
            source_scheme: scheme.to_string(),
            target_scheme: None,
        }
    }

    pub fn transfer(kind: OperationKind, source_scheme: &str, target_scheme: &str) -> Self {
        Self {
            kind,
            source_scheme: source_scheme.to_string(),
            target_scheme: Some(target_scheme.to_string()),
        }
    }

    /// Target scheme, falling back to the source scheme.
    pub fn target_scheme(&self) -> &str {
        self.target_scheme.as_deref().unwrap_or(&self.source_scheme)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target_scheme {
            Some(target) => write!(f, "{} {} -> {}", self.kind, self.source_scheme, target),
            None => write!(f, "{} on {}", self.kind, self.source_scheme),
        }
    }
}
