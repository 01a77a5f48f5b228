//! Partial-failure result model.
//!
//! An operation over many targets records one [`Outcome`] per processed
//! entry. Failures are data; the aggregate only reports success when
//! nothing failed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::{EntryKind, Info};
use crate::dispatch::OperationKind;
use crate::error::FileOpError;
use crate::uri::SingleRef;

/// What happened to one entry.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub source: Option<SingleRef>,
    pub target: SingleRef,
    pub error: Option<FileOpError>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl Serialize for Outcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Outcome", 3)?;
        state.serialize_field("source", &self.source)?;
        state.serialize_field("target", &self.target)?;
        state.serialize_field("error", &self.error.as_ref().map(ToString::to_string))?;
        state.end()
    }
}

/// Accumulates outcomes and values while an operation runs.
#[derive(Debug)]
pub struct ResultBuilder<T = ()> {
    outcomes: Vec<Outcome>,
    values: Vec<T>,
    fatal: Option<FileOpError>,
}

impl<T> Default for ResultBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultBuilder<T> {
    pub fn new() -> Self {
        Self {
            outcomes: Vec::new(),
            values: Vec::new(),
            fatal: None,
        }
    }

    /// A builder holding only a fatal error.
    pub fn failed(error: FileOpError) -> Self {
        let mut builder = Self::new();
        builder.set_fatal(error);
        builder
    }

    /// A builder holding one failed transfer.
    pub fn failed_transfer(source: &SingleRef, target: &SingleRef, error: FileOpError) -> Self {
        let mut builder = Self::new();
        builder.add_transfer_failure(source, target, error);
        builder
    }

    pub fn add_success(&mut self, target: &SingleRef) {
        self.outcomes.push(Outcome {
            source: None,
            target: target.clone(),
            error: None,
        });
    }

    pub fn add_transfer(&mut self, source: &SingleRef, target: &SingleRef) {
        self.outcomes.push(Outcome {
            source: Some(source.clone()),
            target: target.clone(),
            error: None,
        });
    }

    pub fn add_failure(&mut self, target: &SingleRef, error: FileOpError) {
        self.outcomes.push(Outcome {
            source: None,
            target: target.clone(),
            error: Some(error),
        });
    }

    pub fn add_transfer_failure(
        &mut self,
        source: &SingleRef,
        target: &SingleRef,
        error: FileOpError,
    ) {
        self.outcomes.push(Outcome {
            source: Some(source.clone()),
            target: target.clone(),
            error: Some(error),
        });
    }

    pub fn push_value(&mut self, value: T) {
        self.values.push(value);
    }

    /// Absorb another builder. The first fatal error wins.
    pub fn merge(&mut self, other: ResultBuilder<T>) {
        self.outcomes.extend(other.outcomes);
        self.values.extend(other.values);
        if self.fatal.is_none() {
            self.fatal = other.fatal;
        }
    }

    pub fn set_fatal(&mut self, error: FileOpError) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }

    pub fn has_failures(&self) -> bool {
        self.fatal.is_some() || self.outcomes.iter().any(|o| o.error.is_some())
    }

    pub fn first_failure(&self) -> Option<&FileOpError> {
        self.fatal
            .as_ref()
            .or_else(|| self.outcomes.iter().find_map(|o| o.error.as_ref()))
    }

    pub fn has_cancelled(&self) -> bool {
        self.fatal.as_ref().is_some_and(FileOpError::is_cancelled)
            || self
                .outcomes
                .iter()
                .any(|o| o.error.as_ref().is_some_and(FileOpError::is_cancelled))
    }

    pub fn build(self, kind: OperationKind) -> OpResult<T> {
        OpResult {
            kind,
            outcomes: self.outcomes,
            values: self.values,
            fatal: self.fatal,
        }
    }
}

/// Immutable aggregate of an operation.
#[derive(Debug, Serialize)]
pub struct OpResult<T = ()> {
    kind: OperationKind,
    outcomes: Vec<Outcome>,
    values: Vec<T>,
    #[serde(serialize_with = "serialize_error")]
    fatal: Option<FileOpError>,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<FileOpError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl<T> OpResult<T> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Processed entries plus a fatal error, if any.
    pub fn total_count(&self) -> usize {
        self.outcomes.len() + usize::from(self.fatal.is_some())
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn fail_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count() + usize::from(self.fatal.is_some())
    }

    /// No failures, and a mutating operation must have touched something.
    pub fn success(&self) -> bool {
        self.fail_count() == 0 && (self.total_count() > 0 || !self.kind.is_mutating())
    }

    /// The fatal error, else the first per-entry error.
    pub fn first_error(&self) -> Option<&FileOpError> {
        self.fatal
            .as_ref()
            .or_else(|| self.outcomes.iter().find_map(|o| o.error.as_ref()))
    }

    pub fn errors(&self) -> impl Iterator<Item = &FileOpError> {
        self.fatal
            .iter()
            .chain(self.outcomes.iter().filter_map(|o| o.error.as_ref()))
    }

    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn into_values(self) -> Vec<T> {
        self.values
    }
}

impl OpResult<Option<Info>> {
    fn entry(&self) -> Option<&Info> {
        self.values.first().and_then(Option::as_ref)
    }

    pub fn exists(&self) -> bool {
        self.entry().is_some()
    }

    pub fn is_file(&self) -> bool {
        self.entry().is_some_and(|i| i.kind == EntryKind::File)
    }

    pub fn is_directory(&self) -> bool {
        self.entry().is_some_and(|i| i.kind == EntryKind::Directory)
    }

    pub fn is_link(&self) -> bool {
        self.entry().is_some_and(|i| i.kind == EntryKind::Link)
    }

    pub fn size(&self) -> Option<u64> {
        self.entry().map(|i| i.size)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.entry().and_then(|i| i.last_modified)
    }

    pub fn name(&self) -> Option<&str> {
        self.entry().map(|i| i.name.as_str())
    }
}

/// An opened stream together with the reference it was opened from.
pub struct Content<S> {
    pub reference: SingleRef,
    pub stream: S,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(path: &str) -> SingleRef {
        SingleRef::parse(&format!("mem://v{}", path)).unwrap()
    }

    #[test]
    fn test_counts_and_success() {
        let mut builder = ResultBuilder::<()>::new();
        builder.add_success(&target("/a"));
        builder.add_transfer(&target("/b"), &target("/c"));
        let result = builder.build(OperationKind::Copy);
        assert_eq!(result.total_count(), 2);
        assert_eq!(result.success_count(), 2);
        assert!(result.success());
        assert!(result.first_error().is_none());
    }

    #[test]
    fn test_partial_failure() {
        let mut builder = ResultBuilder::<()>::new();
        builder.add_success(&target("/a"));
        builder.add_failure(&target("/b"), FileOpError::NotFound("b".into()));
        let result = builder.build(OperationKind::Delete);
        assert_eq!(result.total_count(), 2);
        assert_eq!(result.fail_count(), 1);
        assert!(!result.success());
        assert!(result.first_error().is_some_and(FileOpError::is_not_found));
    }

    #[test]
    fn test_empty_result_depends_on_kind() {
        assert!(!ResultBuilder::<()>::new().build(OperationKind::Copy).success());
        assert!(!ResultBuilder::<()>::new().build(OperationKind::Create).success());
        assert!(ResultBuilder::<()>::new().build(OperationKind::List).success());
        assert!(ResultBuilder::<()>::new().build(OperationKind::Resolve).success());
    }

    #[test]
    fn test_fatal_error_counts_and_comes_first() {
        let mut builder = ResultBuilder::<()>::new();
        builder.add_failure(&target("/x"), FileOpError::NotFound("x".into()));
        builder.set_fatal(FileOpError::NotADirectory("t".into()));
        let result = builder.build(OperationKind::Copy);
        assert_eq!(result.total_count(), 2);
        assert_eq!(result.fail_count(), 2);
        assert!(matches!(result.first_error(), Some(FileOpError::NotADirectory(_))));
    }

    #[test]
    fn test_merge_keeps_everything() {
        let mut a = ResultBuilder::new();
        a.push_value(1);
        a.add_success(&target("/1"));
        let mut b = ResultBuilder::new();
        b.push_value(2);
        b.add_failure(&target("/2"), FileOpError::cancelled(&target("/2")));
        a.merge(b);
        assert!(a.has_cancelled());
        let result = a.build(OperationKind::List);
        assert_eq!(result.values(), &[1, 2]);
        assert_eq!(result.total_count(), 2);
    }
}
