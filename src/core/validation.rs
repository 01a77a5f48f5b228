use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{FileOpError, FileOpResult};
use crate::uri::SingleRef;

/// Lexical checks for a transfer, done before any I/O.
pub fn validate_transfer(source: &SingleRef, target: &SingleRef) -> FileOpResult<()> {
    debug!(
        "Validating transfer: {} -> {}",
        source.redacted(),
        target.redacted()
    );

    if source.same_location(target) {
        return Err(FileOpError::SourceEqualsTarget(source.redacted()));
    }

    // Circular paths (target inside source)
    if target.is_within(source) {
        return Err(FileOpError::TargetInsideSource {
            source_ref: source.redacted(),
            target_ref: target.redacted(),
        });
    }

    Ok(())
}

/// Whether `source` is strictly newer than `target`, at millisecond precision.
///
/// A missing timestamp on either side counts as newer, so the copy happens.
pub fn is_newer(source: Option<DateTime<Utc>>, target: Option<DateTime<Utc>>) -> bool {
    match (source, target) {
        (Some(s), Some(t)) => s.timestamp_millis() > t.timestamp_millis(),
        _ => true,
    }
}
