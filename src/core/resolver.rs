//! Wildcard expansion against live listings.

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backend::Backend;
use crate::error::{FileOpError, FileOpResult};
use crate::uri::SingleRef;
use crate::uri::has_wildcard;
use crate::uri::pattern::SegmentPattern;

/// Expand `pattern` into the concrete references that exist on `backend`.
///
/// A glob-free pattern is returned as-is without any listing. Otherwise
/// each wildcard segment lists every surviving candidate once; literal
/// segments are appended without I/O. Order follows the backend listings.
pub async fn resolve(
    backend: &dyn Backend,
    pattern: &SingleRef,
    cx: &CancellationToken,
) -> FileOpResult<Vec<SingleRef>> {
    if !pattern.is_wildcard() {
        return Ok(vec![pattern.clone()]);
    }

    let segments = pattern.segments();
    let first_glob = segments
        .iter()
        .position(|s| has_wildcard(s))
        .unwrap_or(segments.len());
    let want_dir = pattern.has_trailing_slash();
    let case_insensitive = backend.capabilities().case_insensitive;

    let prefix = segments[..first_glob]
        .iter()
        .fold(pattern.root(), |dir, segment| dir.join_encoded(segment));
    let mut frontier = vec![prefix.as_directory()];

    for (idx, segment) in segments.iter().enumerate().skip(first_glob) {
        if frontier.is_empty() {
            break;
        }
        let last = idx + 1 == segments.len();

        if !has_wildcard(segment) {
            frontier = frontier
                .iter()
                .map(|dir| dir.join_encoded(segment))
                .collect();
            continue;
        }

        let matcher = SegmentPattern::new(segment, case_insensitive)?;
        let need_dir = !last || want_dir;
        let mut next = Vec::new();

        for dir in &frontier {
            if cx.is_cancelled() {
                return Err(FileOpError::cancelled(dir));
            }
            let children = match backend.list(&dir.as_directory()).await {
                Ok(children) => children,
                Err(FileOpError::NotFound(_)) | Err(FileOpError::NotADirectory(_)) => {
                    trace!("Skipping unlistable candidate {}", dir.redacted());
                    continue;
                }
                Err(e) => return Err(e),
            };
            next.extend(
                children
                    .into_iter()
                    .filter(|child| matcher.is_match(&child.name))
                    .filter(|child| !need_dir || child.is_directory())
                    .map(|child| child.reference),
            );
        }
        frontier = next;
    }

    let matches: Vec<SingleRef> = frontier
        .into_iter()
        .map(|r| {
            if want_dir {
                r.as_directory()
            } else {
                r.without_trailing_slash()
            }
        })
        .collect();

    debug!("Resolved {} to {} match(es)", pattern.redacted(), matches.len());
    Ok(matches)
}
