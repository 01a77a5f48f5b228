use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{FileOpError, FileOpResult};
use crate::uri::SingleRef;

/// A missing destination directory surfaces as `NotFound` from the write
/// primitive; report it against the parent instead.
pub(crate) fn missing_parent(err: FileOpError, target: &SingleRef) -> FileOpError {
    match err {
        FileOpError::NotFound(_) => FileOpError::MissingParent(
            target
                .parent()
                .map(|p| p.redacted())
                .unwrap_or_else(|| target.redacted()),
        ),
        other => other,
    }
}

/// Stream one file between backends in `chunk_size` steps.
///
/// Cancellation is checked before every chunk. A cancelled transfer removes
/// the partial destination file.
pub(crate) async fn stream_file(
    from: &dyn Backend,
    source: &SingleRef,
    to: &dyn Backend,
    target: &SingleRef,
    chunk_size: usize,
    cx: &CancellationToken,
) -> FileOpResult<u64> {
    let mut reader = from.read(source).await?;
    let mut writer = to
        .write(target, false)
        .await
        .map_err(|e| missing_parent(e, target))?;

    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;

    loop {
        if cx.is_cancelled() {
            drop(writer);
            discard_partial(to, target).await;
            return Err(FileOpError::cancelled(target));
        }

        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| FileOpError::from_io(e, source))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .await
            .map_err(|e| FileOpError::from_io(e, target))?;
        copied += n as u64;
    }

    writer
        .shutdown()
        .await
        .map_err(|e| FileOpError::from_io(e, target))?;

    debug!(
        "Streamed {} bytes: {} -> {}",
        copied,
        source.redacted(),
        target.redacted()
    );
    Ok(copied)
}

async fn discard_partial(to: &dyn Backend, target: &SingleRef) {
    if let Err(e) = to.delete_file(target).await {
        warn!("Failed to remove partial file {}: {}", target.redacted(), e);
    }
}
