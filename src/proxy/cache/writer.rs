use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::super::http::body::BodyPlan;
use super::super::http::codec::ResponseHead;

/// Serializes a complete HTTP response (head, blank line, exactly
/// `content_length` body bytes) to the temp path and fsyncs it. Returns the
/// total bytes written. On any failure the temp file is removed; the rename
/// to the final path is the caller's responsibility.
pub async fn write_response_to_tmp<R>(
    tmp_path: &Path,
    head: &ResponseHead,
    body: &mut R,
    content_length: u64,
) -> Result<i64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match write_inner(tmp_path, head, body, content_length).await {
        Ok(written) => Ok(written),
        Err(err) => {
            let _ = fs::remove_file(tmp_path).await;
            Err(err)
        }
    }
}

async fn write_inner<R>(
    tmp_path: &Path,
    head: &ResponseHead,
    body: &mut R,
    content_length: u64,
) -> Result<i64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = fs::File::create(tmp_path)
        .await
        .with_context(|| format!("failed to create cache temp file {}", tmp_path.display()))?;

    let encoded_head = head.encode(BodyPlan::Fixed(content_length), false);
    file.write_all(&encoded_head)
        .await
        .with_context(|| format!("failed to write cache entry head {}", tmp_path.display()))?;

    let copied = crate::io_util::copy_exact_with_write_timeout(
        body,
        &mut file,
        content_length,
        std::time::Duration::from_secs(60),
        "writing cache entry body",
    )
    .await?;

    file.sync_all()
        .await
        .with_context(|| format!("failed to sync cache entry {}", tmp_path.display()))?;

    Ok(encoded_head.len() as i64 + copied as i64)
}
