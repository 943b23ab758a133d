use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner
/// errors into contextual `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .map_err(|err| anyhow::Error::new(err).context(format!("failed while {context}")))
}

pub async fn write_all_with_timeout<W: AsyncWrite + Unpin, C: Into<String>>(
    writer: &mut W,
    buf: &[u8],
    timeout: Duration,
    context: C,
) -> Result<()> {
    timeout_with_context(timeout, writer.write_all(buf), context).await
}

/// Copies the reader to the writer until EOF, bounding each write by the
/// timeout. Returns the number of bytes copied.
pub async fn copy_with_write_timeout<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
    context: &str,
) -> Result<u64> {
    let mut total = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        write_all_with_timeout(writer, &buffer[..read], timeout, context).await?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}

/// Copies exactly `remaining` bytes from the reader to the writer, bounding
/// each write by the timeout. Errors on early EOF.
pub async fn copy_exact_with_write_timeout<R: AsyncRead + Unpin + ?Sized, W: AsyncWrite + Unpin>(
    reader: &mut R,
    writer: &mut W,
    mut remaining: u64,
    timeout: Duration,
    context: &str,
) -> Result<u64> {
    let mut total = 0u64;
    let mut buffer = [0u8; 8192];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = reader.read(&mut buffer[..to_read]).await?;
        if read == 0 {
            bail!("unexpected EOF while {context} ({remaining} bytes short)");
        }
        remaining -= read as u64;
        write_all_with_timeout(writer, &buffer[..read], timeout, context).await?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}
