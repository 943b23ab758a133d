use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use http::Method;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};

use crate::io_util::{
    copy_exact_with_write_timeout, copy_with_write_timeout, write_all_with_timeout,
};
use crate::metrics;

use super::codec::{ResponseHead, read_line_with_timeout};

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// How the response body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub fn response_body_plan(method: &Method, head: &ResponseHead) -> BodyPlan {
    if method == Method::HEAD {
        return BodyPlan::Empty;
    }
    let status = head.status.as_u16();
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return BodyPlan::Empty;
    }
    if head.chunked {
        return BodyPlan::Chunked;
    }
    match head.content_length {
        Some(0) => BodyPlan::Empty,
        Some(length) => BodyPlan::Fixed(length),
        None => BodyPlan::UntilClose,
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A response body: a byte source plus the framing it uses. A body owns its
/// source, so dropping it releases the underlying file handle or upstream
/// connection.
pub struct Body {
    plan: BodyPlan,
    reader: Option<BoxedReader>,
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("plan", &self.plan)
            .field("reader", &self.reader.is_some())
            .finish()
    }
}

impl Body {
    pub fn empty() -> Self {
        Self {
            plan: BodyPlan::Empty,
            reader: None,
        }
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        let plan = if data.is_empty() {
            BodyPlan::Empty
        } else {
            BodyPlan::Fixed(data.len() as u64)
        };
        Self {
            plan,
            reader: Some(Box::new(std::io::Cursor::new(data))),
        }
    }

    pub fn stream(reader: BoxedReader, plan: BodyPlan) -> Self {
        Self {
            plan,
            reader: Some(reader),
        }
    }

    pub fn plan(&self) -> BodyPlan {
        self.plan
    }

    /// Wraps the source so every byte the client reads is added to the
    /// transfer counters, attributed to a hit or a miss.
    pub fn counted(self, hit: bool) -> Self {
        match self.reader {
            Some(reader) => Self {
                plan: self.plan,
                reader: Some(Box::new(CountingReader::new(reader, hit))),
            },
            None => self,
        }
    }

    pub fn into_reader(self) -> Option<BoxedReader> {
        self.reader
    }

    /// Streams the body to the writer according to its plan. Returns the
    /// number of payload bytes written.
    pub async fn write_to<W>(
        self,
        writer: &mut W,
        write_timeout: Duration,
        context: &str,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let plan = self.plan;
        let reader = match self.reader {
            Some(reader) => reader,
            None => return Ok(0),
        };
        match plan {
            BodyPlan::Empty => Ok(0),
            BodyPlan::Fixed(length) => {
                let mut reader = reader;
                copy_exact_with_write_timeout(&mut reader, writer, length, write_timeout, context)
                    .await
            }
            BodyPlan::UntilClose => {
                let mut reader = reader;
                copy_with_write_timeout(&mut reader, writer, write_timeout, context).await
            }
            BodyPlan::Chunked => {
                let mut reader = BufReader::new(reader);
                relay_chunked_body(&mut reader, writer, write_timeout, context).await
            }
        }
    }
}

/// Relays a chunked body verbatim, framing included, until the terminating
/// zero chunk and its trailers have been copied.
pub async fn relay_chunked_body<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    write_timeout: Duration,
    context: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = String::new();

    loop {
        let size_bytes = read_line_with_timeout(
            reader,
            &mut line,
            write_timeout,
            MAX_CHUNK_LINE_LENGTH,
            context,
        )
        .await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size ({context})");
        }
        total = total.saturating_add(size_bytes as u64);
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed);
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        write_all_with_timeout(writer, line.as_bytes(), write_timeout, context).await?;

        if chunk_size == 0 {
            loop {
                let trailer_bytes = read_line_with_timeout(
                    reader,
                    &mut line,
                    write_timeout,
                    MAX_CHUNK_LINE_LENGTH,
                    context,
                )
                .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer ({context})");
                }
                write_all_with_timeout(writer, line.as_bytes(), write_timeout, context).await?;
                total = total.saturating_add(trailer_bytes as u64);
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        let copied = copy_exact_with_write_timeout(
            reader,
            writer,
            chunk_size as u64 + 2,
            write_timeout,
            context,
        )
        .await?;
        total = total.saturating_add(copied);
    }

    Ok(total)
}

/// Delegating reader that adds every positive read to the global transfer
/// counters, attributed to a hit or a miss at construction time.
pub struct CountingReader<R> {
    inner: R,
    hit: bool,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, hit: bool) -> Self {
        Self { inner, hit }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let hit = self.hit;
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                metrics::record_transfer(read as u64, hit);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
