#![allow(dead_code)]

pub mod harness;
pub mod upstream;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use harness::ProxyHarness;
pub use upstream::{MockUpstream, UPSTREAM_IP};

/// Reads a complete `Connection: close` response (until EOF) as text.
pub async fn read_http_response<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}
