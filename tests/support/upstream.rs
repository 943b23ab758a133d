use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use gitmproxy::tls::ca::CertificateAuthority;

/// A loopback alias the proxy's self-loop guard does not match; requests to
/// `127.0.0.1`/`localhost` are refused by design.
pub const UPSTREAM_IP: Ipv4Addr = Ipv4Addr::new(127, 1, 2, 3);

/// Minimal counting origin server: answers every request with a fixed 200
/// response, optionally behind TLS with a throwaway certificate.
pub struct MockUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn http(extra_headers: &str, body: &str) -> Result<Self> {
        Self::spawn(extra_headers, body, None).await
    }

    pub async fn https(extra_headers: &str, body: &str, tls_dir: &std::path::Path) -> Result<Self> {
        let ca = CertificateAuthority::load_or_generate(tls_dir)?;
        let certified = ca.mint_leaf(&[&UPSTREAM_IP.to_string()], Duration::from_secs(3600))?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(rustls::sign::SingleCertAndKey::from(certified)));
        Self::spawn(extra_headers, body, Some(TlsAcceptor::from(Arc::new(config)))).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn spawn(
        extra_headers: &str,
        body: &str,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((UPSTREAM_IP, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n{}",
            body.len(),
            extra_headers,
            body
        );

        let loop_requests = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let requests = loop_requests.clone();
                let response = response.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => {
                            if let Ok(stream) = acceptor.accept(stream).await {
                                let _ = serve_one(stream, &requests, &response).await;
                            }
                        }
                        None => {
                            let _ = serve_one(stream, &requests, &response).await;
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            requests,
            handle,
        })
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one<S>(mut stream: S, requests: &AtomicUsize, response: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let head_end = loop {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        data.extend_from_slice(&buf[..read]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    // Drain any declared request body before answering.
    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let body_len = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let mut remaining = body_len.saturating_sub(data.len() - head_end);
    while remaining > 0 {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        remaining = remaining.saturating_sub(read);
    }

    requests.fetch_add(1, Ordering::SeqCst);
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}
