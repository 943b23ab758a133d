use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rustls::{ClientConfig, crypto::ring, pki_types::ServerName};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::io_util::write_all_with_timeout;
use crate::settings::Settings;
use crate::tls::verify::DisabledCertVerifier;

use super::cache::transport::Transport;
use super::http::HttpResponse;
use super::http::body::{Body, response_body_plan};
use super::http::codec::read_response_head;
use super::request::ProxyRequest;

trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// The passthrough transport: one upstream connection per request, plain
/// TCP for http and rustls for https with certificate verification
/// disabled (clients already accepted the interception CA; the upstream
/// side is explicitly not a trust boundary here).
pub struct UpstreamTransport {
    tls: Arc<ClientConfig>,
    connect_timeout: Duration,
    io_timeout: Duration,
    max_header_size: usize,
}

impl UpstreamTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            tls: Arc::new(build_upstream_tls_config()?),
            connect_timeout: settings.upstream_connect_timeout,
            io_timeout: settings.upstream_timeout,
            max_header_size: settings.max_header_size,
        })
    }
}

fn build_upstream_tls_config() -> Result<ClientConfig> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?;
    let mut config = builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DisabledCertVerifier::default()))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Attempts each resolved address in turn until one connects.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(addr = %addr, error = %err, "failed to set TCP_NODELAY on upstream stream");
                }
                debug!(addr = %addr, "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(
                    anyhow::Error::new(err).context(format!("failed to connect to {addr}")),
                );
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no addresses resolved for upstream connect")))
}

#[async_trait]
impl Transport for UpstreamTransport {
    async fn round_trip(&self, req: &ProxyRequest) -> Result<HttpResponse> {
        let host = req.hostname().to_string();
        let port = req.port();

        let addrs: Vec<SocketAddr> = timeout(
            self.connect_timeout,
            tokio::net::lookup_host((host.as_str(), port)),
        )
        .await
        .map_err(|_| anyhow!("resolving {host} timed out"))?
        .with_context(|| format!("failed to resolve {host}"))?
        .collect();

        let (tcp, _) = connect_to_addrs(&addrs, self.connect_timeout).await?;

        let mut stream: Box<dyn IoStream> = if req.is_https() {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| anyhow!("invalid server name '{host}'"))?;
            let connector = TlsConnector::from(self.tls.clone());
            let tls_stream = timeout(self.io_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| anyhow!("TLS handshake with {host} timed out"))?
                .with_context(|| format!("TLS handshake with {host} failed"))?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        let encoded = req.encode_origin_form()?;
        write_all_with_timeout(
            &mut stream,
            &encoded,
            self.io_timeout,
            "writing request to upstream",
        )
        .await?;
        if !req.body.is_empty() {
            write_all_with_timeout(
                &mut stream,
                &req.body,
                self.io_timeout,
                "writing request body to upstream",
            )
            .await?;
        }

        let mut reader = BufReader::new(stream);
        let head = read_response_head(
            &mut reader,
            self.io_timeout,
            self.max_header_size,
            "reading upstream response",
        )
        .await?;
        let plan = response_body_plan(&req.method, &head);

        Ok(HttpResponse {
            head,
            body: Body::stream(Box::new(reader), plan),
        })
    }
}
