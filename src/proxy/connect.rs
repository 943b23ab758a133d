use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, ensure};
use rustls::{crypto::ring, server::ServerConfig, sign::SingleCertAndKey};
use rustls::sign::CertifiedKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::io_util::write_all_with_timeout;

use super::{AppContext, server};

#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

pub fn parse_connect_target(target: &str) -> Result<ConnectTarget> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("CONNECT target '{target}' missing port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ensure!(!host.is_empty(), "CONNECT target '{target}' missing host");
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("CONNECT target '{target}' has invalid port"))?;
    ensure!(port != 0, "CONNECT target '{target}' has invalid port");
    Ok(ConnectTarget {
        host: host.to_string(),
        port,
    })
}

/// Acknowledges the CONNECT, terminates the client's TLS with a leaf minted
/// for the target host, and serves the decrypted requests.
pub async fn bump<S>(
    mut stream: S,
    peer: SocketAddr,
    target: ConnectTarget,
    app: AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    write_all_with_timeout(
        &mut stream,
        b"HTTP/1.1 200 Connection Established\r\n\r\n",
        app.settings.client_timeout,
        "acknowledging CONNECT",
    )
    .await?;

    let certified = app.tls.issuer.issue(&target.host)?;
    let acceptor = TlsAcceptor::from(build_server_config(certified)?);
    let tls_stream = acceptor
        .accept(stream)
        .await
        .context("TLS handshake with client failed during CONNECT bump")?;
    debug!(peer = %peer, host = %target.host, "bumped TLS session");

    server::serve_bumped(tls_stream, peer, app, (target.host, target.port)).await
}

fn build_server_config(certified: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>> {
    let provider = ring::default_provider();
    let builder = ServerConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?;
    let resolver = SingleCertAndKey::from(certified);
    let mut config = builder
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() -> Result<()> {
        let target = parse_connect_target("example.com:443")?;
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        Ok(())
    }

    #[test]
    fn parses_bracketed_ipv6() -> Result<()> {
        let target = parse_connect_target("[::1]:8443")?;
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8443);
        Ok(())
    }

    #[test]
    fn rejects_malformed_targets() {
        assert!(parse_connect_target("example.com").is_err());
        assert!(parse_connect_target(":443").is_err());
        assert!(parse_connect_target("example.com:notaport").is_err());
        assert!(parse_connect_target("example.com:0").is_err());
    }
}
