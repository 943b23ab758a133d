pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod tls;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::proxy::cache::DiskCache;
use crate::proxy::cache::transport::{CachingTransport, Transport};
use crate::proxy::upstream::UpstreamTransport;
use crate::proxy::{AppContext, TlsContext};
use crate::settings::Settings;
use crate::tls::ca::CertificateAuthority;
use crate::tls::issuer::TlsIssuer;

const LEAF_CACHE_CAPACITY: usize = 512;
const LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    settings.log_summary();

    // CA material lives in the working directory so clients can import it.
    let ca = Arc::new(CertificateAuthority::load_or_generate(Path::new("."))?);
    let issuer = Arc::new(TlsIssuer::new(ca, LEAF_CACHE_CAPACITY, LEAF_VALIDITY)?);

    let cache = Arc::new(DiskCache::new(settings.clone()).await?);
    let upstream: Arc<dyn Transport> = Arc::new(UpstreamTransport::new(&settings)?);
    let caching: Arc<dyn Transport> = Arc::new(CachingTransport::new(
        cache,
        upstream.clone(),
        settings.clone(),
    ));

    let app = AppContext {
        settings: settings.clone(),
        tls: Arc::new(TlsContext { issuer }),
        caching,
        passthrough: upstream,
    };

    let bind_addr = settings.listen_socket_addr()?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;

    tokio::select! {
        result = proxy::listener::serve(listener, app) => result,
        _ = shutdown_signal() => {
            info!("received shutdown signal; exiting");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
