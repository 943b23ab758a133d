use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use gitmproxy::proxy::cache::DiskCache;
use gitmproxy::proxy::cache::transport::{CachingTransport, Transport};
use gitmproxy::proxy::upstream::UpstreamTransport;
use gitmproxy::proxy::{AppContext, TlsContext, listener};
use gitmproxy::settings::{ByteSize, Settings};
use gitmproxy::tls::ca::CertificateAuthority;
use gitmproxy::tls::issuer::TlsIssuer;

/// A full proxy stack bound to an ephemeral port, with cache and CA
/// directories under a per-test tempdir.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub ca: Arc<CertificateAuthority>,
    pub cache_dir: PathBuf,
    handle: JoinHandle<()>,
    _dirs: TempDir,
}

impl ProxyHarness {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(adjust: impl FnOnce(&mut Settings)) -> Result<Self> {
        let dirs = TempDir::new()?;
        let cache_dir = dirs.path().join("cache");
        let mut settings = Settings {
            cache_dir: cache_dir.clone(),
            max_size: ByteSize(0),
            entry_max_size: ByteSize(0),
            enable_logging: false,
            ..Settings::default()
        };
        adjust(&mut settings);
        let settings = Arc::new(settings);

        let ca = Arc::new(CertificateAuthority::load_or_generate(
            dirs.path().join("ca"),
        )?);
        let issuer = Arc::new(TlsIssuer::new(ca.clone(), 64, Duration::from_secs(3600))?);
        let cache = Arc::new(DiskCache::new(settings.clone()).await?);
        let upstream: Arc<dyn Transport> = Arc::new(UpstreamTransport::new(&settings)?);
        let caching: Arc<dyn Transport> = Arc::new(CachingTransport::new(
            cache,
            upstream.clone(),
            settings.clone(),
        ));
        let app = AppContext {
            settings,
            tls: Arc::new(TlsContext { issuer }),
            caching,
            passthrough: upstream,
        };

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = listener::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            ca,
            cache_dir,
            handle,
            _dirs: dirs,
        })
    }

    /// Number of entry files currently under the cache root.
    pub fn cache_file_count(&self) -> usize {
        fn walk(dir: &std::path::Path, count: &mut usize) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    walk(&entry.path(), count);
                } else if file_type.is_file() {
                    *count += 1;
                }
            }
        }
        let mut count = 0;
        walk(&self.cache_dir, &mut count);
        count
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
