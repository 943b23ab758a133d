use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::{
    Method, StatusCode,
    header::{IF_MODIFIED_SINCE, IF_NONE_MATCH},
};
use tracing::{info, warn};

use super::super::http::HttpResponse;
use super::super::request::ProxyRequest;
use super::{DiskCache, control, key, singleflight};
use crate::metrics;
use crate::settings::Settings;

/// The round-tripper contract: consume a fully-formed request, produce a
/// response or an error. Implemented by the upstream transport and by the
/// caching transport that wraps it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: &ProxyRequest) -> Result<HttpResponse>;
}

/// Serves GET requests from the disk cache, collapsing concurrent misses
/// for the same key into a single upstream fetch and revalidating stale
/// entries with conditional requests. Everything else bypasses to the
/// upstream transport untouched.
pub struct CachingTransport {
    cache: Arc<DiskCache>,
    upstream: Arc<dyn Transport>,
    settings: Arc<Settings>,
    inflight: singleflight::Inflight,
}

impl CachingTransport {
    pub fn new(cache: Arc<DiskCache>, upstream: Arc<dyn Transport>, settings: Arc<Settings>) -> Self {
        Self {
            cache,
            upstream,
            settings,
            inflight: singleflight::Inflight::new(),
        }
    }

    fn log_enabled(&self) -> bool {
        self.settings.enable_logging
    }

    /// Fetches from upstream while holding the singleflight slot, applies
    /// the cacheability gate, stores eligible responses and re-reads them
    /// from disk so the caller consumes the exact persisted bytes.
    async fn fetch_and_store(
        &self,
        req: &ProxyRequest,
        etag: Option<String>,
    ) -> Result<HttpResponse> {
        // Revalidation is the proxy's job: client conditionals must not
        // reach upstream, or a 304 would arrive with no entry to serve.
        let mut upstream_req = req.clone();
        upstream_req.headers.remove(IF_NONE_MATCH);
        upstream_req.headers.remove(IF_MODIFIED_SINCE);
        if let Some(etag) = etag
            && let Ok(value) = etag.parse()
        {
            upstream_req.headers.insert(IF_NONE_MATCH, value);
        }

        let resp = self.upstream.round_trip(&upstream_req).await?;
        let status = resp.head.status;

        if status != StatusCode::OK && status != StatusCode::NOT_MODIFIED {
            return Ok(resp);
        }

        if status == StatusCode::NOT_MODIFIED {
            // Revalidation succeeded: the entry is fresh again as of now.
            self.cache.touch_revalidated(req);
            let (cached, meta) = self
                .cache
                .get(req)
                .await?
                .context("revalidated cache entry disappeared")?;
            if self.log_enabled() {
                info!(
                    "cache MISS-UP: {} {} {}B",
                    req.method,
                    req.url(),
                    meta.size
                );
            }
            return Ok(cached);
        }

        if !self.settings.ignore_server_cache_control {
            let reasons = control::uncacheable_reasons(&resp.head);
            if !reasons.is_empty() {
                if self.log_enabled() {
                    info!(
                        "cache control ignore: {} {}: {:?}",
                        req.method,
                        req.url(),
                        reasons
                    );
                }
                return Ok(resp);
            }
        }

        let length = match resp.head.content_length {
            Some(length) => length,
            None => {
                if self.log_enabled() {
                    info!(
                        "response has no determinate length, not caching: {} {}",
                        req.method,
                        req.url()
                    );
                }
                return Ok(resp);
            }
        };
        let entry_max = self.settings.entry_max_size.as_u64();
        if entry_max > 0 && length > entry_max {
            if self.log_enabled() {
                info!(
                    "response TOO LARGE to cache: {} {} (Content-Length: {length}, limit: {entry_max})",
                    req.method,
                    req.url()
                );
            }
            return Ok(resp);
        }

        // Reserve the slot before consuming the body: if the cache is
        // unwritable we can still hand the live response to the client.
        let pending = match self.cache.begin_set(req).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, url = %req.url(), "cache set failed; serving live response");
                return Ok(resp);
            }
        };
        let HttpResponse { head, body } = resp;
        let size = pending
            .commit(&head, body)
            .await
            .context("failed to store upstream response")?;

        let (cached, _) = self
            .cache
            .get(req)
            .await?
            .context("freshly stored cache entry disappeared")?;
        if self.log_enabled() {
            info!("cache MISS: {} {} {}B", req.method, req.url(), size);
        }
        Ok(cached)
    }
}

#[async_trait]
impl Transport for CachingTransport {
    async fn round_trip(&self, req: &ProxyRequest) -> Result<HttpResponse> {
        if req.method != Method::GET {
            return self.upstream.round_trip(req).await;
        }
        let inflight_key = key::cache_key(&req.method, &req.url());

        loop {
            let mut revalidate_etag = None;
            if let Some((resp, meta)) = self.cache.get(req).await? {
                let ttl = self.settings.entry_ttl;
                let age = meta.modified.elapsed().unwrap_or_default();
                if ttl.is_zero() || age <= ttl {
                    if self.log_enabled() {
                        info!("cache HIT: {} {} {}B", req.method, req.url(), meta.size);
                    }
                    metrics::record_cache_request(true);
                    return Ok(resp.counted(true));
                }
                if self.log_enabled() {
                    info!(
                        "cache EXPIRED: {} (age {:?}, ttl {:?})",
                        req.url(),
                        age,
                        ttl
                    );
                }
                // Stale: carry the entity tag into a conditional request and
                // discard the stale body.
                revalidate_etag = resp.head.get("etag").map(|etag| etag.to_string());
            }

            match self.inflight.claim(&inflight_key) {
                singleflight::Claim::InFlight(rx) => {
                    singleflight::wait(rx).await;
                    continue;
                }
                singleflight::Claim::Acquired(slot) => {
                    let result = self.fetch_and_store(req, revalidate_etag).await;
                    drop(slot);
                    let resp = result?;
                    metrics::record_cache_request(false);
                    return Ok(resp.counted(false));
                }
            }
        }
    }
}
