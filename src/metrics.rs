use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "gitmproxy_http_requests_total",
        "The total number of received requests.",
    );
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register gitmproxy_http_requests_total");
    vec
});

static CACHE_REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gitmproxy_cache_requests_total",
        "The total number of GET requests handled by the cache transport.",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register gitmproxy_cache_requests_total");
    counter
});

static CACHE_REQUESTS_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gitmproxy_cache_requests_hits_total",
        "The total number of requests served from the cache.",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register gitmproxy_cache_requests_hits_total");
    counter
});

static CACHE_REQUESTS_MISS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gitmproxy_cache_requests_miss_total",
        "The total number of requests that required an upstream fetch.",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register gitmproxy_cache_requests_miss_total");
    counter
});

static CACHE_REQUESTS_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gitmproxy_cache_requests_bytes",
        "Bytes streamed to clients by the cache transport.",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register gitmproxy_cache_requests_bytes");
    counter
});

static CACHE_REQUESTS_HIT_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gitmproxy_cache_requests_hit_bytes",
        "Bytes streamed to clients from cache hits.",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register gitmproxy_cache_requests_hit_bytes");
    counter
});

static CACHE_REQUESTS_MISS_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gitmproxy_cache_requests_miss_bytes",
        "Bytes streamed to clients from cache misses.",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register gitmproxy_cache_requests_miss_bytes");
    counter
});

/// Records a request accepted by the dispatcher, labeled by method.
pub fn record_http_request(method: &str) {
    HTTP_REQUESTS_TOTAL.with_label_values(&[method]).inc();
}

/// Records a GET request that reached the cache transport, partitioned into
/// hit or miss.
pub fn record_cache_request(hit: bool) {
    CACHE_REQUESTS_TOTAL.inc();
    if hit {
        CACHE_REQUESTS_HITS_TOTAL.inc();
    } else {
        CACHE_REQUESTS_MISS_TOTAL.inc();
    }
}

/// Records bytes actually delivered to a client, measured at read time.
pub fn record_transfer(bytes: u64, hit: bool) {
    if bytes == 0 {
        return;
    }
    CACHE_REQUESTS_BYTES.inc_by(bytes);
    if hit {
        CACHE_REQUESTS_HIT_BYTES.inc_by(bytes);
    } else {
        CACHE_REQUESTS_MISS_BYTES.inc_by(bytes);
    }
}

// Counters register on first use; force them all so the exposition is
// complete even before any traffic has been counted.
fn ensure_registered() {
    Lazy::force(&HTTP_REQUESTS_TOTAL);
    Lazy::force(&CACHE_REQUESTS_TOTAL);
    Lazy::force(&CACHE_REQUESTS_HITS_TOTAL);
    Lazy::force(&CACHE_REQUESTS_MISS_TOTAL);
    Lazy::force(&CACHE_REQUESTS_BYTES);
    Lazy::force(&CACHE_REQUESTS_HIT_BYTES);
    Lazy::force(&CACHE_REQUESTS_MISS_BYTES);
}

/// Renders the registry in the Prometheus text format.
pub fn gather() -> Vec<u8> {
    ensure_registered();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

pub fn text_format_type() -> &'static str {
    "text/plain; version=0.0.4"
}
