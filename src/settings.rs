use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, Environment};
use serde::{Deserialize, Deserializer, de};
use tracing::info;

fn default_listen_addr() -> String {
    ":8090".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_max_size() -> ByteSize {
    ByteSize(10 * (1 << 30))
}

fn default_entry_max_size() -> ByteSize {
    ByteSize(500 * (1 << 20))
}

fn default_entry_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_enable_logging() -> bool {
    true
}

fn default_client_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_upstream_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

/// A size in bytes, decoded from human-friendly strings such as `10GB`,
/// `500MB`, `1.5KB` or a bare number of bytes. Units are binary and
/// case-insensitive; `0` means unlimited wherever a limit is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub i64);

impl ByteSize {
    pub fn parse(value: &str) -> Result<Self> {
        let mut value = value.trim().to_ascii_uppercase();
        let multiplier: i64 = if let Some(stripped) = value.strip_suffix("GB") {
            value = stripped.to_string();
            1 << 30
        } else if let Some(stripped) = value.strip_suffix("MB") {
            value = stripped.to_string();
            1 << 20
        } else if let Some(stripped) = value.strip_suffix("KB") {
            value = stripped.to_string();
            1 << 10
        } else if let Some(stripped) = value.strip_suffix("B") {
            value = stripped.to_string();
            1
        } else {
            1
        };
        let magnitude: f64 = value
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid byte size '{value}'"))?;
        if magnitude < 0.0 {
            bail!("byte size must not be negative (got {magnitude})");
        }
        Ok(ByteSize((magnitude * multiplier as f64).round() as i64))
    }

    pub fn as_u64(&self) -> u64 {
        self.0.max(0) as u64
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes >= 1 << 30 && bytes % (1 << 30) == 0 {
            write!(f, "{}GB", bytes >> 30)
        } else if bytes >= 1 << 20 && bytes % (1 << 20) == 0 {
            write!(f, "{}MB", bytes >> 20)
        } else if bytes >= 1 << 10 && bytes % (1 << 10) == 0 {
            write!(f, "{}KB", bytes >> 10)
        } else {
            write!(f, "{bytes}B")
        }
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte size such as '10GB', '500MB' or a number of bytes")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ByteSize, E> {
                ByteSize::parse(value).map_err(de::Error::custom)
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<ByteSize, E> {
                if value < 0 {
                    return Err(de::Error::custom("byte size must not be negative"));
                }
                Ok(ByteSize(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(value as i64))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<ByteSize, E> {
                if value < 0.0 {
                    return Err(de::Error::custom("byte size must not be negative"));
                }
                Ok(ByteSize(value.round() as i64))
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Accepts humantime strings (`1h`, `30s`, `500ms`), the literal `0`, or a
/// bare integer interpreted as seconds.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl de::Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as '1h', '30s' or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            let trimmed = value.trim();
            if trimmed == "0" {
                return Ok(Duration::ZERO);
            }
            humantime::parse_duration(trimmed).map_err(de::Error::custom)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            if value < 0 {
                return Err(de::Error::custom("duration must not be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// Runtime configuration, populated exclusively from environment variables.
/// Missing variables use defaults; malformed values are fatal at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Total disk quota for the cache; 0 means unlimited.
    #[serde(default = "default_max_size")]
    pub max_size: ByteSize,
    /// Per-entry cap on cacheable responses; 0 means unlimited.
    #[serde(default = "default_entry_max_size")]
    pub entry_max_size: ByteSize,
    /// Freshness lifetime of a cache entry; 0 means entries never expire.
    #[serde(
        default = "default_entry_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub entry_ttl: Duration,
    /// Gates cache operation logs (hits, misses, evictions, skips).
    #[serde(default = "default_enable_logging")]
    pub enable_logging: bool,
    /// When set, any successful GET is cached regardless of Cache-Control.
    #[serde(default)]
    pub ignore_server_cache_control: bool,
    #[serde(
        default = "default_client_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub client_timeout: Duration,
    #[serde(
        default = "default_upstream_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub upstream_connect_timeout: Duration,
    #[serde(
        default = "default_upstream_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub upstream_timeout: Duration,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            cache_dir: default_cache_dir(),
            max_size: default_max_size(),
            entry_max_size: default_entry_max_size(),
            entry_ttl: default_entry_ttl(),
            enable_logging: default_enable_logging(),
            ignore_server_cache_control: false,
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            max_header_size: default_max_header_size(),
            max_request_body_size: default_max_request_body_size(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let cfg = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()
            .map_err(|err| anyhow::anyhow!(err))?;
        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolves `LISTEN_ADDR` in `[host]:port` form; an empty host binds all
    /// interfaces.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        let addr = self.listen_addr.trim();
        if let Ok(parsed) = addr.parse::<SocketAddr>() {
            return Ok(parsed);
        }
        if let Some(port) = addr.strip_prefix(':')
            && let Ok(port) = port.parse::<u16>()
        {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        }
        bail!("invalid listen address '{}'", self.listen_addr);
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_socket_addr()?;
        ensure!(
            self.max_size.0 >= 0,
            "MAX_SIZE must not be negative (got {})",
            self.max_size.0
        );
        ensure!(
            self.entry_max_size.0 >= 0,
            "ENTRY_MAX_SIZE must not be negative (got {})",
            self.entry_max_size.0
        );
        ensure!(
            !self.client_timeout.is_zero(),
            "CLIENT_TIMEOUT must be greater than zero"
        );
        ensure!(
            !self.upstream_connect_timeout.is_zero(),
            "UPSTREAM_CONNECT_TIMEOUT must be greater than zero"
        );
        ensure!(
            !self.upstream_timeout.is_zero(),
            "UPSTREAM_TIMEOUT must be greater than zero"
        );
        ensure!(
            self.max_header_size > 0,
            "MAX_HEADER_SIZE must be greater than zero"
        );
        ensure!(
            self.max_request_body_size > 0,
            "MAX_REQUEST_BODY_SIZE must be greater than zero"
        );
        Ok(())
    }

    pub fn log_summary(&self) {
        info!("config:");
        info!("  listen_addr: {}", self.listen_addr);
        info!("  cache_dir: {}", self.cache_dir.display());
        info!("  max_size: {}", self.max_size);
        info!("  entry_max_size: {}", self.entry_max_size);
        info!("  entry_ttl: {:?}", self.entry_ttl);
        info!("  enable_logging: {}", self.enable_logging);
        info!(
            "  ignore_server_cache_control: {}",
            self.ignore_server_cache_control
        );
    }
}
