use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use tokio::io::BufReader;
use tokio::task;
use tracing::{debug, info, warn};

pub mod control;
pub mod key;
pub mod singleflight;
pub mod transport;
mod writer;

use super::http::HttpResponse;
use super::http::body::{Body, BodyPlan};
use super::http::codec::read_response_head;
use super::request::ProxyRequest;
use crate::settings::Settings;

const ENTRY_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Filesystem-derived metadata of a cache entry: its size and the freshness
/// timestamp (mtime, bumped only on 304 revalidation).
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    pub size: u64,
    pub modified: SystemTime,
}

/// Disk-backed HTTP response store. One file per entry under
/// `<cache_dir>/<hostname>/<key[0..4]>/<key>`, each holding a complete
/// re-parseable HTTP response. All entry metadata lives in the filesystem:
/// length, mtime (freshness) and atime (recency for eviction).
pub struct DiskCache {
    settings: Arc<Settings>,
    curr_size: AtomicI64,
}

impl DiskCache {
    /// Creates the cache directory if missing and runs the crash-recovery
    /// sweep: stray `.tmp` files are deleted and the sizes of the remaining
    /// entries seed the in-memory size counter.
    pub async fn new(settings: Arc<Settings>) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.cache_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create cache directory {}",
                    settings.cache_dir.display()
                )
            })?;

        let root = settings.cache_dir.clone();
        let initial = task::spawn_blocking(move || sweep_cache_root(&root))
            .await
            .map_err(|err| anyhow!("cache sweep task failed: {err}"))?;

        debug!(bytes = initial, "cache startup sweep complete");
        Ok(Self {
            settings,
            curr_size: AtomicI64::new(initial as i64),
        })
    }

    pub fn curr_size(&self) -> i64 {
        self.curr_size.load(Ordering::Relaxed)
    }

    pub fn entry_path(&self, req: &ProxyRequest) -> PathBuf {
        let cache_key = key::cache_key(&req.method, &req.url());
        key::entry_path(&self.settings.cache_dir, req.hostname(), &cache_key)
    }

    /// Looks up the entry for a request. Absence is a clean miss; open or
    /// parse failures on a would-be hit are logged and degrade to a miss so
    /// the caller can re-fetch. Freshness is not evaluated here; the
    /// transport applies the TTL so it can attempt revalidation.
    pub async fn get(&self, req: &ProxyRequest) -> Result<Option<(HttpResponse, EntryMeta)>> {
        let path = self.entry_path(req);

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        // LRU touch: refresh atime, leave mtime alone.
        touch_accessed(&path);

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to open cache entry");
                return Ok(None);
            }
        };
        let mut reader = BufReader::new(file);
        let head = match read_response_head(
            &mut reader,
            ENTRY_READ_TIMEOUT,
            self.settings.max_header_size,
            "parsing cached response",
        )
        .await
        {
            Ok(head) => head,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to parse cache entry");
                return Ok(None);
            }
        };
        let length = match head.content_length {
            Some(length) => length,
            None => {
                warn!(path = %path.display(), "cache entry missing content length");
                return Ok(None);
            }
        };

        let plan = if length == 0 {
            BodyPlan::Empty
        } else {
            BodyPlan::Fixed(length)
        };
        // The body owns the file handle; one close releases both.
        let body = Body::stream(Box::new(reader), plan);
        Ok(Some((
            HttpResponse { head, body },
            EntryMeta {
                size: meta.len(),
                modified,
            },
        )))
    }

    /// Stores a response, consuming its body. Equivalent to
    /// `begin_set` + `commit`.
    pub async fn set(&self, req: &ProxyRequest, resp: HttpResponse) -> Result<()> {
        let pending = self.begin_set(req).await?;
        let HttpResponse { head, body } = resp;
        pending.commit(&head, body).await?;
        Ok(())
    }

    /// First phase of a store: creates parent directories and reserves the
    /// temp path. Fails without consuming anything, so the caller can still
    /// serve the live response when the cache is unwritable.
    pub async fn begin_set(&self, req: &ProxyRequest) -> Result<PendingEntry<'_>> {
        let path = self.entry_path(req);
        let tmp = key::tmp_path(&path);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("cache entry path has no parent"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
        Ok(PendingEntry {
            cache: self,
            path,
            tmp,
        })
    }

    /// Bumps the entry's mtime (and atime) to now after a successful 304
    /// revalidation. Best effort.
    pub fn touch_revalidated(&self, req: &ProxyRequest) {
        let path = self.entry_path(req);
        if let Ok(file) = fs::File::open(&path) {
            let now = SystemTime::now();
            let times = fs::FileTimes::new().set_accessed(now).set_modified(now);
            let _ = file.set_times(times);
        }
    }

    /// Removes the least-recently-used entry (strictly oldest atime; `.tmp`
    /// files are never candidates). Returns the freed bytes, or `None` when
    /// the cache root holds no entries. The walk is O(N) but runs only on
    /// the cold quota-exceeded path.
    pub fn evict_one(&self) -> Result<Option<u64>> {
        let mut oldest: Option<(PathBuf, u64, SystemTime)> = None;

        walk_files(&self.settings.cache_dir, &mut |path, meta| {
            if key::is_tmp_file(path) {
                return;
            }
            let atime = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let older = match &oldest {
                Some((_, _, oldest_atime)) => atime < *oldest_atime,
                None => true,
            };
            if older {
                oldest = Some((path.to_path_buf(), meta.len(), atime));
            }
        });

        let (path, size, _) = match oldest {
            Some(found) => found,
            None => return Ok(None),
        };

        fs::remove_file(&path)
            .with_context(|| format!("failed to evict cache entry {}", path.display()))?;
        if self.settings.enable_logging {
            info!("cache DELETE: {}", path.display());
        }
        Ok(Some(size))
    }

    fn add_size(&self, bytes: i64) {
        self.curr_size.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_size(&self, bytes: i64) {
        self.curr_size.fetch_sub(bytes, Ordering::Relaxed);
        if self.curr_size.load(Ordering::Relaxed) < 0 {
            self.curr_size.store(0, Ordering::Relaxed);
        }
    }
}

/// A reserved store slot: temp path created lazily, final rename on commit.
pub struct PendingEntry<'a> {
    cache: &'a DiskCache,
    path: PathBuf,
    tmp: PathBuf,
}

impl PendingEntry<'_> {
    /// Serializes the response to the temp file, evicts until the quota
    /// admits the new entry, then renames it into place and updates the
    /// size counter. Overwrites subtract the replaced entry's size first so
    /// the counter tracks actual disk usage.
    pub async fn commit(self, head: &super::http::codec::ResponseHead, body: Body) -> Result<i64> {
        let length = head
            .content_length
            .ok_or_else(|| anyhow!("refusing to store response without determinate length"))?;

        let mut reader = body
            .into_reader()
            .unwrap_or_else(|| Box::new(tokio::io::empty()));
        let size = writer::write_response_to_tmp(&self.tmp, head, &mut reader, length).await?;

        let max_size = self.cache.settings.max_size.as_u64() as i64;
        if max_size > 0 {
            while self.cache.curr_size() + size > max_size {
                match self.cache.evict_one() {
                    Ok(Some(freed)) => self.cache.sub_size(freed as i64),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "cache eviction failed");
                        break;
                    }
                }
            }
        }

        let old_size = tokio::fs::metadata(&self.path).await.map(|meta| meta.len());
        if let Err(err) = tokio::fs::rename(&self.tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&self.tmp).await;
            return Err(err).with_context(|| {
                format!("failed to publish cache entry {}", self.path.display())
            });
        }
        if let Ok(old_size) = old_size {
            self.cache.sub_size(old_size as i64);
        }
        self.cache.add_size(size);
        Ok(size)
    }
}

/// Best-effort atime refresh that leaves mtime untouched.
fn touch_accessed(path: &Path) {
    if let Ok(file) = fs::File::open(path) {
        let times = fs::FileTimes::new().set_accessed(SystemTime::now());
        let _ = file.set_times(times);
    }
}

/// Deletes stray `.tmp` files and returns the summed size of the surviving
/// entries. Walk errors are swallowed; recovery is best effort.
fn sweep_cache_root(root: &Path) -> u64 {
    let mut total = 0u64;
    walk_files(root, &mut |path, meta| {
        if key::is_tmp_file(path) {
            let _ = fs::remove_file(path);
        } else {
            total += meta.len();
        }
    });
    total
}

fn walk_files(dir: &Path, visit: &mut dyn FnMut(&Path, &fs::Metadata)) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk_files(&path, visit);
        } else if file_type.is_file()
            && let Ok(meta) = entry.metadata()
        {
            visit(&path, &meta);
        }
    }
}
