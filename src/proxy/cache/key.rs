use std::path::{Path, PathBuf};

use http::Method;

/// Computes the cache key for a request: the hex digest of a 128-bit hash
/// over the method octets followed by the full URL, with no delimiter.
/// Headers never participate, so identical method+URL pairs always map to
/// the same entry.
pub fn cache_key(method: &Method, url: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(url.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex[..32].to_string()
}

/// `<root>/<hostname>/<key[0..4]>/<key>`; the 4-hex subdirectory caps the
/// per-directory entry count.
pub fn entry_path(root: &Path, hostname: &str, key: &str) -> PathBuf {
    root.join(hostname).join(&key[..4]).join(key)
}

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

pub fn is_tmp_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_per_method_and_url() {
        let a = cache_key(&Method::GET, "http://example.com/a");
        let b = cache_key(&Method::GET, "http://example.com/a");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn key_varies_with_method_and_url() {
        let base = cache_key(&Method::GET, "http://example.com/a");
        assert_ne!(base, cache_key(&Method::HEAD, "http://example.com/a"));
        assert_ne!(base, cache_key(&Method::GET, "http://example.com/b"));
        assert_ne!(base, cache_key(&Method::GET, "https://example.com/a"));
        assert_ne!(base, cache_key(&Method::GET, "http://example.com:8080/a"));
    }

    #[test]
    fn entry_path_fans_out_by_key_prefix() {
        let key = cache_key(&Method::GET, "http://example.com/a");
        let path = entry_path(Path::new("/var/cache"), "example.com", &key);
        let expected: PathBuf = [
            "/var/cache",
            "example.com",
            &key[..4],
            &key,
        ]
        .iter()
        .collect();
        assert_eq!(path, expected);
    }

    #[test]
    fn tmp_path_appends_suffix() {
        let path = Path::new("/var/cache/example.com/abcd/abcdef");
        let tmp = tmp_path(path);
        assert_eq!(
            tmp,
            Path::new("/var/cache/example.com/abcd/abcdef.tmp")
        );
        assert!(is_tmp_file(&tmp));
        assert!(!is_tmp_file(path));
    }
}
