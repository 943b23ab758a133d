use anyhow::{Result, anyhow, ensure};
use http::{HeaderMap, Method, Uri};

/// An intercepted client request, rewritten to carry the absolute upstream
/// URL regardless of how it arrived (plain absolute-form or bumped TLS
/// origin-form).
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Vec<u8>) -> Result<Self> {
        ensure!(uri.scheme_str().is_some(), "request URI must be absolute");
        ensure!(uri.host().is_some(), "request URI must carry a host");
        Ok(Self {
            method,
            uri,
            headers,
            body,
        })
    }

    /// The full URL as key material: scheme, host, port, path, query,
    /// exactly as the URI renders.
    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    /// Host without the port.
    pub fn hostname(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    pub fn is_https(&self) -> bool {
        self.uri.scheme_str() == Some("https")
    }

    pub fn port(&self) -> u16 {
        self.uri
            .port_u16()
            .unwrap_or(if self.is_https() { 443 } else { 80 })
    }

    /// Encodes the request head in origin form for the upstream connection.
    /// Hop-by-hop headers were already dropped at parse time; the proxy
    /// opens one upstream connection per request, hence `Connection: close`.
    pub fn encode_origin_form(&self) -> Result<Vec<u8>> {
        let authority = self
            .uri
            .authority()
            .ok_or_else(|| anyhow!("request URI missing authority"))?;
        let path = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(self.method.as_str().as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(path.as_bytes());
        buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        buffer.extend_from_slice(authority.as_str().as_bytes());
        buffer.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            buffer.extend_from_slice(name.as_str().as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        if !self.body.is_empty() {
            buffer.extend_from_slice(b"Content-Length: ");
            buffer.extend_from_slice(self.body.len().to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        buffer.extend_from_slice(b"Connection: close\r\n\r\n");
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> ProxyRequest {
        ProxyRequest::new(
            Method::GET,
            uri.parse().expect("test uri"),
            HeaderMap::new(),
            Vec::new(),
        )
        .expect("test request")
    }

    #[test]
    fn derives_host_and_port() {
        let req = request("http://example.com/a");
        assert_eq!(req.hostname(), "example.com");
        assert_eq!(req.port(), 80);
        assert!(!req.is_https());

        let req = request("https://example.com:8443/a");
        assert_eq!(req.port(), 8443);
        assert!(req.is_https());
    }

    #[test]
    fn rejects_relative_uris() {
        let uri: Uri = "/relative".parse().expect("uri");
        assert!(ProxyRequest::new(Method::GET, uri, HeaderMap::new(), Vec::new()).is_err());
    }

    #[test]
    fn encodes_origin_form_with_host_and_close() -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "*/*".parse().expect("value"));
        let req = ProxyRequest::new(
            Method::GET,
            "http://example.com:8080/path?q=1".parse().expect("uri"),
            headers,
            Vec::new(),
        )?;
        let encoded = String::from_utf8(req.encode_origin_form()?)?;
        assert!(encoded.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(encoded.contains("Host: example.com:8080\r\n"));
        assert!(encoded.contains("accept: */*\r\n"));
        assert!(encoded.ends_with("Connection: close\r\n\r\n"));
        Ok(())
    }

    #[test]
    fn encodes_content_length_for_bodies() -> Result<()> {
        let req = ProxyRequest::new(
            Method::POST,
            "http://example.com/submit".parse().expect("uri"),
            HeaderMap::new(),
            b"payload".to_vec(),
        )?;
        let encoded = String::from_utf8(req.encode_origin_form()?)?;
        assert!(encoded.contains("Content-Length: 7\r\n"));
        Ok(())
    }
}
