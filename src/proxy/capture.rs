use http::StatusCode;

use super::http::HttpResponse;
use super::http::body::Body;
use super::http::codec::{HeaderLine, ResponseHead};

/// Minimal server-side writer: collects headers and body bytes in memory
/// and turns them into a synthetic HTTP/1.1 response. Used to serve the
/// metrics page without routing it through a real socket handler.
pub struct ResponseCapture {
    headers: Vec<HeaderLine>,
    buffer: Vec<u8>,
    status: StatusCode,
}

impl Default for ResponseCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCapture {
    pub fn new() -> Self {
        Self {
            headers: Vec::new(),
            buffer: Vec::new(),
            status: StatusCode::OK,
        }
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.push(HeaderLine::new(name, value));
    }

    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.buffer.extend_from_slice(bytes);
        bytes.len()
    }

    pub fn into_response(self) -> HttpResponse {
        let content_length = Some(self.buffer.len() as u64);
        let head = ResponseHead::new(self.status, self.headers, content_length);
        HttpResponse {
            head,
            body: Body::bytes(self.buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn captures_status_headers_and_body() -> anyhow::Result<()> {
        let mut capture = ResponseCapture::new();
        capture.set_header("Content-Type", "text/plain");
        capture.write(b"hello ");
        capture.write(b"world");

        let resp = capture.into_response();
        assert_eq!(resp.head.status, StatusCode::OK);
        assert_eq!(resp.head.get("content-type"), Some("text/plain"));
        assert_eq!(resp.head.content_length, Some(11));

        let mut sink = Vec::new();
        resp.body
            .write_to(&mut sink, Duration::from_secs(1), "reading captured body")
            .await?;
        assert_eq!(sink, b"hello world");
        Ok(())
    }

    #[test]
    fn status_defaults_to_ok_and_can_be_overridden() {
        let capture = ResponseCapture::new();
        assert_eq!(capture.into_response().head.status, StatusCode::OK);

        let mut capture = ResponseCapture::new();
        capture.set_status(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            capture.into_response().head.status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
