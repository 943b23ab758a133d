pub mod body;
pub mod codec;

use http::StatusCode;

use self::body::{Body, BodyPlan};
use self::codec::{HeaderLine, ResponseHead};

/// A full HTTP response: parsed head plus a body source.
#[derive(Debug)]
pub struct HttpResponse {
    pub head: ResponseHead,
    pub body: Body,
}

impl HttpResponse {
    /// Builds a locally generated response with an optional text body.
    pub fn synthetic(status: StatusCode, body: Vec<u8>) -> Self {
        let mut headers = Vec::new();
        if !body.is_empty() {
            headers.push(HeaderLine::new("Content-Type", "text/plain; charset=utf-8"));
        }
        let content_length = Some(body.len() as u64);
        let head = ResponseHead::new(status, headers, content_length);
        Self {
            head,
            body: Body::bytes(body),
        }
    }

    pub fn counted(self, hit: bool) -> Self {
        Self {
            head: self.head,
            body: self.body.counted(hit),
        }
    }

    pub fn body_plan(&self) -> BodyPlan {
        self.body.plan()
    }
}
