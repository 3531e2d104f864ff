use std::io;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const CONTENT_TYPE_DISK: &str = "application/octet-stream";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Interim response sent before reading a body when the client asked for `Expect: 100-continue`.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A short plain-text response.
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        let mut body = message.into();
        body.push('\n');
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_TEXT))
            .with_body(Bytes::from(body))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Value of `Content-Length` as it will go on the wire.
    pub fn content_length(&self) -> u64 {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.body.len() as u64)
    }

    /// Serialize as an HTTP/1.1 response. The body is omitted for `HEAD` (`head_only`), but an
    /// explicit `Content-Length` is kept so it can describe the resource.
    pub async fn write_to<W>(&self, writer: &mut W, head_only: bool) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_str(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            if *name == CONTENT_LENGTH || *name == CONNECTION {
                continue;
            }
            push_header(&mut head, name.as_str().as_bytes(), value.as_bytes());
        }
        push_header(
            &mut head,
            b"content-length",
            self.content_length().to_string().as_bytes(),
        );
        push_header(&mut head, b"connection", b"close");
        head.extend_from_slice(b"\r\n");

        writer.write_all(&head).await?;
        if !head_only {
            writer.write_all(&self.body).await?;
        }
        writer.flush().await
    }
}

fn push_header(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    out.extend_from_slice(name);
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::ACCEPT_RANGES;

    async fn render(resp: &Response, head_only: bool) -> String {
        let mut out = Vec::new();
        resp.write_to(&mut out, head_only).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn writes_status_headers_and_body() {
        let resp = Response::text(StatusCode::OK, "ok");
        assert_eq!(
            render(&resp, false).await,
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: 3\r\nconnection: close\r\n\r\nok\n"
        );
    }

    #[tokio::test]
    async fn head_keeps_explicit_length_without_body() {
        let resp = Response::new(StatusCode::OK)
            .with_header(ACCEPT_RANGES, HeaderValue::from_static("bytes"))
            .with_header(CONTENT_LENGTH, HeaderValue::from(10_485_760u64));
        let out = render(&resp, true).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("accept-ranges: bytes\r\n"));
        assert!(out.contains("content-length: 10485760\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }
}
