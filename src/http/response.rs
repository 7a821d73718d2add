//! Responses and their HTTP/1.1 wire form.

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// A response under construction.
///
/// The body is [`Bytes`], so a cached asset is shared with every response
/// that serves it rather than copied.
///
/// ```
/// use rstash::http::{Response, StatusCode};
///
/// let wire = Response::new(StatusCode::Ok)
///     .header("Content-Type", "text/css")
///     .body("a{}")
///     .into_bytes();
///
/// let text = std::str::from_utf8(&wire).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 3\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Empty body, keep-alive.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Builder form of [`add_header`](Self::add_header).
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    /// Adds a header. `Content-Length` is dropped: it always comes from the body.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !name.eq_ignore_ascii_case("content-length") {
            self.headers.insert(name, value);
        }
    }

    #[must_use]
    pub fn body(self, text: impl Into<String>) -> Self {
        self.body_bytes(text.into())
    }

    #[must_use]
    pub fn body_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = bytes.into();
        self
    }

    /// Selects `Connection: keep-alive` or `Connection: close`.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Headers set by handlers; framing headers are only added by
    /// [`into_bytes`](Self::into_bytes).
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    /// Encodes status line, headers and body.
    ///
    /// A non-empty body without a `Content-Type` is sent as plain text.
    /// `Connection` follows [`keep_alive`](Self::keep_alive) and
    /// `Content-Length` is written last.
    pub fn into_bytes(self) -> BytesMut {
        let mut head = format!("HTTP/1.1 {}\r\n", self.status);

        for (name, value) in self.headers.iter() {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        if !self.body.is_empty() && !self.headers.contains("content-type") {
            let _ = write!(head, "Content-Type: {TEXT_PLAIN}\r\n");
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        let _ = write!(
            head,
            "Connection: {connection}\r\nContent-Length: {}\r\n\r\n",
            self.body.len()
        );

        let mut wire = BytesMut::with_capacity(head.len() + self.body.len());
        wire.put(head.as_bytes());
        wire.put(self.body);
        wire
    }
}
