//! Request head parsing on top of [`httparse`].
//!
//! Only the head is decoded. The proxy serves GETs, so a body (when a client
//! sends one anyway) is skipped by the connection loop using
//! [`Request::content_length`] and never handed to a route.

use thiserror::Error;

use super::{Headers, Method};

#[derive(Debug, Error)]
pub enum RequestError {
    /// The head has not fully arrived yet; read more and retry.
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A parsed request head.
///
/// The query string is dropped from the path; asset lookups ignore it.
///
/// ```
/// use rstash::http::request::Request;
///
/// let raw = b"GET /assets/index-3f2a.js?v=2 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, head_len) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/assets/index-3f2a.js");
/// assert_eq!(head_len, raw.len());
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    minor_version: u8,
    headers: Headers,
}

const MAX_HEADERS: usize = 64;

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, RequestError> {
    value.ok_or(RequestError::MissingField { field })
}

impl Request {
    /// Parses a request head from the front of `buf`.
    ///
    /// On success returns the request and the length of the head, which is
    /// where any body starts in `buf`.
    ///
    /// # Errors
    ///
    /// [`RequestError::Incomplete`] until the blank line ending the head has
    /// been received; [`RequestError::Parse`] or
    /// [`RequestError::MissingField`] for a malformed head.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut head = httparse::Request::new(&mut slots);

        let httparse::Status::Complete(head_len) = head.parse(buf)? else {
            return Err(RequestError::Incomplete);
        };

        let method = Method::from(required(head.method, "method")?);
        let target = required(head.path, "path")?;
        let minor_version = required(head.version, "version")?;

        let path = target.split_once('?').map_or(target, |(path, _)| path);

        let mut headers = Headers::with_capacity(head.headers.len());
        for field in head.headers.iter() {
            // Non-UTF-8 values are dropped; nothing the proxy reads needs them.
            if let Ok(value) = std::str::from_utf8(field.value) {
                headers.insert(field.name, value);
            }
        }

        let request = Self {
            method,
            path: path.to_owned(),
            minor_version,
            headers,
        };
        Ok((request, head_len))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> u8 {
        self.minor_version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// HTTP/1.1 stays open unless the client says `Connection: close`;
    /// HTTP/1.0 closes unless it asks for `keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.minor_version == 1,
        }
    }

    /// Declared body length, used to step over the body to the next request.
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .content_length()
            .and_then(|len| usize::try_from(len).ok())
    }
}
