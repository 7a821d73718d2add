//! Tokio accept loop speaking HTTP/1.1.
//!
//! One task per connection. Connections stay open across requests
//! (including pipelined ones) until the client closes or opts out with
//! `Connection: close`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::StatusCode;
use crate::http::request::{Request, RequestError};
use crate::http::response::Response;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Requests are GETs; a head bigger than this is refused with 413.
const MAX_REQUEST_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// A bound listener that feeds HTTP/1.1 requests to a handler.
///
/// ```rust,no_run
/// use rstash::server::Server;
/// use rstash::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:0").await?;
///     server
///         .run_until(
///             |_req: Request| async { Response::new(StatusCode::NoContent) },
///             async { let _ = tokio::signal::ctrl_c().await; },
///         )
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds `addr`; port `0` picks a free port (see [`local_addr`](Self::local_addr)).
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] naming the address when the bind fails.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                return Err(ServerError::Bind {
                    addr: addr.to_owned(),
                    source,
                });
            }
        };
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// [`run_until`](Self::run_until) with a shutdown that never comes.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running on their own tasks after
    /// that. Accept errors are logged and the loop carries on.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "rstash listening");

        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "shutdown requested, no longer accepting");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer, "connection accepted");
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer, handler.as_ref()).await {
                    warn!(peer = %peer, error = %e, "connection closed with error");
                }
            });
        }
    }
}

// What the read side produced next.
enum Frame {
    // A complete request occupying `len` bytes of the buffer, head and body.
    Request { request: Request, len: usize },
    // The client sent something we will not serve; answer and hang up.
    Reject(Response),
    Closed,
}

fn too_large() -> Frame {
    Frame::Reject(Response::new(StatusCode::PayloadTooLarge).body("Request entity too large"))
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut, peer: SocketAddr) -> io::Result<Frame> {
    loop {
        // A pipelined request may already be buffered; only read when short.
        if !buf.is_empty() {
            match Request::parse(&buf[..]) {
                Ok((request, head_len)) => {
                    let body_len = request.content_length().unwrap_or(0);
                    let Some(len) = head_len
                        .checked_add(body_len)
                        .filter(|&len| len <= MAX_REQUEST_SIZE)
                    else {
                        warn!(peer = %peer, body_len, "declared body too large, sending 413");
                        return Ok(too_large());
                    };
                    if buf.len() >= len {
                        return Ok(Frame::Request { request, len });
                    }
                }
                Err(RequestError::Incomplete) => {}
                Err(e) => {
                    warn!(peer = %peer, error = %e, "bad request, sending 400");
                    return Ok(Frame::Reject(
                        Response::new(StatusCode::BadRequest).body(format!("Bad Request: {e}")),
                    ));
                }
            }

            if buf.len() > MAX_REQUEST_SIZE {
                warn!(peer = %peer, "request too large, sending 413");
                return Ok(too_large());
            }
        }

        buf.reserve(READ_CHUNK);
        if stream.read_buf(buf).await? == 0 {
            if !buf.is_empty() {
                debug!(peer = %peer, "peer closed mid-request");
            }
            return Ok(Frame::Closed);
        }
    }
}

async fn serve_connection<H, F>(mut stream: TcpStream, peer: SocketAddr, handler: &H) -> io::Result<()>
where
    H: Fn(Request) -> F,
    F: Future<Output = Response>,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        let (request, len) = match read_frame(&mut stream, &mut buf, peer).await? {
            Frame::Request { request, len } => (request, len),
            Frame::Reject(response) => {
                stream.write_all(&response.keep_alive(false).into_bytes()).await?;
                return Ok(());
            }
            Frame::Closed => {
                debug!(peer = %peer, "connection closed by peer");
                return Ok(());
            }
        };

        let keep_alive = request.is_keep_alive();
        debug!(
            peer = %peer,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request).await.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;
        buf.advance(len);

        if !keep_alive {
            debug!(peer = %peer, "Connection: close, shutting down");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    async fn roundtrip(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(server.run_until(
            |req: Request| async move {
                Response::new(StatusCode::Ok).body(req.path().to_owned())
            },
            async move {
                let _ = rx.await;
            },
        ));

        let reply = roundtrip(addr, b"GET /assets/a.js HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
        assert!(reply.ends_with("/assets/a.js"));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|_req: Request| async { Response::new(StatusCode::Ok) }));

        let reply = roundtrip(addr, b"GET /\x01 HTTP/1.1\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn oversized_content_length_gets_413() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|_req: Request| async { Response::new(StatusCode::Ok) }));

        let huge = roundtrip(
            addr,
            b"GET /healthz HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n",
        )
        .await;
        assert!(huge.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{huge}");
        assert!(huge.contains("Connection: close\r\n"));

        let over_limit = format!(
            "GET /healthz HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_REQUEST_SIZE
        );
        let reply = roundtrip(addr, over_limit.as_bytes()).await;
        assert!(reply.starts_with("HTTP/1.1 413 "), "{reply}");
    }

    #[tokio::test]
    async fn pipelined_requests_are_both_answered() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|req: Request| async move {
            Response::new(StatusCode::Ok).body(req.path().to_owned())
        }));

        let reply = roundtrip(
            addr,
            b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(reply.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(reply.ends_with("/two"));
    }

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let err = Server::bind("not-an-address").await.err().unwrap();
        assert!(err.to_string().contains("not-an-address"));
    }
}
