//! Upstream origins and the HTTP client used to reach them.
//!
//! - [`UpstreamCandidates`]: ordered list of origin base URLs.
//! - [`Fetch`]: one GET against one URL; the seam the cache talks to.
//! - [`HttpFetcher`]: the reqwest-backed [`Fetch`] used in production.
//! - [`fetch_first`]: walk the candidates until one answers.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, warn};

/// Path prefix shared by the proxy and every upstream origin.
pub const ASSET_PREFIX: &str = "/assets";

/// Why a single candidate did not produce the asset.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read body from {url}: {message}")]
    Body { url: String, message: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    fn from_reqwest(url: &str, err: &reqwest::Error, reading_body: bool) -> Self {
        let url = url.to_owned();
        if err.is_timeout() {
            Self::Timeout { url }
        } else if reading_body {
            Self::Body {
                url,
                message: err.to_string(),
            }
        } else {
            Self::Network {
                url,
                message: err.to_string(),
            }
        }
    }
}

/// A successful upstream answer, headers as the origin sent them.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// Boxed future returned by [`Fetch::fetch`].
pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UpstreamResponse, FetchError>> + Send + 'a>>;

/// Performs a single GET. Implementations must treat any non-2xx status as an error.
pub trait Fetch: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a>;
}

/// Ordered origins to try for every miss. Never empty.
///
/// # Examples
///
/// ```
/// use rstash::upstream::UpstreamCandidates;
///
/// let candidates = UpstreamCandidates::new(["https://a.example/", "https://b.example"])
///     .unwrap()
///     .with_preferred("https://b.example");
/// assert_eq!(candidates.origins(), ["https://b.example", "https://a.example"]);
/// assert_eq!(
///     candidates.asset_url("https://a.example", "logo.png"),
///     "https://a.example/assets/logo.png"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCandidates {
    origins: Vec<String>,
}

impl UpstreamCandidates {
    /// Builds the list, dropping trailing slashes and blank entries.
    /// Returns `None` if nothing is left.
    pub fn new<I, S>(origins: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let origins: Vec<String> = origins
            .into_iter()
            .map(|o| o.as_ref().trim().trim_end_matches('/').to_owned())
            .filter(|o| !o.is_empty())
            .collect();
        (!origins.is_empty()).then_some(Self { origins })
    }

    /// Moves `preferred` to the front if it is one of the origins.
    #[must_use]
    pub fn with_preferred(mut self, preferred: &str) -> Self {
        let preferred = preferred.trim().trim_end_matches('/');
        if let Some(pos) = self.origins.iter().position(|o| o == preferred) {
            let origin = self.origins.remove(pos);
            self.origins.insert(0, origin);
        }
        self
    }

    pub fn origins(&self) -> &[String] {
        &self.origins
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// URL of `asset_id` on `origin`, mirroring the proxy's own layout.
    pub fn asset_url(&self, origin: &str, asset_id: &str) -> String {
        format!("{origin}{ASSET_PREFIX}/{asset_id}")
    }
}

/// Tries every candidate in order and returns the first success with the
/// origin that served it, or every failure in candidate order.
pub async fn fetch_first(
    fetcher: &dyn Fetch,
    candidates: &UpstreamCandidates,
    asset_id: &str,
) -> Result<(String, UpstreamResponse), Vec<FetchError>> {
    let mut failures = Vec::with_capacity(candidates.len());

    for origin in candidates.origins() {
        let url = candidates.asset_url(origin, asset_id);
        debug!(url = %url, "fetching from upstream");

        match fetcher.fetch(&url).await {
            Ok(response) => return Ok((origin.clone(), response)),
            Err(e) => {
                warn!(url = %url, error = %e, "upstream candidate failed");
                failures.push(e);
            }
        }
    }

    Err(failures)
}

/// Production [`Fetch`] backed by a pooled reqwest client.
///
/// The client never asks for compressed encodings, so the bytes received are
/// exactly the bytes the origin stores. Outbound traffic goes through
/// `network_proxy` when one is configured and never through proxies picked up
/// from the environment.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// # Arguments
    ///
    /// * `timeout` - limit for a whole request; connecting gets at most 5s of it.
    /// * `network_proxy` - `http://` or `https://` URL every
    ///   request is sent through, or `None` for direct connections.
    ///
    /// # Errors
    ///
    /// Fails if `network_proxy` is not a valid proxy URL or the TLS backend
    /// cannot be initialised.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use rstash::upstream::HttpFetcher;
    ///
    /// assert!(HttpFetcher::new(Duration::from_secs(10), None).is_ok());
    /// assert!(HttpFetcher::new(Duration::from_secs(10), Some("http://10.0.0.1:3128")).is_ok());
    /// assert!(HttpFetcher::new(Duration::from_secs(10), Some("ftp://10.0.0.1:21")).is_err());
    /// ```
    pub fn new(timeout: Duration, network_proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("rstash/", env!("CARGO_PKG_VERSION")));

        let builder = match network_proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };

        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl Fetch for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| FetchError::from_reqwest(url, &e, false))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_owned(),
                    status: status.as_u16(),
                });
            }

            let headers = response.headers();
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let content_length = headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());

            let body = response
                .bytes()
                .await
                .map_err(|e| FetchError::from_reqwest(url, &e, true))?;

            debug!(url = %url, bytes = body.len(), "upstream answered");

            Ok(UpstreamResponse {
                body,
                content_type,
                content_length,
            })
        })
    }
}
