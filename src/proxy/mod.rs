//! The HTTP surface of the proxy.
//!
//! | Route                    | Response                                         |
//! |--------------------------|--------------------------------------------------|
//! | `GET /assets/:asset_id`  | cached bytes, origin `Content-Type`, `X-Cache`   |
//! | `GET /assets`            | 404, no upstream traffic                         |
//! | `GET /healthz`           | `{"status":"ok","entries":N}`                    |
//!
//! Cache failures map to status codes in [`error_response`].

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::cache::{AssetCache, CacheError, CacheStore, DiskStore, MemoryStore, StoreError};
use crate::config::{ConfigError, ProxyConfig};
use crate::context::Context;
use crate::middleware::AccessLog;
use crate::router::Router;
use crate::server::{Server, ServerError};
use crate::upstream::HttpFetcher;
use crate::{Request, Response, StatusCode};

/// Reasons the proxy fails to start or stops serving.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot open cache: {0}")]
    Store(#[from] StoreError),

    #[error("cannot build upstream client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Server(#[from] ServerError),
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    entries: usize,
}

/// Builds the route table around a shared cache.
pub fn routes(cache: Arc<AssetCache>) -> Router {
    let mut router = Router::new();
    router.layer(AccessLog);

    let assets = Arc::clone(&cache);
    router.get("/assets/:asset_id", move |ctx: Context| {
        let cache = Arc::clone(&assets);
        async move { serve_asset(&cache, ctx).await }
    });

    router.get("/assets", |_ctx: Context| async {
        Response::new(StatusCode::NotFound).body("asset identifier required")
    });

    router.get("/healthz", move |_ctx: Context| {
        let entries = cache.len();
        async move { health(entries) }
    });

    router
}

async fn serve_asset(cache: &AssetCache, ctx: Context) -> Response {
    let asset_id = ctx.param("asset_id").unwrap_or_default();

    match cache.get(asset_id).await {
        Ok(lookup) => Response::new(StatusCode::Ok)
            .header("Content-Type", lookup.entry.content_type())
            .header("X-Cache", lookup.status.as_header())
            .body_bytes(lookup.entry.content().clone()),
        Err(e) => error_response(&e),
    }
}

fn health(entries: usize) -> Response {
    let body = Health {
        status: "ok",
        entries,
    };
    match serde_json::to_vec(&body) {
        Ok(json) => Response::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .body_bytes(json),
        Err(e) => {
            error!(error = %e, "failed to encode health report");
            Response::new(StatusCode::InternalServerError)
        }
    }
}

/// Maps a cache failure to the response the client sees.
///
/// Unknown or malformed ids are 404. When every upstream attempt timed out
/// the answer is 504, any other upstream failure is 502.
pub fn error_response(err: &CacheError) -> Response {
    let status = match err {
        CacheError::NotFound(_) => StatusCode::NotFound,
        e if e.all_timed_out() => StatusCode::GatewayTimeout,
        CacheError::UpstreamUnavailable { .. } => StatusCode::BadGateway,
    };
    Response::new(status).body(err.to_string())
}

/// Assembles the cache from settings: disk-backed when `cache_dir` is set,
/// memory only otherwise.
pub async fn build_cache(config: &ProxyConfig) -> Result<AssetCache, ProxyError> {
    let candidates = config.candidates()?;

    let store: Arc<dyn CacheStore> = match &config.cache_dir {
        Some(dir) => {
            let disk = DiskStore::open(dir).await?;
            info!(dir = %disk.dir().display(), entries = disk.len(), "using disk cache");
            Arc::new(disk)
        }
        None => {
            info!("using in-memory cache");
            Arc::new(MemoryStore::new())
        }
    };

    let fetcher = HttpFetcher::new(config.fetch_timeout(), config.network_proxy.as_deref())?;

    info!(upstreams = ?candidates.origins(), "upstream candidates");
    Ok(AssetCache::new(store, Arc::new(fetcher), candidates))
}

/// Binds `config.bind` and serves until `shutdown` resolves.
pub async fn serve<S>(config: &ProxyConfig, shutdown: S) -> Result<(), ProxyError>
where
    S: Future<Output = ()>,
{
    let cache = build_cache(config).await?;
    let server = Server::bind(&config.bind).await?;
    serve_with(server, cache, shutdown).await
}

/// Serves the proxy routes on an already bound server.
pub async fn serve_with<S>(server: Server, cache: AssetCache, shutdown: S) -> Result<(), ProxyError>
where
    S: Future<Output = ()>,
{
    let router = Arc::new(routes(Arc::new(cache)));
    server
        .run_until(
            move |req: Request| {
                let router = Arc::clone(&router);
                async move { router.route(req).await }
            },
            shutdown,
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::upstream::UpstreamCandidates;
    use crate::upstream::testing::{Script, ScriptedFetcher};

    const ORIGIN_A: &str = "https://a.example";
    const ORIGIN_B: &str = "https://b.example";

    fn get(path: &str) -> Request {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn router_with(fetcher: Arc<ScriptedFetcher>) -> (Router, Arc<AssetCache>) {
        let candidates = UpstreamCandidates::new([ORIGIN_A, ORIGIN_B]).unwrap();
        let cache = Arc::new(AssetCache::new(
            Arc::new(MemoryStore::new()),
            fetcher,
            candidates,
        ));
        (routes(Arc::clone(&cache)), cache)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve(
            "https://a.example/assets/app.js",
            b"console.log(1)",
            "text/javascript",
        );
        let (router, cache) = router_with(Arc::clone(&fetcher));

        let first = router.route(get("/assets/app.js")).await;
        assert_eq!(first.status(), StatusCode::Ok);
        assert_eq!(first.headers().get("x-cache"), Some("MISS"));
        assert_eq!(first.headers().get("content-type"), Some("text/javascript"));
        assert_eq!(first.body_ref().as_ref(), b"console.log(1)");

        let second = router.route(get("/assets/app.js")).await;
        assert_eq!(second.headers().get("x-cache"), Some("HIT"));
        assert_eq!(second.body_ref(), first.body_ref());

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn missing_identifier_never_fetches() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let (router, _cache) = router_with(Arc::clone(&fetcher));

        for path in ["/assets", "/assets/", "/assets/a/b", "/assets/.."] {
            let res = router.route(get(path)).await;
            assert_eq!(res.status(), StatusCode::NotFound, "{path}");
        }
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn failing_upstreams_are_bad_gateway() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.script("https://a.example/assets/x.css", Script::Status(500));
        fetcher.script("https://b.example/assets/x.css", Script::Timeout);
        let (router, cache) = router_with(Arc::clone(&fetcher));

        let res = router.route(get("/assets/x.css")).await;
        assert_eq!(res.status(), StatusCode::BadGateway);
        assert!(!res.headers().contains("x-cache"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn all_timeouts_are_gateway_timeout() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.script("https://a.example/assets/x.css", Script::Timeout);
        fetcher.script("https://b.example/assets/x.css", Script::Timeout);
        let (router, _cache) = router_with(fetcher);

        let res = router.route(get("/assets/x.css")).await;
        assert_eq!(res.status(), StatusCode::GatewayTimeout);
    }

    #[tokio::test]
    async fn health_reports_entry_count() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve("https://b.example/assets/logo.png", b"\x89PNG", "image/png");
        let (router, _cache) = router_with(fetcher);

        let before = router.route(get("/healthz")).await;
        assert_eq!(before.status(), StatusCode::Ok);
        assert_eq!(before.headers().get("content-type"), Some("application/json"));
        let json: serde_json::Value = serde_json::from_slice(before.body_ref()).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "ok", "entries": 0 }));

        router.route(get("/assets/logo.png")).await;

        let after = router.route(get("/healthz")).await;
        let json: serde_json::Value = serde_json::from_slice(after.body_ref()).unwrap();
        assert_eq!(json["entries"], 1);
    }

    #[test]
    fn not_found_error_is_404() {
        let res = error_response(&CacheError::NotFound(String::new()));
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    async fn upstream_origin() -> String {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|req: Request| async move {
            match req.path() {
                "/assets/theme.css" => Response::new(StatusCode::Ok)
                    .header("Content-Type", "text/css")
                    .body("body{margin:0}"),
                _ => Response::new(StatusCode::NotFound),
            }
        }));
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn serves_through_real_sockets() {
        let origin = upstream_origin().await;
        let config = ProxyConfig {
            upstreams: vec![origin],
            fetch_timeout_secs: 5,
            ..ProxyConfig::default()
        };
        let cache = build_cache(&config).await.unwrap();

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", server.local_addr());
        let (stop, stopped) = oneshot::channel::<()>();
        let proxy = tokio::spawn(serve_with(server, cache, async move {
            let _ = stopped.await;
        }));

        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let first = client
            .get(format!("{base}/assets/theme.css"))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status().as_u16(), 200);
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert_eq!(first.headers()["content-type"], "text/css");
        assert_eq!(first.headers()["content-length"], "14");
        assert_eq!(first.bytes().await.unwrap().as_ref(), b"body{margin:0}");

        let second = client
            .get(format!("{base}/assets/theme.css"))
            .send()
            .await
            .unwrap();
        assert_eq!(second.headers()["x-cache"], "HIT");

        let missing = client
            .get(format!("{base}/assets/nope.css"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 502);

        stop.send(()).unwrap();
        proxy.await.unwrap().unwrap();
    }
}
