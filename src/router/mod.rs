//! Request routing: URL patterns and HTTP methods mapped to handlers.
//!
//! [`Router`] dispatches requests by method and path. Two pattern styles are
//! supported:
//!
//! | Pattern              | Example match              | Captured params   |
//! |----------------------|----------------------------|-------------------|
//! | `/healthz`           | `/healthz`                 | *(none)*          |
//! | `/assets/:asset_id`  | `/assets/app-91c2.js`      | `asset_id → "app-91c2.js"` |
//!
//! Trailing slashes are normalized on both patterns and incoming paths. A
//! parameter only matches a non-empty segment, so `/assets/` never reaches
//! the `/assets/:asset_id` handler.
//!
//! Routes are matched in registration order; the first match wins. Matched
//! requests run through the router's middleware stack before the handler.

use std::pin::Pin;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::{Method, Request, Response, StatusCode};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait via the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    // Matches one exact path string, e.g. `/healthz`.
    Exact(String),
    // Matches a fixed number of segments where some may be named captures.
    Parameterized { segments: Vec<Segment> },
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl Pattern {
    /// Compile a pattern string. Anything containing `:` is parameterized.
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_string()),
                    None => Segment::Static(s.to_string()),
                })
                .collect();

            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_string())
    }

    // Try to match `path` against this pattern, returning extracted [`PathParams`] on success.
    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(PathParams::new),
            Pattern::Parameterized { segments } => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => params.insert(name.clone(), path_seg),
                    }
                }

                Some(params)
            }
        }
    }
}

// A single registered route binding a method + pattern to a handler.
struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    // Returns `Some(params)` when both the HTTP method and path pattern match, `None` otherwise.
    fn matches(&self, method: &Method, path: &str) -> Option<PathParams> {
        if &self.method == method {
            self.pattern.matches(path)
        } else {
            None
        }
    }
}

/// HTTP request router.
///
/// When no route matches, a `404 Not Found` response is returned without
/// running the middleware stack.
///
/// # Examples
///
/// ```rust,no_run
/// use rstash::{Router, Response, StatusCode};
/// use rstash::context::Context;
/// use rstash::middleware::AccessLog;
///
/// let mut router = Router::new();
/// router.layer(AccessLog);
/// router.get("/assets/:asset_id", |ctx: Context| async move {
///     let id = ctx.param("asset_id").unwrap_or_default().to_owned();
///     Response::new(StatusCode::Ok).body(id)
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    // Shared with every request's `Next`; rebuilt only by `layer`.
    middlewares: Arc<[MiddlewareHandler]>,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `GET` requests matching `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    /// Append a middleware to the stack. The first one added runs outermost.
    pub fn layer(&mut self, middleware: impl Middleware + 'static) {
        let mut stack = self.middlewares.to_vec();
        stack.push(from_middleware(Arc::new(middleware)));
        self.middlewares = stack.into();
    }

    // Erase the concrete handler type and store it as a `Handler` trait object.
    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx: Context| handler.call(ctx));
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch `request` to the first matching route and return its response.
    pub async fn route(&self, request: Request) -> Response {
        let matched = self
            .routes
            .iter()
            .find_map(|route| Some((route, route.matches(request.method(), request.path())?)));

        let Some((route, params)) = matched else {
            return Response::new(StatusCode::NotFound);
        };

        let ctx = Context::with_params(request, params);
        Next::new(Arc::clone(&self.middlewares), Arc::clone(&route.handler))
            .run(ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    fn make_request(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    fn echo_router() -> Router {
        let mut router = Router::new();
        router.get("/assets/:asset_id", |ctx: Context| async move {
            let id = ctx.param("asset_id").unwrap_or("").to_owned();
            Response::new(StatusCode::Ok).body(id)
        });
        router.get("/healthz", |_ctx: Context| async { Response::new(StatusCode::NoContent) });
        router
    }

    #[test]
    fn parameter_requires_a_segment() {
        let pat = Pattern::parse("/assets/:asset_id");
        assert!(pat.matches("/assets").is_none());
        assert!(pat.matches("/assets/").is_none());
        assert!(pat.matches("/assets//").is_none());
        assert_eq!(
            pat.matches("/assets/bundle.css").unwrap().get("asset_id"),
            Some("bundle.css")
        );
    }

    #[test]
    fn parameter_rejects_nested_paths() {
        let pat = Pattern::parse("/assets/:asset_id");
        assert!(pat.matches("/assets/a/b").is_none());
        assert!(pat.matches("/static/a").is_none());
    }

    #[test]
    fn exact_pattern_normalizes_trailing_slash() {
        let pat = Pattern::parse("/healthz/");
        assert!(pat.matches("/healthz").is_some());
        assert!(pat.matches("/healthz/").is_some());
        assert!(pat.matches("/health").is_none());
    }

    #[tokio::test]
    async fn captured_id_reaches_handler() {
        let router = echo_router();
        assert_eq!(router.len(), 2);
        let res = router.route(make_request("GET", "/assets/app-1.js")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.body_ref().as_ref(), b"app-1.js");
    }

    #[tokio::test]
    async fn unmatched_method_or_path_is_404() {
        let router = echo_router();
        for (m, p) in [("POST", "/assets/a"), ("GET", "/assets/"), ("GET", "/nope")] {
            let res = router.route(make_request(m, p)).await;
            assert_eq!(res.status(), StatusCode::NotFound, "{m} {p}");
        }
    }

    #[tokio::test]
    async fn middleware_wraps_matched_routes_only() {
        struct Stamp;
        impl Middleware for Stamp {
            fn handle(
                &self,
                ctx: Context,
                next: Next,
            ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
                Box::pin(async move {
                    let mut resp = next.run(ctx).await;
                    resp.add_header("X-Stamp", "1");
                    resp
                })
            }
        }

        let mut router = echo_router();
        router.layer(Stamp);

        let hit = router.route(make_request("GET", "/healthz")).await;
        assert_eq!(hit.headers().get("x-stamp"), Some("1"));

        let miss = router.route(make_request("GET", "/missing")).await;
        assert!(!miss.headers().contains("x-stamp"));
    }

    #[tokio::test]
    async fn layers_run_in_registration_order_on_a_shared_stack() {
        struct Push(&'static str);
        impl Middleware for Push {
            fn handle(
                &self,
                ctx: Context,
                next: Next,
            ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
                let tag = self.0;
                Box::pin(async move {
                    let mut resp = next.run(ctx).await;
                    resp.add_header("X-Order", tag);
                    resp
                })
            }
        }

        let mut router = echo_router();
        router.layer(Push("outer"));
        router.layer(Push("inner"));
        let stack = Arc::clone(&router.middlewares);

        for _ in 0..2 {
            let res = router.route(make_request("GET", "/healthz")).await;
            let order: Vec<_> = res
                .headers()
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case("x-order"))
                .map(|(_, value)| value)
                .collect();
            assert_eq!(order, ["inner", "outer"]);
        }
        assert!(Arc::ptr_eq(&stack, &router.middlewares));
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let mut router = Router::new();
        router.get("/healthz", |_ctx: Context| async { Response::new(StatusCode::Ok) });
        router.get("/healthz", |_ctx: Context| async { Response::new(StatusCode::NoContent) });
        let res = router.route(make_request("GET", "/healthz")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }
}
