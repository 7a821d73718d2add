//! Per-request context: the parsed request plus path parameters captured by the router.

use std::collections::HashMap;

use crate::Request;

/// Path parameters extracted from the matched route, e.g. `asset_id` for
/// `/assets/:asset_id`.
#[derive(Default, Debug, Clone)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// What a route handler (and every middleware in front of it) receives.
pub struct Context {
    request: Request,
    params: PathParams,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self::with_params(request, PathParams::new())
    }

    pub fn with_params(request: Request, params: PathParams) -> Self {
        Self { request, params }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Shorthand for `params().get(name)`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_reachable_from_context() {
        let (req, _) = Request::parse(b"GET /assets/x HTTP/1.1\r\n\r\n").unwrap();
        let mut params = PathParams::new();
        params.insert("asset_id", "x");
        let ctx = Context::with_params(req, params);
        assert_eq!(ctx.param("asset_id"), Some("x"));
        assert_eq!(ctx.param("missing"), None);
        assert_eq!(ctx.request().path(), "/assets/x");
    }

    #[test]
    fn new_context_has_no_params() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(Context::new(req).params().is_empty());
    }
}
