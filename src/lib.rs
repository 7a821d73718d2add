//! # rstash
//!
//! A caching reverse proxy for immutable web assets.
//!
//! `GET /assets/:asset_id` is answered from the cache when possible. On a
//! miss the asset is fetched from the first upstream origin that can serve
//! it, stored, and returned. Entries never expire.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rstash::config::ProxyConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::default();
//!     rstash::proxy::serve(&config, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod server;
pub mod upstream;

pub use cache::AssetCache;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
