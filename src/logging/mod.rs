//! Process-wide `tracing` subscriber.

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber.
///
/// # Arguments
///
/// * `level` - configured filter, used when `RUST_LOG` is unset or empty.
///
/// Call once, before the server starts.
pub fn init(level: &str) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(env.as_deref(), level);
    let active = filter.to_string();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    info!("Logging initialized with filter: {}", active);
}

// `env` is the raw `RUST_LOG` value; it wins over `level` when it parses.
fn build_filter(env: Option<&str>, level: &str) -> EnvFilter {
    env.filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
