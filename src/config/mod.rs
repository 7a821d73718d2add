//! Startup configuration.
//!
//! Settings come from a JSON file (the desktop shell's settings store) and
//! are then overridden from the command line. A missing file means defaults.
//!
//! ```json
//! {
//!   "bind": "127.0.0.1:9370",
//!   "upstreams": ["https://music.apple.com", "https://beta.music.apple.com"],
//!   "preferred_upstream": "https://beta.music.apple.com",
//!   "network_proxy": "http://127.0.0.1:8888",
//!   "cache_dir": "/home/me/.cache/rstash",
//!   "fetch_timeout_secs": 15,
//!   "log_level": "info"
//! }
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::upstream::UpstreamCandidates;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read settings file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("settings file {} is not valid: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Everything the proxy needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Local listen address.
    pub bind: String,

    /// Origins tried in order on a cache miss.
    pub upstreams: Vec<String>,

    /// Origin moved to the front of `upstreams` when present there.
    pub preferred_upstream: Option<String>,

    /// Outbound proxy for upstream traffic, e.g. `http://127.0.0.1:8888`.
    pub network_proxy: Option<String>,

    /// Persist entries here; memory only when unset.
    pub cache_dir: Option<PathBuf>,

    pub fetch_timeout_secs: u64,

    /// `trace`, `debug`, `info`, `warn` or `error`; `RUST_LOG` takes precedence.
    pub log_level: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9370".to_string(),
            upstreams: vec![
                "https://music.apple.com".to_string(),
                "https://beta.music.apple.com".to_string(),
            ],
            preferred_upstream: None,
            network_proxy: None,
            cache_dir: None,
            fetch_timeout_secs: 15,
            log_level: "info".to_string(),
        }
    }
}

/// Command-line values that replace file settings when present.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    /// Replaces the whole list when non-empty.
    pub upstreams: Vec<String>,
    pub cache_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ProxyConfig {
    /// Loads `path`, or defaults when `path` is `None` or does not exist.
    ///
    /// The result is not validated; call [`validate`](Self::validate) after
    /// applying overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_owned(),
                    source,
                });
            }
        };

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if !overrides.upstreams.is_empty() {
            self.upstreams = overrides.upstreams;
        }
        if let Some(dir) = overrides.cache_dir {
            self.cache_dir = Some(dir);
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::Invalid {
                field: "upstreams",
                reason: "at least one origin is required".into(),
            });
        }
        if let Some(bad) = self
            .upstreams
            .iter()
            .find(|u| !(u.starts_with("http://") || u.starts_with("https://")))
        {
            return Err(ConfigError::Invalid {
                field: "upstreams",
                reason: format!("{bad:?} is not an http(s) URL"),
            });
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "bind",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Upstream list in the order misses will try it.
    pub fn candidates(&self) -> Result<UpstreamCandidates, ConfigError> {
        let candidates =
            UpstreamCandidates::new(&self.upstreams).ok_or_else(|| ConfigError::Invalid {
                field: "upstreams",
                reason: "at least one origin is required".into(),
            })?;
        Ok(match &self.preferred_upstream {
            Some(preferred) => candidates.with_preferred(preferred),
            None => candidates,
        })
    }
}
