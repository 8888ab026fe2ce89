//! Service configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:3001";
/// Default manifest service base URL.
pub const DEFAULT_UPSTREAM: &str = "http://localhost:3000";
/// Default scratch root for image pulls.
pub const DEFAULT_SCRATCH_DIR: &str = "/images";

/// Settings for one bundle server process.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Address the HTTP server binds.
    pub listen: SocketAddr,
    /// Base URL of the manifest service.
    pub upstream: String,
    /// Directory that per-image scratch directories are created in.
    pub scratch_dir: PathBuf,
    /// End-to-end limit for every outbound HTTP call. `None` keeps transport defaults.
    pub http_timeout: Option<Duration>,
    /// Release stage attached to error reports.
    pub release_stage: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3001)),
            upstream: DEFAULT_UPSTREAM.to_owned(),
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            http_timeout: None,
            release_stage: None,
        }
    }
}

impl Config {
    /// Sets the listen address.
    #[must_use]
    pub const fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Sets the manifest service base URL.
    #[must_use]
    pub fn upstream(mut self, url: impl Into<String>) -> Self {
        self.upstream = url.into();
        self
    }

    /// Sets the scratch root.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Sets the outbound HTTP timeout.
    #[must_use]
    pub const fn http_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Sets the release stage for error reports.
    #[must_use]
    pub fn release_stage(mut self, stage: Option<String>) -> Self {
        self.release_stage = stage;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(c.upstream, DEFAULT_UPSTREAM);
        assert_eq!(c.scratch_dir, PathBuf::from(DEFAULT_SCRATCH_DIR));
        assert_eq!(c.http_timeout, None);
    }
}
