//! Out-of-band error reporting.

use std::error::Error as StdError;
use std::fmt::{self, Write as _};

/// Request details attached to every report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct RequestContext {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Installer ID (suffix stripped).
    pub installer_id: String,
    /// Pinned kURL version, if any.
    pub kurl_version: Option<String>,
}

impl RequestContext {
    /// Context for a request to `path` naming `installer_id`.
    pub fn new(method: &str, path: &str, installer_id: &str, kurl_version: Option<&str>) -> Self {
        Self {
            method: method.to_owned(),
            path: path.to_owned(),
            installer_id: installer_id.to_owned(),
            kurl_version: kurl_version.map(str::to_owned),
        }
    }
}

/// Receives errors for recording outside the request flow.
pub trait Reporter: Send + Sync + fmt::Debug {
    /// Records `error`, which occurred while serving `ctx`.
    fn report(&self, error: &(dyn StdError + 'static), ctx: &RequestContext);
}

/// Reporter that emits one structured `error` event per report.
#[derive(Debug, Clone, Default)]
pub struct LogReporter {
    /// Deployment stage tag.
    release_stage: Option<String>,
}

impl LogReporter {
    /// Creates a reporter tagging events with `release_stage` (e.g. `production`).
    pub const fn new(release_stage: Option<String>) -> Self {
        Self { release_stage }
    }
}

impl Reporter for LogReporter {
    fn report(&self, error: &(dyn StdError + 'static), ctx: &RequestContext) {
        tracing::error!(
            release_stage = self.release_stage.as_deref().unwrap_or("default"),
            method = %ctx.method,
            path = %ctx.path,
            installer_id = %ctx.installer_id,
            kurl_version = ctx.kurl_version.as_deref(),
            error = %chain(error),
            "bundle request failed"
        );
    }
}

/// Renders an error and its sources as `outer: inner: root`.
pub fn chain(error: &(dyn StdError + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(out, ": {cause}");
        source = cause.source();
    }
    out
}
