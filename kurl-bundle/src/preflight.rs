//! Checks run before the response is committed.
//!
//! Once a `200` has been sent the status can no longer change, so every
//! check that is cheap to do up front happens here. Passing preflight does
//! not guarantee the full transfer succeeds.

use crate::allowlist::RegistryAllowlist;
use crate::error::{Error, Result};
use crate::manifest::BundleManifest;

/// Validates a manifest: registry allowlist first (no I/O), then layer reachability.
#[derive(Debug, Clone)]
pub struct Preflight<'a> {
    /// Agent used for layer `HEAD` requests.
    agent: &'a ureq::Agent,
    /// Permitted registries.
    allowlist: &'a RegistryAllowlist,
}

impl<'a> Preflight<'a> {
    /// Creates a validator probing layers with `agent`.
    pub const fn new(agent: &'a ureq::Agent, allowlist: &'a RegistryAllowlist) -> Self {
        Self { agent, allowlist }
    }

    /// Runs every check, failing on the first problem.
    pub fn check(&self, manifest: &BundleManifest) -> Result<()> {
        self.check_images(&manifest.images)?;
        for url in &manifest.layers {
            self.probe_layer(url)?;
        }
        Ok(())
    }

    /// Rejects the whole manifest if any image names a registry outside the allowlist.
    pub fn check_images(&self, images: &[String]) -> Result<()> {
        match images.iter().find(|image| !self.allowlist.allows(image)) {
            Some(image) => Err(Error::DisallowedRegistry(image.clone())),
            None => Ok(()),
        }
    }

    /// Issues a `HEAD` for `url` and requires `200 OK`.
    pub fn probe_layer(&self, url: &str) -> Result<()> {
        let resp = self
            .agent
            .head(url)
            .call()
            .map_err(|source| Error::ProbeTransport {
                url: url.to_owned(),
                source,
            })?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(Error::ProbeStatus {
                url: url.to_owned(),
                status,
            });
        }
        tracing::debug!(url, "layer reachable");
        Ok(())
    }
}
