//! Bundle manifests and their resolution against the upstream manifest service.

use std::collections::BTreeMap;
use std::io::Read;

use axum::http::HeaderMap;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Suffix clients may append to the installer ID.
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Request headers that describe the client connection rather than the request.
/// `accept-encoding` is left to the HTTP agent, which negotiates its own compression.
const HOP_BY_HOP: &[&str] = &[
    "accept-encoding",
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client attribution header, filled in from the peer address when absent.
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Everything needed to build one installer bundle.
///
/// Fields that are missing or `null` in the upstream JSON decode as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[non_exhaustive]
pub struct BundleManifest {
    /// URLs of gzip tar archives, merged under `kurl/` in this order.
    #[serde(default, deserialize_with = "nullable")]
    pub layers: Vec<String>,
    /// Inline files keyed by archive path; emitted in path order.
    #[serde(default, deserialize_with = "nullable")]
    pub files: BTreeMap<String, String>,
    /// Image references; position `i` becomes `kurl/image-overrides/<i>.tar`.
    #[serde(default, deserialize_with = "nullable")]
    pub images: Vec<String>,
}

impl BundleManifest {
    /// Creates a manifest from its three parts.
    pub const fn new(
        layers: Vec<String>,
        files: BTreeMap<String, String>,
        images: Vec<String>,
    ) -> Self {
        Self {
            layers,
            files,
            images,
        }
    }
}

/// Decodes `null` as the type's default.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Which installer a request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct InstallerRequest {
    /// Installer ID with any `.tar.gz` suffix removed.
    pub installer_id: String,
    /// Pinned kURL version, if the versioned route was used.
    pub kurl_version: Option<String>,
}

impl InstallerRequest {
    /// Normalizes the raw path parameters.
    pub fn new(installer_id: &str, kurl_version: Option<String>) -> Self {
        Self {
            installer_id: installer_id
                .strip_suffix(ARCHIVE_SUFFIX)
                .unwrap_or(installer_id)
                .to_owned(),
            kurl_version,
        }
    }

    /// Manifest URL on the upstream service rooted at `upstream`.
    pub fn manifest_url(&self, upstream: &str) -> String {
        let base = upstream.trim_end_matches('/');
        match &self.kurl_version {
            Some(version) => format!("{base}/bundle/version/{version}/{}", self.installer_id),
            None => format!("{base}/bundle/{}", self.installer_id),
        }
    }
}

/// Outcome of a manifest lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Lookup {
    /// The installer exists.
    Found(BundleManifest),
    /// Upstream answered `404`; carries its body for passthrough.
    Missing(String),
}

/// Fetches manifests from the upstream service.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    /// Outbound HTTP agent.
    agent: ureq::Agent,
    /// Base URL of the manifest service.
    upstream: String,
}

impl ManifestResolver {
    /// Creates a resolver for the service rooted at `upstream`.
    pub fn new(agent: ureq::Agent, upstream: impl Into<String>) -> Self {
        Self {
            agent,
            upstream: upstream.into(),
        }
    }

    /// Looks up the manifest for `installer`.
    ///
    /// `client_headers` are forwarded for attribution; `client_ip` fills in
    /// `X-Forwarded-For` when the client did not send it.
    pub fn resolve(
        &self,
        installer: &InstallerRequest,
        client_headers: &HeaderMap,
        client_ip: Option<&str>,
    ) -> Result<Lookup> {
        let url = installer.manifest_url(&self.upstream);
        let mut req = self.agent.get(&url);
        for (name, value) in client_headers {
            if !HOP_BY_HOP.contains(&name.as_str()) {
                req = req.header(name.as_str(), value.as_bytes());
            }
        }
        if !client_headers.contains_key(FORWARDED_FOR) {
            if let Some(ip) = client_ip {
                req = req.header(FORWARDED_FOR, ip);
            }
        }

        let resp = req.call().map_err(|source| Error::Upstream {
            url: url.clone(),
            source,
        })?;
        let status = resp.status();
        let mut body = String::new();
        resp.into_body()
            .into_reader()
            .read_to_string(&mut body)
            .map_err(|source| Error::UpstreamBody {
                url: url.clone(),
                source,
            })?;

        if status.as_u16() == 404 {
            return Ok(Lookup::Missing(body));
        }
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                url,
                status: status.as_u16(),
            });
        }

        match serde_json::from_str(&body) {
            Ok(manifest) => Ok(Lookup::Found(manifest)),
            Err(source) => Err(Error::Manifest { url, body, source }),
        }
    }
}
