//! Distribution API (v2) client for anonymous pulls.
//!
//! Only the v2 protocol is spoken; registries are never probed for v1.
//! No credentials are sent: when a registry answers `401` with a bearer
//! challenge, an anonymous token is requested from the advertised realm and
//! the request is retried once.

use std::collections::HashMap;
use std::io::Read;

use serde::Deserialize;
use ureq::http::{Response, StatusCode};
use ureq::{Agent, Body};

use crate::{Error, Reference, Result};

/// Manifest media types accepted during pull.
const ACCEPT_MANIFEST: &str = "\
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json";

/// Upper bound for manifest and config documents held in memory.
const MAX_DOCUMENT: u64 = 16 * 1024 * 1024;

/// Content descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: Option<String>,
    pub digest: String,
    pub size: u64,
}

/// Single-platform image manifest.
#[derive(Debug, Deserialize)]
pub struct ImageManifest {
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    platform: Option<Platform>,
}

/// Image index / manifest list.
#[derive(Debug, Deserialize)]
struct ImageIndex {
    manifests: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Registry client scoped to a single pull; bearer tokens are cached per scope.
#[derive(Debug)]
pub struct Client {
    agent: Agent,
    tokens: HashMap<String, String>,
}

impl Client {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            tokens: HashMap::new(),
        }
    }

    /// Resolves the reference to a single-platform manifest (`linux/<host arch>`).
    pub fn pull_manifest(&mut self, reference: &Reference) -> Result<ImageManifest> {
        let body = self.manifest_document(reference, reference.reference_str())?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;

        if value.get("schemaVersion").and_then(serde_json::Value::as_u64) == Some(1) {
            return Err(Error::UnsupportedMediaType(
                "schema 1 manifest (legacy registry protocol)".into(),
            ));
        }

        if value.get("manifests").is_some() {
            let index: ImageIndex = serde_json::from_value(value)?;
            let entry = select_platform(&index)?;
            tracing::debug!(%reference, digest = %entry.digest, "resolved platform manifest");
            let platform_body = self.manifest_document(reference, &entry.digest)?;
            verify_digest(&entry.digest, &crate::digest::of(&platform_body))?;
            Ok(serde_json::from_slice(&platform_body)?)
        } else {
            Ok(serde_json::from_value(value)?)
        }
    }

    /// Fetches a small blob (the image config) into memory, verifying its digest.
    pub fn fetch_config(&mut self, reference: &Reference, desc: &Descriptor) -> Result<Vec<u8>> {
        let resp = self.fetch_blob(reference, &desc.digest)?;
        let data = read_document(resp)?;
        verify_digest(&desc.digest, &crate::digest::of(&data))?;
        Ok(data)
    }

    /// Opens a blob download; the caller streams the body.
    pub fn fetch_blob(&mut self, reference: &Reference, digest: &str) -> Result<Response<Body>> {
        let url = format!(
            "{}/{}/blobs/{digest}",
            reference.api_base(),
            reference.repository
        );
        self.get(reference, &url, None)
    }

    fn manifest_document(&mut self, reference: &Reference, tag_or_digest: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{}/manifests/{tag_or_digest}",
            reference.api_base(),
            reference.repository
        );
        let resp = self.get(reference, &url, Some(ACCEPT_MANIFEST))?;
        read_document(resp)
    }

    /// GET with anonymous bearer auth, retrying once after a `401` challenge.
    fn get(&mut self, reference: &Reference, url: &str, accept: Option<&str>) -> Result<Response<Body>> {
        let scope = reference.pull_scope();
        let resp = self.send(url, accept, self.tokens.get(&scope).map(String::as_str))?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return check_status(url, resp);
        }

        let challenge = resp
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse)
            .ok_or_else(|| Error::Status {
                url: url.to_owned(),
                status: StatusCode::UNAUTHORIZED.as_u16(),
            })?;
        let token = self.anonymous_token(&challenge, &scope)?;
        self.tokens.insert(scope, token.clone());

        let retried = self.send(url, accept, Some(&token))?;
        check_status(url, retried)
    }

    fn send(&self, url: &str, accept: Option<&str>, token: Option<&str>) -> Result<Response<Body>> {
        let mut req = self.agent.get(url);
        if let Some(accept) = accept {
            req = req.header("Accept", accept);
        }
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        Ok(req.call()?)
    }

    /// Requests a pull token from the challenge realm; parameters are
    /// percent-encoded onto whatever query the realm already carries.
    fn anonymous_token(&self, challenge: &Challenge, default_scope: &str) -> Result<String> {
        let mut req = self
            .agent
            .get(&challenge.realm)
            .query("scope", challenge.scope.as_deref().unwrap_or(default_scope));
        if let Some(service) = &challenge.service {
            req = req.query("service", service);
        }

        let resp = check_status(&challenge.realm, req.call()?)?;
        let body: TokenResponse = serde_json::from_slice(&read_document(resp)?)?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Error::Auth(format!("token endpoint {} returned no token", challenge.realm)))
    }
}

/// Parsed `WWW-Authenticate: Bearer realm="…",service="…",scope="…"` challenge.
#[derive(Debug, PartialEq, Eq)]
struct Challenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for part in split_params(params) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let unquoted = value.trim().trim_matches('"').to_owned();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(unquoted),
                "service" => service = Some(unquoted),
                "scope" => scope = Some(unquoted),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Splits challenge parameters on commas that are outside quotes.
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in params.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

fn check_status(url: &str, resp: Response<Body>) -> Result<Response<Body>> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::NOT_FOUND => Err(Error::NotFound(url.to_owned())),
        s => Err(Error::Status {
            url: url.to_owned(),
            status: s.as_u16(),
        }),
    }
}

fn read_document(resp: Response<Body>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    resp.into_body()
        .into_reader()
        .take(MAX_DOCUMENT)
        .read_to_end(&mut data)?;
    Ok(data)
}

fn verify_digest(expected: &str, actual: &str) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::DigestMismatch {
            expected: expected.to_owned(),
            actual: actual.to_owned(),
        })
    }
}

/// Picks the `linux` manifest for the host architecture.
fn select_platform(index: &ImageIndex) -> Result<&IndexEntry> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    index
        .manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.architecture == arch && p.os == "linux")
        })
        .ok_or_else(|| Error::NoPlatform {
            arch: arch.to_owned(),
            os: "linux".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_hub_challenge() {
        let c = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.docker.io/token");
        assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:library/nginx:pull"));
    }

    #[test]
    fn scope_with_commas_stays_intact() {
        let c = Challenge::parse(r#"Bearer realm="https://ghcr.io/token",scope="repository:a/b:pull,push""#)
            .unwrap();
        assert_eq!(c.scope.as_deref(), Some("repository:a/b:pull,push"));
        assert_eq!(c.service, None);
    }

    #[test]
    fn non_bearer_challenge_is_ignored() {
        assert_eq!(Challenge::parse(r#"Basic realm="registry""#), None);
        assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
    }

    #[test]
    fn selects_linux_host_platform() {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        let index: ImageIndex = serde_json::from_value(serde_json::json!({
            "manifests": [
                {"digest": "sha256:win", "platform": {"architecture": arch, "os": "windows"}},
                {"digest": "sha256:attest"},
                {"digest": "sha256:linux", "platform": {"architecture": arch, "os": "linux"}}
            ]
        }))
        .unwrap();
        assert_eq!(select_platform(&index).unwrap().digest, "sha256:linux");
    }

    #[test]
    fn missing_platform_is_an_error() {
        let index = ImageIndex { manifests: vec![] };
        assert!(matches!(select_platform(&index), Err(Error::NoPlatform { .. })));
    }
}
