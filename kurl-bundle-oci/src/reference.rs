//! Image reference parsing.
//!
//! Follows the Docker normalization rules:
//! - `nginx` → `docker.io/library/nginx:latest`
//! - `kotsadm/kotsadm:v1` → `docker.io/kotsadm/kotsadm:v1`
//! - `ghcr.io/org/app@sha256:…` → `ghcr.io/org/app@sha256:…`

use std::fmt;

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_NAMESPACE: &str = "library";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Reference {
    /// Registry host, optionally with port (e.g. `docker.io`, `localhost:5000`).
    pub registry: String,
    /// Repository path within the registry (e.g. `library/nginx`).
    pub repository: String,
    /// Tag or digest.
    pub identifier: Identifier,
}

/// Tag or digest part of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Identifier {
    /// Mutable tag such as `latest`.
    Tag(String),
    /// Content digest such as `sha256:9f86…`.
    Digest(String),
}

impl Reference {
    /// Parses a reference of the form `[registry/]repo[:tag|@digest]`.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidReference("empty reference".into()));
        }

        let (named, digest) = match trimmed.split_once('@') {
            Some((n, d)) if d.contains(':') => (n, Some(d)),
            Some(_) => {
                return Err(crate::Error::InvalidReference(format!(
                    "malformed digest in {trimmed}"
                )));
            }
            None => (trimmed, None),
        };

        // A tag colon only counts after the last path separator, so
        // `localhost:5000/app` keeps its port.
        let (name, tag) = match named.rsplit_once(':') {
            Some((repo, t)) if !t.contains('/') => (repo, Some(t)),
            _ => (named, None),
        };

        let (registry, path) = match name.split_once('/') {
            Some((host, rest)) if looks_like_host(host) => (normalize_host(host), rest.to_owned()),
            Some(_) => (DOCKER_HUB.to_owned(), name.to_owned()),
            None => (DOCKER_HUB.to_owned(), format!("{OFFICIAL_NAMESPACE}/{name}")),
        };

        if path.is_empty() || path.contains("//") {
            return Err(crate::Error::InvalidReference(trimmed.to_owned()));
        }
        let repository = if registry == DOCKER_HUB && !path.contains('/') {
            format!("{OFFICIAL_NAMESPACE}/{path}")
        } else {
            path
        };

        let identifier = match (digest, tag) {
            (Some(d), _) => Identifier::Digest(d.to_owned()),
            (None, Some(t)) if !t.is_empty() => Identifier::Tag(t.to_owned()),
            (None, Some(_)) => return Err(crate::Error::InvalidReference(trimmed.to_owned())),
            (None, None) => Identifier::Tag(DEFAULT_TAG.to_owned()),
        };

        Ok(Self {
            registry,
            repository,
            identifier,
        })
    }

    /// Base URL of the registry's v2 API.
    pub fn api_base(&self) -> String {
        let host = if self.registry == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            &self.registry
        };
        let scheme = if is_loopback(host) { "http" } else { "https" };
        format!("{scheme}://{host}/v2")
    }

    /// The tag or digest as used in manifest URLs.
    pub fn reference_str(&self) -> &str {
        match &self.identifier {
            Identifier::Tag(s) | Identifier::Digest(s) => s,
        }
    }

    /// `registry/repository:tag` for tagged references, used as a docker-archive `RepoTags` entry.
    pub fn repo_tag(&self) -> Option<String> {
        match &self.identifier {
            Identifier::Tag(tag) => Some(format!("{}/{}:{tag}", self.registry, self.repository)),
            Identifier::Digest(_) => None,
        }
    }

    /// Token scope requested for anonymous pulls.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }
}

/// Whether the first path segment names a registry rather than a namespace.
fn looks_like_host(s: &str) -> bool {
    s.contains('.') || s.contains(':') || s == "localhost"
}

/// Folds Docker Hub aliases into `docker.io` and lowercases the rest.
fn normalize_host(host: &str) -> String {
    match host {
        "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB.to_owned(),
        other => other.to_ascii_lowercase(),
    }
}

/// Loopback registries are spoken to over plain HTTP.
fn is_loopback(host: &str) -> bool {
    let hostname = host.rsplit_once(':').map_or(host, |(h, _)| h);
    matches!(hostname, "localhost" | "127.0.0.1" | "[::1]")
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.identifier {
            Identifier::Tag(t) => write!(f, ":{t}"),
            Identifier::Digest(d) => write!(f, "@{d}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_hub_defaults() {
        let r = Reference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.identifier, Identifier::Tag("latest".into()));
    }

    #[test]
    fn hub_namespace_is_kept() {
        let r = Reference::parse("kotsadm/kotsadm:v1.50.0").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "kotsadm/kotsadm");
        assert_eq!(r.identifier, Identifier::Tag("v1.50.0".into()));
    }

    #[test]
    fn explicit_hub_single_segment_is_official() {
        let r = Reference::parse("docker.io/nginx:1.25").unwrap();
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.api_base(), "https://registry-1.docker.io/v2");
    }

    #[test]
    fn index_alias_normalizes_to_hub() {
        let r = Reference::parse("index.docker.io/library/redis").unwrap();
        assert_eq!(r.registry, "docker.io");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r = Reference::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.identifier, Identifier::Tag("latest".into()));
        assert_eq!(r.api_base(), "http://localhost:5000/v2");
    }

    #[test]
    fn digest_reference_has_no_repo_tag() {
        let r = Reference::parse("ghcr.io/org/app@sha256:abc123").unwrap();
        assert_eq!(r.identifier, Identifier::Digest("sha256:abc123".into()));
        assert_eq!(r.repo_tag(), None);
        assert_eq!(r.to_string(), "ghcr.io/org/app@sha256:abc123");
    }

    #[test]
    fn repo_tag_and_scope() {
        let r = Reference::parse("gcr.io/proj/img:v2").unwrap();
        assert_eq!(r.repo_tag().as_deref(), Some("gcr.io/proj/img:v2"));
        assert_eq!(r.pull_scope(), "repository:proj/img:pull");
    }

    #[test]
    fn rejects_malformed() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("nginx@nodigest").is_err());
        assert!(Reference::parse("nginx:").is_err());
        assert!(Reference::parse("ghcr.io/").is_err());
    }
}
