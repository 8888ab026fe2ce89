//! Registry allowlist for images embedded in bundles.

use std::collections::BTreeSet;

/// Apex domains images may be pulled from unless configured otherwise.
pub const DEFAULT_REGISTRIES: &[&str] = &[
    "docker.io",
    "gcr.io",
    "ghcr.io",
    "azurecr.io",
    "ttl.sh",
    "ecr.us-east-1.amazonaws.com",
];

/// Immutable set of permitted registry apex domains.
///
/// An image is allowed when the registrable domain (public suffix plus one
/// label) of its registry host is in the set, so `us.gcr.io` is covered by
/// `gcr.io`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAllowlist {
    /// Lowercased apex domains.
    domains: BTreeSet<String>,
}

impl RegistryAllowlist {
    /// Builds an allowlist from apex domains (compared case-insensitively).
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Returns `true` if `image` may be pulled. Unparseable references are denied.
    pub fn allows(&self, image: &str) -> bool {
        apex_domain(image).is_some_and(|apex| self.domains.contains(&apex))
    }

    /// Iterates the permitted domains in sorted order.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }
}

impl Default for RegistryAllowlist {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRIES)
    }
}

/// Registrable domain of the registry host named by `image`.
pub fn apex_domain(image: &str) -> Option<String> {
    let parsed = url::Url::parse(&format!("https://{image}")).ok()?;
    let host = parsed.host_str()?;
    psl::domain_str(host).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registries_are_allowed() {
        let allow = RegistryAllowlist::default();
        assert!(allow.allows("docker.io/library/nginx:1.25"));
        assert!(allow.allows("ghcr.io/org/app@sha256:abc"));
        assert!(allow.allows("ttl.sh/6d1c8a:1h"));
        assert!(allow.allows("gcr.io/kubebuilder/kube-rbac-proxy:v0.8.0"));
    }

    #[test]
    fn subdomains_match_their_apex() {
        let allow = RegistryAllowlist::default();
        assert!(allow.allows("us.gcr.io/project/img:tag"));
        assert!(allow.allows("registry-1.docker.io/library/redis"));
    }

    #[test]
    fn foreign_registries_are_denied() {
        let allow = RegistryAllowlist::default();
        assert!(!allow.allows("evil.example.com/foo:latest"));
        assert!(!allow.allows("quay.io/coreos/etcd:v3"));
        // lookalike: apex is dockerr.io
        assert!(!allow.allows("docker.io.dockerr.io/x"));
    }

    #[test]
    fn unqualified_and_malformed_references_are_denied() {
        let allow = RegistryAllowlist::default();
        // `nginx:latest` parses as host `nginx`, port `latest`
        assert!(!allow.allows("nginx:latest"));
        assert!(!allow.allows("nginx"));
        assert!(!allow.allows(""));
        assert!(!allow.allows("localhost:5000/app"));
    }

    #[test]
    fn custom_set_replaces_defaults() {
        let allow = RegistryAllowlist::new(["Example.com"]);
        assert!(allow.allows("registry.example.com/team/app:v1"));
        assert!(!allow.allows("docker.io/library/nginx"));
        assert_eq!(allow.domains().collect::<Vec<_>>(), ["example.com"]);
    }
}
