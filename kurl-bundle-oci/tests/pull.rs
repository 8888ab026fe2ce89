//! Pulls against a local v2 registry that demands anonymous bearer tokens.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use flate2::Compression;
use flate2::write::GzEncoder;
use kurl_bundle_oci::{Error, Puller};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

const TOKEN: &str = "anon";
const INDEX: &str = "application/vnd.oci.image.index.v1+json";
const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

fn hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex(data))
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Uncompressed layer holding a single file.
fn layer_tar() -> Vec<u8> {
    let mut tar = tar::Builder::new(Vec::new());
    let mut h = tar::Header::new_ustar();
    h.set_size(5);
    h.set_mode(0o644);
    h.set_cksum();
    tar.append_data(&mut h, "etc/motd", &b"hello"[..]).unwrap();
    tar.into_inner().unwrap()
}

/// Gzips `data` as two concatenated members.
fn two_members(data: &[u8]) -> Vec<u8> {
    let (head, tail) = data.split_at(data.len() / 2);
    let mut out = Vec::new();
    for part in [head, tail] {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(part).unwrap();
        out.extend(gz.finish().unwrap());
    }
    out
}

// ── Fake registry ──────────────────────────────────────────────────────

#[derive(Clone)]
struct Registry {
    realm: String,
    /// `(repository, tag or digest)` → `(media type, body)`.
    manifests: Arc<HashMap<(String, String), (&'static str, Vec<u8>)>>,
    /// `(repository, digest)` → body.
    blobs: Arc<HashMap<(String, String), Vec<u8>>>,
    token_requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl Registry {
    fn challenge(&self, repo: &str) -> Response {
        let value = format!(
            r#"Bearer realm="{}",service="fake registry",scope="repository:{repo}:pull""#,
            self.realm
        );
        (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, value)]).into_response()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .is_some_and(|v| v == format!("Bearer {TOKEN}").as_str())
}

async fn token(
    State(reg): State<Registry>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    reg.token_requests.lock().unwrap().push(params);
    axum::Json(json!({ "token": TOKEN })).into_response()
}

async fn manifest(
    State(reg): State<Registry>,
    UrlPath((ns, name, reference)): UrlPath<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let repo = format!("{ns}/{name}");
    if !authorized(&headers) {
        return reg.challenge(&repo);
    }
    match reg.manifests.get(&(repo, reference)) {
        Some((media_type, body)) => {
            ([(header::CONTENT_TYPE, *media_type)], body.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn blob(
    State(reg): State<Registry>,
    UrlPath((ns, name, digest)): UrlPath<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let repo = format!("{ns}/{name}");
    if !authorized(&headers) {
        return reg.challenge(&repo);
    }
    match reg.blobs.get(&(repo, digest)) {
        Some(body) => body.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

struct Fixture {
    addr: SocketAddr,
    registry: Registry,
    layer_tar: Vec<u8>,
    config: Vec<u8>,
}

/// Serves `test/app:v1` as an index with a host-platform entry, and
/// `test/bad:v1` as a manifest whose layer blob does not match its digest.
async fn start_registry() -> Fixture {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let layer_tar = layer_tar();
    let layer_gz = two_members(&layer_tar);
    let config = serde_json::to_vec(&json!({
        "architecture": host_arch(),
        "os": "linux",
        "rootfs": { "type": "layers", "diff_ids": [sha256(&layer_tar)] },
    }))
    .unwrap();
    let image_manifest = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": sha256(&config),
            "size": config.len(),
        },
        "layers": [{ "mediaType": LAYER, "digest": sha256(&layer_gz), "size": layer_gz.len() }],
    }))
    .unwrap();
    let index = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": INDEX,
        "manifests": [
            {
                "mediaType": MANIFEST,
                "digest": format!("sha256:{}", "0".repeat(64)),
                "size": 1,
                "platform": { "architecture": host_arch(), "os": "windows" },
            },
            {
                "mediaType": MANIFEST,
                "digest": sha256(&image_manifest),
                "size": image_manifest.len(),
                "platform": { "architecture": host_arch(), "os": "linux" },
            },
        ],
    }))
    .unwrap();

    let app = "test/app".to_owned();
    let bad = "test/bad".to_owned();
    let manifests = HashMap::from([
        ((app.clone(), "v1".to_owned()), (INDEX, index)),
        ((app.clone(), sha256(&image_manifest)), (MANIFEST, image_manifest.clone())),
        ((bad.clone(), "v1".to_owned()), (MANIFEST, image_manifest)),
    ]);
    let tampered = two_members(b"not the layer you asked for");
    let blobs = HashMap::from([
        ((app.clone(), sha256(&config)), config.clone()),
        ((app, sha256(&layer_gz)), layer_gz.clone()),
        ((bad.clone(), sha256(&config)), config.clone()),
        ((bad, sha256(&layer_gz)), tampered),
    ]);

    let registry = Registry {
        realm: format!("http://{addr}/token?client=kurl"),
        manifests: Arc::new(manifests),
        blobs: Arc::new(blobs),
        token_requests: Arc::default(),
    };
    let router = Router::new()
        .route("/token", get(token))
        .route("/v2/:ns/:name/manifests/:reference", get(manifest))
        .route("/v2/:ns/:name/blobs/:digest", get(blob))
        .with_state(registry.clone());
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    Fixture {
        addr,
        registry,
        layer_tar,
        config,
    }
}

async fn pull(image: String, staging: &Path, dest: &Path) -> kurl_bundle_oci::Result<()> {
    let staging = staging.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        Puller::new(kurl_bundle_oci::agent(None)).save(&image, &staging, &dest)
    })
    .await
    .unwrap()
}

fn archive_entries(path: &Path) -> HashMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(std::fs::File::open(path).unwrap());
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut e = entry.unwrap();
            let name = e.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            e.read_to_end(&mut data).unwrap();
            (name, data)
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn index_image_becomes_docker_archive() {
    let f = start_registry().await;
    let dir = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let dest = dir.path().join("image.tar");

    pull(format!("{}/test/app:v1", f.addr), staging.path(), &dest)
        .await
        .unwrap();

    let entries = archive_entries(&dest);
    let layer_name = format!("{}.tar", hex(&f.layer_tar));
    let config_name = format!("{}.json", hex(&f.config));
    assert_eq!(entries[&layer_name], f.layer_tar);
    assert_eq!(entries[&config_name], f.config);

    let manifest: Value = serde_json::from_slice(&entries["manifest.json"]).unwrap();
    assert_eq!(
        manifest,
        json!([{
            "Config": config_name,
            "RepoTags": [format!("{}/test/app:v1", f.addr)],
            "Layers": [layer_name],
        }])
    );
    let repositories: Value = serde_json::from_slice(&entries["repositories"]).unwrap();
    assert_eq!(
        repositories[format!("{}/test/app", f.addr)]["v1"],
        hex(&f.layer_tar)
    );

    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn token_is_requested_once_with_encoded_parameters() {
    let f = start_registry().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("image.tar");

    pull(format!("{}/test/app:v1", f.addr), dir.path(), &dest)
        .await
        .unwrap();

    let requests = f.registry.token_requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let params = &requests[0];
    assert_eq!(params["scope"], "repository:test/app:pull");
    assert_eq!(params["service"], "fake registry");
    assert_eq!(params["client"], "kurl");
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_layer_is_rejected() {
    let f = start_registry().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("image.tar");

    let err = pull(format!("{}/test/bad:v1", f.addr), dir.path(), &dest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DigestMismatch { .. }), "{err}");
    assert!(!dest.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_tag_is_not_found() {
    let f = start_registry().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("image.tar");

    let err = pull(format!("{}/test/app:v2", f.addr), dir.path(), &dest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err}");
}
