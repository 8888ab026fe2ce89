//! Container image materialization for kURL installer bundles.
//!
//! Pulls an image from a remote registry and writes it as a single-file
//! docker-archive, the format `docker load` accepts. Transfers follow an
//! "accept anything" policy: no signature verification, no credentials,
//! v2 protocol only.

#![allow(clippy::missing_docs_in_private_items)]

mod archive;
mod digest;
pub mod reference;
mod registry;

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use std::time::Duration;

use flate2::read::MultiGzDecoder;

use archive::{ArchiveContents, StagedLayer};
use digest::{HashingReader, HashingWriter};
pub use reference::{Identifier, Reference};
use registry::{Client, Descriptor};

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from pulling or archiving an image.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// The registry has no such manifest or blob.
    #[error("not found: {0}")]
    NotFound(String),

    /// No manifest in the image index matched the host platform.
    #[error("no matching platform for {arch}/{os}")]
    NoPlatform {
        /// CPU architecture.
        arch: String,
        /// Operating system.
        os: String,
    },

    /// Downloaded content did not match its descriptor digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest named by the manifest.
        expected: String,
        /// Digest of the received bytes.
        actual: String,
    },

    /// Manifest or layer format this puller cannot convert.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Anonymous token negotiation failed.
    #[error("registry auth: {0}")]
    Auth(String),

    /// The registry answered with an unexpected status code.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Connection, TLS or protocol failure.
    #[error(transparent)]
    Transport(#[from] ureq::Error),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Builds an HTTP agent that reports non-2xx statuses as responses rather than errors.
///
/// `timeout` bounds each call end to end; `None` keeps the transport defaults.
pub fn agent(timeout: Option<Duration>) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(timeout)
        .build();
    ureq::Agent::new_with_config(config)
}

/// Pulls images into docker-archive files.
#[derive(Debug, Clone)]
pub struct Puller {
    agent: ureq::Agent,
}

impl Puller {
    /// Creates a puller sharing `agent`'s connection pool.
    pub const fn new(agent: ureq::Agent) -> Self {
        Self { agent }
    }

    /// Pulls `image` and writes it as a docker-archive at `dest`.
    ///
    /// Layer blobs are decompressed into `staging` first (docker-archive
    /// stores uncompressed layers) and removed once the archive is complete.
    /// Callers own `staging` and are responsible for removing it on error.
    pub fn save(&self, image: &str, staging: &Path, dest: &Path) -> Result<()> {
        let reference = Reference::parse(image)?;
        let mut client = Client::new(self.agent.clone());

        let manifest = client.pull_manifest(&reference)?;
        let config = client.fetch_config(&reference, &manifest.config)?;

        let total = manifest.layers.len();
        let mut layers = Vec::with_capacity(total);
        for (i, desc) in manifest.layers.iter().enumerate() {
            tracing::debug!(
                %reference,
                digest = %desc.digest,
                size = desc.size,
                "pulling layer {}/{total}",
                i + 1
            );
            let path = staging.join(format!("layer-{i}.tar"));
            let diff_id = stage_layer(&mut client, &reference, desc, &path)?;
            layers.push(StagedLayer { path, diff_id });
        }

        ArchiveContents {
            repo_tag: reference.repo_tag(),
            config_digest: &manifest.config.digest,
            config: &config,
            layers: &layers,
        }
        .write_to(dest)?;

        for layer in &layers {
            std::fs::remove_file(&layer.path)?;
        }
        tracing::debug!(%reference, dest = %dest.display(), "image archive written");
        Ok(())
    }
}

/// Streams one layer blob to `path` uncompressed, returning its diff ID.
///
/// All gzip members are decoded; eStargz layers are a concatenation of many.
fn stage_layer(
    client: &mut Client,
    reference: &Reference,
    desc: &Descriptor,
    path: &Path,
) -> Result<String> {
    let media_type = desc.media_type.as_deref().unwrap_or_default();
    let resp = client.fetch_blob(reference, &desc.digest)?;
    let mut blob = HashingReader::new(resp.into_body().into_reader());
    let mut out = HashingWriter::new(BufWriter::new(File::create(path)?));

    if is_gzip(media_type) {
        io::copy(&mut MultiGzDecoder::new(&mut blob), &mut out)?;
    } else if is_plain_tar(media_type) {
        io::copy(&mut blob, &mut out)?;
    } else {
        return Err(Error::UnsupportedMediaType(media_type.to_owned()));
    }

    let diff_id = out.finish()?;
    let actual = blob.finish()?;
    if actual != desc.digest {
        return Err(Error::DigestMismatch {
            expected: desc.digest.clone(),
            actual,
        });
    }
    Ok(diff_id)
}

/// Missing media types are treated as gzip, the Docker default.
fn is_gzip(media_type: &str) -> bool {
    media_type.is_empty() || media_type.ends_with("+gzip") || media_type.ends_with(".tar.gzip")
}

fn is_plain_tar(media_type: &str) -> bool {
    media_type.ends_with(".tar") || media_type.ends_with("diff.tar")
}
