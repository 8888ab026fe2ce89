//! Error types for bundle assembly.

use std::io;

use axum::http::StatusCode;

/// Alias for `Result<T, kurl_bundle::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving, validating or streaming a bundle.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The manifest request could not be sent or answered.
    #[error("error fetching {url}")]
    Upstream {
        /// Manifest URL.
        url: String,
        /// Transport failure.
        #[source]
        source: ureq::Error,
    },

    /// The manifest response body could not be read.
    #[error("error reading response body from {url}")]
    UpstreamBody {
        /// Manifest URL.
        url: String,
        /// Read failure.
        #[source]
        source: io::Error,
    },

    /// The manifest service answered with a status other than 2xx or 404.
    #[error("unexpected response status code {status} from {url}")]
    UpstreamStatus {
        /// Manifest URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The manifest body was not a valid bundle manifest.
    #[error("error unmarshaling installer bundle manifest from {url}: {body}")]
    Manifest {
        /// Manifest URL.
        url: String,
        /// Raw body, for diagnosis.
        body: String,
        /// Decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// An image names a registry outside the allowlist.
    #[error("unsupported image registry {0}")]
    DisallowedRegistry(String),

    /// A layer's reachability probe failed at the transport level.
    #[error("error http head {url}")]
    ProbeTransport {
        /// Layer URL.
        url: String,
        /// Transport failure.
        #[source]
        source: ureq::Error,
    },

    /// A layer's reachability probe returned a status other than 200.
    #[error("error http head {url}: unexpected response status code {status}")]
    ProbeStatus {
        /// Layer URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The per-image scratch directory could not be created or removed.
    #[error("error managing scratch directory for image {image}")]
    Scratch {
        /// Image reference.
        image: String,
        /// Filesystem failure.
        #[source]
        source: io::Error,
    },

    /// Pulling or converting an image failed.
    #[error("failed to save docker image archive of {image}")]
    Image {
        /// Image reference.
        image: String,
        /// Puller failure.
        #[source]
        source: kurl_bundle_oci::Error,
    },

    /// Copying a materialized image into the bundle failed.
    #[error("copy file {entry} contents")]
    ImageEntry {
        /// Archive entry name.
        entry: String,
        /// Read or write failure.
        #[source]
        source: io::Error,
    },

    /// A layer download could not be started.
    #[error("error piping {url}")]
    LayerFetch {
        /// Layer URL.
        url: String,
        /// Transport failure.
        #[source]
        source: ureq::Error,
    },

    /// A layer download returned a status other than 200.
    #[error("error piping {url}: unexpected response code {status}")]
    LayerStatus {
        /// Layer URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Decompressing, reading or re-writing a layer entry failed.
    #[error("error piping {url}")]
    LayerCopy {
        /// Layer URL.
        url: String,
        /// Read or write failure.
        #[source]
        source: io::Error,
    },

    /// Writing an inline file entry failed.
    #[error("error writing file {path}")]
    File {
        /// Entry path.
        path: String,
        /// Write failure.
        #[source]
        source: io::Error,
    },

    /// Closing the archive or gzip stream failed.
    #[error("error closing {stream} stream")]
    Finish {
        /// Which stream failed to close (`archive` or `gzip`).
        stream: &'static str,
        /// Write failure.
        #[source]
        source: io::Error,
    },

    /// A blocking task panicked or was cancelled.
    #[error("bundle task failed")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// HTTP status to answer with when this error occurs before the response is committed.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::DisallowedRegistry(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
