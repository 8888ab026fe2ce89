//! kURL installer bundle server.
//!
//! Serves `GET /bundle/{installerID}` (and the version-pinned
//! `/bundle/version/{kurlVersion}/{installerID}`) by resolving the
//! installer's manifest upstream, validating it, and streaming one gzip tar
//! holding container images, remote layers and inline files.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kurl_bundle::{Bundler, Config};
//!
//! # async fn run() -> std::io::Result<()> {
//! let config = Config::default().upstream("http://kurl-api:3000");
//! let listener = tokio::net::TcpListener::bind(config.listen).await?;
//! let bundler = Arc::new(Bundler::builder(config).build());
//! kurl_bundle::serve(bundler, listener, std::future::pending()).await
//! # }
//! ```

mod allowlist;
mod compose;
mod config;
mod error;
mod handler;
mod image;
mod layer;
mod manifest;
mod preflight;
mod server;
mod stream;
mod telemetry;

pub use allowlist::{DEFAULT_REGISTRIES, RegistryAllowlist, apex_domain};
pub use compose::{Compositor, image_entry_name};
pub use config::{Config, DEFAULT_LISTEN, DEFAULT_SCRATCH_DIR, DEFAULT_UPSTREAM};
pub use error::{Error, Result};
pub use handler::{Bundler, BundlerBuilder, Phase, router};
pub use image::{ARCHIVE_FILE, ImageMaterializer, ImagePullJob, RegistryMaterializer, SCRATCH_PREFIX};
pub use layer::{LAYER_PREFIX, copy_entries, reroot};
pub use manifest::{BundleManifest, InstallerRequest, Lookup, ManifestResolver};
pub use preflight::Preflight;
pub use server::serve;
pub use stream::{AbortHandle, CHANNEL_DEPTH, CHUNK_SIZE, ChunkWriter, channel};
pub use telemetry::{LogReporter, Reporter, RequestContext, chain};
