//! Image materialization into per-request scratch space.

use std::fmt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{Error, Result};

/// Prefix of every per-image scratch directory.
pub const SCRATCH_PREFIX: &str = "temp-image-pull";

/// File name of the materialized archive inside its scratch directory.
pub const ARCHIVE_FILE: &str = "temp-archive-image";

/// Turns an image reference into a single-file archive on local disk.
///
/// Implementations run on a blocking thread and may take as long as the
/// pull takes; `workdir` is exclusively theirs for the duration of the call.
pub trait ImageMaterializer: Send + Sync + fmt::Debug {
    /// Materializes `image` inside `workdir`, returning the archive path.
    fn materialize(&self, image: &str, workdir: &Path) -> kurl_bundle_oci::Result<PathBuf>;
}

/// Pulls from the image's registry and writes a docker-archive.
#[derive(Debug, Clone)]
pub struct RegistryMaterializer {
    /// Registry client writing docker-archives.
    puller: kurl_bundle_oci::Puller,
}

impl RegistryMaterializer {
    /// Creates a materializer pulling through `agent`.
    pub const fn new(agent: ureq::Agent) -> Self {
        Self {
            puller: kurl_bundle_oci::Puller::new(agent),
        }
    }
}

impl ImageMaterializer for RegistryMaterializer {
    fn materialize(&self, image: &str, workdir: &Path) -> kurl_bundle_oci::Result<PathBuf> {
        let dest = workdir.join(ARCHIVE_FILE);
        self.puller.save(image, workdir, &dest)?;
        Ok(dest)
    }
}

/// One image being pulled: owns a unique scratch directory for its lifetime.
///
/// The directory is removed when the job is dropped, whatever path the
/// caller leaves by; [`ImagePullJob::finish`] removes it eagerly and reports
/// failures.
#[derive(Debug)]
pub struct ImagePullJob<'a> {
    /// Reference being pulled.
    image: &'a str,
    /// Scratch directory, removed on drop.
    workdir: TempDir,
}

impl<'a> ImagePullJob<'a> {
    /// Creates the scratch directory under `scratch_root`.
    pub fn create(image: &'a str, scratch_root: &Path) -> Result<Self> {
        let workdir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(scratch_root)
            .map_err(|source| Error::Scratch {
                image: image.to_owned(),
                source,
            })?;
        tracing::debug!(image, workdir = %workdir.path().display(), "scratch directory created");
        Ok(Self { image, workdir })
    }

    /// Runs `materializer` into this job's directory.
    pub fn materialize(&self, materializer: &dyn ImageMaterializer) -> Result<PathBuf> {
        materializer
            .materialize(self.image, self.workdir.path())
            .map_err(|source| Error::Image {
                image: self.image.to_owned(),
                source,
            })
    }

    /// Removes the scratch directory now.
    pub fn finish(self) -> Result<()> {
        let image = self.image;
        self.workdir.close().map_err(|source| Error::Scratch {
            image: image.to_owned(),
            source,
        })
    }
}
