//! Sequential composition of a bundle archive.
//!
//! Producers run in a fixed order against one gzip tar sink: images, then
//! layers, then inline files. Images go first because they are the slowest
//! and most failure-prone step.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{EntryType, Header};

use crate::error::{Error, Result};
use crate::image::{ImageMaterializer, ImagePullJob};
use crate::layer;

/// Mode of image and inline file entries.
const ENTRY_MODE: u32 = 0o644;

/// Width of the name field in a tar header.
const NAME_FIELD: usize = 100;

/// Name of the pseudo-entry carrying a GNU long name.
const LONG_LINK: &[u8] = b"././@LongLink";

/// Archive path of the image at position `index` in the manifest.
pub fn image_entry_name(index: usize) -> String {
    format!("kurl/image-overrides/{index}.tar")
}

/// Owns the outgoing archive: a tar stream layered on a gzip stream layered on `W`.
pub struct Compositor<W: Write> {
    /// Tar stream over the gzip stream over the sink.
    archive: tar::Builder<GzEncoder<W>>,
}

impl<W: Write> std::fmt::Debug for Compositor<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compositor").finish_non_exhaustive()
    }
}

impl<W: Write> Compositor<W> {
    /// Starts a new archive writing into `sink`.
    pub fn new(sink: W) -> Self {
        Self {
            archive: tar::Builder::new(GzEncoder::new(sink, Compression::default())),
        }
    }

    /// Pulls each image into its own scratch directory under `scratch_root`
    /// and appends it as `kurl/image-overrides/<i>.tar`.
    ///
    /// Only one scratch directory is alive at a time.
    pub fn append_images(
        &mut self,
        images: &[String],
        materializer: &dyn ImageMaterializer,
        scratch_root: &Path,
    ) -> Result<()> {
        for (index, image) in images.iter().enumerate() {
            tracing::debug!(image, index, "materializing image");
            let job = ImagePullJob::create(image, scratch_root)?;
            let archive_path = job.materialize(materializer)?;
            self.append_image_file(index, &archive_path)?;
            job.finish()?;
        }
        Ok(())
    }

    /// Appends the archive at `path` as image entry `index`.
    fn append_image_file(&mut self, index: usize, path: &Path) -> Result<()> {
        let entry = image_entry_name(index);
        let io_err = |source| Error::ImageEntry {
            entry: entry.clone(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();
        let mut header = regular_header(size);
        self.archive
            .append_data(&mut header, &entry, file)
            .map_err(io_err)
    }

    /// Relays each layer URL, re-rooted under `kurl/`.
    pub fn append_layers(&mut self, layers: &[String], agent: &ureq::Agent) -> Result<()> {
        for url in layers {
            tracing::debug!(url, "relaying layer");
            layer::relay(agent, url, &mut self.archive)?;
        }
        Ok(())
    }

    /// Writes inline files in path order.
    ///
    /// Names go into the archive byte for byte: absolute paths, `.` and `..`
    /// segments are kept as the manifest spells them.
    pub fn append_files(&mut self, files: &BTreeMap<String, String>) -> Result<()> {
        for (path, contents) in files {
            append_verbatim(&mut self.archive, path.as_bytes(), contents.as_bytes()).map_err(
                |source| Error::File {
                    path: path.clone(),
                    source,
                },
            )?;
        }
        Ok(())
    }

    /// Closes the tar stream, then the gzip stream, then flushes the sink.
    ///
    /// Returns the sink so callers can decide how to end the transfer.
    pub fn finish(self) -> Result<W> {
        let gzip = self.archive.into_inner().map_err(|source| Error::Finish {
            stream: "archive",
            source,
        })?;
        let mut sink = gzip.finish().map_err(|source| Error::Finish {
            stream: "gzip",
            source,
        })?;
        sink.flush().map_err(|source| Error::Finish {
            stream: "gzip",
            source,
        })?;
        Ok(sink)
    }
}

/// Appends a regular entry named exactly `name`, bypassing path normalization.
///
/// Names longer than the header field are preceded by a GNU long-name entry.
fn append_verbatim<W: Write>(
    archive: &mut tar::Builder<W>,
    name: &[u8],
    contents: &[u8],
) -> io::Result<()> {
    if name.len() > NAME_FIELD {
        let mut long = Header::new_gnu();
        long.set_entry_type(EntryType::GNULongName);
        long.set_size(name.len() as u64 + 1);
        long.set_mode(ENTRY_MODE);
        long.set_mtime(0);
        set_name(&mut long, LONG_LINK);
        long.set_cksum();
        let mut terminated = name.to_vec();
        terminated.push(0);
        archive.append(&long, terminated.as_slice())?;
    }

    let mut header = regular_header(contents.len() as u64);
    set_name(&mut header, &name[..name.len().min(NAME_FIELD)]);
    header.set_cksum();
    archive.append(&header, contents)
}

/// Overwrites the raw name field of `header`.
fn set_name(header: &mut Header, name: &[u8]) {
    let field = &mut header.as_old_mut().name;
    field.fill(0);
    field[..name.len()].copy_from_slice(name);
}

/// Regular-file header with the bundle's fixed mode and the current time.
fn regular_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(ENTRY_MODE);
    header.set_mtime(now());
    header
}

/// Seconds since the Unix epoch, or zero if the clock is before it.
fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
