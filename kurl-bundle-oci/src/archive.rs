//! Writer for the docker-archive format (the layout of `docker save`).
//!
//! ```text
//! <diff id hex>.tar     one uncompressed tar per layer
//! <config hex>.json     image config blob
//! manifest.json         [{"Config", "RepoTags", "Layers"}]
//! repositories          {"<repo>": {"<tag>": "<top layer id>"}} (tagged images only)
//! ```
//!
//! Entry headers carry fixed metadata so that the same image always yields
//! the same archive bytes.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::digest;

/// An uncompressed layer tar staged on local disk.
#[derive(Debug)]
pub struct StagedLayer {
    /// Location of the uncompressed tar.
    pub path: PathBuf,
    /// `sha256:` digest of the uncompressed tar.
    pub diff_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestItem<'a> {
    config: &'a str,
    repo_tags: Vec<String>,
    layers: &'a [String],
}

/// Image content to be written as one docker-archive.
#[derive(Debug)]
pub struct ArchiveContents<'a> {
    /// `registry/repo:tag` for tagged references.
    pub repo_tag: Option<String>,
    /// Digest of the config blob.
    pub config_digest: &'a str,
    /// Raw config blob.
    pub config: &'a [u8],
    /// Layers in manifest order (base first).
    pub layers: &'a [StagedLayer],
}

impl ArchiveContents<'_> {
    /// Writes the archive to `dest`, replacing any existing file.
    pub fn write_to(&self, dest: &Path) -> crate::Result<()> {
        let file = BufWriter::new(File::create(dest)?);
        let mut builder = tar::Builder::new(file);

        let mut layer_names = Vec::with_capacity(self.layers.len());
        let mut written = HashSet::new();
        for layer in self.layers {
            let name = format!("{}.tar", digest::hex(&layer.diff_id));
            // Identical layers (e.g. repeated empty layers) are stored once.
            if written.insert(name.clone()) {
                let mut src = File::open(&layer.path)?;
                let size = src.metadata()?.len();
                append(&mut builder, &name, size, &mut src)?;
            }
            layer_names.push(name);
        }

        let config_name = format!("{}.json", digest::hex(self.config_digest));
        append_bytes(&mut builder, &config_name, self.config)?;

        let manifest = [ManifestItem {
            config: &config_name,
            repo_tags: self.repo_tag.iter().cloned().collect(),
            layers: &layer_names,
        }];
        append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

        if let (Some(repo_tag), Some(top)) = (&self.repo_tag, self.layers.last()) {
            if let Some((repo, tag)) = repo_tag.rsplit_once(':') {
                let mut tags = BTreeMap::new();
                tags.insert(tag, digest::hex(&top.diff_id));
                let mut repositories = BTreeMap::new();
                repositories.insert(repo, tags);
                append_bytes(&mut builder, "repositories", &serde_json::to_vec(&repositories)?)?;
            }
        }

        let mut file = builder.into_inner()?;
        file.flush()?;
        Ok(())
    }
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> io::Result<()> {
    append(builder, name, data.len() as u64, data)
}

fn append<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    data: impl Read,
) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, name, data)
}
