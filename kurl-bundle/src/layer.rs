//! Streams remote layer archives into the bundle under a fixed prefix.

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::error::{Error, Result};

/// Directory every layer entry is re-rooted under.
pub const LAYER_PREFIX: &str = "kurl";

/// Downloads `url`, a gzip tar, and appends each entry to `dst` under [`LAYER_PREFIX`].
///
/// Entries are copied one at a time; the layer is never held in full.
pub fn relay<W: Write>(agent: &ureq::Agent, url: &str, dst: &mut tar::Builder<W>) -> Result<()> {
    let resp = agent.get(url).call().map_err(|source| Error::LayerFetch {
        url: url.to_owned(),
        source,
    })?;
    let status = resp.status().as_u16();
    if status != 200 {
        return Err(Error::LayerStatus {
            url: url.to_owned(),
            status,
        });
    }

    let copied = copy_entries(resp.into_body().into_reader(), dst).map_err(|source| {
        Error::LayerCopy {
            url: url.to_owned(),
            source,
        }
    })?;
    tracing::debug!(url, entries = copied, "layer relayed");
    Ok(())
}

/// Copies all entries of the gzip tar `src` into `dst`, re-rooted. Returns the entry count.
///
/// Every gzip member is read, so a layer made of concatenated members is copied whole.
pub fn copy_entries<R: Read, W: Write>(src: R, dst: &mut tar::Builder<W>) -> io::Result<usize> {
    let mut archive = tar::Archive::new(MultiGzDecoder::new(src));
    let mut count = 0;
    for item in archive.entries()? {
        let mut entry = item?;
        let path = reroot(&entry.path()?);
        let mut header = entry.header().clone();
        let kind = header.entry_type();
        let link = entry.link_name()?.map(Cow::into_owned);

        match link {
            Some(target) if kind.is_symlink() || kind.is_hard_link() => {
                dst.append_link(&mut header, &path, &target)?;
            }
            _ => dst.append_data(&mut header, &path, &mut entry)?,
        }
        count += 1;
    }
    Ok(count)
}

/// Joins `path` onto [`LAYER_PREFIX`] the way a lexical path join does.
///
/// `.` and leading `/` vanish and `..` removes the previous component, but
/// never climbs above the prefix.
pub fn reroot(path: &Path) -> PathBuf {
    let mut out = PathBuf::from(LAYER_PREFIX);
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::ParentDir if depth > 0 => {
                out.pop();
                depth -= 1;
            }
            Component::ParentDir | Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for (name, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            builder.append_data(&mut header, name, *body).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn unpacked(tar_bytes: &[u8]) -> BTreeMap<String, (Vec<u8>, u32)> {
        let mut archive = tar::Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut e = entry.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let mode = e.header().mode().unwrap();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (name, (data, mode))
            })
            .collect()
    }

    #[test]
    fn reroot_prefixes_and_normalizes() {
        assert_eq!(reroot(Path::new("foo/bar.txt")), Path::new("kurl/foo/bar.txt"));
        assert_eq!(reroot(Path::new("./foo/./bar")), Path::new("kurl/foo/bar"));
        assert_eq!(reroot(Path::new("/abs/file")), Path::new("kurl/abs/file"));
        assert_eq!(reroot(Path::new("a/../b")), Path::new("kurl/b"));
        assert_eq!(reroot(Path::new("../../etc/passwd")), Path::new("kurl/etc/passwd"));
        assert_eq!(reroot(Path::new("./")), Path::new("kurl"));
    }

    #[test]
    fn entries_are_rerooted_with_content_and_mode() {
        let src = layer(&[("foo/bar.txt", b"hello"), ("packages/k8s.tar", b"bin")]);
        let mut dst = tar::Builder::new(Vec::new());
        let n = copy_entries(&src[..], &mut dst).unwrap();
        assert_eq!(n, 2);

        let out = unpacked(&dst.into_inner().unwrap());
        assert_eq!(out["kurl/foo/bar.txt"], (b"hello".to_vec(), 0o755));
        assert_eq!(out["kurl/packages/k8s.tar"].0, b"bin");
    }

    #[test]
    fn long_paths_survive() {
        let long = format!("{}/file.txt", "d".repeat(120));
        let src = layer(&[(long.as_str(), b"x")]);
        let mut dst = tar::Builder::new(Vec::new());
        copy_entries(&src[..], &mut dst).unwrap();
        let out = unpacked(&dst.into_inner().unwrap());
        assert!(out.contains_key(&format!("kurl/{long}")));
    }

    #[test]
    fn symlinks_keep_their_target() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, "bin/kubectl", "../opt/kubectl").unwrap();
        let src = builder.into_inner().unwrap().finish().unwrap();

        let mut dst = tar::Builder::new(Vec::new());
        copy_entries(&src[..], &mut dst).unwrap();
        let bytes = dst.into_inner().unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap(), Path::new("kurl/bin/kubectl"));
        assert_eq!(entry.link_name().unwrap().unwrap(), Path::new("../opt/kubectl"));
    }

    #[test]
    fn concatenated_gzip_members_are_all_relayed() {
        let mut plain = tar::Builder::new(Vec::new());
        for (name, body) in [("a.txt", b"first"), ("b.txt", b"other")] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            plain.append_data(&mut header, name, &body[..]).unwrap();
        }
        let raw = plain.into_inner().unwrap();

        // Split inside the tar stream: the second entry lives in the second member.
        let mut src = Vec::new();
        for part in [&raw[..512 * 2], &raw[512 * 2..]] {
            let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
            gz.write_all(part).unwrap();
            src.extend(gz.finish().unwrap());
        }

        let mut dst = tar::Builder::new(Vec::new());
        assert_eq!(copy_entries(&src[..], &mut dst).unwrap(), 2);
        let out = unpacked(&dst.into_inner().unwrap());
        assert_eq!(out["kurl/a.txt"].0, b"first");
        assert_eq!(out["kurl/b.txt"].0, b"other");
    }

    #[test]
    fn corrupt_layer_is_an_error() {
        let mut dst = tar::Builder::new(Vec::new());
        assert!(copy_entries(&b"not gzip at all"[..], &mut dst).is_err());
    }
}
