//! Self-describing bundle images.
//!
//! A bundle is a tar stream (optionally compressed) whose identity is the
//! SHA-256 of its decompressed bytes. The archive carries a `manifest`
//! document and a `rootfs/` tree; at ingest the rootfs is repacked into a
//! canonical `layer.tar` and handed to the driver, and the ids of any
//! dependencies resolved at that moment are recorded next to the manifest.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use layerd_core::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::archive;

/// Manifest file name inside a bundle directory.
pub const MANIFEST_FILE: &str = "manifest";

/// Canonical layer tar file name inside a bundle directory.
pub const LAYER_FILE: &str = "layer.tar";

/// Recorded parent ids file name inside a bundle directory.
pub const PARENTS_FILE: &str = "parents";

/// Rootfs directory name inside the bundle archive.
pub const ROOTFS_DIR: &str = "rootfs";

/// Decompressed bundle tar staged during ingest.
const BUNDLE_TAR: &str = "bundle.tar";

/// A name/value label attached to a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleLabel {
    pub name: String,
    pub value: String,
}

/// A dependency declared by a bundle manifest, naming a potential parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDependency {
    /// Name of the depended-on bundle.
    pub name: String,
}

/// Parsed bundle manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<BundleLabel>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<BundleDependency>,
}

/// Parse a manifest document.
pub fn parse_manifest(raw: &[u8]) -> Result<BundleManifest> {
    serde_json::from_slice(raw)
        .map_err(|err| GraphError::Malformed(format!("invalid bundle manifest: {}", err)))
}

/// Load the manifest stored in a bundle directory.
pub fn load_manifest(dir: &Path) -> Result<BundleManifest> {
    let raw = fs::read(dir.join(MANIFEST_FILE))?;
    parse_manifest(&raw)
}

/// Record the parent ids resolved at ingest time.
pub(crate) fn save_parents(dir: &Path, parents: &[String]) -> Result<()> {
    let raw = serde_json::to_string(parents)?;
    fs::write(dir.join(PARENTS_FILE), raw)?;
    Ok(())
}

/// Read the parent ids recorded at ingest time. Bundles ingested without
/// resolvable dependencies have no parents file.
pub fn load_parents(dir: &Path) -> Result<Vec<String>> {
    match fs::read(dir.join(PARENTS_FILE)) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Reader adapter feeding everything it reads through a SHA-256 hasher.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Decompress `reader` into `<dir>/bundle.tar`, hashing the decompressed
/// bytes. Returns the tar path and the hex digest that becomes the bundle id.
fn store_decompressed<R: Read>(dir: &Path, reader: R) -> Result<(PathBuf, String)> {
    let decompressed = archive::decompress(reader)?;
    let mut hashing = HashingReader {
        inner: decompressed,
        hasher: Sha256::new(),
    };

    let tar_path = dir.join(BUNDLE_TAR);
    let mut tar_file = File::create(&tar_path)?;
    io::copy(&mut hashing, &mut tar_file)?;
    tar_file.sync_all()?;

    Ok((tar_path, hex::encode(hashing.hasher.finalize())))
}

/// Check that an unpacked bundle has a parsable manifest and a rootfs
/// directory, and return the manifest.
fn validate_unpacked(dir: &Path) -> Result<BundleManifest> {
    let manifest = match load_manifest(dir) {
        Ok(manifest) => manifest,
        Err(err) if err.is_not_found() => {
            return Err(GraphError::Malformed(
                "bundle has no manifest".to_string(),
            ))
        }
        Err(err) => return Err(err),
    };

    let rootfs = dir.join(ROOTFS_DIR);
    match fs::symlink_metadata(&rootfs) {
        Ok(meta) if meta.is_dir() => Ok(manifest),
        Ok(_) => Err(GraphError::Malformed(
            "bundle rootfs must be a directory".to_string(),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(GraphError::Malformed(
            "bundle has no rootfs directory".to_string(),
        )),
        Err(err) => Err(err.into()),
    }
}

/// Ingest a bundle stream into `dir`: decompress and hash, untar, validate.
///
/// On success `dir` holds `manifest` and `rootfs/`, the staged tar is gone,
/// and the returned digest is the bundle id.
pub(crate) fn unpack_bundle<R: Read>(dir: &Path, reader: R) -> Result<(BundleManifest, String)> {
    let (tar_path, digest) = store_decompressed(dir, reader)?;

    let tar_file = File::open(&tar_path)?;
    archive::unpack(tar_file, dir)?;
    fs::remove_file(&tar_path)?;

    let manifest = validate_unpacked(dir)?;
    Ok((manifest, digest))
}

/// Pack the unpacked rootfs into `<dir>/layer.tar` and return the file,
/// rewound and ready to stream into the driver.
pub(crate) fn create_layer_tar(dir: &Path) -> Result<File> {
    let path = dir.join(LAYER_FILE);
    let mut file = File::options()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)?;
    archive::pack(&dir.join(ROOTFS_DIR), &mut file)?;
    file.sync_all()?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}
