//! Mountpoint bootstrap for the shared init layer.
//!
//! Populates a directory with the fixed set of mountpoints used as the
//! top-most read-only layer of every running container, protecting the
//! container from side effects on the writable layer.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{symlink, DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use layerd_core::error::Result;

enum InitEntry {
    Dir,
    File,
    Symlink(&'static str),
}

const INIT_LAYER: &[(&str, InitEntry)] = &[
    ("dev/pts", InitEntry::Dir),
    ("dev/shm", InitEntry::Dir),
    ("proc", InitEntry::Dir),
    ("sys", InitEntry::Dir),
    (".dockerinit", InitEntry::File),
    (".dockerenv", InitEntry::File),
    ("etc/resolv.conf", InitEntry::File),
    ("etc/hosts", InitEntry::File),
    ("etc/hostname", InitEntry::File),
    ("dev/console", InitEntry::File),
    ("etc/mtab", InitEntry::Symlink("/proc/mounts")),
];

/// Populate `root` with the init-layer mountpoints.
///
/// Idempotent: entries that already exist with the correct kind are left
/// alone. Conflicting non-directory path segments are unlinked first.
pub fn setup_init_layer(root: &Path) -> Result<()> {
    for (path, kind) in INIT_LAYER {
        let dest = root.join(path);

        if let Ok(meta) = fs::symlink_metadata(&dest) {
            let matches = match kind {
                InitEntry::Dir => meta.is_dir(),
                InitEntry::File => meta.is_file(),
                InitEntry::Symlink(_) => meta.file_type().is_symlink(),
            };
            if matches {
                continue;
            }
        }

        // Clear any file or symlink squatting on a path segment.
        let mut prefix = PathBuf::new();
        for part in Path::new(path).components() {
            prefix.push(part);
            match fs::remove_file(root.join(&prefix)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                // Directories fail here and stay in place.
                Err(_) => {}
            }
        }

        if let Some(parent) = dest.parent() {
            DirBuilder::new().recursive(true).mode(0o755).create(parent)?;
        }

        match kind {
            InitEntry::Dir => {
                DirBuilder::new().recursive(true).mode(0o755).create(&dest)?;
            }
            InitEntry::File => {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .mode(0o755)
                    .open(&dest)?;
            }
            InitEntry::Symlink(target) => {
                symlink(target, &dest)?;
            }
        }
    }
    Ok(())
}
