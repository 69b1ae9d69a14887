//! Tar pack/unpack codec for layer ingress and egress.
//!
//! Ingress streams may be gzip, bzip2, or xz compressed; the codec sniffs the
//! magic bytes and wraps the stream in the matching decompressor. Egress is
//! always raw uncompressed tar. Both directions stream; neither materializes
//! the whole archive in memory.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use layerd_core::error::{GraphError, Result};
use tar::{Archive, Builder, EntryType};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Sniff the compression magic of `reader` and wrap it in the matching
/// decompressor. Streams with no recognized magic pass through unchanged.
pub fn decompress<'a, R: Read + 'a>(mut reader: R) -> Result<Box<dyn Read + 'a>> {
    let mut magic = [0u8; 6];
    let n = read_at_most(&mut reader, &mut magic)?;
    let stream = io::Cursor::new(magic[..n].to_vec()).chain(reader);

    if magic[..n].starts_with(&GZIP_MAGIC) {
        Ok(Box::new(flate2::read::GzDecoder::new(stream)))
    } else if magic[..n].starts_with(&BZIP2_MAGIC) {
        Ok(Box::new(bzip2::read::BzDecoder::new(stream)))
    } else if magic[..n].starts_with(&XZ_MAGIC) {
        Ok(Box::new(xz2::read::XzDecoder::new(stream)))
    } else {
        Ok(Box::new(stream))
    }
}

/// Read up to `buf.len()` bytes, stopping early only at end of stream.
fn read_at_most<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Unpack a tar stream (optionally compressed) into `target`.
///
/// Regular files and directories are materialized with the mode carried in
/// their headers; symlinks are recreated. Hardlinks, devices, and fifos are
/// skipped. Entry paths that would escape `target` are rejected.
///
/// `target` must be a freshly created directory under a controlled root;
/// the graph guarantees that by unpacking into scratch directories only.
pub fn unpack<R: Read>(reader: R, target: &Path) -> Result<()> {
    let decompressed = decompress(reader)?;
    let mut archive = Archive::new(decompressed);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let dest = join_checked(target, &rel)?;
        let mode = entry.header().mode()?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&dest)?;
                io::copy(&mut entry, &mut file)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Symlink => {
                let link = entry.link_name()?.ok_or_else(|| {
                    GraphError::Malformed(format!(
                        "symlink entry '{}' has no link target",
                        rel.display()
                    ))
                })?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                match fs::remove_file(&dest) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                symlink(link.as_ref(), &dest)?;
            }
            other => {
                tracing::debug!(
                    entry = %rel.display(),
                    kind = ?other,
                    "skipping unsupported tar entry"
                );
            }
        }
    }
    Ok(())
}

/// Join an archive entry path onto `target`, rejecting components that would
/// escape it.
fn join_checked(target: &Path, rel: &Path) -> Result<PathBuf> {
    let mut out = target.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(GraphError::Malformed(format!(
                    "tar entry path '{}' escapes the unpack root",
                    rel.display()
                )))
            }
        }
    }
    Ok(out)
}

/// Pack the contents of `root` into a raw tar stream written to `writer`.
///
/// Walks depth-first; every non-directory entry is written with its name
/// made relative to `root`. Directory entries are not emitted (they
/// materialize implicitly when their children are unpacked). Symlinks are
/// preserved as symlink entries; sockets and other special files are
/// skipped. The first walk error aborts the pack.
pub fn pack<W: Write>(root: &Path, writer: W) -> Result<()> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);
    append_dir(&mut builder, root, root)?;
    builder.finish()?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut Builder<W>, root: &Path, current: &Path) -> Result<()> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            append_dir(builder, root, &path)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            let rel = path.strip_prefix(root).map_err(|_| {
                GraphError::Malformed(format!(
                    "walked path '{}' is outside the pack root",
                    path.display()
                ))
            })?;
            builder.append_path_with_name(&path, rel)?;
        }
    }
    Ok(())
}

/// A layer archive fully buffered to a scratch file, deleted when dropped.
///
/// Buffering to disk lets the caller consume the stream with seek semantics
/// and releases driver-side resources as soon as the buffering copy is done.
pub struct TempArchive {
    file: File,
    path: PathBuf,
    size: u64,
}

impl TempArchive {
    /// Drain `reader` into the file at `path`, sync, rewind, and return a
    /// self-deleting handle.
    pub fn new<R: Read>(mut reader: R, path: PathBuf) -> Result<Self> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let size = io::copy(&mut reader, &mut file)?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self { file, path, size })
    }

    /// Number of bytes buffered.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for TempArchive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for TempArchive {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to remove temp archive");
        }
    }
}

/// Reader adapter reporting the cumulative byte count to a callback.
pub struct ProgressReader<R> {
    inner: R,
    total: u64,
    progress: Box<dyn FnMut(u64) + Send>,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, progress: Box<dyn FnMut(u64) + Send>) -> Self {
        Self {
            inner,
            total: 0,
            progress,
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.total += n as u64;
            (self.progress)(self.total);
        }
        Ok(n)
    }
}
