//! tar.gz packing, size-bounded splitting and guarded extraction.

use flate2::{
    read::GzDecoder,
    write::GzEncoder,
    Compression,
};
use std::{
    fs::{
        self,
        File,
    },
    io::{
        self,
        BufReader,
        BufWriter,
        Read as _,
        Write,
    },
    path::{
        Component,
        Path,
        PathBuf,
    },
};
use thiserror::Error;
use walkdir::WalkDir;

/// Per-entry allowance for tar headers and padding when deciding to split.
pub const ENTRY_OVERHEAD: u64 = 1024;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive entry '{entry}' escapes the destination directory")]
    PathEscape { entry: String },

    #[error("split size must be positive, got {0}")]
    InvalidSplitSize(i64),

    #[error("failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, ArchiveError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, ArchiveError> {
        self.map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Counts bytes that reach the file, i.e. compressed output.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type PartWriter = tar::Builder<GzEncoder<CountingWriter<BufWriter<File>>>>;

fn open_part(path: &Path) -> Result<PartWriter, ArchiveError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).at(parent)?;
        }
    }
    let file = File::create(path).at(path)?;
    let counter = CountingWriter {
        inner: BufWriter::new(file),
        written: 0,
    };
    let mut builder = tar::Builder::new(GzEncoder::new(counter, Compression::default()));
    builder.follow_symlinks(false);
    Ok(builder)
}

/// Sync-flushes the compressor so the counter covers every entry so far.
fn flushed_size(builder: &mut PartWriter, path: &Path) -> Result<u64, ArchiveError> {
    builder.get_mut().flush().at(path)?;
    Ok(builder.get_ref().get_ref().written)
}

fn close_part(builder: PartWriter, path: &Path) -> Result<u64, ArchiveError> {
    let encoder = builder.into_inner().at(path)?;
    let mut counter = encoder.finish().at(path)?;
    counter.flush().at(path)?;
    Ok(counter.written)
}

struct WalkEntry {
    abs: PathBuf,
    rel: String,
    meta: fs::Metadata,
}

/// Entries under `src` in file-name order, relative with forward slashes.
fn walk(src: &Path, keep: &dyn Fn(&str) -> bool) -> Result<Vec<WalkEntry>, ArchiveError> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || keep(&relative(src, e.path())));
    for entry in walker {
        let entry = entry.map_err(|source| ArchiveError::Walk {
            path: src.to_path_buf(),
            source,
        })?;
        let meta = entry.path().symlink_metadata().at(entry.path())?;
        entries.push(WalkEntry {
            rel: relative(src, entry.path()),
            abs: entry.into_path(),
            meta,
        });
    }
    Ok(entries)
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn append(builder: &mut PartWriter, entry: &WalkEntry) -> Result<(), ArchiveError> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata(&entry.meta);
    let file_type = entry.meta.file_type();
    if file_type.is_file() {
        let file = File::open(&entry.abs).at(&entry.abs)?;
        // Logs keep growing while we read them; stop at the size we recorded.
        builder
            .append_data(&mut header, &entry.rel, file.take(entry.meta.len()))
            .at(&entry.abs)?;
    } else if file_type.is_symlink() {
        let target = fs::read_link(&entry.abs).at(&entry.abs)?;
        header.set_size(0);
        builder.append_link(&mut header, &entry.rel, target).at(&entry.abs)?;
    } else {
        header.set_size(0);
        builder.append_data(&mut header, &entry.rel, io::empty()).at(&entry.abs)?;
    }
    Ok(())
}

/// Writes `src` as one gzip-compressed tar at `dest`. `keep` sees relative
/// forward-slash paths; rejecting a directory skips its contents.
pub fn compact(src: &Path, dest: &Path, keep: impl Fn(&str) -> bool) -> Result<(), ArchiveError> {
    let entries = walk(src, &keep)?;
    let mut builder = open_part(dest)?;
    for entry in &entries {
        append(&mut builder, entry)?;
    }
    let written = close_part(builder, dest)?;
    debug!(src = %src.display(), dest = %dest.display(), entries = entries.len(), bytes = written, "archive written");
    Ok(())
}

pub fn part_name(prefix: &Path, index: usize) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".part{index:03}.tar.gz"));
    PathBuf::from(name)
}

/// Like [`compact`] but starts a new `<prefix>.partNNN.tar.gz` whenever the
/// next entry could push the current part past `max_bytes`. A part always
/// receives at least one entry.
pub fn compact_split(
    src: &Path,
    dest_prefix: &Path,
    max_bytes: i64,
    keep: impl Fn(&str) -> bool,
) -> Result<Vec<PathBuf>, ArchiveError> {
    if max_bytes <= 0 {
        return Err(ArchiveError::InvalidSplitSize(max_bytes));
    }
    let max_bytes = max_bytes as u64;
    let entries = walk(src, &keep)?;

    let mut parts = vec![part_name(dest_prefix, 1)];
    let mut builder = open_part(&parts[0])?;
    let mut in_part = 0usize;
    for entry in &entries {
        let current = parts.len() - 1;
        let estimate = if entry.meta.is_file() { entry.meta.len() } else { 0 };
        if in_part > 0 && flushed_size(&mut builder, &parts[current])? + estimate + ENTRY_OVERHEAD > max_bytes {
            let size = close_part(builder, &parts[current])?;
            debug!(part = %parts[current].display(), bytes = size, entries = in_part, "archive part finished");
            parts.push(part_name(dest_prefix, parts.len() + 1));
            builder = open_part(&parts[parts.len() - 1])?;
            in_part = 0;
        }
        append(&mut builder, entry)?;
        in_part += 1;
    }
    let last = parts.len() - 1;
    close_part(builder, &parts[last])?;
    info!(src = %src.display(), parts = parts.len(), "split archive written");
    Ok(parts)
}

/// Resolves an entry name below the destination; `..` may not climb out.
fn sanitize(name: &str) -> Result<PathBuf, ArchiveError> {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {},
            ".." => {
                if parts.pop().is_none() {
                    return Err(ArchiveError::PathEscape {
                        entry: name.to_string(),
                    });
                }
            },
            other => parts.push(other),
        }
    }
    Ok(parts.iter().collect())
}

/// Streams `tar_gz` into `dest`, optionally removing `strip_prefix` from
/// every entry name first. Returns the number of file bytes written.
pub fn extract(tar_gz: &Path, dest: &Path, strip_prefix: Option<&str>) -> Result<u64, ArchiveError> {
    let file = File::open(tar_gz).at(tar_gz)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    fs::create_dir_all(dest).at(dest)?;
    let strip = strip_prefix.map(|p| p.replace('\\', "/").trim_matches('/').to_string());

    let mut total = 0u64;
    for entry in archive.entries().at(tar_gz)? {
        let mut entry = entry.at(tar_gz)?;
        let raw = entry.path().at(tar_gz)?.to_string_lossy().replace('\\', "/");
        let mut name = raw.trim_start_matches('/').to_string();
        if let Some(strip) = strip.as_deref().filter(|s| !s.is_empty()) {
            if let Some(rest) = name.strip_prefix(strip) {
                name = rest.trim_start_matches('/').to_string();
            }
        }
        let rel = sanitize(&name)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&rel);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target).at(&target)?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }
            let mut out = File::create(&target).at(&target)?;
            total += io::copy(&mut entry, &mut out).at(&target)?;
            if let Ok(mode) = entry.header().mode() {
                set_mode(&target, mode)?;
            }
        } else {
            trace!(entry = %name, ?entry_type, "skipping non-regular entry");
        }
    }
    info!(archive = %tar_gz.display(), dest = %dest.display(), bytes = total, "extracted archive");
    Ok(total)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt as _;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)).at(path)
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ArchiveError> {
    Ok(())
}

/// gzip `src` into `dest`, returning the compressed size.
pub fn gzip_file(src: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    let mut input = BufReader::new(File::open(src).at(src)?);
    let file = File::create(dest).at(dest)?;
    let mut encoder = GzEncoder::new(
        CountingWriter {
            inner: BufWriter::new(file),
            written: 0,
        },
        Compression::default(),
    );
    io::copy(&mut input, &mut encoder).at(src)?;
    let mut counter = encoder.finish().at(dest)?;
    counter.flush().at(dest)?;
    Ok(counter.written)
}
