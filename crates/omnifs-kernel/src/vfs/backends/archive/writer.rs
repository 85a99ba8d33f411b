//! Forward-only archive writing.
//!
//! Entries go out one at a time: header first, then exactly `size` bytes of
//! content for regular files, nothing for directories and symlinks.

use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::SystemTime;

use super::codec::ArchiveFormat;
use super::entry::ArchiveEntry;
use super::error::ArchiveError;
use crate::vfs::types::FileType;

enum Compressor<W: Write> {
    Plain(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Xz(xz2::write::XzEncoder<W>),
}

impl<W: Write> Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Plain(w) => Ok(w),
            Compressor::Zstd(e) => e.finish(),
            Compressor::Xz(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Plain(w) => w.write(buf),
            Compressor::Zstd(e) => e.write(buf),
            Compressor::Xz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Plain(w) => w.flush(),
            Compressor::Zstd(e) => e.flush(),
            Compressor::Xz(e) => e.flush(),
        }
    }
}

/// Writes a tar-family archive to `W`.
pub struct ArchiveSink<W: Write> {
    builder: tar::Builder<Compressor<W>>,
}

fn unix_secs(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

impl<W: Write> ArchiveSink<W> {
    pub fn new(inner: W, format: ArchiveFormat) -> Result<Self, ArchiveError> {
        let compressor = match format {
            ArchiveFormat::Tar => Compressor::Plain(inner),
            ArchiveFormat::TarZstd => Compressor::Zstd(
                zstd::stream::write::Encoder::new(inner, 0)
                    .map_err(|e| ArchiveError::from_io("open_encoder", e))?,
            ),
            ArchiveFormat::TarXz => Compressor::Xz(xz2::write::XzEncoder::new(inner, 6)),
            ArchiveFormat::Zip => {
                return Err(ArchiveError::unsupported(
                    "open_writer",
                    "writing zip archives is not supported",
                ));
            }
        };
        let mut builder = tar::Builder::new(compressor);
        builder.follow_symlinks(false);
        Ok(Self { builder })
    }

    fn header(entry: &ArchiveEntry) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(match entry.file_type {
            FileType::Directory => tar::EntryType::Directory,
            FileType::Symlink => tar::EntryType::Symlink,
            _ => tar::EntryType::Regular,
        });
        header.set_size(if entry.file_type.is_file() { entry.size } else { 0 });
        header.set_mode(entry.mode);
        header.set_mtime(unix_secs(entry.last_modified));
        if let Some(owner) = &entry.owner {
            header.set_uid(u64::from(owner.id));
            if let Some(name) = &owner.name {
                // Names that do not fit the field are dropped.
                let _ = header.set_username(&name.to_string_lossy());
            }
        }
        if let Some(group) = &entry.group {
            header.set_gid(u64::from(group.id));
            if let Some(name) = &group.name {
                let _ = header.set_groupname(&name.to_string_lossy());
            }
        }
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(unix_secs(entry.last_access));
            gnu.set_ctime(unix_secs(entry.creation));
        }
        header
    }

    /// Append one entry. `content` must yield exactly `entry.size` bytes for
    /// regular files and is ignored otherwise.
    pub fn write_entry(
        &mut self,
        entry: &ArchiveEntry,
        content: Option<&mut dyn Read>,
    ) -> Result<(), ArchiveError> {
        let mut header = Self::header(entry);
        let mut name = entry.name.as_bytes().to_vec();
        if entry.file_type.is_dir() && !name.ends_with(b"/") {
            name.push(b'/');
        }
        let path = Path::new(OsStr::from_bytes(&name));
        match entry.file_type {
            FileType::Symlink => {
                let target = entry
                    .symlink_target
                    .as_ref()
                    .map(|t| t.as_bytes())
                    .unwrap_or_default();
                self.builder
                    .append_link(&mut header, path, OsStr::from_bytes(target))
                    .map_err(|e| ArchiveError::from_io("write_header", e))
            }
            FileType::Regular => {
                let Some(content) = content else {
                    return Err(ArchiveError::new(
                        rustix::io::Errno::INVAL,
                        "write_data",
                        "regular entry without content",
                    ));
                };
                self.builder
                    .append_data(&mut header, path, content.take(entry.size))
                    .map_err(|e| ArchiveError::from_io("write_data", e))
            }
            _ => self
                .builder
                .append_data(&mut header, path, io::empty())
                .map_err(|e| ArchiveError::from_io("write_header", e)),
        }
    }

    /// Write the end-of-archive marker, flush the compressor and return the
    /// underlying writer.
    pub fn finish(self) -> Result<W, ArchiveError> {
        let compressor = self
            .builder
            .into_inner()
            .map_err(|e| ArchiveError::from_io("finish", e))?;
        compressor
            .finish()
            .map_err(|e| ArchiveError::from_io("finish", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::backends::archive::codec::{ArchiveSource, Flow};
    use crate::vfs::path::ByteString;
    use crate::vfs::types::PosixPrincipal;

    fn write_fixture(format: ArchiveFormat, path: &Path) {
        let mut sink = ArchiveSink::new(std::fs::File::create(path).unwrap(), format).unwrap();
        sink.write_entry(&ArchiveEntry::directory("docs"), None).unwrap();
        let mut report = ArchiveEntry::new("docs/report.txt", FileType::Regular, 5);
        report.owner = Some(PosixPrincipal {
            id: 1000,
            name: Some(ByteString::from("alice")),
        });
        report.last_modified = Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(86_400));
        sink.write_entry(&report, Some(&mut &b"hello"[..])).unwrap();
        sink.write_entry(&ArchiveEntry::symlink("latest", "docs/report.txt"), None)
            .unwrap();
        sink.finish().unwrap();
    }

    #[test]
    fn test_written_archives_read_back() {
        let dir = tempfile::tempdir().unwrap();
        for format in [ArchiveFormat::Tar, ArchiveFormat::TarZstd, ArchiveFormat::TarXz] {
            let path = dir.path().join(format!("out.{format}"));
            write_fixture(format, &path);

            let source = ArchiveSource::open(&path, b"out").unwrap();
            assert_eq!(source.format(), format);
            let mut entries = Vec::new();
            source
                .for_each_entry(&[], |_, entry, data| {
                    let mut content = Vec::new();
                    data.read_to_end(&mut content).unwrap();
                    entries.push((entry.clone(), content));
                    Ok(Flow::Continue)
                })
                .unwrap();
            assert_eq!(entries.len(), 3, "{format}");
            assert_eq!(entries[0].0.name.as_bytes(), b"docs/");
            assert_eq!(entries[1].1, b"hello");
            let owner = entries[1].0.owner.as_ref().unwrap();
            assert_eq!(owner.id, 1000);
            assert_eq!(owner.name.as_ref().unwrap().as_bytes(), b"alice");
            assert_eq!(entries[2].0.file_type, FileType::Symlink);
        }
    }

    #[test]
    fn test_zip_output_unsupported() {
        let err = ArchiveSink::new(Vec::new(), ArchiveFormat::Zip).err().unwrap();
        assert_eq!(err.errno, rustix::io::Errno::NOTSUP);
    }
}
