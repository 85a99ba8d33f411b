//! Blocking archive reading.
//!
//! Every pass re-opens the archive file and walks headers from the start.
//! The visitor sees each entry with a reader positioned at its data; the
//! reader is only valid for the duration of the callback.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use rustix::io::Errno;
use strum::{Display, EnumString};
use tracing::debug;

use super::entry::ArchiveEntry;
use super::error::ArchiveError;
use crate::vfs::path::ByteString;
use crate::vfs::types::{FileType, PosixPrincipal};

/// Supported container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum ArchiveFormat {
    #[strum(serialize = "tar")]
    Tar,
    #[strum(serialize = "tar.zst")]
    TarZstd,
    #[strum(serialize = "tar.xz")]
    TarXz,
    #[strum(serialize = "zip")]
    Zip,
}

const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];

impl ArchiveFormat {
    /// Guess from the file name's extension.
    pub fn from_name(name: &[u8]) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let ends = |suffix: &str| name.ends_with(suffix.as_bytes());
        if ends(".tar.zst") || ends(".tzst") {
            Some(Self::TarZstd)
        } else if ends(".tar.xz") || ends(".txz") {
            Some(Self::TarXz)
        } else if ends(".tar") {
            Some(Self::Tar)
        } else if ends(".zip") || ends(".jar") || ends(".apk") {
            Some(Self::Zip)
        } else {
            None
        }
    }

    /// Guess from the first bytes of the file.
    pub fn from_magic(head: &[u8]) -> Option<Self> {
        if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
            Some(Self::Zip)
        } else if head.starts_with(ZSTD_MAGIC) {
            Some(Self::TarZstd)
        } else if head.starts_with(XZ_MAGIC) {
            Some(Self::TarXz)
        } else if head.len() >= 262 && &head[257..262] == b"ustar" {
            Some(Self::Tar)
        } else {
            None
        }
    }

    /// Whether [`super::writer::ArchiveSink`] can produce this format.
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Zip)
    }
}

/// Whether to keep walking after a visited entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// An archive file on local disk, either the archive itself or a spooled
/// copy of a remote one.
#[derive(Debug)]
pub struct ArchiveSource {
    path: PathBuf,
    format: ArchiveFormat,
    size: OnceLock<u64>,
    _spool: Option<tempfile::TempPath>,
}

impl ArchiveSource {
    /// Open a local archive. `name` is the archive's own file name, used for
    /// format detection before falling back to magic bytes.
    pub fn open(path: impl Into<PathBuf>, name: &[u8]) -> Result<Self, ArchiveError> {
        let path = path.into();
        let format = detect(&path, name)?;
        debug!(path = %path.display(), %format, "opened archive");
        Ok(Self {
            path,
            format,
            size: OnceLock::new(),
            _spool: None,
        })
    }

    /// Archive spooled to a temporary file, deleted when this is dropped.
    pub fn spooled(spool: tempfile::TempPath, name: &[u8]) -> Result<Self, ArchiveError> {
        let mut source = Self::open(spool.to_path_buf(), name)?;
        source._spool = Some(spool);
        Ok(source)
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Archive size in bytes, queried once.
    pub fn size(&self) -> Result<u64, ArchiveError> {
        if let Some(size) = self.size.get() {
            return Ok(*size);
        }
        let size = std::fs::metadata(&self.path)
            .map_err(|e| ArchiveError::from_io("size", e))?
            .len();
        Ok(*self.size.get_or_init(|| size))
    }

    fn reopen(&self) -> Result<File, ArchiveError> {
        File::open(&self.path).map_err(|e| ArchiveError::from_io("open", e))
    }

    /// Walk every entry in archive order. Encrypted zip entries are opened
    /// with the first password that works; with none, the visitor still
    /// sees the entry but its data fails with `EACCES`.
    pub fn for_each_entry(
        &self,
        passwords: &[String],
        mut visit: impl FnMut(usize, &ArchiveEntry, &mut dyn Read) -> Result<Flow, ArchiveError>,
    ) -> Result<(), ArchiveError> {
        let file = self.reopen()?;
        match self.format {
            ArchiveFormat::Tar => tar_pass(BufReader::new(file), &mut visit),
            ArchiveFormat::TarZstd => {
                let decoder = zstd::stream::read::Decoder::new(file)
                    .map_err(|e| ArchiveError::from_io("open_decoder", e))?;
                tar_pass(decoder, &mut visit)
            }
            ArchiveFormat::TarXz => tar_pass(
                xz2::read::XzDecoder::new(BufReader::new(file)),
                &mut visit,
            ),
            ArchiveFormat::Zip => zip_pass(file, passwords, &mut visit),
        }
    }
}

fn detect(path: &Path, name: &[u8]) -> Result<ArchiveFormat, ArchiveError> {
    if let Some(format) = ArchiveFormat::from_name(name) {
        return Ok(format);
    }
    let mut head = Vec::with_capacity(512);
    File::open(path)
        .and_then(|f| f.take(512).read_to_end(&mut head))
        .map_err(|e| ArchiveError::from_io("detect_format", e))?;
    ArchiveFormat::from_magic(&head).ok_or_else(|| {
        ArchiveError::unsupported("detect_format", "unrecognized archive format")
    })
}

type Visitor<'a> =
    dyn FnMut(usize, &ArchiveEntry, &mut dyn Read) -> Result<Flow, ArchiveError> + 'a;

fn epoch_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

fn principal(id: u64, name: Option<&[u8]>) -> Option<PosixPrincipal> {
    let id = u32::try_from(id).ok()?;
    Some(PosixPrincipal {
        id,
        name: name.filter(|n| !n.is_empty()).map(ByteString::from),
    })
}

fn tar_entry<R: Read>(entry: &tar::Entry<'_, R>) -> ArchiveEntry {
    let header = entry.header();
    let name = entry.path_bytes().into_owned();
    let link = entry.link_name_bytes().map(|l| l.into_owned());
    let (file_type, symlink_target) = match header.entry_type() {
        tar::EntryType::Directory => (FileType::Directory, None),
        tar::EntryType::Symlink => (FileType::Symlink, link),
        // A hard link names another member by its archive path.
        tar::EntryType::Link => (
            FileType::Symlink,
            link.map(|l| {
                let mut absolute = vec![b'/'];
                absolute.extend_from_slice(&l);
                absolute
            }),
        ),
        tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
            (FileType::Regular, None)
        }
        _ => (FileType::Other, None),
    };

    let mut result = ArchiveEntry::new(name, file_type, entry.size());
    if let Ok(mode) = header.mode() {
        result.mode = mode & 0o7777;
    }
    result.last_modified = header.mtime().ok().map(epoch_secs);
    if let Some(gnu) = header.as_gnu() {
        result.last_access = gnu.atime().ok().filter(|&t| t > 0).map(epoch_secs);
        result.creation = gnu.ctime().ok().filter(|&t| t > 0).map(epoch_secs);
    }
    result.owner = header
        .uid()
        .ok()
        .and_then(|uid| principal(uid, header.username_bytes()));
    result.group = header
        .gid()
        .ok()
        .and_then(|gid| principal(gid, header.groupname_bytes()));
    result.symlink_target = symlink_target.map(ByteString::from);
    result
}

fn tar_pass<R: Read>(reader: R, visit: &mut Visitor<'_>) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::from_io("read_headers", e))?;
    for (index, entry) in entries.enumerate() {
        let mut entry = entry.map_err(|e| ArchiveError::from_io("next_header", e))?;
        if matches!(
            entry.header().entry_type(),
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader
        ) {
            continue;
        }
        let meta = tar_entry(&entry);
        if visit(index, &meta, &mut entry)? == Flow::Stop {
            break;
        }
    }
    Ok(())
}

fn zip_time(time: zip::DateTime) -> Option<SystemTime> {
    let date = chrono::NaiveDate::from_ymd_opt(
        i32::from(time.year()),
        u32::from(time.month()),
        u32::from(time.day()),
    )?;
    let datetime = date.and_hms_opt(
        u32::from(time.hour()),
        u32::from(time.minute()),
        u32::from(time.second()),
    )?;
    Some(SystemTime::from(datetime.and_utc()))
}

fn zip_entry(file: &zip::read::ZipFile<'_>, encrypted: bool) -> ArchiveEntry {
    let unix_mode = file.unix_mode();
    let file_type = if file.is_dir() {
        FileType::Directory
    } else {
        match unix_mode {
            Some(mode) if mode & 0o170000 != 0 => FileType::from_mode(mode),
            _ => FileType::Regular,
        }
    };
    let mut entry = ArchiveEntry::new(file.name_raw().to_vec(), file_type, file.size());
    entry.encrypted = encrypted;
    if let Some(mode) = unix_mode {
        entry.mode = mode & 0o7777;
    }
    entry.last_modified = zip_time(file.last_modified());
    entry
}

/// Symlink members store their target as content.
fn read_zip_link(
    file: &mut zip::read::ZipFile<'_>,
    entry: &mut ArchiveEntry,
) -> Result<(), ArchiveError> {
    if entry.file_type.is_symlink() {
        let mut target = Vec::new();
        file.read_to_end(&mut target)
            .map_err(|e| ArchiveError::from_io("read_link", e))?;
        entry.symlink_target = Some(ByteString::from(target));
    }
    Ok(())
}

/// Data of an encrypted member no password opened.
struct Locked;

impl Read for Locked {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(Errno::ACCESS))
    }
}

fn zip_pass(file: File, passwords: &[String], visit: &mut Visitor<'_>) -> Result<(), ArchiveError> {
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::from_zip("open", e))?;
    for index in 0..archive.len() {
        let needs_password = match archive.by_index(index) {
            Ok(mut file) => {
                let mut entry = zip_entry(&file, false);
                read_zip_link(&mut file, &mut entry)?;
                if visit(index, &entry, &mut file)? == Flow::Stop {
                    return Ok(());
                }
                false
            }
            Err(zip::result::ZipError::UnsupportedArchive(msg))
                if msg == zip::result::ZipError::PASSWORD_REQUIRED =>
            {
                true
            }
            Err(e) => return Err(ArchiveError::from_zip("next_header", e)),
        };
        if !needs_password {
            continue;
        }

        let mut opened = false;
        for password in passwords {
            match archive.by_index_decrypt(index, password.as_bytes()) {
                Ok(Ok(mut file)) => {
                    let mut entry = zip_entry(&file, true);
                    read_zip_link(&mut file, &mut entry)?;
                    opened = true;
                    if visit(index, &entry, &mut file)? == Flow::Stop {
                        return Ok(());
                    }
                    break;
                }
                Ok(Err(_)) => continue,
                Err(e) => return Err(ArchiveError::from_zip("decrypt", e)),
            }
        }
        if !opened {
            let file = archive
                .by_index_raw(index)
                .map_err(|e| ArchiveError::from_zip("next_header", e))?;
            let entry = zip_entry(&file, true);
            drop(file);
            if visit(index, &entry, &mut Locked)? == Flow::Stop {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tar_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("fixture.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(6);
        header.set_mode(0o640);
        header.set_mtime(1_700_000_000);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, "docs/report.txt", &b"report"[..])
            .unwrap();
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        builder
            .append_link(&mut link, "latest", "docs/report.txt")
            .unwrap();
        builder.into_inner().unwrap().flush().unwrap();
        path
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ArchiveFormat::from_name(b"a.TAR.ZST"), Some(ArchiveFormat::TarZstd));
        assert_eq!(ArchiveFormat::from_name(b"a.txz"), Some(ArchiveFormat::TarXz));
        assert_eq!(ArchiveFormat::from_name(b"a.apk"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_name(b"a.bin"), None);
        assert_eq!(ArchiveFormat::from_magic(b"PK\x03\x04rest"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_magic(XZ_MAGIC), Some(ArchiveFormat::TarXz));
        assert_eq!(ArchiveFormat::from_magic(b"plain"), None);
        assert_eq!("tar.zst".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarZstd);
    }

    #[test]
    fn test_tar_pass_reads_headers_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = tar_fixture(dir.path());
        // No extension: detected from the ustar magic.
        let source = ArchiveSource::open(&path, b"fixture").unwrap();
        assert_eq!(source.format(), ArchiveFormat::Tar);
        assert_eq!(source.size().unwrap(), std::fs::metadata(&path).unwrap().len());

        let mut seen = Vec::new();
        source
            .for_each_entry(&[], |_, entry, data| {
                let mut content = Vec::new();
                data.read_to_end(&mut content).unwrap();
                seen.push((entry.clone(), content));
                Ok(Flow::Continue)
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.name.as_bytes(), b"docs/report.txt");
        assert_eq!(seen[0].0.mode, 0o640);
        assert_eq!(seen[0].1, b"report");
        assert_eq!(seen[1].0.file_type, FileType::Symlink);
        assert_eq!(
            seen[1].0.symlink_target.as_ref().unwrap().as_bytes(),
            b"docs/report.txt"
        );
    }

    #[test]
    fn test_stop_ends_pass_early() {
        let dir = tempfile::tempdir().unwrap();
        let source = ArchiveSource::open(tar_fixture(dir.path()), b"fixture.tar").unwrap();
        let mut count = 0;
        source
            .for_each_entry(&[], |_, _, _| {
                count += 1;
                Ok(Flow::Stop)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_zip_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = zip::write::FileOptions::default().unix_permissions(0o600);
        writer.add_directory("img/", options).unwrap();
        writer.start_file("img/a.png", options).unwrap();
        writer.write_all(b"png").unwrap();
        writer.finish().unwrap();

        let source = ArchiveSource::open(&path, b"fixture.zip").unwrap();
        let mut names = Vec::new();
        source
            .for_each_entry(&[], |_, entry, data| {
                let mut content = Vec::new();
                data.read_to_end(&mut content).unwrap();
                names.push((entry.name.to_string_lossy(), entry.file_type, content));
                Ok(Flow::Continue)
            })
            .unwrap();
        assert_eq!(names[0].0, "img/");
        assert_eq!(names[0].1, FileType::Directory);
        assert_eq!(names[1].2, b"png");
    }

    #[test]
    fn test_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"not an archive").unwrap();
        let err = ArchiveSource::open(&path, b"blob").unwrap_err();
        assert_eq!(err.errno, Errno::NOTSUP);
    }
}
