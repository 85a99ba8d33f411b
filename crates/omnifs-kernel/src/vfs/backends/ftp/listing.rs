//! Directory listing parsers: Unix-style `LIST` and RFC 3659 `MLSD`.

use std::time::SystemTime;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::vfs::types::FileType;

/// One parsed listing line. Names are raw wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEntry {
    pub name: Vec<u8>,
    pub file_type: FileType,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub symlink_target: Option<Vec<u8>>,
}

impl FtpEntry {
    pub fn new(name: impl Into<Vec<u8>>, file_type: FileType) -> Self {
        Self {
            name: name.into(),
            file_type,
            size: 0,
            modified: None,
            mode: None,
            owner: None,
            group: None,
            symlink_target: None,
        }
    }

    fn is_dot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

/// Parse a full listing, skipping lines that are not entries.
pub fn parse_listing(data: &[u8], mlsd: bool, now: SystemTime) -> Vec<FtpEntry> {
    data.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let entry = if mlsd {
                parse_mlsd_line(line)
            } else {
                parse_unix_line(line, now)
            };
            if entry.is_none() {
                tracing::debug!(line = %String::from_utf8_lossy(line), "skipping listing line");
            }
            entry
        })
        .filter(|entry| !entry.is_dot())
        .collect()
}

/// `type=file;size=12;modify=20240101120000; name`
pub fn parse_mlsd_line(line: &[u8]) -> Option<FtpEntry> {
    let space = line.iter().position(|&b| b == b' ')?;
    let (facts, name) = (&line[..space], &line[space + 1..]);
    if name.is_empty() {
        return None;
    }
    let mut entry = FtpEntry::new(name, FileType::Regular);
    for fact in facts.split(|&b| b == b';').filter(|f| !f.is_empty()) {
        let fact = std::str::from_utf8(fact).ok()?;
        let (key, value) = fact.split_once('=')?;
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                entry.file_type = match value.to_ascii_lowercase().as_str() {
                    "file" => FileType::Regular,
                    "dir" => FileType::Directory,
                    "cdir" | "pdir" => return None,
                    v if v.starts_with("os.unix=slink") || v.starts_with("os.unix=symlink") => {
                        FileType::Symlink
                    }
                    _ => FileType::Other,
                }
            }
            "size" => entry.size = value.parse().ok()?,
            "modify" => entry.modified = parse_timeval(value),
            "unix.mode" => entry.mode = u32::from_str_radix(value, 8).ok(),
            "unix.owner" | "unix.ownername" => entry.owner = Some(value.to_string()),
            "unix.group" | "unix.groupname" => entry.group = Some(value.to_string()),
            _ => {}
        }
    }
    Some(entry)
}

/// `YYYYMMDDHHMMSS[.sss]` in UTC, as used by MLSD and MDTM.
pub fn parse_timeval(value: &str) -> Option<SystemTime> {
    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (value, None),
    };
    let time = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;
    let mut time = Utc.from_utc_datetime(&time);
    if let Some(fraction) = fraction {
        let millis: String = fraction.chars().chain("000".chars()).take(3).collect();
        time += chrono::Duration::milliseconds(millis.parse().ok()?);
    }
    Some(time.into())
}

/// Format for MFMT.
pub fn format_timeval(time: SystemTime) -> String {
    chrono::DateTime::<Utc>::from(time)
        .format("%Y%m%d%H%M%S")
        .to_string()
}

fn parse_permissions(perms: &[u8]) -> Option<(FileType, u32)> {
    if perms.len() < 10 {
        return None;
    }
    let file_type = match perms[0] {
        b'-' => FileType::Regular,
        b'd' => FileType::Directory,
        b'l' => FileType::Symlink,
        b'b' | b'c' | b'p' | b's' => FileType::Other,
        _ => return None,
    };
    let mut mode = 0u32;
    for (i, &c) in perms[1..10].iter().enumerate() {
        let bit = 1 << (8 - i);
        match c {
            b'-' => {}
            b'r' | b'w' | b'x' => mode |= bit,
            b's' | b't' => mode |= bit | special_bit(i),
            b'S' | b'T' => mode |= special_bit(i),
            _ => return None,
        }
    }
    Some((file_type, mode))
}

fn special_bit(index: usize) -> u32 {
    match index {
        2 => 0o4000,
        5 => 0o2000,
        8 => 0o1000,
        _ => 0,
    }
}

/// Split off `count` whitespace-separated fields; the rest of the line is
/// returned untouched so names keep their spaces.
fn split_fields(line: &[u8], count: usize) -> Option<(Vec<&[u8]>, &[u8])> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line;
    for _ in 0..count {
        let start = rest.iter().position(|b| !b.is_ascii_whitespace())?;
        rest = &rest[start..];
        let end = rest
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = &rest[end..];
    }
    let name_start = rest.iter().position(|b| !b.is_ascii_whitespace())?;
    Some((fields, &rest[name_start..]))
}

fn month(name: &[u8]) -> Option<u32> {
    const MONTHS: [&[u8]; 12] = [
        b"jan", b"feb", b"mar", b"apr", b"may", b"jun", b"jul", b"aug", b"sep", b"oct", b"nov",
        b"dec",
    ];
    let lower = name.to_ascii_lowercase();
    MONTHS.iter().position(|m| *m == lower.as_slice()).map(|i| i as u32 + 1)
}

/// `Jan  5 12:30` (year implied) or `Jan  5  2020`.
fn parse_list_time(mon: &[u8], day: &[u8], time_or_year: &[u8], now: SystemTime) -> Option<SystemTime> {
    let month = month(mon)?;
    let day: u32 = std::str::from_utf8(day).ok()?.parse().ok()?;
    let text = std::str::from_utf8(time_or_year).ok()?;
    let now = chrono::DateTime::<Utc>::from(now);
    let time = match text.split_once(':') {
        Some((h, m)) => {
            let (h, m): (u32, u32) = (h.parse().ok()?, m.parse().ok()?);
            let at = |year| NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(h, m, 0);
            let this_year = at(now.year())?;
            // Without a year the entry is within the last six months.
            if Utc.from_utc_datetime(&this_year) > now + chrono::Duration::days(1) {
                at(now.year() - 1)?
            } else {
                this_year
            }
        }
        None => NaiveDate::from_ymd_opt(text.parse().ok()?, month, day)?.and_hms_opt(0, 0, 0)?,
    };
    Some(Utc.from_utc_datetime(&time).into())
}

/// `drwxr-xr-x  2 owner group  4096 Jan  5 12:30 name`
pub fn parse_unix_line(line: &[u8], now: SystemTime) -> Option<FtpEntry> {
    if line.starts_with(b"total ") {
        return None;
    }
    let (fields, rest) = split_fields(line, 8)?;
    let (file_type, mode) = parse_permissions(fields[0])?;
    let mut entry = FtpEntry::new(rest, file_type);
    entry.mode = Some(mode);
    entry.owner = Some(String::from_utf8_lossy(fields[2]).into_owned());
    entry.group = Some(String::from_utf8_lossy(fields[3]).into_owned());
    entry.size = std::str::from_utf8(fields[4]).ok()?.parse().ok()?;
    entry.modified = parse_list_time(fields[5], fields[6], fields[7], now);
    if file_type == FileType::Symlink {
        if let Some(arrow) = rest.windows(4).position(|w| w == b" -> ") {
            entry.name = rest[..arrow].to_vec();
            entry.symlink_target = Some(rest[arrow + 4..].to_vec());
        }
    }
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(text: &str) -> SystemTime {
        chrono::DateTime::parse_from_rfc3339(text).unwrap().into()
    }

    #[test]
    fn test_unix_listing() {
        let now = at("2024-03-10T00:00:00Z");
        let data = b"total 12\r\n\
            drwxr-xr-x   2 alice staff     4096 Jan  5 12:30 My Dir\r\n\
            -rw-r--r--   1 alice staff      123 Dec 24  2019 notes.txt\r\n\
            lrwxrwxrwx   1 alice staff        9 Nov 30 08:00 latest -> notes.txt\r\n\
            drwxr-xr-x   2 alice staff     4096 Jan  5 12:30 ..\r\n";
        let entries = parse_listing(data, false, now);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, b"My Dir");
        assert_eq!(entries[0].file_type, FileType::Directory);
        assert_eq!(entries[0].mode, Some(0o755));
        assert_eq!(entries[0].modified, Some(at("2024-01-05T12:30:00Z")));

        assert_eq!(entries[1].size, 123);
        assert_eq!(entries[1].owner.as_deref(), Some("alice"));
        assert_eq!(entries[1].modified, Some(at("2019-12-24T00:00:00Z")));

        assert_eq!(entries[2].name, b"latest");
        assert_eq!(entries[2].symlink_target.as_deref(), Some(&b"notes.txt"[..]));
        // November is in the future relative to March, so last year.
        assert_eq!(entries[2].modified, Some(at("2023-11-30T08:00:00Z")));
    }

    #[test]
    fn test_setuid_bits() {
        let entry = parse_unix_line(
            b"-rwsr-sr-T 1 root root 0 Jan 1 2020 x",
            SystemTime::UNIX_EPOCH,
        )
        .unwrap();
        assert_eq!(entry.mode, Some(0o7754));
    }

    #[test]
    fn test_mlsd_listing() {
        let data = b"type=cdir;modify=20240101000000; .\r\n\
            type=file;size=42;modify=20240102030405.5;UNIX.mode=0640; a file.txt\r\n\
            type=dir;modify=20240101000000; sub\r\n\
            type=OS.unix=slink:/etc; link\r\n";
        let entries = parse_listing(data, true, SystemTime::now());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, b"a file.txt");
        assert_eq!(entries[0].size, 42);
        assert_eq!(entries[0].mode, Some(0o640));
        assert_eq!(
            entries[0].modified,
            Some(at("2024-01-02T03:04:05Z") + Duration::from_millis(500))
        );
        assert_eq!(entries[1].file_type, FileType::Directory);
        assert_eq!(entries[2].file_type, FileType::Symlink);
    }

    #[test]
    fn test_timeval_format() {
        let time = at("2021-06-07T08:09:10Z");
        assert_eq!(format_timeval(time), "20210607080910");
        assert_eq!(parse_timeval("20210607080910"), Some(time));
        assert_eq!(parse_timeval("garbage"), None);
    }
}
