//! In-memory collaborators for the platform and network backends.
//!
//! Used by the test suites and by embedders that want a backend without a
//! real device or server behind it. All data is lost when dropped.

mod content;
mod dav;
mod document;
mod ftp;

pub use content::MemoryContentResolver;
pub use dav::MemoryDavTransport;
pub use document::MemoryDocumentProvider;
pub use ftp::MemoryFtpConnector;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::vfs::backends::document::WriteMode;
use crate::vfs::content::ContentWriter;
use crate::vfs::error::VfsResult;

type Commit = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Buffers writes and hands the bytes to `commit` on finish.
struct CommitWriter {
    buffer: Vec<u8>,
    commit: Commit,
}

impl CommitWriter {
    fn new(commit: Commit) -> Self {
        Self {
            buffer: Vec::new(),
            commit,
        }
    }
}

#[async_trait]
impl ContentWriter for CommitWriter {
    async fn write_all(&mut self, buf: &[u8]) -> VfsResult<()> {
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> VfsResult<()> {
        let CommitWriter { buffer, commit } = *self;
        commit(buffer);
        Ok(())
    }
}

fn apply_write(existing: &mut Vec<u8>, mode: WriteMode, written: Vec<u8>) {
    match mode {
        WriteMode::Truncate => *existing = written,
        WriteMode::Append => existing.extend_from_slice(&written),
        WriteMode::Overwrite => {
            if written.len() >= existing.len() {
                *existing = written;
            } else {
                existing[..written.len()].copy_from_slice(&written);
            }
        }
    }
}

fn millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_write_modes() {
        let mut data = b"old contents".to_vec();
        apply_write(&mut data, WriteMode::Overwrite, b"NEW".to_vec());
        assert_eq!(data, b"NEW contents");
        apply_write(&mut data, WriteMode::Append, b"!".to_vec());
        assert_eq!(data, b"NEW contents!");
        apply_write(&mut data, WriteMode::Truncate, b"x".to_vec());
        assert_eq!(data, b"x");
    }
}
