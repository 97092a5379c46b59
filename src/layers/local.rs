//! Local filesystem terminal layer.
//!
//! The bottom of most stacks: every operation maps directly onto the host
//! filesystem. Descriptors index an internal table of open [`File`]s, so the
//! layer's handle space is independent of the process's raw fd numbers.

use std::fs::{self, File, Metadata, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::layer::{Fd, FileStat, HandleTable, Layer, OpContext, OpenFlags};

/// Terminal layer over the host filesystem.
#[derive(Default)]
pub struct LocalLayer {
    files: Mutex<HandleTable<Arc<File>>>,
}

impl LocalLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones the handle out so the table mutex is not held across I/O.
    fn file(&self, fd: Fd) -> Result<Arc<File>> {
        self.files.lock().get(fd).map(Arc::clone)
    }
}

fn stat_from(meta: &Metadata) -> FileStat {
    FileStat {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        size: meta.size(),
        mtime: meta.mtime(),
    }
}

impl Layer for LocalLayer {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, _ctx: &OpContext) -> Result<Fd> {
        let file = OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .create(flags.create)
            .truncate(flags.truncate)
            .mode(mode)
            .open(path)?;
        Ok(self.files.lock().insert(Arc::new(file)))
    }

    fn close(&self, fd: Fd, _ctx: &OpContext) -> Result<()> {
        self.files.lock().remove(fd).map(drop)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, _ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(self.file(fd)?.read_at(buf, offset)?)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, _ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(self.file(fd)?.write_at(buf, offset)?)
    }

    fn ftruncate(&self, fd: Fd, length: u64, _ctx: &OpContext) -> Result<()> {
        Ok(self.file(fd)?.set_len(length)?)
    }

    fn fstat(&self, fd: Fd, _ctx: &OpContext) -> Result<FileStat> {
        Ok(stat_from(&self.file(fd)?.metadata()?))
    }

    fn lstat(&self, path: &str, _ctx: &OpContext) -> Result<FileStat> {
        Ok(stat_from(&fs::symlink_metadata(path)?))
    }

    fn unlink(&self, path: &str, _ctx: &OpContext) -> Result<()> {
        Ok(fs::remove_file(path)?)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::error::LayerError;

    fn path_in(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "a.bin");
        let layer = LocalLayer::new();
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        assert_eq!(layer.pwrite(fd, b"hello", 0, &ctx).unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(layer.pread(fd, &mut buf, 0, &ctx).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        layer.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "short.bin");
        let layer = LocalLayer::new();
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        layer.pwrite(fd, b"abc", 0, &ctx).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(layer.pread(fd, &mut buf, 1, &ctx).unwrap(), 2);
        assert_eq!(layer.pread(fd, &mut buf, 10, &ctx).unwrap(), 0);
        layer.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_zero_length_io_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "zero.bin");
        let layer = LocalLayer::new();
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        assert_eq!(layer.pwrite(fd, b"", 0, &ctx).unwrap(), 0);
        assert_eq!(layer.pread(fd, &mut [], 0, &ctx).unwrap(), 0);
        assert_eq!(layer.fstat(fd, &ctx).unwrap().size, 0);
        layer.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "absent.bin");
        let layer = LocalLayer::new();
        let err = layer.open(&path, OpenFlags::read_only(), 0, &OpContext::none()).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "closed.bin");
        let layer = LocalLayer::new();
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        layer.close(fd, &ctx).unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(layer.pread(fd, &mut buf, 0, &ctx), Err(LayerError::BadDescriptor(_))));
        assert!(matches!(layer.close(fd, &ctx), Err(LayerError::BadDescriptor(_))));
    }

    #[test]
    fn test_truncate_and_stat() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "t.bin");
        let layer = LocalLayer::new();
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        layer.pwrite(fd, &[7u8; 100], 0, &ctx).unwrap();
        layer.ftruncate(fd, 10, &ctx).unwrap();
        assert_eq!(layer.fstat(fd, &ctx).unwrap().size, 10);
        assert_eq!(layer.lstat(&path, &ctx).unwrap().size, 10);
        layer.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_unlink_removes_file() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "gone.bin");
        let layer = LocalLayer::new();
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        layer.close(fd, &ctx).unwrap();
        layer.unlink(&path, &ctx).unwrap();
        assert_eq!(layer.lstat(&path, &ctx).unwrap_err().errno(), libc::ENOENT);
    }
}
