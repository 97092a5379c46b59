//! Block alignment via read-modify-write.
//!
//! Layers below this one may assume every `pread`/`pwrite` starts on a
//! multiple of `block_size` and covers whole blocks, except at end of file.
//! Unaligned writes patch the first and last touched blocks by reading them
//! back, overlaying the new bytes, and writing the patched block; full
//! interior blocks go straight through in one child write.

use anyhow::ensure;
use parking_lot::Mutex;

use crate::error::Result;
use crate::layer::{Fd, FileStat, HandleTable, Layer, OpContext, OpenFlags, SharedLayer};

/// Converts arbitrary `(offset, len)` I/O into block-aligned child I/O.
pub struct BlockAlignLayer {
    next: SharedLayer,
    block_size: usize,
    fds: Mutex<HandleTable<Fd>>,
}

impl BlockAlignLayer {
    /// # Errors
    ///
    /// Fails if `block_size` is zero.
    pub fn new(next: SharedLayer, block_size: usize) -> anyhow::Result<Self> {
        ensure!(block_size > 0, "block_align: block_size must be non-zero");
        Ok(Self { next, block_size, fds: Mutex::new(HandleTable::new()) })
    }

    fn child_fd(&self, fd: Fd) -> Result<Fd> {
        self.fds.lock().get(fd).copied()
    }

    /// Reads block `index` from the child; the result may be shorter than a
    /// block at end of file.
    fn read_block(&self, cfd: Fd, index: u64, ctx: &OpContext) -> Result<Vec<u8>> {
        let mut block = vec![0u8; self.block_size];
        let off = index * self.block_size as u64;
        let n = self.next.pread(cfd, &mut block, off, ctx)?;
        block.truncate(n);
        Ok(block)
    }

    /// Patches one partially-covered block and writes it back.
    ///
    /// Returns the number of *logical* bytes of `src` consumed, which is
    /// less than `src.len()` only when the child write came up short.
    fn patch_block(
        &self,
        cfd: Fd,
        index: u64,
        rel: usize,
        src: &[u8],
        ctx: &OpContext,
    ) -> Result<usize> {
        let existing = self.read_block(cfd, index, ctx)?;
        let mut block = vec![0u8; self.block_size];
        block[..existing.len()].copy_from_slice(&existing);
        block[rel..rel + src.len()].copy_from_slice(src);

        let write_len = existing.len().max(rel + src.len());
        let off = index * self.block_size as u64;
        let written = self.next.pwrite(cfd, &block[..write_len], off, ctx)?;
        Ok(src.len().min(written.saturating_sub(rel)))
    }
}

impl Layer for BlockAlignLayer {
    fn kind(&self) -> &'static str {
        "block_align"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd> {
        let cfd = self.next.open(path, flags, mode, ctx)?;
        Ok(self.fds.lock().insert(cfd))
    }

    fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()> {
        let cfd = self.fds.lock().remove(fd)?;
        self.next.close(cfd, ctx)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cfd = self.child_fd(fd)?;
        let bsize = self.block_size as u64;

        let first = offset / bsize;
        let last = (offset + buf.len() as u64 - 1) / bsize;
        let aligned_off = first * bsize;
        let span = ((last - first + 1) * bsize) as usize;

        let mut scratch = vec![0u8; span];
        let got = self.next.pread(cfd, &mut scratch, aligned_off, ctx)?;

        let avail_end = aligned_off + got as u64;
        if avail_end <= offset {
            return Ok(0);
        }
        let take = ((offset + buf.len() as u64).min(avail_end) - offset) as usize;
        let skip = (offset - aligned_off) as usize;
        buf[..take].copy_from_slice(&scratch[skip..skip + take]);
        Ok(take)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cfd = self.child_fd(fd)?;
        let bsize = self.block_size as u64;

        let first = offset / bsize;
        let last = (offset + buf.len() as u64 - 1) / bsize;
        let head_rel = (offset - first * bsize) as usize;

        // Single block, possibly ragged at either end.
        if first == last && (head_rel != 0 || buf.len() < self.block_size) {
            return self.patch_block(cfd, first, head_rel, buf, ctx);
        }

        let mut done = 0usize;

        // Ragged head block.
        let mut full_start = first;
        if head_rel != 0 {
            let head_len = self.block_size - head_rel;
            done += self.patch_block(cfd, first, head_rel, &buf[..head_len], ctx)?;
            if done < head_len {
                return Ok(done);
            }
            full_start = first + 1;
        }

        // Ragged tail block.
        let tail_rel = ((offset + buf.len() as u64) - last * bsize) as usize;
        let full_end = if tail_rel != self.block_size { last } else { last + 1 };

        // Full interior blocks in one aligned child write.
        if full_start < full_end {
            let span = ((full_end - full_start) * bsize) as usize;
            let start = done;
            let written =
                self.next.pwrite(cfd, &buf[start..start + span], full_start * bsize, ctx)?;
            done += written;
            if written < span {
                return Ok(done);
            }
        }

        if tail_rel != self.block_size {
            done += self.patch_block(cfd, last, 0, &buf[done..], ctx)?;
        }
        Ok(done)
    }

    fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()> {
        let cfd = self.child_fd(fd)?;
        self.next.ftruncate(cfd, length, ctx)
    }

    fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat> {
        let cfd = self.child_fd(fd)?;
        self.next.fstat(cfd, ctx)
    }

    fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat> {
        self.next.lstat(path, ctx)
    }

    fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
        self.next.unlink(path, ctx)
    }

    fn descendant_count(&self) -> usize {
        1 + self.next.descendant_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::layers::local::LocalLayer;

    fn stack(block_size: usize) -> (tempfile::TempDir, BlockAlignLayer) {
        let dir = tempdir().unwrap();
        let layer = BlockAlignLayer::new(Arc::new(LocalLayer::new()), block_size).unwrap();
        (dir, layer)
    }

    fn path_in(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(BlockAlignLayer::new(Arc::new(LocalLayer::new()), 0).is_err());
    }

    #[test]
    fn test_straddling_write_at_block_boundary() {
        // Two bytes at offset 4095 touch blocks 0 and 1 but the file must
        // grow to exactly 4097 bytes.
        let (dir, layer) = stack(4096);
        let path = path_in(&dir, "xy.bin");
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        assert_eq!(layer.pwrite(fd, b"XY", 4095, &ctx).unwrap(), 2);
        assert_eq!(layer.fstat(fd, &ctx).unwrap().size, 4097);

        let mut buf = [0u8; 2];
        assert_eq!(layer.pread(fd, &mut buf, 4095, &ctx).unwrap(), 2);
        assert_eq!(&buf, b"XY");
        layer.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_unaligned_round_trips() {
        let (dir, layer) = stack(16);
        let path = path_in(&dir, "rt.bin");
        let ctx = OpContext::none();
        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();

        for (offset, len) in [(0u64, 5usize), (3, 16), (15, 2), (16, 16), (7, 70), (100, 1)] {
            let data: Vec<u8> = (0..len).map(|i| (i + offset as usize) as u8).collect();
            assert_eq!(layer.pwrite(fd, &data, offset, &ctx).unwrap(), len);

            let mut back = vec![0u8; len];
            assert_eq!(layer.pread(fd, &mut back, offset, &ctx).unwrap(), len);
            assert_eq!(back, data, "mismatch at offset {offset} len {len}");
        }
        layer.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_overwrite_preserves_neighbors() {
        let (dir, layer) = stack(8);
        let path = path_in(&dir, "nb.bin");
        let ctx = OpContext::none();
        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();

        layer.pwrite(fd, &[b'a'; 32], 0, &ctx).unwrap();
        layer.pwrite(fd, b"ZZZ", 10, &ctx).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(layer.pread(fd, &mut buf, 0, &ctx).unwrap(), 32);
        let mut expect = [b'a'; 32];
        expect[10..13].copy_from_slice(b"ZZZ");
        assert_eq!(buf, expect);
        layer.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_read_past_eof_short() {
        let (dir, layer) = stack(16);
        let path = path_in(&dir, "eof.bin");
        let ctx = OpContext::none();
        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();

        layer.pwrite(fd, &[1u8; 10], 0, &ctx).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(layer.pread(fd, &mut buf, 4, &ctx).unwrap(), 6);
        assert_eq!(layer.pread(fd, &mut buf, 10, &ctx).unwrap(), 0);
        assert_eq!(layer.pread(fd, &mut buf, 100, &ctx).unwrap(), 0);
        layer.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_zero_length_is_no_op() {
        let (dir, layer) = stack(16);
        let path = path_in(&dir, "z.bin");
        let ctx = OpContext::none();
        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        assert_eq!(layer.pwrite(fd, b"", 5, &ctx).unwrap(), 0);
        assert_eq!(layer.pread(fd, &mut [], 5, &ctx).unwrap(), 0);
        assert_eq!(layer.fstat(fd, &ctx).unwrap().size, 0);
        layer.close(fd, &ctx).unwrap();
    }
}
