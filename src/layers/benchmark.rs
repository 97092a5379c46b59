//! Benchmark pass-through.
//!
//! An identity transform that counts operations and, every `reps` of them,
//! prints `label: rate ops/s` to standard output. Descriptors pass through
//! untouched, so this layer can be spliced anywhere in a stack without
//! shifting handle spaces.

use std::time::Instant;

use anyhow::ensure;
use parking_lot::Mutex;

use crate::error::Result;
use crate::layer::{Fd, FileStat, Layer, OpContext, OpenFlags, SharedLayer};

struct Window {
    count: u64,
    started: Instant,
}

/// Op-rate reporting wrapper.
pub struct BenchmarkLayer {
    next: SharedLayer,
    label: String,
    reps: u64,
    window: Mutex<Window>,
}

impl BenchmarkLayer {
    /// # Errors
    ///
    /// Fails if `reps` is zero.
    pub fn new(next: SharedLayer, label: impl Into<String>, reps: u64) -> anyhow::Result<Self> {
        ensure!(reps > 0, "benchmark: reps must be non-zero");
        Ok(Self {
            next,
            label: label.into(),
            reps,
            window: Mutex::new(Window { count: 0, started: Instant::now() }),
        })
    }

    fn tally(&self) {
        let mut window = self.window.lock();
        window.count += 1;
        if window.count % self.reps == 0 {
            let elapsed = window.started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 { self.reps as f64 / elapsed } else { f64::INFINITY };
            println!("{}: {rate:.0} ops/s", self.label);
            window.started = Instant::now();
        }
    }
}

impl Layer for BenchmarkLayer {
    fn kind(&self) -> &'static str {
        "benchmark"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd> {
        self.tally();
        self.next.open(path, flags, mode, ctx)
    }

    fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()> {
        self.tally();
        self.next.close(fd, ctx)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        self.tally();
        self.next.pread(fd, buf, offset, ctx)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        self.tally();
        self.next.pwrite(fd, buf, offset, ctx)
    }

    fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()> {
        self.tally();
        self.next.ftruncate(fd, length, ctx)
    }

    fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat> {
        self.tally();
        self.next.fstat(fd, ctx)
    }

    fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat> {
        self.tally();
        self.next.lstat(path, ctx)
    }

    fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
        self.tally();
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

    #[test]
    fn test_identity_transform() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.bin").to_string_lossy().into_owned();
        let layer = BenchmarkLayer::new(Arc::new(LocalLayer::new()), "bench", 1000).unwrap();
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        assert_eq!(layer.pwrite(fd, b"timed", 0, &ctx).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(layer.pread(fd, &mut buf, 0, &ctx).unwrap(), 5);
        assert_eq!(&buf, b"timed");
        assert_eq!(layer.fstat(fd, &ctx).unwrap().size, 5);
        layer.close(fd, &ctx).unwrap();
        layer.unlink(&path, &ctx).unwrap();
    }

    #[test]
    fn test_zero_reps_rejected() {
        assert!(BenchmarkLayer::new(Arc::new(LocalLayer::new()), "bench", 0).is_err());
    }

    #[test]
    fn test_counts_accumulate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.bin").to_string_lossy().into_owned();
        let layer = BenchmarkLayer::new(Arc::new(LocalLayer::new()), "bench", 1_000_000).unwrap();
        let ctx = OpContext::none();

        let fd = layer.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        for _ in 0..10 {
            layer.pwrite(fd, b"x", 0, &ctx).unwrap();
        }
        layer.close(fd, &ctx).unwrap();
        assert_eq!(layer.window.lock().count, 12);
    }
}
