//! Demultiplexer: parallel fan-out of every operation across N children.
//!
//! Each child carries three roles set at construction:
//!
//! - `passthrough_read` — this child is the sole authority for reads and is
//!   excluded from the reader pool otherwise;
//! - `passthrough_write` — this child is skipped by writes entirely;
//! - `enforced` — this child's failures decide the aggregate result.
//!
//! Aggregate success requires every enforced child to succeed; the first
//! enforced failure (in child order) supplies the propagated error.
//! Non-enforced children fail quietly into the log. With no enforced
//! children configured, the first participating child speaks for the
//! aggregate.
//!
//! Children execute sequentially on the caller's thread, in declaration
//! order.

use anyhow::{bail, ensure};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{LayerError, Result};
use crate::layer::{Fd, FileStat, HandleTable, Layer, OpContext, OpenFlags, SharedLayer};

/// One fan-out target plus its role flags.
pub struct DemuxChild {
    pub name: String,
    pub layer: SharedLayer,
    pub passthrough_read: bool,
    pub passthrough_write: bool,
    pub enforced: bool,
}

/// Fan-out layer over an ordered set of children.
pub struct DemuxLayer {
    children: Vec<DemuxChild>,
    fds: Mutex<HandleTable<Vec<Fd>>>,
}

impl DemuxLayer {
    /// Validates the role flags and builds the layer.
    ///
    /// # Errors
    ///
    /// Any illegal flag combination aborts construction:
    /// a child with both passthrough roles, an all-passthrough-read or
    /// all-passthrough-write configuration, or an enforced passthrough
    /// reader.
    pub fn new(children: Vec<DemuxChild>) -> anyhow::Result<Self> {
        ensure!(!children.is_empty(), "demultiplexer: at least one child is required");

        for child in &children {
            if child.passthrough_read && child.passthrough_write {
                bail!("demultiplexer: child '{}' cannot be passthrough for both roles", child.name);
            }
            if child.passthrough_read && child.enforced {
                bail!(
                    "demultiplexer: child '{}' is passthrough_read and already authoritative; \
                     enforcing it is contradictory",
                    child.name
                );
            }
        }
        ensure!(
            children.iter().any(|c| !c.passthrough_read),
            "demultiplexer: at least one child must actually serve reads"
        );
        ensure!(
            children.iter().any(|c| !c.passthrough_write),
            "demultiplexer: at least one child must actually receive writes"
        );

        Ok(Self { children, fds: Mutex::new(HandleTable::new()) })
    }

    fn child_fds(&self, fd: Fd) -> Result<Vec<Fd>> {
        self.fds.lock().get(fd).cloned()
    }

    fn has_enforced(&self) -> bool {
        self.children.iter().any(|c| c.enforced)
    }

    /// Folds per-child results into the aggregate per the enforcement rules.
    ///
    /// `results` holds `(child index, result)` for every participating
    /// child, in child order. With an enforced set configured, the first
    /// enforced failure decides the aggregate; otherwise the first enforced
    /// success does. With no enforcement anywhere, the first participant
    /// speaks for the aggregate, failure included.
    fn aggregate<T>(&self, op: &str, results: Vec<(usize, Result<T>)>) -> Result<T> {
        if !self.has_enforced() {
            let mut iter = results.into_iter();
            let first = iter
                .next()
                .map(|(_, result)| result)
                .unwrap_or(Err(LayerError::InvalidArgument("no child participated")));
            for (idx, result) in iter {
                if let Err(e) = result {
                    warn!(child = %self.children[idx].name, op, error = %e, "child failed");
                }
            }
            return first;
        }

        let mut success: Option<T> = None;
        let mut fallback: Option<T> = None;
        let mut failure: Option<LayerError> = None;
        for (idx, result) in results {
            let child = &self.children[idx];
            match result {
                Err(e) if child.enforced => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    warn!(child = %child.name, op, error = %e, "non-enforced child failed");
                }
                Ok(v) => {
                    if child.enforced && success.is_none() {
                        success = Some(v);
                    } else if fallback.is_none() {
                        fallback = Some(v);
                    }
                }
            }
        }
        match (failure, success) {
            (Some(e), _) => Err(e),
            (None, Some(v)) => Ok(v),
            // Every enforced child sat this operation out (e.g. all are
            // passthrough for it); the first successful participant answers.
            (None, None) => {
                fallback.ok_or(LayerError::InvalidArgument("no child produced a result"))
            }
        }
    }
}

impl Layer for DemuxLayer {
    fn kind(&self) -> &'static str {
        "demultiplexer"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd> {
        let mut opened: Vec<Fd> = Vec::with_capacity(self.children.len());
        for child in &self.children {
            match child.layer.open(path, flags, mode, ctx) {
                Ok(cfd) => opened.push(cfd),
                Err(e) => {
                    // All-or-nothing: roll the siblings back.
                    for (done, cfd) in opened.into_iter().enumerate() {
                        let _ = self.children[done].layer.close(cfd, ctx);
                    }
                    return Err(e);
                }
            }
        }
        Ok(self.fds.lock().insert(opened))
    }

    fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()> {
        let cfds = self.fds.lock().remove(fd)?;
        let mut first_err = None;
        for (child, cfd) in self.children.iter().zip(cfds) {
            if let Err(e) = child.layer.close(cfd, ctx)
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cfds = self.child_fds(fd)?;

        // A single passthrough reader is authoritative on its own.
        let passthrough: Vec<usize> = (0..self.children.len())
            .filter(|i| self.children[*i].passthrough_read)
            .collect();
        if let [only] = passthrough[..] {
            return self.children[only].layer.pread(cfds[only], buf, offset, ctx);
        }

        let mut results: Vec<(usize, Result<usize>)> = Vec::new();
        let mut winner: Option<(usize, Vec<u8>)> = None;
        for (idx, child) in self.children.iter().enumerate() {
            if child.passthrough_read {
                continue;
            }
            let mut scratch = vec![0u8; buf.len()];
            let result = child.layer.pread(cfds[idx], &mut scratch, offset, ctx);
            if result.is_ok() && winner.is_none() && (child.enforced || !self.has_enforced()) {
                winner = Some((idx, scratch));
            }
            results.push((idx, result));
        }

        let count = self.aggregate("pread", results)?;
        if let Some((_, bytes)) = winner {
            buf[..count].copy_from_slice(&bytes[..count]);
        }
        Ok(count)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cfds = self.child_fds(fd)?;

        let mut results: Vec<(usize, Result<usize>)> = Vec::new();
        for (idx, child) in self.children.iter().enumerate() {
            if child.passthrough_write {
                continue;
            }
            results.push((idx, child.layer.pwrite(cfds[idx], buf, offset, ctx)));
        }
        self.aggregate("pwrite", results)
    }

    fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()> {
        let cfds = self.child_fds(fd)?;
        let results = self
            .children
            .iter()
            .enumerate()
            .map(|(idx, child)| (idx, child.layer.ftruncate(cfds[idx], length, ctx)))
            .collect();
        self.aggregate("ftruncate", results)
    }

    fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat> {
        let cfds = self.child_fds(fd)?;
        let results = self
            .children
            .iter()
            .enumerate()
            .map(|(idx, child)| (idx, child.layer.fstat(cfds[idx], ctx)))
            .collect();
        self.aggregate("fstat", results)
    }

    fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat> {
        let results = self
            .children
            .iter()
            .enumerate()
            .map(|(idx, child)| (idx, child.layer.lstat(path, ctx)))
            .collect();
        self.aggregate("lstat", results)
    }

    fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
        let results = self
            .children
            .iter()
            .enumerate()
            .map(|(idx, child)| (idx, child.layer.unlink(path, ctx)))
            .collect();
        self.aggregate("unlink", results)
    }

    fn descendant_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.layer.descendant_count()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::layers::local::LocalLayer;

    /// Local-backed child that can be told to fail specific operations.
    #[derive(Default)]
    struct FaultyLayer {
        inner: LocalLayer,
        fail_pwrite: Option<i32>,
        fail_fstat: Option<i32>,
        fail_open: bool,
    }

    impl FaultyLayer {
        fn failing_writes(errno: i32) -> Self {
            Self { fail_pwrite: Some(errno), ..Self::default() }
        }

        fn failing_fstat(errno: i32) -> Self {
            Self { fail_fstat: Some(errno), ..Self::default() }
        }
    }

    impl Layer for FaultyLayer {
        fn kind(&self) -> &'static str {
            "faulty"
        }
        fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd> {
            if self.fail_open {
                return Err(LayerError::from_errno(libc::EACCES));
            }
            self.inner.open(path, flags, mode, ctx)
        }
        fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()> {
            self.inner.close(fd, ctx)
        }
        fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize> {
            self.inner.pread(fd, buf, offset, ctx)
        }
        fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize> {
            match self.fail_pwrite {
                Some(errno) => Err(LayerError::from_errno(errno)),
                None => self.inner.pwrite(fd, buf, offset, ctx),
            }
        }
        fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()> {
            self.inner.ftruncate(fd, length, ctx)
        }
        fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat> {
            match self.fail_fstat {
                Some(errno) => Err(LayerError::from_errno(errno)),
                None => self.inner.fstat(fd, ctx),
            }
        }
        fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat> {
            self.inner.lstat(path, ctx)
        }
        fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
            self.inner.unlink(path, ctx)
        }
    }

    fn child(name: &str, layer: SharedLayer) -> DemuxChild {
        DemuxChild {
            name: name.to_owned(),
            layer,
            passthrough_read: false,
            passthrough_write: false,
            enforced: false,
        }
    }

    fn paths(dir: &tempfile::TempDir, names: &[&str]) -> Vec<String> {
        names.iter().map(|n| dir.path().join(n).to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_validation_rejects_bad_flag_combinations() {
        let mk = || child("c", Arc::new(LocalLayer::new()) as SharedLayer);

        let mut both = mk();
        both.passthrough_read = true;
        both.passthrough_write = true;
        assert!(DemuxLayer::new(vec![both]).is_err());

        let mut all_ptr = mk();
        all_ptr.passthrough_read = true;
        assert!(DemuxLayer::new(vec![all_ptr]).is_err());

        let mut all_ptw = mk();
        all_ptw.passthrough_write = true;
        assert!(DemuxLayer::new(vec![all_ptw]).is_err());

        let mut enforced_reader = mk();
        enforced_reader.passthrough_read = true;
        enforced_reader.enforced = true;
        assert!(DemuxLayer::new(vec![enforced_reader, mk()]).is_err());

        assert!(DemuxLayer::new(Vec::new()).is_err());
        assert!(DemuxLayer::new(vec![mk(), mk()]).is_ok());
    }

    #[test]
    fn test_enforced_success_masks_optional_failure() {
        // L0 enforced and healthy, L1 optional and failing: the aggregate
        // write succeeds.
        let dir = tempdir().unwrap();
        let mut c0 = child("good", Arc::new(LocalLayer::new()));
        c0.enforced = true;
        let c1 = child("bad", Arc::new(FaultyLayer::failing_writes(libc::EIO)));

        let demux = DemuxLayer::new(vec![c0, c1]).unwrap();
        let ctx = OpContext::none();
        let path = paths(&dir, &["f.bin"]).remove(0);

        let fd = demux.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        assert_eq!(demux.pwrite(fd, b"x", 0, &ctx).unwrap(), 1);
        demux.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_enforced_failure_fails_aggregate_write() {
        let dir = tempdir().unwrap();
        let c0 = child("good", Arc::new(LocalLayer::new()));
        let mut c1 = child("bad", Arc::new(FaultyLayer::failing_writes(libc::ENOSPC)));
        c1.enforced = true;

        let demux = DemuxLayer::new(vec![c0, c1]).unwrap();
        let ctx = OpContext::none();
        let path = paths(&dir, &["f.bin"]).remove(0);

        let fd = demux.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        let err = demux.pwrite(fd, b"x", 0, &ctx).unwrap_err();
        assert_eq!(err.errno(), libc::ENOSPC);
        demux.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_first_enforced_failure_errno_wins() {
        // fstat: L0 succeeds, L1 fails ENOENT, L2 fails EACCES; the
        // propagated errno is L1's.
        let dir = tempdir().unwrap();
        let mut c0 = child("ok", Arc::new(LocalLayer::new()));
        let mut c1 = child("enoent", Arc::new(FaultyLayer::failing_fstat(libc::ENOENT)));
        let mut c2 = child("eacces", Arc::new(FaultyLayer::failing_fstat(libc::EACCES)));
        c0.enforced = true;
        c1.enforced = true;
        c2.enforced = true;

        let demux = DemuxLayer::new(vec![c0, c1, c2]).unwrap();
        let ctx = OpContext::none();
        let path = paths(&dir, &["f.bin"]).remove(0);

        let fd = demux.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        let err = demux.fstat(fd, &ctx).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        demux.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_write_replicates_to_all_children() {
        let dir = tempdir().unwrap();
        let c0 = child("a", Arc::new(LocalLayer::new()));
        let c1 = child("b", Arc::new(LocalLayer::new()));
        let demux = DemuxLayer::new(vec![c0, c1]).unwrap();
        let ctx = OpContext::none();
        let path = paths(&dir, &["f.bin"]).remove(0);

        let fd = demux.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        demux.pwrite(fd, b"copies", 0, &ctx).unwrap();

        let mut buf = vec![0u8; 6];
        assert_eq!(demux.pread(fd, &mut buf, 0, &ctx).unwrap(), 6);
        assert_eq!(&buf, b"copies");
        demux.close(fd, &ctx).unwrap();

        // Both children wrote to the same local path here; a fan-out over
        // distinct roots is exercised in the builder tests.
        assert_eq!(std::fs::read(&path).unwrap(), b"copies");
    }

    #[test]
    fn test_passthrough_write_child_is_skipped() {
        let dir = tempdir().unwrap();
        // The passthrough child would fail every write; skipping it is the
        // only way this test passes.
        let mut c0 = child("skip", Arc::new(FaultyLayer::failing_writes(libc::EIO)));
        c0.passthrough_write = true;
        let c1 = child("real", Arc::new(LocalLayer::new()));

        let demux = DemuxLayer::new(vec![c0, c1]).unwrap();
        let ctx = OpContext::none();
        let path = paths(&dir, &["f.bin"]).remove(0);

        let fd = demux.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        assert_eq!(demux.pwrite(fd, b"data", 0, &ctx).unwrap(), 4);
        demux.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_open_rolls_back_on_partial_failure() {
        let dir = tempdir().unwrap();
        let c0 = child("ok", Arc::new(LocalLayer::new()));
        let c1 = child("denied", Arc::new(FaultyLayer { fail_open: true, ..Default::default() }));

        let demux = DemuxLayer::new(vec![c0, c1]).unwrap();
        let ctx = OpContext::none();
        let path = paths(&dir, &["f.bin"]).remove(0);

        let err = demux.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
        assert!(demux.fds.lock().is_empty());
    }

    #[test]
    fn test_unlink_fans_out() {
        let dir = tempdir().unwrap();
        let c0 = child("a", Arc::new(LocalLayer::new()));
        let c1 = child("b", Arc::new(LocalLayer::new()));
        let demux = DemuxLayer::new(vec![c0, c1]).unwrap();
        let ctx = OpContext::none();
        let path = paths(&dir, &["f.bin"]).remove(0);

        let fd = demux.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        demux.close(fd, &ctx).unwrap();
        demux.unlink(&path, &ctx).unwrap();
        assert!(std::fs::metadata(&path).is_err());
    }
}
