//! Anti-tampering: integrity over a data child and a hash child.
//!
//! Two modes share the descriptor mapping and path-keyed locking
//! scaffolding:
//!
//! - **File mode** hashes the whole file: `open` verifies the stored digest
//!   against a fresh stream of the data file, `close` re-hashes and rewrites
//!   the digest. No hash I/O happens on reads or writes.
//! - **Block mode** hashes per block: every `pwrite` stores one fixed-width
//!   hex digest per touched block at `block_index * hex_width` in the hash
//!   file, and every `pread` recomputes and compares, warning per mismatched
//!   block.
//!
//! The hash artifact lives in the hash child under a flat namespace derived
//! from the data path: `hashes_storage/<hex(H(data_path))>.hash`. Mismatches
//! are never fatal — the data is returned and a warning carries the file
//! identity plus the stored and computed digests. Data-child errors
//! propagate; hash-child problems degrade to warnings wherever the data
//! itself is still served.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::ensure;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::hashing::{HashAlgorithm, hex_digests_match};
use crate::layer::{Fd, FileStat, HandleTable, Layer, OpContext, OpenFlags, SharedLayer};
use crate::pathlock::PathLocks;

/// Read granularity when streaming a file through the hasher.
const HASH_STREAM_CHUNK: usize = 64 * 1024;

/// Integrity mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperMode {
    /// Whole-file hash, verified on open and rewritten on close.
    File,

    /// Per-block hashes, written on write and verified on read.
    Block { block_size: usize },
}

struct OpenState {
    data_fd: Fd,
    path: String,
    hash_path: String,
    writable: bool,
}

/// Integrity layer over a data child and a hash child.
pub struct AntiTamperLayer {
    data: SharedLayer,
    hashes: SharedLayer,
    hashes_storage: String,
    algorithm: HashAlgorithm,
    mode: TamperMode,
    locks: PathLocks,
    fds: Mutex<HandleTable<OpenState>>,
    warnings: AtomicU64,
}

impl AntiTamperLayer {
    /// # Errors
    ///
    /// Fails if block mode is selected with a zero block size.
    pub fn new(
        data: SharedLayer,
        hashes: SharedLayer,
        hashes_storage: impl Into<String>,
        algorithm: HashAlgorithm,
        mode: TamperMode,
    ) -> anyhow::Result<Self> {
        if let TamperMode::Block { block_size } = mode {
            ensure!(block_size > 0, "anti_tampering: block_size must be non-zero");
        }
        Ok(Self {
            data,
            hashes,
            hashes_storage: hashes_storage.into(),
            algorithm,
            mode,
            locks: PathLocks::new(),
            fds: Mutex::new(HandleTable::new()),
            warnings: AtomicU64::new(0),
        })
    }

    /// Number of integrity warnings emitted so far.
    #[must_use]
    pub fn integrity_warnings(&self) -> u64 {
        self.warnings.load(Ordering::SeqCst)
    }

    /// Hash-file path for `data_path`: a flat namespace in the hash child,
    /// independent of the data child's directory structure.
    #[must_use]
    pub fn hash_path_for(&self, data_path: &str) -> String {
        format!(
            "{}/{}.hash",
            self.hashes_storage,
            self.algorithm.digest_hex(data_path.as_bytes())
        )
    }

    fn state(&self, fd: Fd) -> Result<(Fd, String, String)> {
        let fds = self.fds.lock();
        let s = fds.get(fd)?;
        Ok((s.data_fd, s.path.clone(), s.hash_path.clone()))
    }

    /// Streams an open data-child descriptor through the hasher.
    fn stream_hash(&self, fd: Fd, ctx: &OpContext) -> Result<String> {
        let mut hasher = self.algorithm.hasher();
        let mut chunk = vec![0u8; HASH_STREAM_CHUNK];
        let mut offset = 0u64;
        loop {
            let got = self.data.pread(fd, &mut chunk, offset, ctx)?;
            if got == 0 {
                break;
            }
            hasher.update(&chunk[..got]);
            offset += got as u64;
        }
        Ok(hasher.finalize_hex())
    }

    /// Reads the stored whole-file digest, if the hash file is usable.
    fn read_stored_hex(&self, hash_fd: Fd, ctx: &OpContext) -> Result<Option<String>> {
        let width = self.algorithm.hex_width();
        let mut stored = vec![0u8; width];
        let got = self.hashes.pread(hash_fd, &mut stored, 0, ctx)?;
        if got != width {
            return Ok(None);
        }
        Ok(String::from_utf8(stored).ok())
    }

    /// File-mode open verification. Never fails the open: every problem
    /// degrades to a log line.
    fn verify_on_open(&self, path: &str, hash_path: &str, ctx: &OpContext) {
        let hash_fd = match self.hashes.open(hash_path, OpenFlags::read_only(), 0, ctx) {
            Ok(fd) => fd,
            Err(_) => {
                debug!(path, "no stored hash; skipping open verification");
                return;
            }
        };

        let verify_fd = match self.data.open(path, OpenFlags::read_only(), 0, ctx) {
            Ok(fd) => fd,
            Err(e) => {
                warn!(path, error = %e, "cannot reopen data file for verification");
                let _ = self.hashes.close(hash_fd, ctx);
                return;
            }
        };

        self.locks.with_read(path, || {
            let stored = self.read_stored_hex(hash_fd, ctx).ok().flatten();
            let computed = self.stream_hash(verify_fd, ctx).ok();
            let size = self.data.fstat(verify_fd, ctx).map(|s| s.size).unwrap_or(0);

            match (stored, computed) {
                (Some(stored), Some(computed)) => {
                    // A zero-length file is indistinguishable from one just
                    // created; stay quiet about it.
                    if size > 0 && !hex_digests_match(&stored, &computed) {
                        self.warnings.fetch_add(1, Ordering::SeqCst);
                        warn!(path, %stored, %computed, "file hash mismatch on open");
                    }
                }
                (None, _) => warn!(path, "stored hash unreadable; skipping verification"),
                (_, None) => warn!(path, "data unreadable during verification"),
            }
        });

        let _ = self.data.close(verify_fd, ctx);
        let _ = self.hashes.close(hash_fd, ctx);
    }

    /// File-mode close: re-hash the file and rewrite the stored digest.
    fn rehash_on_close(&self, path: &str, hash_path: &str, ctx: &OpContext) -> Result<()> {
        self.locks.with_write(path, || {
            let verify_fd = self.data.open(path, OpenFlags::read_only(), 0, ctx)?;
            let computed = self.stream_hash(verify_fd, ctx);
            let _ = self.data.close(verify_fd, ctx);
            let computed = computed?;

            let hash_fd =
                self.hashes.open(hash_path, OpenFlags::create_rdwr().truncating(), 0o644, ctx)?;
            let res = self.hashes.pwrite(hash_fd, computed.as_bytes(), 0, ctx);
            let _ = self.hashes.close(hash_fd, ctx);
            res.map(drop)
        })
    }

    /// Block-mode write-side hash maintenance.
    fn store_block_hashes(
        &self,
        hash_path: &str,
        written: &[u8],
        offset: u64,
        block_size: usize,
        ctx: &OpContext,
    ) -> Result<()> {
        let width = self.algorithm.hex_width();
        let first_block = offset / block_size as u64;

        let mut concat = String::with_capacity(written.len().div_ceil(block_size) * width);
        for chunk in written.chunks(block_size) {
            concat.push_str(&self.algorithm.digest_hex(chunk));
        }

        let hash_fd = self.hashes.open(hash_path, OpenFlags::create_rdwr(), 0o644, ctx)?;
        let res = self.hashes.pwrite(
            hash_fd,
            concat.as_bytes(),
            first_block * width as u64,
            ctx,
        );
        let _ = self.hashes.close(hash_fd, ctx);
        match res {
            Ok(n) if n == concat.len() => Ok(()),
            Ok(_) => Err(std::io::Error::other("short hash file write").into()),
            Err(e) => Err(e),
        }
    }

    /// Block-mode read-side verification; warnings only.
    fn verify_block_hashes(
        &self,
        path: &str,
        hash_path: &str,
        returned: &[u8],
        offset: u64,
        block_size: usize,
        ctx: &OpContext,
    ) {
        let width = self.algorithm.hex_width();
        let first_block = offset / block_size as u64;
        let block_count = returned.len().div_ceil(block_size);

        let hash_fd = match self.hashes.open(hash_path, OpenFlags::read_only(), 0, ctx) {
            Ok(fd) => fd,
            Err(_) => {
                self.warnings.fetch_add(1, Ordering::SeqCst);
                warn!(path, "hash file missing; blocks unverified");
                return;
            }
        };

        let mut stored = vec![0u8; block_count * width];
        let got = self
            .hashes
            .pread(hash_fd, &mut stored, first_block * width as u64, ctx)
            .unwrap_or(0);
        let _ = self.hashes.close(hash_fd, ctx);
        stored.truncate(got - got % width);

        for (i, chunk) in returned.chunks(block_size).enumerate() {
            let block = first_block + i as u64;
            let Some(stored_hex) = stored
                .get(i * width..(i + 1) * width)
                .and_then(|s| std::str::from_utf8(s).ok())
            else {
                self.warnings.fetch_add(1, Ordering::SeqCst);
                warn!(path, block, "no stored hash for block");
                continue;
            };

            let computed = self.algorithm.digest_hex(chunk);
            if !hex_digests_match(stored_hex, &computed) {
                self.warnings.fetch_add(1, Ordering::SeqCst);
                warn!(path, block, stored = stored_hex, %computed, "block hash mismatch");
            }
        }
    }
}

impl Layer for AntiTamperLayer {
    fn kind(&self) -> &'static str {
        "anti_tampering"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd> {
        let data_fd = self.data.open(path, flags, mode, ctx)?;
        let hash_path = self.hash_path_for(path);

        match self.mode {
            TamperMode::File => self.verify_on_open(path, &hash_path, ctx),
            TamperMode::Block { .. } => {
                // Make sure the hash sidecar exists; per-block verification
                // happens at read time.
                match self.hashes.open(&hash_path, OpenFlags::create_rdwr(), 0o644, ctx) {
                    Ok(fd) => {
                        let _ = self.hashes.close(fd, ctx);
                    }
                    Err(e) => warn!(path, error = %e, "cannot create hash file"),
                }
            }
        }

        Ok(self.fds.lock().insert(OpenState {
            data_fd,
            path: path.to_owned(),
            hash_path,
            writable: flags.writable(),
        }))
    }

    fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()> {
        let state = self.fds.lock().remove(fd)?;
        let hash_res = match self.mode {
            TamperMode::File if state.writable => {
                self.rehash_on_close(&state.path, &state.hash_path, ctx)
            }
            _ => Ok(()),
        };
        self.data.close(state.data_fd, ctx)?;
        hash_res
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (data_fd, path, hash_path) = self.state(fd)?;
        self.locks.with_read(&path, || {
            let got = self.data.pread(data_fd, buf, offset, ctx)?;
            if got > 0
                && let TamperMode::Block { block_size } = self.mode
            {
                self.verify_block_hashes(&path, &hash_path, &buf[..got], offset, block_size, ctx);
            }
            Ok(got)
        })
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (data_fd, path, hash_path) = self.state(fd)?;
        self.locks.with_write(&path, || {
            let written = self.data.pwrite(data_fd, buf, offset, ctx)?;
            if written > 0
                && let TamperMode::Block { block_size } = self.mode
            {
                self.store_block_hashes(&hash_path, &buf[..written], offset, block_size, ctx)?;
            }
            Ok(written)
        })
    }

    fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()> {
        let (data_fd, path, _) = self.state(fd)?;
        // The hash file is deliberately left alone: in block mode stale
        // trailing hashes are only consulted if those blocks are ever read,
        // which a truncated data file will not produce.
        self.locks.with_write(&path, || self.data.ftruncate(data_fd, length, ctx))
    }

    fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat> {
        let (data_fd, path, _) = self.state(fd)?;
        self.locks.with_read(&path, || self.data.fstat(data_fd, ctx))
    }

    fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat> {
        self.locks.with_read(path, || self.data.lstat(path, ctx))
    }

    fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
        self.locks.with_write(path, || {
            self.data.unlink(path, ctx)?;
            if let Err(e) = self.hashes.unlink(&self.hash_path_for(path), ctx) {
                debug!(path, error = %e, "no hash file to unlink");
            }
            Ok(())
        })
    }

    fn descendant_count(&self) -> usize {
        1 + self.data.descendant_count() + self.hashes.descendant_count()
    }
}
