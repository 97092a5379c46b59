//! Sparse-block compression.
//!
//! Each logical block is compressed independently and stored back-to-back in
//! the backing file; a per-file index records the stored size of every block,
//! whether it was left verbatim (compression did not shrink it), and the
//! authoritative logical file length. Block `i`'s payload lives at the prefix
//! sum of the stored sizes before it, so random-access reads touch only the
//! blocks they cover.
//!
//! The index is keyed by `(device, inode)` — it survives renames and is
//! shared by every descriptor open on the same file. It is persisted as a
//! JSON sidecar (`<path>.cidx`) written through the child on close and
//! truncate, and reloaded on open; a non-empty backing file with no sidecar
//! is adopted verbatim with a warning.
//!
//! Overwriting a block with a payload of a different stored size shifts the
//! physical position of every later block; the layer rewrites that tail and
//! trims the backing file to the new physical length.

use std::io;
use std::sync::Arc;

use anyhow::ensure;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{BlockCodec, CodecKind, Packed};
use crate::error::Result;
use crate::layer::{Fd, FileStat, HandleTable, Layer, OpContext, OpenFlags, SharedLayer};

/// Sidecar file suffix holding the serialized per-file index.
const INDEX_SUFFIX: &str = ".cidx";

/// Per-file block index.
///
/// `stored_eof` is the logical extent actually materialized in blocks;
/// `logical_eof` may exceed it after a lengthening truncate, in which case
/// the difference reads back as zeros.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileIndex {
    block_size: u64,
    sizes: Vec<u32>,
    verbatim: Vec<bool>,
    stored_eof: u64,
    logical_eof: u64,

    /// True when the in-memory index is ahead of the sidecar.
    #[serde(skip)]
    dirty: bool,
}

impl FileIndex {
    fn empty(block_size: u64) -> Self {
        Self {
            block_size,
            sizes: Vec::new(),
            verbatim: Vec::new(),
            stored_eof: 0,
            logical_eof: 0,
            dirty: false,
        }
    }

    /// Index describing a pre-existing file stored without compression.
    fn adopt_verbatim(block_size: u64, physical_size: u64) -> Self {
        let count = physical_size.div_ceil(block_size);
        let mut sizes = Vec::with_capacity(count as usize);
        for i in 0..count {
            let ulen = (physical_size - i * block_size).min(block_size);
            sizes.push(ulen as u32);
        }
        Self {
            block_size,
            verbatim: vec![true; count as usize],
            sizes,
            stored_eof: physical_size,
            logical_eof: physical_size,
            dirty: true,
        }
    }

    /// Physical offset of block `i`'s stored payload.
    fn phys_offset(&self, i: usize) -> u64 {
        self.sizes[..i].iter().map(|s| u64::from(*s)).sum()
    }

    fn phys_total(&self) -> u64 {
        self.phys_offset(self.sizes.len())
    }

    /// Uncompressed length of stored block `i`.
    fn ulen(&self, i: usize) -> usize {
        let start = i as u64 * self.block_size;
        self.stored_eof.saturating_sub(start).min(self.block_size) as usize
    }
}

struct OpenState {
    cfd: Fd,
    path: String,
    index: Arc<Mutex<FileIndex>>,
}

/// Per-block compression with random-access reads.
pub struct SparseCompressionLayer {
    next: SharedLayer,
    codec: BlockCodec,
    block_size: usize,
    files: Mutex<HandleTable<OpenState>>,
    indexes: Mutex<HashMap<(u64, u64), Arc<Mutex<FileIndex>>>>,
}

impl SparseCompressionLayer {
    /// # Errors
    ///
    /// Fails if `block_size` is zero.
    pub fn new(
        next: SharedLayer,
        kind: CodecKind,
        level: i32,
        block_size: usize,
    ) -> anyhow::Result<Self> {
        ensure!(block_size > 0, "compression: block_size must be non-zero");
        Ok(Self {
            next,
            codec: BlockCodec::new(kind, level),
            block_size,
            files: Mutex::new(HandleTable::new()),
            indexes: Mutex::new(HashMap::new()),
        })
    }

    fn state(&self, fd: Fd) -> Result<(Fd, String, Arc<Mutex<FileIndex>>)> {
        let files = self.files.lock();
        let s = files.get(fd)?;
        Ok((s.cfd, s.path.clone(), Arc::clone(&s.index)))
    }

    /// Reads and parses the sidecar for `path`, if one exists.
    fn load_sidecar(&self, path: &str, ctx: &OpContext) -> Option<FileIndex> {
        let sidecar = format!("{path}{INDEX_SUFFIX}");
        let fd = self.next.open(&sidecar, OpenFlags::read_only(), 0, ctx).ok()?;
        let size = self.next.fstat(fd, ctx).map(|s| s.size).unwrap_or(0);
        let mut raw = vec![0u8; size as usize];
        let got = self.next.pread(fd, &mut raw, 0, ctx).unwrap_or(0);
        let _ = self.next.close(fd, ctx);
        raw.truncate(got);

        match serde_json::from_slice::<FileIndex>(&raw) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(path, error = %e, "ignoring unreadable compression index sidecar");
                None
            }
        }
    }

    /// Writes the sidecar for `path` through the child.
    fn store_sidecar(&self, path: &str, index: &FileIndex, ctx: &OpContext) -> Result<()> {
        let sidecar = format!("{path}{INDEX_SUFFIX}");
        let raw = serde_json::to_vec(index).map_err(io::Error::other)?;
        let fd =
            self.next.open(&sidecar, OpenFlags::create_rdwr().truncating(), 0o644, ctx)?;
        let res = self.next.pwrite(fd, &raw, 0, ctx);
        let _ = self.next.close(fd, ctx);
        match res {
            Ok(n) if n == raw.len() => Ok(()),
            Ok(_) => Err(io::Error::other("short sidecar write").into()),
            Err(e) => Err(e),
        }
    }

    /// Raw stored payload of block `i`, exactly `sizes[i]` bytes.
    fn read_payload(&self, cfd: Fd, index: &FileIndex, i: usize, ctx: &OpContext) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; index.sizes[i] as usize];
        let got = self.next.pread(cfd, &mut payload, index.phys_offset(i), ctx)?;
        if got != payload.len() {
            return Err(io::Error::other("short read in compressed backing file").into());
        }
        Ok(payload)
    }

    /// Logical content of block `i`: decompressed, verbatim, or zeros for a
    /// hole past the stored extent.
    fn read_block(&self, cfd: Fd, index: &FileIndex, i: usize, ctx: &OpContext) -> Result<Vec<u8>> {
        if i >= index.sizes.len() {
            return Ok(Vec::new());
        }
        let payload = self.read_payload(cfd, index, i, ctx)?;
        if index.verbatim[i] {
            Ok(payload)
        } else {
            self.codec.unpack(&payload, index.ulen(i))
        }
    }

    fn pack_block(&self, block: Vec<u8>) -> Result<(Vec<u8>, bool)> {
        match self.codec.pack(&block)? {
            Packed::Shrunk(payload) => Ok((payload, false)),
            Packed::Verbatim => Ok((block, true)),
        }
    }

    /// Re-stores blocks `dirty` (new logical content given) and relocates any
    /// surviving tail whose physical offset shifted.
    fn rewrite(
        &self,
        cfd: Fd,
        index: &mut FileIndex,
        mut dirty: Vec<(usize, Vec<u8>)>,
        ctx: &OpContext,
    ) -> Result<()> {
        dirty.sort_by_key(|(i, _)| *i);
        let fc = dirty[0].0;
        let old_count = index.sizes.len();

        // Pack the new payloads.
        let mut packed: HashMap<usize, (Vec<u8>, bool)> = HashMap::new();
        for (i, block) in dirty {
            let entry = self.pack_block(block)?;
            packed.insert(i, entry);
        }
        let new_count = old_count.max(packed.keys().max().unwrap() + 1);

        // Fast path: every changed block keeps its stored size, so nothing
        // below it moves and payloads can be written in place.
        let in_place = packed
            .iter()
            .all(|(i, (p, _))| *i < old_count && index.sizes[*i] as usize == p.len());
        if in_place {
            for (i, (payload, verbatim)) in &packed {
                let n = self.next.pwrite(cfd, payload, index.phys_offset(*i), ctx)?;
                if n != payload.len() {
                    return Err(io::Error::other("short write in compressed backing file").into());
                }
                index.verbatim[*i] = *verbatim;
            }
            return Ok(());
        }

        // Preserve untouched payloads at or above the first changed block;
        // their stored offsets are about to shift.
        let mut tail: Vec<(usize, Vec<u8>, bool)> = Vec::new();
        for i in fc..new_count {
            if let Some((payload, verbatim)) = packed.remove(&i) {
                tail.push((i, payload, verbatim));
            } else {
                let payload = self.read_payload(cfd, index, i, ctx)?;
                tail.push((i, payload, index.verbatim[i]));
            }
        }

        index.sizes.resize(new_count, 0);
        index.verbatim.resize(new_count, false);

        let mut off = index.phys_offset(fc);
        for (i, payload, verbatim) in tail {
            let n = self.next.pwrite(cfd, &payload, off, ctx)?;
            if n != payload.len() {
                return Err(io::Error::other("short write in compressed backing file").into());
            }
            index.sizes[i] = payload.len() as u32;
            index.verbatim[i] = verbatim;
            off += payload.len() as u64;
        }
        self.next.ftruncate(cfd, index.phys_total(), ctx)
    }
}

impl Layer for SparseCompressionLayer {
    fn kind(&self) -> &'static str {
        "compression"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd> {
        let cfd = self.next.open(path, flags, mode, ctx)?;
        let stat = match self.next.fstat(cfd, ctx) {
            Ok(stat) => stat,
            Err(e) => {
                let _ = self.next.close(cfd, ctx);
                return Err(e);
            }
        };

        let index = {
            let mut indexes = self.indexes.lock();
            let slot = indexes.entry((stat.dev, stat.ino)).or_insert_with(|| {
                let bsize = self.block_size as u64;
                let index = if let Some(index) = self.load_sidecar(path, ctx) {
                    index
                } else if stat.size > 0 {
                    warn!(path, size = stat.size, "no compression index; adopting file verbatim");
                    FileIndex::adopt_verbatim(bsize, stat.size)
                } else {
                    FileIndex::empty(bsize)
                };
                Arc::new(Mutex::new(index))
            });
            Arc::clone(slot)
        };

        if flags.truncate {
            let mut idx = index.lock();
            let bsize = idx.block_size;
            *idx = FileIndex::empty(bsize);
            idx.dirty = true;
        }

        Ok(self.files.lock().insert(OpenState { cfd, path: path.to_owned(), index }))
    }

    fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()> {
        let state = self.files.lock().remove(fd)?;
        let res = {
            let mut index = state.index.lock();
            if index.dirty {
                let res = self.store_sidecar(&state.path, &index, ctx);
                if res.is_ok() {
                    index.dirty = false;
                }
                res
            } else {
                Ok(())
            }
        };
        self.next.close(state.cfd, ctx)?;
        res
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (cfd, _, index) = self.state(fd)?;
        let index = index.lock();
        let bsize = index.block_size;

        if offset >= index.logical_eof {
            return Ok(0);
        }
        let len = buf.len().min((index.logical_eof - offset) as usize);
        buf[..len].fill(0);

        let first = offset / bsize;
        let last = (offset + len as u64 - 1) / bsize;
        for i in first..=last {
            let block = self.read_block(cfd, &index, i as usize, ctx)?;
            if block.is_empty() {
                continue;
            }
            let block_start = i * bsize;
            // Overlap of [offset, offset+len) with this block's bytes.
            let lo = offset.max(block_start);
            let hi = (offset + len as u64).min(block_start + block.len() as u64);
            if lo < hi {
                let dst = (lo - offset) as usize;
                let src = (lo - block_start) as usize;
                let n = (hi - lo) as usize;
                buf[dst..dst + n].copy_from_slice(&block[src..src + n]);
            }
        }
        Ok(len)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (cfd, _, index) = self.state(fd)?;
        let mut index = index.lock();
        let bsize = index.block_size;

        let first = (offset / bsize) as usize;
        let last = ((offset + buf.len() as u64 - 1) / bsize) as usize;
        let old_count = index.sizes.len();
        let new_count = old_count.max(last + 1);

        let mut dirty: Vec<(usize, Vec<u8>)> = Vec::new();

        // A partial final block only stays partial if it remains the file's
        // last stored block; anything stored beyond it forces zero-extension.
        if old_count > 0 && index.stored_eof < old_count as u64 * bsize && new_count > old_count {
            let i = old_count - 1;
            let mut block = self.read_block(cfd, &index, i, ctx)?;
            block.resize(bsize as usize, 0);
            dirty.push((i, block));
        }

        // Holes between the old stored extent and the write materialize as
        // zero blocks to keep prefix-sum addressing dense.
        for i in old_count..first {
            dirty.push((i, vec![0u8; bsize as usize]));
        }

        for i in first..=last {
            let block_start = i as u64 * bsize;
            let is_final = i + 1 == new_count;

            // Base content: a gap block already staged above, or whatever is
            // stored today (zero-length for a hole).
            let old = match dirty.iter().position(|(d, _)| *d == i) {
                Some(pos) => dirty.remove(pos).1,
                None => self.read_block(cfd, &index, i, ctx)?,
            };

            let write_lo = offset.max(block_start);
            let write_hi = (offset + buf.len() as u64).min(block_start + bsize);
            let new_ulen = if is_final {
                old.len().max((write_hi - block_start) as usize)
            } else {
                bsize as usize
            };

            let mut block = vec![0u8; new_ulen];
            block[..old.len()].copy_from_slice(&old);
            let src = (write_lo - offset) as usize;
            let n = (write_hi - write_lo) as usize;
            block[(write_lo - block_start) as usize..][..n].copy_from_slice(&buf[src..src + n]);
            dirty.push((i, block));
        }

        self.rewrite(cfd, &mut index, dirty, ctx)?;
        index.stored_eof = index.stored_eof.max(offset + buf.len() as u64);
        index.logical_eof = index.logical_eof.max(offset + buf.len() as u64);
        index.dirty = true;
        Ok(buf.len())
    }

    fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()> {
        let (cfd, path, index) = self.state(fd)?;
        let mut index = index.lock();
        let bsize = index.block_size;

        if length >= index.logical_eof {
            // Lengthening: the hole reads back as zeros, nothing materializes.
            index.logical_eof = length;
        } else {
            index.logical_eof = length;
            if length < index.stored_eof {
                let keep = length.div_ceil(bsize) as usize;

                // Re-read the now-final block before the recorded extent
                // shrinks; its stored payload still decompresses to the old
                // length.
                let mut trim = None;
                if keep > 0 {
                    let i = keep - 1;
                    let tail_len = (length - i as u64 * bsize) as usize;
                    if tail_len < index.ulen(i) {
                        let mut block = self.read_block(cfd, &index, i, ctx)?;
                        block.truncate(tail_len);
                        trim = Some((i, block));
                    }
                }

                index.sizes.truncate(keep);
                index.verbatim.truncate(keep);
                index.stored_eof = length;
                if let Some((i, block)) = trim {
                    self.rewrite(cfd, &mut index, vec![(i, block)], ctx)?;
                }
                self.next.ftruncate(cfd, index.phys_total(), ctx)?;
            }
        }
        index.dirty = true;
        let res = self.store_sidecar(&path, &index, ctx);
        if res.is_ok() {
            index.dirty = false;
        }
        res
    }

    fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat> {
        let (cfd, _, index) = self.state(fd)?;
        let mut stat = self.next.fstat(cfd, ctx)?;
        stat.size = index.lock().logical_eof;
        Ok(stat)
    }

    fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat> {
        let mut stat = self.next.lstat(path, ctx)?;
        let known = self.indexes.lock().get(&(stat.dev, stat.ino)).map(Arc::clone);
        if let Some(index) = known {
            stat.size = index.lock().logical_eof;
        } else if let Some(index) = self.load_sidecar(path, &OpContext::none()) {
            stat.size = index.logical_eof;
        }
        Ok(stat)
    }

    fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
        let key = self.next.lstat(path, ctx).ok().map(|s| (s.dev, s.ino));
        self.next.unlink(path, ctx)?;
        if let Some(key) = key {
            self.indexes.lock().remove(&key);
        }
        // The sidecar is this layer's artifact; a missing one is fine.
        let _ = self.next.unlink(&format!("{path}{INDEX_SUFFIX}"), ctx);
        Ok(())
    }

    fn descendant_count(&self) -> usize {
        1 + self.next.descendant_count()
    }
}
