//! Fixed-size block cache over a block-aligned child.
//!
//! Entries are `(descriptor, block index) → block bytes`. A read walks the
//! covered blocks; hits copy out of the cache, and each maximal run of
//! consecutive misses is fetched from the child in a single `pread` before
//! being split into per-block entries. Writes and truncates invalidate the
//! touched blocks — the next read refetches them.
//!
//! Eviction is approximate LRU: accesses append `(key, tick)` markers to a
//! queue and entries record their latest tick, so eviction pops markers
//! until one is current. Stale markers are compacted opportunistically.

use anyhow::ensure;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::Result;
use crate::layer::{Fd, FileStat, HandleTable, Layer, OpContext, OpenFlags, SharedLayer};

struct FdState {
    cfd: Fd,
    ino: u64,
}

struct CacheEntry {
    data: Vec<u8>,
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    map: HashMap<(Fd, u64), CacheEntry>,
    order: VecDeque<((Fd, u64), u64)>,
    tick: u64,
}

impl CacheState {
    fn touch(&mut self, key: (Fd, u64)) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.map.get_mut(&key) {
            entry.tick = tick;
        }
        self.order.push_back((key, tick));
    }

    fn insert(&mut self, key: (Fd, u64), data: Vec<u8>, capacity: usize) {
        self.tick += 1;
        self.map.insert(key, CacheEntry { data, tick: self.tick });
        self.order.push_back((key, self.tick));

        while self.map.len() > capacity {
            match self.order.pop_front() {
                Some((victim, tick)) => {
                    // Stale marker: the entry was touched again or removed.
                    if self.map.get(&victim).is_some_and(|e| e.tick == tick) {
                        self.map.remove(&victim);
                    }
                }
                None => break,
            }
        }

        if self.order.len() > 4 * capacity + 16 {
            let map = &self.map;
            self.order.retain(|(k, t)| map.get(k).is_some_and(|e| e.tick == *t));
        }
    }

    fn evict_if(&mut self, pred: impl Fn(&(Fd, u64)) -> bool) {
        self.map.retain(|key, _| !pred(key));
    }
}

/// LRU-ish block cache layer.
pub struct ReadCacheLayer {
    next: SharedLayer,
    block_size: usize,
    capacity: usize,
    fds: Mutex<HandleTable<FdState>>,
    cache: Mutex<CacheState>,
}

impl ReadCacheLayer {
    /// # Errors
    ///
    /// Fails if `block_size` or `num_blocks` is zero.
    pub fn new(next: SharedLayer, block_size: usize, num_blocks: usize) -> anyhow::Result<Self> {
        ensure!(block_size > 0, "read_cache: block_size must be non-zero");
        ensure!(num_blocks > 0, "read_cache: num_blocks must be non-zero");
        Ok(Self {
            next,
            block_size,
            capacity: num_blocks,
            fds: Mutex::new(HandleTable::new()),
            cache: Mutex::new(CacheState::default()),
        })
    }

    fn fd_state(&self, fd: Fd) -> Result<(Fd, u64)> {
        let fds = self.fds.lock();
        let s = fds.get(fd)?;
        Ok((s.cfd, s.ino))
    }

    /// Fetches blocks `[start, start+count)` from the child in one read and
    /// caches each block. Returns the bytes actually read.
    fn fill_run(
        &self,
        fd: Fd,
        cfd: Fd,
        start: u64,
        count: usize,
        ctx: &OpContext,
    ) -> Result<Vec<u8>> {
        let bsize = self.block_size;
        let mut raw = vec![0u8; count * bsize];
        let got = self.next.pread(cfd, &mut raw, start * bsize as u64, ctx)?;
        raw.truncate(got);

        let mut cache = self.cache.lock();
        for (i, chunk) in raw.chunks(bsize).enumerate() {
            cache.insert((fd, start + i as u64), chunk.to_vec(), self.capacity);
        }
        Ok(raw)
    }
}

impl Layer for ReadCacheLayer {
    fn kind(&self) -> &'static str {
        "read_cache"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd> {
        let cfd = self.next.open(path, flags, mode, ctx)?;
        let ino = match self.next.fstat(cfd, ctx) {
            Ok(stat) => stat.ino,
            Err(e) => {
                let _ = self.next.close(cfd, ctx);
                return Err(e);
            }
        };
        Ok(self.fds.lock().insert(FdState { cfd, ino }))
    }

    fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()> {
        let state = self.fds.lock().remove(fd)?;
        self.cache.lock().evict_if(|(f, _)| *f == fd);
        self.next.close(state.cfd, ctx)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (cfd, _) = self.fd_state(fd)?;
        let bsize = self.block_size as u64;
        let first = offset / bsize;
        let last = (offset + buf.len() as u64 - 1) / bsize;

        // Gather block contents, fetching runs of misses in single reads.
        let mut blocks: Vec<Option<Vec<u8>>> = Vec::with_capacity((last - first + 1) as usize);
        {
            let mut cache = self.cache.lock();
            for i in first..=last {
                let hit = cache.map.get(&(fd, i)).map(|e| e.data.clone());
                if hit.is_some() {
                    cache.touch((fd, i));
                }
                blocks.push(hit);
            }
        }

        let mut i = 0usize;
        while i < blocks.len() {
            if blocks[i].is_some() {
                i += 1;
                continue;
            }
            let mut run = 1usize;
            while i + run < blocks.len() && blocks[i + run].is_none() {
                run += 1;
            }
            let raw = self.fill_run(fd, cfd, first + i as u64, run, ctx)?;
            for (j, chunk) in raw.chunks(self.block_size).enumerate() {
                blocks[i + j] = Some(chunk.to_vec());
            }
            i += run;
        }

        // Assemble the requested slice; a short block ends the file.
        let mut done = 0usize;
        for (j, block) in blocks.iter().enumerate() {
            let block_start = (first + j as u64) * bsize;
            let block_data = block.as_deref().unwrap_or(&[]);
            let lo = offset.max(block_start);
            let hi = (offset + buf.len() as u64).min(block_start + block_data.len() as u64);
            if lo >= hi {
                break;
            }
            let n = (hi - lo) as usize;
            buf[done..done + n]
                .copy_from_slice(&block_data[(lo - block_start) as usize..][..n]);
            done += n;
            if block_data.len() < self.block_size {
                break;
            }
        }
        Ok(done)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (cfd, _) = self.fd_state(fd)?;
        let written = self.next.pwrite(cfd, buf, offset, ctx)?;
        if written > 0 {
            let bsize = self.block_size as u64;
            let first = offset / bsize;
            let last = (offset + written as u64 - 1) / bsize;
            self.cache.lock().evict_if(|(f, b)| *f == fd && (first..=last).contains(b));
        }
        Ok(written)
    }

    fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()> {
        let (cfd, _) = self.fd_state(fd)?;
        let old_size = self.next.fstat(cfd, ctx).map(|s| s.size).unwrap_or(0);
        self.next.ftruncate(cfd, length, ctx)?;

        let bsize = self.block_size as u64;
        // Everything past the new end is gone; the block holding the old or
        // new boundary may change shape, so it goes too.
        let boundary = length.min(old_size) / bsize;
        self.cache.lock().evict_if(|(f, b)| *f == fd && *b >= boundary);
        Ok(())
    }

    fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat> {
        let (cfd, _) = self.fd_state(fd)?;
        self.next.fstat(cfd, ctx)
    }

    fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat> {
        self.next.lstat(path, ctx)
    }

    fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
        let ino = self.next.lstat(path, ctx).ok().map(|s| s.ino);
        self.next.unlink(path, ctx)?;
        if let Some(ino) = ino {
            let doomed: Vec<Fd> = self
                .fds
                .lock()
                .iter()
                .filter(|(_, s)| s.ino == ino)
                .map(|(fd, _)| fd)
                .collect();
            self.cache.lock().evict_if(|(f, _)| doomed.contains(f));
        }
        Ok(())
    }

    fn descendant_count(&self) -> usize {
        1 + self.next.descendant_count()
    }
}
