//! The layer protocol: the uniform operation contract every layer honors.
//!
//! A stack is a tree of [`Layer`] values. Each layer exposes the same
//! file-oriented operation set, owns zero or more children, and forwards
//! calls through the child's trait object. Descriptors are opaque
//! non-negative integers valid only within the issuing layer; every layer
//! maintains its own mapping from external descriptor to internal state.
//!
//! All operations take `&self`: layers use interior mutability so a single
//! tree can be driven from many threads at once.

use std::any::Any;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::{LayerError, Result};

/// External descriptor type. Non-negative on success.
pub type Fd = i32;

/// A layer shared between a parent and the builder.
pub type SharedLayer = Arc<dyn Layer>;

/// Open disposition flags, a structured rendition of `O_RDONLY`/`O_RDWR`/
/// `O_CREAT`/`O_TRUNC`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,

    /// Open for writing.
    pub write: bool,

    /// Create the file if it does not exist.
    pub create: bool,

    /// Truncate to zero length on open.
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-only open of an existing file.
    #[must_use]
    pub const fn read_only() -> Self {
        Self { read: true, write: false, create: false, truncate: false }
    }

    /// Read-write open of an existing file.
    #[must_use]
    pub const fn read_write() -> Self {
        Self { read: true, write: true, create: false, truncate: false }
    }

    /// Read-write open, creating the file if missing.
    #[must_use]
    pub const fn create_rdwr() -> Self {
        Self { read: true, write: true, create: true, truncate: false }
    }

    /// Returns a copy with the truncate flag set.
    #[must_use]
    pub const fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// True if the descriptor may be written through.
    #[must_use]
    pub const fn writable(self) -> bool {
        self.write
    }
}

/// File attributes as reported through `fstat`/`lstat`.
///
/// `dev`/`ino` identify the underlying object across renames and multiple
/// descriptors; the sparse-compression mapping is keyed on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    /// Device identifier of the containing filesystem.
    pub dev: u64,

    /// Inode number within the device.
    pub ino: u64,

    /// POSIX mode bits.
    pub mode: u32,

    /// File size in bytes, as visible through this layer.
    pub size: u64,

    /// Last modification time, seconds since the epoch.
    pub mtime: i64,
}

/// Caller-supplied context that travels with every operation.
///
/// The slot is opaque to the stack: layers forward it unchanged to their
/// children and never retain a reference past the call.
#[derive(Default, Clone, Copy)]
pub struct OpContext<'a> {
    /// Application payload, readable by any layer on the call path.
    pub app: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> OpContext<'a> {
    /// A context carrying no application payload.
    #[must_use]
    pub const fn none() -> Self {
        Self { app: None }
    }

    /// A context carrying the given payload.
    #[must_use]
    pub const fn with(app: &'a (dyn Any + Send + Sync)) -> Self {
        Self { app: Some(app) }
    }
}

/// The uniform operation set.
///
/// Contracts every implementation honors:
///
/// - `open` returns a non-negative descriptor valid only within this layer.
/// - Short reads are legal (end of file, partial block); short writes
///   indicate a downstream failure.
/// - `pread`/`pwrite` with an empty buffer return 0 without calling any
///   child.
/// - After `close`, operations on the descriptor fail with
///   [`LayerError::BadDescriptor`].
/// - `unlink` removes the data artifact and any layer-private sidecars
///   keyed on the same path.
pub trait Layer: Send + Sync {
    /// A short identifier used in logs and the `check` summary.
    fn kind(&self) -> &'static str;

    /// Opens `path`, returning a descriptor in this layer's handle space.
    fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd>;

    /// Closes a descriptor previously returned by [`Layer::open`].
    fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()>;

    /// Positioned read into `buf`; returns the number of bytes read.
    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize>;

    /// Positioned write of `buf`; returns the number of bytes written.
    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize>;

    /// Truncates (or extends) the open file to `length` bytes.
    fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()>;

    /// Attributes of an open descriptor.
    fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat>;

    /// Attributes of a path, without following a final symlink.
    fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat>;

    /// Removes a path and its layer-private sidecars.
    fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()>;

    /// Total number of layers in this subtree, this layer included.
    fn descendant_count(&self) -> usize {
        1
    }
}

/// Descriptor table shared by every layer implementation.
///
/// Maps this layer's external descriptors to per-file state. Descriptors are
/// drawn from a recycling pool: the lowest released value is handed out
/// again before the counter grows.
pub struct HandleTable<T> {
    entries: HashMap<Fd, T>,
    free: Vec<Fd>,
    next: Fd,
}

impl<T> HandleTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: HashMap::new(), free: Vec::new(), next: 0 }
    }

    /// Stores `state` and returns the descriptor now naming it.
    pub fn insert(&mut self, state: T) -> Fd {
        let fd = match self.free.pop() {
            Some(fd) => fd,
            None => {
                let fd = self.next;
                self.next += 1;
                fd
            }
        };
        self.entries.insert(fd, state);
        fd
    }

    /// Looks up the state for `fd`.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::BadDescriptor`] if `fd` is not open here.
    pub fn get(&self, fd: Fd) -> Result<&T> {
        self.entries.get(&fd).ok_or(LayerError::BadDescriptor(fd))
    }

    /// Mutable lookup for `fd`.
    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut T> {
        self.entries.get_mut(&fd).ok_or(LayerError::BadDescriptor(fd))
    }

    /// Removes `fd`, releasing it back to the pool.
    pub fn remove(&mut self, fd: Fd) -> Result<T> {
        let state = self.entries.remove(&fd).ok_or(LayerError::BadDescriptor(fd))?;
        self.free.push(fd);
        // Hand the lowest descriptor out first, like a kernel fd table.
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        Ok(state)
    }

    /// Iterates over `(fd, state)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (Fd, &T)> {
        self.entries.iter().map(|(fd, state)| (*fd, state))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_recycle_lowest_first() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        let c = table.insert("c");
        assert_eq!((a, b, c), (0, 1, 2));

        table.remove(b).unwrap();
        table.remove(a).unwrap();
        assert_eq!(table.insert("d"), 0);
        assert_eq!(table.insert("e"), 1);
        assert_eq!(table.insert("f"), 3);
    }

    #[test]
    fn test_closed_descriptor_is_invalid() {
        let mut table = HandleTable::new();
        let fd = table.insert(42u32);
        table.remove(fd).unwrap();

        assert!(matches!(table.get(fd), Err(LayerError::BadDescriptor(_))));
        assert!(matches!(table.remove(fd), Err(LayerError::BadDescriptor(_))));
    }
}
