//! Global memory allocator configuration.
//!
//! This module configures the global memory allocator for the binary. We
//! use `mimalloc` instead of the system allocator: the stack allocates and
//! frees block-sized scratch buffers constantly, often from many calling
//! threads at once, and `mimalloc` keeps contention and fragmentation low
//! for exactly that pattern.

use mimalloc::MiMalloc;

/// The global allocator instance.
///
/// Registered as the `#[global_allocator]`, replacing the standard
/// library's default system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
