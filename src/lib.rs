//! TamperStack - a composable, tamper-evident, POSIX-style I/O layer stack.
//!
//! A TOML configuration declares a DAG of typed layers; [`builder::Stack`]
//! instantiates a tree rooted at one layer exposing a file-oriented
//! interface (open, close, positioned read/write, truncate, stat, unlink).
//! Layering adds integrity hashing, compression, encryption, caching, block
//! alignment, fan-out replication and benchmarking without the application
//! noticing:
//!
//! - anti-tampering in whole-file and per-block modes
//! - LZ4/ZSTD sparse-block compression with random-access reads
//! - AES-256-XTS encryption
//! - block alignment by read-modify-write
//! - a fixed-size read cache
//! - fan-out across children with enforcement roles

pub mod builder;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod hashing;
pub mod layer;
pub mod layers;
pub mod logging;
pub mod metadata;
pub mod pathlock;

pub use builder::Stack;
pub use config::StackConfig;
pub use error::{LayerError, Result};
pub use layer::{Fd, FileStat, Layer, OpContext, OpenFlags, SharedLayer};
