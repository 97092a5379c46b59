//! The layer implementations.
//!
//! Terminal layers (`local`, `remote`) end a stack; everything else
//! transforms requests and delegates to one or more children.

pub mod anti_tamper;
pub mod benchmark;
pub mod block_align;
pub mod demux;
pub mod encryption;
pub mod local;
pub mod read_cache;
pub mod remote;
pub mod sparse;
