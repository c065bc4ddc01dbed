//! Storage abstraction layer for Braid.
//!
//! Index files live in a [`Storage`]: a flat namespace of write-once files
//! plus named locks. Backends are provided for the local filesystem and for
//! memory.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::*;
pub use memory::*;
pub use traits::*;
