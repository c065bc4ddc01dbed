//! Utility modules for Braid.

pub mod varint;

pub use varint::*;
