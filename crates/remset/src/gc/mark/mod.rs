//! Marking-side data shared with the remembered-set subsystem.

pub mod bitmap;

pub use bitmap::{AtomicBitmap, MarkBitmap};
