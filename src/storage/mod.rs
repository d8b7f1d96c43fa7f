//! File-level storage helpers shared by the builder and the serving cache.

pub mod compression;

pub use compression::{
    CompressedWriter, CompressionService, Lz4Compression, NoCompression, default_compression,
};
