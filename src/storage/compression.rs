//! Pluggable stream compression for scratch and centroid files.
//!
//! Components never pick a codec themselves. They receive an
//! `Arc<dyn CompressionService>` and ask it to wrap a file for writing or
//! reading. Files are always written sequentially and read sequentially,
//! which is all a frame codec needs.

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::Arc;

/// A compressing writer that hands the file back once the stream is closed.
pub trait CompressedWriter: Write + Send {
    /// Flushes the codec trailer and returns the underlying file.
    fn finish(self: Box<Self>) -> io::Result<File>;
}

/// Factory for compressed file streams.
pub trait CompressionService: Send + Sync + fmt::Debug {
    /// Short codec name for logs.
    fn name(&self) -> &'static str;

    /// Wraps `file`, positioned where the compressed stream should start.
    fn writer(&self, file: File) -> io::Result<Box<dyn CompressedWriter>>;

    /// Wraps `file`, positioned at the start of a compressed stream.
    fn reader(&self, file: File) -> io::Result<Box<dyn Read + Send>>;
}

/// LZ4 frame format via `lz4_flex`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compression;

struct Lz4Writer(FrameEncoder<BufWriter<File>>);

impl Write for Lz4Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl CompressedWriter for Lz4Writer {
    fn finish(self: Box<Self>) -> io::Result<File> {
        let buffered = self.0.finish().map_err(io::Error::other)?;
        buffered.into_inner().map_err(|e| e.into_error())
    }
}

impl CompressionService for Lz4Compression {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn writer(&self, file: File) -> io::Result<Box<dyn CompressedWriter>> {
        Ok(Box::new(Lz4Writer(FrameEncoder::new(BufWriter::new(file)))))
    }

    fn reader(&self, file: File) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(FrameDecoder::new(BufReader::new(file))))
    }
}

/// Pass-through codec, mostly for tests and debugging file contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

struct PlainWriter(BufWriter<File>);

impl Write for PlainWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl CompressedWriter for PlainWriter {
    fn finish(self: Box<Self>) -> io::Result<File> {
        self.0.into_inner().map_err(|e| e.into_error())
    }
}

impl CompressionService for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }

    fn writer(&self, file: File) -> io::Result<Box<dyn CompressedWriter>> {
        Ok(Box::new(PlainWriter(BufWriter::new(file))))
    }

    fn reader(&self, file: File) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// The codec used when nothing else is configured.
#[must_use]
pub fn default_compression() -> Arc<dyn CompressionService> {
    Arc::new(Lz4Compression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::tempfile;

    fn round_trip(service: &dyn CompressionService) -> Vec<u8> {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = service.writer(tempfile().unwrap()).unwrap();
        writer.write_all(&payload).unwrap();
        let mut file = writer.finish().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut restored = Vec::new();
        service.reader(file).unwrap().read_to_end(&mut restored).unwrap();
        assert_eq!(restored, payload);
        restored
    }

    #[test]
    fn test_lz4_round_trip() {
        round_trip(&Lz4Compression);
    }

    #[test]
    fn test_plain_round_trip() {
        round_trip(&NoCompression);
    }

    #[test]
    fn test_lz4_shrinks_repetitive_data() {
        let mut writer = Lz4Compression.writer(tempfile().unwrap()).unwrap();
        writer.write_all(&vec![7u8; 100_000]).unwrap();
        let file = writer.finish().unwrap();
        assert!(file.metadata().unwrap().len() < 10_000);
    }
}
