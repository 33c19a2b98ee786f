//! # Compression
//!
//! Two separate concerns live here:
//!
//! - **Entry compression** ([`CompressionAlgo`]): how a single zip entry's bytes are encoded.
//!   This work runs on the worker pool, one entry at a time.
//! - **Stream codecs** ([`StreamCodec`]): a transform over the whole container byte stream, as
//!   used by `.tar.gz` and friends. [`CodecWriter`] wraps the output on the writing side and
//!   [`decoder`] wraps the input on the reading side.
//!
//! Snappy framing is not provided; adding a codec means one more variant in each enum.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Defines the available per-entry compression algorithms.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgo {
    /// Plain storage without any compression. Useful for already-compressed ("dense") data.
    Store,
    /// DEFLATE, readable by every zip tool.
    #[default]
    Deflate,
    /// Use the Zstandard algorithm. Fast and effective, but not every reader supports it.
    Zstd,
}

/// Returns true if the file extension is typically already compressed / dense.
pub(crate) fn is_dense_ext(ext: &str) -> bool {
    matches!(ext.to_ascii_lowercase().as_str(),
        "png" | "jpg" | "jpeg" | "gif" | "mp4" | "mkv" | "mp3" | "ogg" | "flac" |
        "zip" | "jar" | "war" | "ear" | "rar" | "7z" | "gz" | "tgz" | "bz2" | "xz" | "zst" |
        "pdf" | "docx" | "pptx" | "xlsx")
}

/// Extension of the last path segment, if any.
pub(crate) fn extension_of(name: &str) -> Option<&str> {
    let base = name.rsplit('/').next().unwrap_or(name);
    match base.rfind('.') {
        Some(dot) if dot > 0 => Some(&base[dot + 1..]),
        _ => None,
    }
}

/// Whole-stream codec applied around a tar container.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamCodec {
    #[default]
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl StreamCodec {
    /// Level used when the caller does not pick one.
    pub fn default_level(self) -> u32 {
        match self {
            StreamCodec::None => 0,
            StreamCodec::Gzip | StreamCodec::Bzip2 | StreamCodec::Xz => 6,
            StreamCodec::Zstd => 3,
        }
    }
}

/// Encoding side of a [`StreamCodec`].
pub enum CodecWriter<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CodecWriter<W> {
    pub fn new(codec: StreamCodec, out: W, level: Option<u32>) -> io::Result<Self> {
        let level = level.unwrap_or_else(|| codec.default_level());
        Ok(match codec {
            StreamCodec::None => CodecWriter::Plain(out),
            StreamCodec::Gzip => {
                CodecWriter::Gzip(flate2::write::GzEncoder::new(out, flate2::Compression::new(level.min(9))))
            }
            StreamCodec::Bzip2 => {
                CodecWriter::Bzip2(bzip2::write::BzEncoder::new(out, bzip2::Compression::new(level.clamp(1, 9))))
            }
            StreamCodec::Xz => CodecWriter::Xz(xz2::write::XzEncoder::new(out, level.min(9))),
            StreamCodec::Zstd => CodecWriter::Zstd(zstd::stream::write::Encoder::new(out, level as i32)?),
        })
    }

    /// Write any trailer and hand back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CodecWriter::Plain(w) => Ok(w),
            CodecWriter::Gzip(enc) => enc.finish(),
            CodecWriter::Bzip2(enc) => enc.finish(),
            CodecWriter::Xz(enc) => enc.finish(),
            CodecWriter::Zstd(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for CodecWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CodecWriter::Plain(w) => w.write(buf),
            CodecWriter::Gzip(enc) => enc.write(buf),
            CodecWriter::Bzip2(enc) => enc.write(buf),
            CodecWriter::Xz(enc) => enc.write(buf),
            CodecWriter::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CodecWriter::Plain(w) => w.flush(),
            CodecWriter::Gzip(enc) => enc.flush(),
            CodecWriter::Bzip2(enc) => enc.flush(),
            CodecWriter::Xz(enc) => enc.flush(),
            CodecWriter::Zstd(enc) => enc.flush(),
        }
    }
}

/// Decoding side of a [`StreamCodec`].
pub fn decoder<R: Read + Send + 'static>(codec: StreamCodec, input: R) -> io::Result<Box<dyn Read + Send>> {
    Ok(match codec {
        StreamCodec::None => Box::new(input),
        StreamCodec::Gzip => Box::new(flate2::read::GzDecoder::new(input)),
        StreamCodec::Bzip2 => Box::new(bzip2::read::BzDecoder::new(input)),
        StreamCodec::Xz => Box::new(xz2::read::XzDecoder::new(input)),
        StreamCodec::Zstd => Box::new(zstd::stream::read::Decoder::new(input)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_codec_roundtrips() -> Result<(), Box<dyn std::error::Error>> {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        for codec in [StreamCodec::None, StreamCodec::Gzip, StreamCodec::Bzip2, StreamCodec::Xz, StreamCodec::Zstd] {
            let mut enc = CodecWriter::new(codec, Vec::new(), None)?;
            enc.write_all(&payload)?;
            let encoded = enc.finish()?;
            if codec != StreamCodec::None {
                assert!(encoded.len() < payload.len(), "{codec:?} did not compress");
            }
            let mut decoded = Vec::new();
            decoder(codec, io::Cursor::new(encoded))?.read_to_end(&mut decoded)?;
            assert_eq!(decoded, payload, "{codec:?}");
        }
        Ok(())
    }

    #[test]
    fn dense_extensions() {
        assert_eq!(extension_of("lib/dep.JAR"), Some("JAR"));
        assert!(is_dense_ext("JAR"));
        assert!(!is_dense_ext("txt"));
        assert_eq!(extension_of("dir.d/.hidden"), None);
        assert_eq!(extension_of("Makefile"), None);
    }
}
