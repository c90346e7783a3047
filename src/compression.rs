//! Compression envelope detection for image archives.
//!
//! The archive handed to the converter may be a bare tar stream or one
//! wrapped in gzip or bzip2. The envelope is recognized from its leading
//! magic bytes; formats we recognize but cannot decode (xz, zstd) are
//! rejected instead of being fed to the tar reader as raw data.

use crate::error::ConvertError;
use anyhow::Result;
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::fmt;
use std::io::{self, Cursor, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Uncompressed,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
            Compression::Uncompressed => "uncompressed",
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, Compression::Xz | Compression::Zstd)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Checked first to last; the first complete match wins.
const MAGIC_TABLE: &[(&[u8], Compression)] = &[
    (&[0x42, 0x5A, 0x68], Compression::Bzip2),
    (&[0x1F, 0x8B, 0x08], Compression::Gzip),
    (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], Compression::Xz),
    (&[0x28, 0xB5, 0x2F, 0xFD], Compression::Zstd),
];

fn magic_window() -> usize {
    MAGIC_TABLE
        .iter()
        .map(|(magic, _)| magic.len())
        .max()
        .unwrap_or(0)
}

/// Classifies a stream from its first bytes.
///
/// A magic only matches when `prefix` holds all of its bytes, so a short
/// stream falls back to [`Compression::Uncompressed`] unless some magic is
/// fully present.
pub fn detect(prefix: &[u8]) -> Compression {
    MAGIC_TABLE
        .iter()
        .find(|(magic, _)| prefix.starts_with(magic))
        .map(|(_, compression)| *compression)
        .unwrap_or(Compression::Uncompressed)
}

/// Reader that hands back the peeked prefix before the rest of the stream.
pub type Peeked<R> = io::Chain<Cursor<Vec<u8>>, R>;

/// Peeks the magic window of `reader` without losing any bytes.
pub fn sniff<R: Read>(mut reader: R) -> Result<(Compression, Peeked<R>)> {
    let window = magic_window();
    let mut prefix = vec![0u8; window];
    let mut filled = 0;

    while filled < window {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to read archive header")),
        }
    }
    prefix.truncate(filled);

    let compression = detect(&prefix);
    log::debug!("Detected {} archive envelope", compression);

    Ok((compression, Cursor::new(prefix).chain(reader)))
}

/// Sniffs `reader` and wraps it in the matching decoder.
pub fn decompress<'a, R: Read + 'a>(reader: R) -> Result<(Compression, Box<dyn Read + 'a>)> {
    let (compression, peeked) = sniff(reader)?;

    let decoded: Box<dyn Read + 'a> = match compression {
        Compression::Gzip => Box::new(MultiGzDecoder::new(peeked)),
        Compression::Bzip2 => Box::new(MultiBzDecoder::new(peeked)),
        Compression::Uncompressed => Box::new(peeked),
        Compression::Xz | Compression::Zstd => {
            return Err(ConvertError::UnsupportedCompression(compression.name()).into());
        }
    };

    Ok((compression, decoded))
}
