//! On-disk encoding of snapshot files.
//!
//! Snapshots are stored either as plain JSON or gzipped JSON; the encoding is
//! detected from the file extension so a store may hold both after the
//! compression setting changes.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use flate2::{Compression as GzLevel, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
use std::path::Path;

/// Encoding of a snapshot file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Plain JSON (`.json`)
    None,
    /// Gzipped JSON (`.json.gz`)
    #[default]
    Gzip,
}

impl Compression {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled { Self::Gzip } else { Self::None }
    }

    /// Detect the encoding from a file extension.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("gz") => Self::Gzip,
            _ => Self::None,
        }
    }

    /// File extension appended after `.json`.
    #[inline]
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
        }
    }

    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(input.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
                encoder.write_all(input).or_raise(|| ErrorKind::Compression)?;
                encoder.finish().or_raise(|| ErrorKind::Compression)
            },
        }
    }

    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        self.decompress_limited(input, u64::MAX)
    }

    /// Decode at most `limit` bytes; larger output is [`ErrorKind::CorruptData`].
    pub fn decompress_limited(&self, input: &[u8], limit: u64) -> Result<Vec<u8>> {
        let output = match self {
            Self::None => input.to_vec(),
            Self::Gzip => {
                let mut output = Vec::new();
                GzDecoder::new(input)
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut output)
                    .or_raise(|| ErrorKind::Compression)?;
                output
            },
        };
        if output.len() as u64 > limit {
            exn::bail!(ErrorKind::CorruptData(format!("decoded size exceeds {limit} bytes")));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("us/stormrage/1.json", Compression::None)]
    #[case("us/stormrage/1.json.gz", Compression::Gzip)]
    #[case("us/stormrage/1.JSON.GZ", Compression::Gzip)]
    #[case("index", Compression::None)]
    fn test_from_path(#[case] path: &str, #[case] expected: Compression) {
        assert_eq!(Compression::from_path(path), expected);
    }

    #[test]
    fn test_gzip_output_is_gzip() {
        let compressed = Compression::Gzip.compress(br#"{"auctions":[]}"#).unwrap();
        assert_eq!(&compressed[..2], &[0x1F, 0x8B]);
        assert_eq!(Compression::Gzip.decompress(&compressed).unwrap(), br#"{"auctions":[]}"#);
    }

    #[rstest]
    #[case(Compression::Gzip)]
    #[case(Compression::None)]
    fn test_decompress_limited(#[case] compression: Compression) {
        let encoded = compression.compress(&[b' '; 64]).unwrap();
        assert_eq!(compression.decompress_limited(&encoded, 64).unwrap().len(), 64);
        let err = compression.decompress_limited(&encoded, 63).unwrap_err();
        assert!(matches!(&*err, ErrorKind::CorruptData(_)));
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let err = Compression::Gzip.decompress(b"not gzip at all").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Compression));
    }
}
