use crate::error::{Error, Result};

use std::fmt::Debug;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Encoding name of the gzip provider.
pub const GZIP_ENCODING: &str = "gzip";

/// How hard a provider should try.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CompressionLevel {
    /// Balance speed and size.
    #[default]
    Optimal,
    /// Favour speed.
    Fastest,
    /// Favour size.
    SmallestSize,
    /// Store without compressing.
    NoCompression,
}

impl From<CompressionLevel> for Compression {
    fn from(level: CompressionLevel) -> Self {
        match level {
            CompressionLevel::Optimal => Self::default(),
            CompressionLevel::Fastest => Self::fast(),
            CompressionLevel::SmallestSize => Self::best(),
            CompressionLevel::NoCompression => Self::none(),
        }
    }
}

/// Compresses and decompresses message bodies for one encoding.
pub trait CompressionProvider: Debug + Send + Sync + 'static {
    /// Name advertised in encoding headers.
    fn encoding_name(&self) -> &'static str;

    /// Compresses `data`, using the provider's default level when `level` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if compression fails.
    fn compress(&self, data: &[u8], level: Option<CompressionLevel>) -> Result<Bytes>;

    /// Decompresses `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not valid for this encoding.
    fn decompress(&self, data: &[u8]) -> Result<Bytes>;
}

/// Gzip provider backed by `flate2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GzipCompressionProvider {
    default_level: CompressionLevel,
}

impl GzipCompressionProvider {
    /// Creates a provider with the given default level.
    #[must_use]
    pub const fn new(default_level: CompressionLevel) -> Self {
        Self { default_level }
    }
}

impl CompressionProvider for GzipCompressionProvider {
    fn encoding_name(&self) -> &'static str {
        GZIP_ENCODING
    }

    fn compress(&self, data: &[u8], level: Option<CompressionLevel>) -> Result<Bytes> {
        let level = level.unwrap_or(self.default_level);
        let mut encoder = GzEncoder::new(Vec::new(), level.into());
        encoder
            .write_all(data)
            .map_err(|e| Error::CompressionFailed(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| Error::CompressionFailed(e.to_string()))?;
        Ok(Bytes::from(compressed))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| Error::DecompressionFailed(e.to_string()))?;
        Ok(Bytes::from(decompressed))
    }
}

/// Providers installed when none are configured.
#[must_use]
pub fn default_providers() -> Vec<Arc<dyn CompressionProvider>> {
    vec![Arc::new(GzipCompressionProvider::default())]
}

/// Finds the provider for an encoding name.
#[must_use]
pub fn find_provider<'a>(
    providers: &'a [Arc<dyn CompressionProvider>],
    encoding: &str,
) -> Option<&'a Arc<dyn CompressionProvider>> {
    providers
        .iter()
        .find(|p| p.encoding_name().eq_ignore_ascii_case(encoding))
}

/// Comma separated list of encodings for an accept-encoding header.
#[must_use]
pub fn accept_encoding(providers: &[Arc<dyn CompressionProvider>]) -> String {
    providers
        .iter()
        .map(|p| p.encoding_name())
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether an accept-encoding header value lists `encoding`.
#[must_use]
pub fn accepts(accept_encoding: &str, encoding: &str) -> bool {
    accept_encoding
        .split(',')
        .any(|e| e.trim().eq_ignore_ascii_case(encoding))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_shrinks_repetitive_data() {
        let provider = GzipCompressionProvider::default();
        let data = "Hello GreeterClient ".repeat(100);

        let compressed = provider.compress(data.as_bytes(), None).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(provider.decompress(&compressed).unwrap(), data.as_bytes());
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let provider = GzipCompressionProvider::default();
        assert!(matches!(
            provider.decompress(b"not gzip"),
            Err(Error::DecompressionFailed(_))
        ));
    }

    #[test]
    fn test_find_provider_and_accepts() {
        let providers = default_providers();

        assert!(find_provider(&providers, "GZIP").is_some());
        assert!(find_provider(&providers, "br").is_none());
        assert_eq!(accept_encoding(&providers), "gzip");
        assert!(accepts("identity, gzip", "gzip"));
        assert!(!accepts("identity", "gzip"));
    }
}
