//! Compression Codec
//!
//! Reversible value encoding with measured-benefit selection. The default
//! transform is a byte-level run-length encoding; LZ4 is available as a
//! configurable alternative. An encoded form is kept only when it beats the
//! configured benefit ratio, otherwise the value is stored raw — compression
//! is only worth its decode overhead above a minimum savings threshold.
//!
//! Round-trip verification runs before any compressed representation is
//! reported: a mismatch is a codec bug surfaced as [`Error::Encode`], never
//! stored and never silently served.

use std::io;

use bytes::Bytes;
use tracing::warn;

use crate::config::{CodecAlgorithm, CodecConfig};
use crate::error::{Error, Result};

// =============================================================================
// Encoding
// =============================================================================

/// How a stored payload is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Stored as-is
    Raw,
    /// Run-length transformed
    Rle,
    /// LZ4 block compressed
    Lz4,
}

impl Encoding {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Raw => "raw",
            Encoding::Rle => "rle",
            Encoding::Lz4 => "lz4",
        }
    }

    /// True for any non-raw representation
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Encoding::Raw)
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Codec Trait
// =============================================================================

/// Trait for reversible byte transforms
pub trait Codec: Send + Sync {
    /// Encoding identifier produced by this codec
    fn encoding(&self) -> Encoding;

    /// Transform data
    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Reverse the transform, reproducing the exact original bytes
    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

// =============================================================================
// Run-Length Codec
// =============================================================================

/// Byte-level run-length codec.
///
/// Output is a sequence of `(run_length, byte)` pairs with runs capped at
/// 255. Worst case doubles the input, which the benefit threshold in
/// [`CodecManager`] discards.
pub struct RleCodec;

impl Codec for RleCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Rle
    }

    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 2);
        let mut iter = data.iter();

        if let Some(&first) = iter.next() {
            let mut current = first;
            let mut run: u8 = 1;
            for &byte in iter {
                if byte == current && run < u8::MAX {
                    run += 1;
                } else {
                    out.push(run);
                    out.push(current);
                    current = byte;
                    run = 1;
                }
            }
            out.push(run);
            out.push(current);
        }

        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        if data.len() % 2 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "run-length stream has odd length",
            ));
        }

        let mut out = Vec::with_capacity(data.len());
        for pair in data.chunks_exact(2) {
            let (run, byte) = (pair[0], pair[1]);
            if run == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "run-length stream contains zero-length run",
                ));
            }
            out.extend(std::iter::repeat(byte).take(run as usize));
        }
        Ok(out)
    }
}

// =============================================================================
// LZ4 Codec
// =============================================================================

/// LZ4 block codec (size-prepended mode, so decode needs no external length).
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn encoding(&self) -> Encoding {
        Encoding::Lz4
    }

    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        lz4::block::compress(data, None, true)
    }

    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        lz4::block::decompress(data, None)
    }
}

// =============================================================================
// Codec Manager
// =============================================================================

/// Outcome of encoding a value for storage.
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Bytes to store
    pub payload: Bytes,
    /// Representation of `payload`
    pub encoding: Encoding,
}

/// Applies the configured transform with benefit-threshold fallback and
/// round-trip verification.
pub struct CodecManager {
    config: CodecConfig,
    rle: RleCodec,
    lz4: Lz4Codec,
}

impl CodecManager {
    /// Create a manager with default config
    pub fn new() -> Self {
        Self::with_config(CodecConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: CodecConfig) -> Self {
        Self {
            config,
            rle: RleCodec,
            lz4: Lz4Codec,
        }
    }

    fn codec_for(&self, encoding: Encoding) -> Option<&dyn Codec> {
        match encoding {
            Encoding::Raw => None,
            Encoding::Rle => Some(&self.rle),
            Encoding::Lz4 => Some(&self.lz4),
        }
    }

    fn configured_codec(&self) -> &dyn Codec {
        match self.config.algorithm {
            CodecAlgorithm::Rle => &self.rle,
            CodecAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Encode a value for storage.
    ///
    /// Values below the minimum size, transforms that fail, and transforms
    /// whose savings fall under the benefit threshold all fall back to the
    /// raw representation. A round-trip verification mismatch is fatal to
    /// the operation.
    pub fn encode(&self, raw: &[u8]) -> Result<Encoded> {
        self.encode_inner(raw, false)
    }

    /// Encode ignoring the minimum-size gate. Used by the memory-pressure
    /// compression pass, where shrinking already-resident entries matters
    /// more than per-write latency.
    pub fn encode_aggressive(&self, raw: &[u8]) -> Result<Encoded> {
        self.encode_inner(raw, true)
    }

    fn encode_inner(&self, raw: &[u8], ignore_min_size: bool) -> Result<Encoded> {
        if !ignore_min_size && raw.len() < self.config.min_size_bytes {
            return Ok(Encoded {
                payload: Bytes::copy_from_slice(raw),
                encoding: Encoding::Raw,
            });
        }

        let codec = self.configured_codec();
        let transformed = match codec.encode(raw) {
            Ok(t) => t,
            Err(e) => {
                warn!(codec = %codec.encoding(), error = %e, "transform failed, storing raw");
                return Ok(Encoded {
                    payload: Bytes::copy_from_slice(raw),
                    encoding: Encoding::Raw,
                });
            }
        };

        // Savings below the threshold: not worth the decode overhead.
        if (transformed.len() as f64) >= self.config.benefit_ratio * (raw.len() as f64) {
            return Ok(Encoded {
                payload: Bytes::copy_from_slice(raw),
                encoding: Encoding::Raw,
            });
        }

        if self.config.verify_roundtrip {
            let restored = codec.decode(&transformed).map_err(|e| {
                Error::encode(format!("{} round-trip decode failed: {e}", codec.encoding()))
            })?;
            if restored != raw {
                return Err(Error::encode(format!(
                    "{} round-trip mismatch: {} bytes in, {} bytes back",
                    codec.encoding(),
                    raw.len(),
                    restored.len()
                )));
            }
        }

        Ok(Encoded {
            payload: Bytes::from(transformed),
            encoding: codec.encoding(),
        })
    }

    /// Decode a stored payload back to the original bytes.
    pub fn decode(
        &self,
        payload: &[u8],
        encoding: Encoding,
        namespace: &str,
        key: &str,
    ) -> Result<Bytes> {
        match self.codec_for(encoding) {
            None => Ok(Bytes::copy_from_slice(payload)),
            Some(codec) => codec
                .decode(payload)
                .map(Bytes::from)
                .map_err(|e| Error::decode(namespace, key, e.to_string())),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}

impl Default for CodecManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RUNS: &[u8] = b"aaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbcccccccccccccccccccc\
        ddddddddddddddddddddddddddddeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee";

    #[test]
    fn test_rle_roundtrip() {
        let codec = RleCodec;
        let encoded = codec.encode(RUNS).unwrap();
        assert!(encoded.len() < RUNS.len());
        assert_eq!(codec.decode(&encoded).unwrap(), RUNS);
    }

    #[test]
    fn test_rle_empty() {
        let codec = RleCodec;
        let encoded = codec.encode(b"").unwrap();
        assert!(encoded.is_empty());
        assert!(codec.decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_rle_long_run_split() {
        let codec = RleCodec;
        let data = vec![7u8; 600];
        let encoded = codec.encode(&data).unwrap();
        // 600 = 255 + 255 + 90, three pairs
        assert_eq!(encoded.len(), 6);
        assert_eq!(codec.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_rle_rejects_corrupt_stream() {
        let codec = RleCodec;
        assert!(codec.decode(&[1, 2, 3]).is_err()); // odd length
        assert!(codec.decode(&[0, 42]).is_err()); // zero run
    }

    #[test]
    fn test_lz4_roundtrip() {
        let codec = Lz4Codec;
        let encoded = codec.encode(RUNS).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), RUNS);
    }

    #[test]
    fn test_manager_compresses_repetitive_data() {
        let manager = CodecManager::new();
        let encoded = manager.encode(RUNS).unwrap();
        assert_eq!(encoded.encoding, Encoding::Rle);
        assert!(encoded.payload.len() < RUNS.len());

        let decoded = manager
            .decode(&encoded.payload, encoded.encoding, "ns", "k")
            .unwrap();
        assert_eq!(decoded.as_ref(), RUNS);
    }

    #[test]
    fn test_manager_small_values_stay_raw() {
        let manager = CodecManager::new();
        let encoded = manager.encode(b"tiny").unwrap();
        assert_eq!(encoded.encoding, Encoding::Raw);
        assert_eq!(encoded.payload.as_ref(), b"tiny");
    }

    #[test]
    fn test_manager_benefit_threshold_fallback() {
        // Alternating bytes: RLE doubles the size, so raw must win.
        let manager = CodecManager::new();
        let data: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();
        let encoded = manager.encode(&data).unwrap();
        assert_eq!(encoded.encoding, Encoding::Raw);
        assert_eq!(encoded.payload.len(), data.len());
    }

    #[test]
    fn test_manager_marginal_savings_rejected() {
        // A value whose transform lands above 95% of the original size is
        // stored raw even though the transform "succeeded".
        let mut config = CodecConfig::default();
        config.min_size_bytes = 0;
        let manager = CodecManager::with_config(config);

        // 50 distinct two-byte runs: 100 bytes in, 50 pairs = 100 bytes out,
        // and 100 >= 0.95 * 100.
        let mut data = Vec::new();
        for i in 0..50u8 {
            data.push(i);
            data.push(i);
        }
        assert_eq!(data.len(), 100);

        let encoded = manager.encode(&data).unwrap();
        assert_eq!(encoded.encoding, Encoding::Raw);
    }

    #[test]
    fn test_manager_lz4_algorithm() {
        let config = CodecConfig {
            algorithm: CodecAlgorithm::Lz4,
            ..Default::default()
        };
        let manager = CodecManager::with_config(config);

        let encoded = manager.encode(RUNS).unwrap();
        assert_eq!(encoded.encoding, Encoding::Lz4);
        let decoded = manager
            .decode(&encoded.payload, encoded.encoding, "ns", "k")
            .unwrap();
        assert_eq!(decoded.as_ref(), RUNS);
    }

    #[test]
    fn test_manager_decode_corrupt_payload() {
        let manager = CodecManager::new();
        let err = manager
            .decode(&[1, 2, 3], Encoding::Rle, "dash", "stat")
            .unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    proptest! {
        #[test]
        fn prop_rle_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let codec = RleCodec;
            let encoded = codec.encode(&data).unwrap();
            prop_assert_eq!(codec.decode(&encoded).unwrap(), data);
        }

        #[test]
        fn prop_lz4_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let codec = Lz4Codec;
            let encoded = codec.encode(&data).unwrap();
            prop_assert_eq!(codec.decode(&encoded).unwrap(), data);
        }

        #[test]
        fn prop_manager_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let manager = CodecManager::new();
            let encoded = manager.encode(&data).unwrap();
            let decoded = manager
                .decode(&encoded.payload, encoded.encoding, "ns", "k")
                .unwrap();
            prop_assert_eq!(decoded.as_ref(), data.as_slice());
        }
    }
}
