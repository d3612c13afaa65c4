//! Configuration value types for zreplica
//!
//! Validated newtypes shared by the configuration layer and the replication
//! engine. Each constructor rejects out-of-range values so downstream code
//! never re-checks them.

use std::fmt;

/// Fraction of the target filesystem that must remain free, in `[0, 1)`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "f64", into = "f64"))]
pub struct FreeFraction(f64);

impl FreeFraction {
    /// Default threshold (10%)
    pub const DEFAULT: f64 = 0.10;

    /// Create a new free-space fraction with validation
    pub fn new(fraction: f64) -> Result<Self, String> {
        if !fraction.is_finite() {
            Err(format!("Free fraction {} is not a number", fraction))
        } else if fraction < 0.0 {
            Err(format!("Free fraction {} is below 0", fraction))
        } else if fraction >= 1.0 {
            Err(format!("Free fraction {} must be below 1", fraction))
        } else {
            Ok(Self(fraction))
        }
    }

    /// Get the fraction value
    pub fn get(self) -> f64 {
        self.0
    }
}

impl Default for FreeFraction {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<f64> for FreeFraction {
    type Error = String;

    fn try_from(fraction: f64) -> Result<Self, Self::Error> {
        Self::new(fraction)
    }
}

impl From<FreeFraction> for f64 {
    fn from(fraction: FreeFraction) -> Self {
        fraction.0
    }
}

impl fmt::Display for FreeFraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.0 * 100.0)
    }
}

/// Capacity of the in-process decoupling buffer in bytes; zero disables it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "usize", into = "usize"))]
pub struct BufferSize(usize);

impl BufferSize {
    /// Size of one chunk moved through the buffer (64KB)
    pub const CHUNK: usize = 64 * 1024;
    /// Maximum buffer size (1GB)
    pub const MAX: usize = 1024 * 1024 * 1024;
    /// Default buffer size (64MB)
    pub const DEFAULT: usize = 64 * 1024 * 1024;

    /// Create a new buffer size with validation
    pub fn new(size: usize) -> Result<Self, String> {
        if size > Self::MAX {
            Err(format!("Buffer size {} exceeds maximum {}", size, Self::MAX))
        } else if size != 0 && size < Self::CHUNK {
            Err(format!(
                "Buffer size {} is below one chunk ({})",
                size,
                Self::CHUNK
            ))
        } else {
            Ok(Self(size))
        }
    }

    /// A disabled buffer
    pub fn disabled() -> Self {
        Self(0)
    }

    /// Get the buffer size value
    pub fn get(self) -> usize {
        self.0
    }

    /// Check if the buffer is enabled
    pub fn is_enabled(self) -> bool {
        self.0 > 0
    }

    /// Number of chunks the buffer holds
    pub fn chunks(self) -> usize {
        (self.0 / Self::CHUNK).max(1)
    }
}

impl Default for BufferSize {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<usize> for BufferSize {
    type Error = String;

    fn try_from(size: usize) -> Result<Self, Self::Error> {
        Self::new(size)
    }
}

impl From<BufferSize> for usize {
    fn from(size: BufferSize) -> Self {
        size.0
    }
}

/// zstd compression level applied on the producer host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    /// Fastest compression
    pub const FASTEST: u8 = 1;
    /// Default compression
    pub const DEFAULT: u8 = 3;
    /// Best compression without `--ultra`
    pub const BEST: u8 = 19;

    /// Create a new compression level with validation
    pub fn new(level: u8) -> Result<Self, String> {
        if level < Self::FASTEST {
            Err(format!(
                "Compression level {} is below minimum {}",
                level,
                Self::FASTEST
            ))
        } else if level > Self::BEST {
            Err(format!(
                "Compression level {} exceeds maximum {}",
                level,
                Self::BEST
            ))
        } else {
            Ok(Self(level))
        }
    }

    /// Get the compression level value
    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level)
    }
}

impl From<CompressionLevel> for u8 {
    fn from(level: CompressionLevel) -> Self {
        level.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, true)]
    #[case(0.1, true)]
    #[case(0.99, true)]
    #[case(1.0, false)]
    #[case(-0.01, false)]
    #[case(f64::NAN, false)]
    fn test_free_fraction_bounds(#[case] fraction: f64, #[case] valid: bool) {
        assert_eq!(FreeFraction::new(fraction).is_ok(), valid);
    }

    #[test]
    fn test_free_fraction_display() {
        assert_eq!(FreeFraction::default().to_string(), "10.0%");
    }

    #[test]
    fn test_buffer_size_validation() {
        assert!(BufferSize::new(0).is_ok());
        assert!(!BufferSize::new(0).unwrap().is_enabled());
        assert!(BufferSize::new(1024).is_err());
        assert!(BufferSize::new(BufferSize::MAX + 1).is_err());
        assert_eq!(BufferSize::default().chunks(), 1024);
    }

    #[test]
    fn test_compression_level_validation() {
        assert!(CompressionLevel::new(0).is_err());
        assert!(CompressionLevel::new(20).is_err());
        assert_eq!(CompressionLevel::default().get(), 3);
    }

    proptest! {
        #[test]
        fn test_valid_buffer_sizes_hold_at_least_one_chunk(
            size in BufferSize::CHUNK..BufferSize::MAX
        ) {
            let buffer = BufferSize::new(size).unwrap();
            prop_assert!(buffer.chunks() >= 1);
            prop_assert!(buffer.chunks() * BufferSize::CHUNK <= size);
        }
    }
}
