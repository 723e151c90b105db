use std::fmt;
use std::str::FromStr;

use human_size::{Byte, Size, SpecificSize};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

pub use human_size::ParsingError as ByteSizeParseError;

const UNITS: &[(u64, &str)] = &[
    (1024 * 1024 * 1024, "GiB"),
    (1_000_000_000, "GB"),
    (1024 * 1024, "MiB"),
    (1_000_000, "MB"),
    (1024, "KiB"),
    (1000, "kB"),
];

/// Represents a size in bytes.
///
/// Parses plain integers as bytes, and human readable sizes such as `10MB` or `64KiB`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Create a byte size from bytes.
    pub const fn bytes(value: u64) -> Self {
        Self(value)
    }

    /// Create a byte size from kibibytes.
    pub const fn kibibytes(value: u64) -> Self {
        Self(value * 1024)
    }

    /// Create a byte size from megabytes.
    pub const fn megabytes(value: u64) -> Self {
        Self(value * 1_000_000)
    }

    /// Create a byte size from mebibytes.
    pub const fn mebibytes(value: u64) -> Self {
        Self(value * 1024 * 1024)
    }

    /// Return the value in bytes.
    pub const fn as_bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ByteSizeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Ok(value) = value.trim().parse::<u64>() {
            return Ok(Self(value));
        }

        let size: Size = value.trim().parse()?;
        let bytes: SpecificSize<Byte> = size.into();
        Ok(Self(bytes.value() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 > 0 {
            for (multiple, unit) in UNITS {
                if self.0 % multiple == 0 {
                    return write!(f, "{}{unit}", self.0 / multiple);
                }
            }
        }

        write!(f, "{}B", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl de::Visitor<'_> for V {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("data size")
            }

            fn visit_u64<E>(self, value: u64) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                Ok(ByteSize(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                value
                    .parse()
                    .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(V)
    }
}

impl From<u64> for ByteSize {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let size: ByteSize = "42MiB".parse().unwrap();
        assert_eq!(size.as_bytes(), 44_040_192);
        assert_eq!(size.to_string(), "42MiB");

        let size: ByteSize = "10MB".parse().unwrap();
        assert_eq!(size.as_bytes(), 10_000_000);
        assert_eq!(size.to_string(), "10MB");

        let size: ByteSize = "1025".parse().unwrap();
        assert_eq!(size.to_string(), "1025B");
    }

    #[test]
    fn test_deserialize_int_and_str() {
        let size: ByteSize = serde_json::from_str("2048").unwrap();
        assert_eq!(size, ByteSize::kibibytes(2));

        let size: ByteSize = serde_json::from_str(r#""1MB""#).unwrap();
        assert_eq!(size, ByteSize::megabytes(1));

        assert!(serde_json::from_str::<ByteSize>(r#""lots""#).is_err());
    }
}
