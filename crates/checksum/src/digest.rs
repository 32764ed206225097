use std::fmt;
use std::io::Read;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::ChecksumError;

/// Checksum algorithms understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Adler32,
}

impl ChecksumAlgorithm {
    /// Lowercase algorithm name as used in logs and reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Adler32 => "adler32",
        }
    }

    /// Number of hex digits in the canonical rendering.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Adler32 => 8,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "adler32" | "adler-32" => Ok(Self::Adler32),
            other => Err(ChecksumError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// A checksum value tagged with the algorithm that produced it.
///
/// `value` is always canonical: lowercase hex of [`ChecksumAlgorithm::hex_len`]
/// digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChecksumPair {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl ChecksumPair {
    /// Parses a raw value as reported by an external tool and canonicalizes it.
    pub fn parse(algorithm: ChecksumAlgorithm, raw: &str) -> Result<Self, ChecksumError> {
        Ok(Self {
            algorithm,
            value: canonicalize(algorithm, raw)?,
        })
    }

    /// Returns `true` if both pairs use the same algorithm and value.
    pub fn matches(&self, other: &ChecksumPair) -> bool {
        self.algorithm == other.algorithm && self.value == other.value
    }
}

impl fmt::Display for ChecksumPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// Normalizes a checksum string to its canonical form.
///
/// Accepts surrounding whitespace, upper case and a `0x` prefix. Adler32
/// values may omit leading zeros (storage systems disagree on padding).
pub fn canonicalize(algorithm: ChecksumAlgorithm, raw: &str) -> Result<String, ChecksumError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    let invalid = || ChecksumError::InvalidValue {
        algorithm,
        value: raw.to_string(),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    match algorithm {
        ChecksumAlgorithm::Md5 => {
            if digits.len() != algorithm.hex_len() {
                return Err(invalid());
            }
            Ok(digits.to_ascii_lowercase())
        }
        ChecksumAlgorithm::Adler32 => {
            if digits.len() > algorithm.hex_len() {
                return Err(invalid());
            }
            let value = u32::from_str_radix(digits, 16).map_err(|_| invalid())?;
            Ok(format!("{value:08x}"))
        }
    }
}

enum State {
    Md5(Md5),
    Adler32(adler2::Adler32),
}

/// Incremental digest over a byte stream of unknown length.
pub struct StreamingChecksum {
    state: State,
    bytes: u64,
}

impl StreamingChecksum {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let state = match algorithm {
            ChecksumAlgorithm::Md5 => State::Md5(Md5::new()),
            ChecksumAlgorithm::Adler32 => State::Adler32(adler2::Adler32::new()),
        };
        Self { state, bytes: 0 }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self.state {
            State::Md5(_) => ChecksumAlgorithm::Md5,
            State::Adler32(_) => ChecksumAlgorithm::Adler32,
        }
    }

    /// Feeds the next slice of the stream.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Md5(h) => h.update(data),
            State::Adler32(h) => h.write_slice(data),
        }
        self.bytes += data.len() as u64;
    }

    /// Total bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consumes the digest and returns the canonical value.
    pub fn finalize(self) -> ChecksumPair {
        match self.state {
            State::Md5(h) => ChecksumPair {
                algorithm: ChecksumAlgorithm::Md5,
                value: hex::encode(h.finalize()),
            },
            State::Adler32(h) => ChecksumPair {
                algorithm: ChecksumAlgorithm::Adler32,
                value: format!("{:08x}", h.checksum()),
            },
        }
    }
}

/// Computes a checksum over an in-memory buffer.
pub fn checksum_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> ChecksumPair {
    let mut digest = StreamingChecksum::new(algorithm);
    digest.update(data);
    digest.finalize()
}

/// Computes a checksum over everything `reader` yields.
pub fn checksum_reader<R: Read>(
    algorithm: ChecksumAlgorithm,
    mut reader: R,
) -> Result<ChecksumPair, ChecksumError> {
    let mut digest = StreamingChecksum::new(algorithm);
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn empty_input_reference_values() {
        assert_eq!(checksum_bytes(ChecksumAlgorithm::Md5, b"").value, EMPTY_MD5);
        assert_eq!(
            checksum_bytes(ChecksumAlgorithm::Adler32, b"").value,
            "00000001"
        );
    }

    #[test]
    fn known_vectors() {
        assert_eq!(
            checksum_bytes(ChecksumAlgorithm::Md5, b"abc").value,
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            checksum_bytes(ChecksumAlgorithm::Adler32, b"abc").value,
            "024d0127"
        );
        assert_eq!(
            checksum_bytes(ChecksumAlgorithm::Adler32, b"Wikipedia").value,
            "11e60398"
        );
    }

    #[test]
    fn chunked_updates_match_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        for algorithm in [ChecksumAlgorithm::Md5, ChecksumAlgorithm::Adler32] {
            let mut digest = StreamingChecksum::new(algorithm);
            for chunk in data.chunks(777) {
                digest.update(chunk);
            }
            assert_eq!(digest.bytes(), data.len() as u64);
            assert_eq!(digest.finalize(), checksum_bytes(algorithm, &data));
        }
    }

    #[test]
    fn reader_matches_bytes() {
        let data = b"0123456789abcdef";
        let from_reader = checksum_reader(ChecksumAlgorithm::Md5, &data[..]).unwrap();
        assert_eq!(from_reader, checksum_bytes(ChecksumAlgorithm::Md5, data));
    }

    #[test]
    fn file_checksum_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"payload for adler").unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let from_file = checksum_reader(ChecksumAlgorithm::Adler32, file).unwrap();
        assert_eq!(
            from_file,
            checksum_bytes(ChecksumAlgorithm::Adler32, b"payload for adler")
        );
    }

    #[test]
    fn canonicalize_pads_adler32() {
        assert_eq!(
            canonicalize(ChecksumAlgorithm::Adler32, "1").unwrap(),
            "00000001"
        );
        assert_eq!(
            canonicalize(ChecksumAlgorithm::Adler32, "0x024D0127").unwrap(),
            "024d0127"
        );
        assert_eq!(
            canonicalize(ChecksumAlgorithm::Adler32, " 11E60398\n").unwrap(),
            "11e60398"
        );
    }

    #[test]
    fn canonicalize_rejects_garbage() {
        assert!(canonicalize(ChecksumAlgorithm::Adler32, "").is_err());
        assert!(canonicalize(ChecksumAlgorithm::Adler32, "123456789").is_err());
        assert!(canonicalize(ChecksumAlgorithm::Adler32, "xyz").is_err());
        assert!(canonicalize(ChecksumAlgorithm::Md5, "abc").is_err());
    }

    #[test]
    fn canonicalize_lowercases_md5() {
        let upper = EMPTY_MD5.to_ascii_uppercase();
        assert_eq!(
            canonicalize(ChecksumAlgorithm::Md5, &upper).unwrap(),
            EMPTY_MD5
        );
    }

    #[test]
    fn pairs_match_only_same_algorithm() {
        let a = ChecksumPair::parse(ChecksumAlgorithm::Adler32, "1").unwrap();
        let b = checksum_bytes(ChecksumAlgorithm::Adler32, b"");
        assert!(a.matches(&b));

        let md5 = checksum_bytes(ChecksumAlgorithm::Md5, b"");
        assert!(!a.matches(&md5));
    }

    #[test]
    fn algorithm_from_str() {
        assert_eq!(
            "MD5".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Md5
        );
        assert_eq!(
            "adler-32".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Adler32
        );
        assert!("sha1".parse::<ChecksumAlgorithm>().is_err());
    }

    #[test]
    fn pair_display() {
        let pair = checksum_bytes(ChecksumAlgorithm::Adler32, b"");
        assert_eq!(pair.to_string(), "adler32:00000001");
    }
}
