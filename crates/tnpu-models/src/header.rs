//! Fixed-size model header.
//!
//! ```text
//! 0x00  magic            "TNPM"
//! 0x04  format_version   u16
//! 0x06  security         u8   (0 plain, 1 signed, 2 secure)
//! 0x07  execution_mode   u8   (0 default, 1 profile)
//! 0x08  metadata_length  u32
//! 0x0c  code_length      u32
//! 0x10  key_set          u32
//! 0x14  hardware_target  u16
//! 0x16  reserved         [u8; 10]
//! ```
//!
//! The header is the only part of an upload read before the declared size
//! has been checked against the bytes actually supplied.

use crate::error::{ModelError, Result};

/// Header magic.
pub const MODEL_MAGIC: [u8; 4] = *b"TNPM";

/// Format version this crate reads and writes.
pub const FORMAT_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// How the model content is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    /// No protection.
    Plain,
    /// Signed; runs on non-secure memory after verification.
    Signed,
    /// Signed and encrypted; code and pool live in secure memory.
    Secure,
}

impl SecurityType {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Signed),
            2 => Ok(Self::Secure),
            other => Err(ModelError::InvalidField {
                field: "security",
                value: u64::from(other),
            }),
        }
    }

    const fn raw(self) -> u8 {
        match self {
            Self::Plain => 0,
            Self::Signed => 1,
            Self::Secure => 2,
        }
    }
}

/// Build variant of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Regular execution.
    Default,
    /// Per-layer timing is collected on every run.
    Profile,
}

impl ExecutionMode {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Default),
            1 => Ok(Self::Profile),
            other => Err(ModelError::InvalidField {
                field: "execution_mode",
                value: u64::from(other),
            }),
        }
    }

    const fn raw(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Profile => 1,
        }
    }
}

/// Parsed model header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelHeader {
    /// Format version
    pub format_version: u16,
    /// Content protection
    pub security: SecurityType,
    /// Build variant
    pub execution_mode: ExecutionMode,
    /// Bytes of public metadata following the header
    pub metadata_length: u32,
    /// Bytes of code following the public data
    pub code_length: u32,
    /// Signing key set the model was produced for
    pub key_set: u32,
    /// Hardware revision the model was compiled for
    pub hardware_target: u16,
}

impl ModelHeader {
    /// Parse the header from the first [`HEADER_SIZE`] bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns error if `data` is too short, the magic or version is wrong,
    /// or an enumerated field is out of range.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ModelError::truncated(
                "header",
                HEADER_SIZE as u64,
                data.len() as u64,
            ));
        }
        if data[0..4] != MODEL_MAGIC {
            return Err(ModelError::InvalidMagic);
        }

        let format_version = u16::from_le_bytes([data[4], data[5]]);
        if format_version != FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion {
                version: format_version,
            });
        }

        let header = Self {
            format_version,
            security: SecurityType::from_raw(data[6])?,
            execution_mode: ExecutionMode::from_raw(data[7])?,
            metadata_length: read_u32(data, 8),
            code_length: read_u32(data, 12),
            key_set: read_u32(data, 16),
            hardware_target: u16::from_le_bytes([data[20], data[21]]),
        };
        tracing::debug!(
            "model header: metadata={} code={} security={:?} mode={:?}",
            header.metadata_length,
            header.code_length,
            header.security,
            header.execution_mode
        );
        Ok(header)
    }

    /// Serialize to the on-disk layout.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MODEL_MAGIC);
        out[4..6].copy_from_slice(&self.format_version.to_le_bytes());
        out[6] = self.security.raw();
        out[7] = self.execution_mode.raw();
        out[8..12].copy_from_slice(&self.metadata_length.to_le_bytes());
        out[12..16].copy_from_slice(&self.code_length.to_le_bytes());
        out[16..20].copy_from_slice(&self.key_set.to_le_bytes());
        out[20..22].copy_from_slice(&self.hardware_target.to_le_bytes());
        out
    }

    /// Header plus metadata: the part of the image the peer may read in the clear.
    pub fn public_data_length(&self) -> u64 {
        HEADER_SIZE as u64 + u64::from(self.metadata_length)
    }

    /// Smallest upload consistent with this header.
    pub fn declared_size(&self) -> u64 {
        self.public_data_length() + u64::from(self.code_length)
    }

    /// Reject an upload of `total` bytes that cannot hold what the header declares.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Truncated`] when `total` is below [`Self::declared_size`].
    pub fn check_upload_size(&self, total: u64) -> Result<()> {
        let needed = self.declared_size();
        if total < needed {
            return Err(ModelError::truncated("model", needed, total));
        }
        Ok(())
    }

    /// Code and pool must be placed in secure memory.
    pub fn is_secure(&self) -> bool {
        self.security == SecurityType::Secure
    }

    /// Built in profiling mode.
    pub fn is_profiling(&self) -> bool {
        self.execution_mode == ExecutionMode::Profile
    }
}

pub(crate) fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelHeader {
        ModelHeader {
            format_version: FORMAT_VERSION,
            security: SecurityType::Signed,
            execution_mode: ExecutionMode::Profile,
            metadata_length: 40,
            code_length: 4096,
            key_set: 7,
            hardware_target: 3,
        }
    }

    #[test]
    fn parse_written_header() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[0..4], b"TNPM");
        let parsed = ModelHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, sample());
        assert_eq!(parsed.public_data_length(), 72);
        assert_eq!(parsed.declared_size(), 72 + 4096);
        assert!(parsed.is_profiling());
        assert!(!parsed.is_secure());
    }

    #[test]
    fn short_header_rejected() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            ModelHeader::parse(&bytes[..HEADER_SIZE - 1]),
            Err(ModelError::Truncated { section: "header", .. })
        ));
    }

    #[test]
    fn invalid_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            ModelHeader::parse(&bytes),
            Err(ModelError::InvalidMagic)
        ));
    }

    #[test]
    fn unknown_security_type() {
        let mut bytes = sample().to_bytes();
        bytes[6] = 9;
        assert!(matches!(
            ModelHeader::parse(&bytes),
            Err(ModelError::InvalidField { field: "security", value: 9 })
        ));
    }

    #[test]
    fn upload_size_check() {
        let header = sample();
        assert!(header.check_upload_size(header.declared_size()).is_ok());
        assert!(header.check_upload_size(header.declared_size() - 1).is_err());
    }
}
