//! Reversible obfuscation for secrets kept in settings files
//!
//! Secrets are zlib-compressed and base64-encoded before they are written to
//! disk. This is not encryption: it only keeps passwords from showing up in
//! plain text when someone opens the settings file.
//!
//! # Legacy values
//!
//! Settings written before obfuscation was introduced hold the raw secret.
//! [`CredentialCodec::deobfuscate`] returns such values unchanged instead of
//! failing, and [`CredentialCodec::migrate`] re-encodes them once when the
//! settings schema version advances.

use base64::Engine;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;
use thiserror::Error;
use tracing::debug;

/// Settings schema version that introduced obfuscated secrets
pub const OBFUSCATED_SCHEMA_VERSION: u32 = 2;

/// Error types for credential encoding
#[derive(Error, Debug)]
pub enum CodecError {
    /// Value is not valid base64
    #[error("Invalid base64 encoding: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Value decodes to nothing
    #[error("Encoded secret is empty")]
    Empty,

    /// Decoded bytes are not UTF-8
    #[error("Decoded secret is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Obfuscation codec for persisted secrets
pub struct CredentialCodec;

impl CredentialCodec {
    /// Encode a secret for at-rest storage
    ///
    /// # Example
    /// ```
    /// use tunnelwatch_codec::CredentialCodec;
    ///
    /// let stored = CredentialCodec::obfuscate("hunter2").unwrap();
    /// assert_ne!(stored, "hunter2");
    /// assert_eq!(CredentialCodec::deobfuscate(&stored), "hunter2");
    /// ```
    pub fn obfuscate(secret: &str) -> Result<String, CodecError> {
        let mut encoder = ZlibEncoder::new(secret.as_bytes(), Compression::default());
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed)?;

        Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
    }

    /// Strict inverse of [`CredentialCodec::obfuscate`]
    pub fn decode(token: &str) -> Result<String, CodecError> {
        let compressed = base64::engine::general_purpose::STANDARD.decode(token)?;
        if compressed.is_empty() {
            return Err(CodecError::Empty);
        }

        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;

        Ok(String::from_utf8(raw)?)
    }

    /// Decode a stored secret, tolerating legacy plain-text values
    ///
    /// Anything that does not decode cleanly is assumed to be a raw secret
    /// written by an older version and is returned unchanged.
    pub fn deobfuscate(token: &str) -> String {
        match Self::decode(token) {
            Ok(secret) => secret,
            Err(e) => {
                debug!("Stored secret is not obfuscated, using it as-is: {}", e);
                token.to_string()
            }
        }
    }

    /// Whether a stored value decodes as an obfuscated secret
    pub fn is_obfuscated(token: &str) -> bool {
        Self::decode(token).is_ok()
    }

    /// One-time migration of a secret stored under `from_version`
    ///
    /// Returns `Ok(None)` when the value is already in the current format.
    pub fn migrate(value: &str, from_version: u32) -> Result<Option<String>, CodecError> {
        if from_version >= OBFUSCATED_SCHEMA_VERSION {
            return Ok(None);
        }
        Self::obfuscate(value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obfuscate_hides_plaintext() {
        let stored = CredentialCodec::obfuscate("correct horse battery staple").unwrap();
        assert!(!stored.contains("horse"));
        assert_eq!(
            CredentialCodec::deobfuscate(&stored),
            "correct horse battery staple"
        );
    }

    #[test]
    fn test_empty_secret() {
        let stored = CredentialCodec::obfuscate("").unwrap();
        assert!(!stored.is_empty());
        assert_eq!(CredentialCodec::deobfuscate(&stored), "");
    }

    #[test]
    fn test_printable_ascii_and_unicode() {
        let all_printable: String = (0x20u8..0x7f).map(char::from).collect();
        for secret in [all_printable.as_str(), "p@ss:w/ord", "pässwörd ✓", " "] {
            let stored = CredentialCodec::obfuscate(secret).unwrap();
            assert_eq!(CredentialCodec::deobfuscate(&stored), secret);
        }
    }

    #[test]
    fn test_legacy_value_passes_through() {
        assert_eq!(
            CredentialCodec::deobfuscate("plaintext-legacy-value"),
            "plaintext-legacy-value"
        );
        assert!(!CredentialCodec::is_obfuscated("plaintext-legacy-value"));
    }

    #[test]
    fn test_valid_base64_but_not_compressed() {
        // "secret" in base64, but not a zlib stream
        assert_eq!(CredentialCodec::deobfuscate("c2VjcmV0"), "c2VjcmV0");
        assert!(CredentialCodec::decode("c2VjcmV0").is_err());
    }

    #[test]
    fn test_empty_legacy_value() {
        assert_eq!(CredentialCodec::deobfuscate(""), "");
        assert!(!CredentialCodec::is_obfuscated(""));
    }

    #[test]
    fn test_migrate_from_legacy_version() {
        let migrated = CredentialCodec::migrate("raw-password", 1).unwrap().unwrap();
        assert!(CredentialCodec::is_obfuscated(&migrated));
        assert_eq!(CredentialCodec::deobfuscate(&migrated), "raw-password");
    }

    #[test]
    fn test_migrate_current_version_is_noop() {
        let stored = CredentialCodec::obfuscate("pw").unwrap();
        assert!(CredentialCodec::migrate(&stored, OBFUSCATED_SCHEMA_VERSION)
            .unwrap()
            .is_none());
    }
}
