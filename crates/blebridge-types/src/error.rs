//! Error types for decoding sensor payloads.

use thiserror::Error;

/// Errors that can occur when decoding an advertisement or GATT payload.
///
/// Every variant means "no reading": the caller keeps whatever reading it
/// already had for the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The buffer is shorter than the layout requires.
    #[error("payload requires {expected} bytes, got {actual}")]
    InsufficientBytes { expected: usize, actual: usize },

    /// An Aranet beacon was received with the Smart Home integrations flag cleared.
    #[error("integrations are disabled on the device; the beacon carries no sensor data")]
    IntegrationsDisabled,

    /// The data-format or type byte is not one we know how to decode.
    #[error("unsupported payload format 0x{0:02X}")]
    UnsupportedFormat(u8),

    /// A field carries a sentinel or a value outside its physical range.
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

impl ParseError {
    pub(crate) fn check_len(data: &[u8], expected: usize) -> ParseResult<()> {
        if data.len() < expected {
            return Err(ParseError::InsufficientBytes {
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }
}

/// Result type alias using [`ParseError`].
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_bytes_display() {
        let err = ParseError::InsufficientBytes {
            expected: 13,
            actual: 4,
        };
        assert_eq!(err.to_string(), "payload requires 13 bytes, got 4");
    }

    #[test]
    fn test_unsupported_format_display() {
        assert_eq!(
            ParseError::UnsupportedFormat(0x03).to_string(),
            "unsupported payload format 0x03"
        );
    }

    #[test]
    fn test_check_len() {
        assert!(ParseError::check_len(&[0; 4], 4).is_ok());
        assert_eq!(
            ParseError::check_len(&[0; 3], 4),
            Err(ParseError::InsufficientBytes {
                expected: 4,
                actual: 3
            })
        );
    }
}
