//! Codec errors.

/// Errors from encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The message does not have the required frame structure.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// The command code is not one this protocol version defines.
    #[error("unknown command code {0:#06x}")]
    UnknownCode(u16),

    /// A payload record failed to encode or decode.
    #[error("payload error: {0}")]
    Payload(String),

    /// A scalar value carried an unknown type tag.
    #[error("unknown scalar type tag {0:#04x}")]
    UnknownValueTag(u8),

    /// A string value was not valid UTF-8.
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
}
