//! Bytecode Persistence
//!
//! Binary save/load of [`ByteCodeBuffer`] for build caches and embedded
//! compiled scripts. A fixed header (`TNBC` magic + format version)
//! rejects foreign or stale buffers before bincode sees the body; round
//! trips preserve ops, constants, the string pool, the debug tables, and
//! the main-frame local count exactly.

use std::fmt;

use crate::bytecode::ByteCodeBuffer;

/// File magic preceding every serialized buffer
pub const MAGIC: &[u8; 4] = b"TNBC";

/// Bumped whenever the opcode set or buffer layout changes
pub const FORMAT_VERSION: u32 = 1;

/// Error during bytecode serialization/deserialization
#[derive(Debug)]
pub enum SerializeError {
    /// The input does not start with the `TNBC` magic
    BadMagic,
    /// The input was written by an incompatible format version
    VersionMismatch { found: u32 },
    /// Bincode encoding/decoding error (original error preserved)
    BincodeError(Box<bincode::Error>),
    /// Input shorter than the fixed header
    Truncated,
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::BadMagic => write!(f, "not a tern bytecode buffer (bad magic)"),
            SerializeError::VersionMismatch { found } => write!(
                f,
                "bytecode format version {found} is not supported (expected {FORMAT_VERSION})"
            ),
            SerializeError::BincodeError(e) => write!(f, "bincode error: {e}"),
            SerializeError::Truncated => write!(f, "input shorter than the bytecode header"),
        }
    }
}

impl std::error::Error for SerializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializeError::BincodeError(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<bincode::Error> for SerializeError {
    fn from(e: bincode::Error) -> Self {
        SerializeError::BincodeError(Box::new(e))
    }
}

/// Serialize a buffer: `TNBC` + version (LE) + bincode body
pub fn save_bytecode(buf: &ByteCodeBuffer) -> Result<Vec<u8>, SerializeError> {
    let mut out = Vec::with_capacity(16 + buf.ops.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend(bincode::serialize(buf)?);
    Ok(out)
}

/// Deserialize a buffer saved by `save_bytecode`
pub fn load_bytecode(bytes: &[u8]) -> Result<ByteCodeBuffer, SerializeError> {
    if bytes.len() < 8 {
        return Err(SerializeError::Truncated);
    }
    if &bytes[..4] != MAGIC {
        return Err(SerializeError::BadMagic);
    }
    let found = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if found != FORMAT_VERSION {
        return Err(SerializeError::VersionMismatch { found });
    }
    Ok(bincode::deserialize(&bytes[8..])?)
}

// =============================================================================
// Tests
// =============================================================================
