//! Text conversion between the local representation and the host's.
//!
//! The host speaks one wire encoding for names and paths; the bridge converts
//! at the boundary. The trait is the seam: the default table is UTF-8, a
//! mount may install another.

use crate::error::{SfError, SfResult};

/// Longest name a single directory entry may carry locally, in bytes.
pub const NAME_MAX: usize = 255;

/// Upper bound for symlink targets and full paths, in bytes.
pub const PATH_MAX: usize = 4096;

pub trait NameCodec: Send + Sync {
    /// Convert a host-encoded name into the local representation.
    /// Fails with `InvalidData` on undecodable bytes and `NameTooLong` when
    /// the decoded name exceeds [`NAME_MAX`].
    fn decode_name(&self, raw: &[u8]) -> SfResult<String>;

    /// Convert a local name into the host encoding.
    fn encode_name(&self, name: &str) -> SfResult<Vec<u8>>;
}

/// Default table: the host wire encoding is UTF-8.
pub struct Utf8Codec;

impl NameCodec for Utf8Codec {
    fn decode_name(&self, raw: &[u8]) -> SfResult<String> {
        // Host buffers may carry trailing NUL padding; the logical name ends
        // at the first NUL.
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let raw = &raw[..end];
        if raw.len() > NAME_MAX {
            return Err(SfError::NameTooLong);
        }
        let name = str::from_utf8(raw).map_err(|_| SfError::InvalidData)?;
        Ok(name.to_owned())
    }

    fn encode_name(&self, name: &str) -> SfResult<Vec<u8>> {
        if name.len() > NAME_MAX {
            return Err(SfError::NameTooLong);
        }
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(SfError::InvalidFilename);
        }
        Ok(name.as_bytes().to_vec())
    }
}
