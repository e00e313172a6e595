//! Directory listing decoder.
//!
//! A directory open fetches the complete listing from the host as a sequence
//! of immutable byte chunks, each packing variable-length records (fixed
//! header + name payload, no padding, per-record stride). This module walks
//! those buffers by computed offsets, maps remote type codes to local entry
//! kinds and drives enumeration with a caller-visible cursor.
//!
//! A listing is a snapshot: the chunks never change for the lifetime of the
//! directory session and no RPC is re-issued mid-enumeration.

use crate::error::{SfError, SfResult};
use crate::nls::NameCodec;
use crate::transport::{
    DirChunk, OBJ_TYPE_BLOCK_DEV, OBJ_TYPE_CHAR_DEV, OBJ_TYPE_DIRECTORY, OBJ_TYPE_FIFO,
    OBJ_TYPE_FILE, OBJ_TYPE_SOCKET, OBJ_TYPE_SYMLINK, OBJ_TYPE_WHITEOUT, RECORD_HEADER_LEN,
    TYPE_MASK, TYPE_SHIFT,
};

/// Local entry type tag, the d_type analog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Fifo,
    CharDev,
    Dir,
    BlockDev,
    File,
    Symlink,
    Socket,
    Whiteout,
    /// Type codes this bridge does not know map here, never to an error.
    Unknown,
}

/// Map a remote mode word to the local entry kind.
pub fn kind_for_mode(mode: u32) -> EntryKind {
    match (mode & TYPE_MASK) >> TYPE_SHIFT {
        OBJ_TYPE_FIFO => EntryKind::Fifo,
        OBJ_TYPE_CHAR_DEV => EntryKind::CharDev,
        OBJ_TYPE_DIRECTORY => EntryKind::Dir,
        OBJ_TYPE_BLOCK_DEV => EntryKind::BlockDev,
        OBJ_TYPE_FILE => EntryKind::File,
        OBJ_TYPE_SYMLINK => EntryKind::Symlink,
        OBJ_TYPE_SOCKET => EntryKind::Socket,
        OBJ_TYPE_WHITEOUT => EntryKind::Whiteout,
        _ => EntryKind::Unknown,
    }
}

/// Offset folded into the cursor to synthesize enumeration identifiers.
pub const FAKE_INO_OFFSET: i64 = 0xbeef;

/// One decoded listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// The materialized listing snapshot of one directory session.
pub struct DirBuffer {
    chunks: Vec<DirChunk>,
}

impl DirBuffer {
    pub fn new(chunks: Vec<DirChunk>) -> Self {
        Self { chunks }
    }

    pub fn total_entries(&self) -> u64 {
        self.chunks.iter().map(|c| c.entries as u64).sum()
    }

    /// Decode the entry at logical position `pos`.
    ///
    /// `Ok(None)` signals end-of-listing. An `Err` covers that one entry only
    /// (malformed framing or a name the codec refuses); the caller may skip
    /// it and continue.
    pub fn entry_at(&self, pos: i64, codec: &dyn NameCodec) -> SfResult<Option<ListedEntry>> {
        if pos < 0 {
            return Err(SfError::InvalidInput);
        }
        let mut cur: i64 = 0;
        for chunk in &self.chunks {
            let entries = chunk.entries as i64;
            if pos >= cur + entries {
                cur += entries;
                continue;
            }

            // The records are variable sized; step by each record's encoded
            // size, computed from its own header, until the target ordinal.
            let buf = &chunk.buf;
            let mut off = 0usize;
            for _ in 0..(pos - cur) {
                let name_size = record_name_size(buf, off)?;
                off += RECORD_HEADER_LEN + name_size;
            }

            if off + RECORD_HEADER_LEN > buf.len() {
                return Err(SfError::InvalidData);
            }
            let mode = u32::from_le_bytes(buf[off + 8..off + 12].try_into().unwrap());
            let name_len =
                u16::from_le_bytes(buf[off + 12..off + 14].try_into().unwrap()) as usize;
            let name_size =
                u16::from_le_bytes(buf[off + 14..off + 16].try_into().unwrap()) as usize;
            if name_len > name_size || off + RECORD_HEADER_LEN + name_size > buf.len() {
                return Err(SfError::InvalidData);
            }
            let name_start = off + RECORD_HEADER_LEN;
            let name = codec.decode_name(&buf[name_start..name_start + name_len])?;
            return Ok(Some(ListedEntry {
                name,
                kind: kind_for_mode(mode),
            }));
        }
        Ok(None)
    }

    /// Drive enumeration from `*pos`, feeding decoded entries to `emit`
    /// together with a synthesized stable identifier.
    ///
    /// Per-entry decode failures are skipped, not fatal. When `emit` returns
    /// `false` the cursor is left on that entry so the next pass resumes
    /// there. A synthesized identifier that does not fit its storage width
    /// aborts the pass with [`SfError::RangeOverflow`]; silent duplicate
    /// identifiers would be worse than the error.
    pub fn iterate<F>(&self, pos: &mut i64, codec: &dyn NameCodec, mut emit: F) -> SfResult<()>
    where
        F: FnMut(&str, u64, EntryKind) -> bool,
    {
        if *pos < 0 {
            return Err(SfError::InvalidInput);
        }
        loop {
            let entry = match self.entry_at(*pos, codec) {
                Ok(None) => return Ok(()),
                Ok(Some(entry)) => entry,
                Err(err) => {
                    // Skip the erroneous entry and proceed.
                    log::debug!("skipping undecodable dir entry at pos {}: {err}", *pos);
                    *pos += 1;
                    continue;
                }
            };

            let fake_ino = fake_ino_at(*pos)?;

            if !emit(&entry.name, fake_ino, entry.kind) {
                return Ok(());
            }
            *pos += 1;
        }
    }
}

/// Synthesize the stable identifier for the entry at `pos`.
///
/// The cursor and the identifier have different storage widths; a narrowing
/// that loses bits must abort enumeration rather than hand out duplicate
/// identifiers, so both the offset addition and the width conversion are
/// checked.
pub fn fake_ino_at(pos: i64) -> SfResult<u64> {
    pos.checked_add(FAKE_INO_OFFSET)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or(SfError::RangeOverflow)
}

fn record_name_size(buf: &[u8], off: usize) -> SfResult<usize> {
    if off + RECORD_HEADER_LEN > buf.len() {
        return Err(SfError::InvalidData);
    }
    let name_size = u16::from_le_bytes(buf[off + 14..off + 16].try_into().unwrap()) as usize;
    if off + RECORD_HEADER_LEN + name_size > buf.len() {
        return Err(SfError::InvalidData);
    }
    Ok(name_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nls::Utf8Codec;
    use crate::transport::{ObjInfo, encode_dir_record, mode_for};
    use bytes::BytesMut;

    fn chunk(entries: &[(&str, u32)]) -> DirChunk {
        let mut buf = BytesMut::new();
        for (name, type_code) in entries {
            let info = ObjInfo::new(*type_code, 0o644, 0);
            encode_dir_record(&mut buf, &info, name.as_bytes(), name.len() as u16 + 1);
        }
        DirChunk {
            entries: entries.len() as u32,
            buf: buf.freeze(),
        }
    }

    fn two_chunk_buffer() -> DirBuffer {
        DirBuffer::new(vec![
            chunk(&[("foo", OBJ_TYPE_FILE), ("bar", OBJ_TYPE_DIRECTORY)]),
            chunk(&[("baz", OBJ_TYPE_SYMLINK)]),
        ])
    }

    #[test]
    fn test_two_chunk_scenario() {
        let buffer = two_chunk_buffer();
        let codec = Utf8Codec;
        let expect = [
            ("foo", EntryKind::File),
            ("bar", EntryKind::Dir),
            ("baz", EntryKind::Symlink),
        ];
        for (i, (name, kind)) in expect.iter().enumerate() {
            let entry = buffer.entry_at(i as i64, &codec).unwrap().unwrap();
            assert_eq!(entry.name, *name);
            assert_eq!(entry.kind, *kind);
        }
        assert!(buffer.entry_at(3, &codec).unwrap().is_none());
    }

    #[test]
    fn test_position_addressing_is_order_stable() {
        // Decoding i then i+1 in sequence equals decoding i+1 directly.
        let buffer = two_chunk_buffer();
        let codec = Utf8Codec;
        for i in 0..2 {
            let _ = buffer.entry_at(i, &codec).unwrap().unwrap();
            let sequential = buffer.entry_at(i + 1, &codec).unwrap().unwrap();
            let direct = buffer.entry_at(i + 1, &codec).unwrap().unwrap();
            assert_eq!(sequential, direct);
        }
    }

    #[test]
    fn test_unknown_type_code_maps_to_unknown() {
        let buffer = DirBuffer::new(vec![chunk(&[("odd", 0xE)])]);
        let entry = buffer.entry_at(0, &Utf8Codec).unwrap().unwrap();
        assert_eq!(entry.kind, EntryKind::Unknown);
    }

    #[test]
    fn test_iterate_emits_offset_identifiers() {
        let buffer = two_chunk_buffer();
        let mut pos = 0i64;
        let mut seen = Vec::new();
        buffer
            .iterate(&mut pos, &Utf8Codec, |name, ino, kind| {
                seen.push((name.to_owned(), ino, kind));
                true
            })
            .unwrap();
        assert_eq!(pos, 3);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1, FAKE_INO_OFFSET as u64);
        assert_eq!(seen[2].1, 2 + FAKE_INO_OFFSET as u64);
    }

    #[test]
    fn test_sink_decline_leaves_cursor_in_place() {
        let buffer = two_chunk_buffer();
        let mut pos = 0i64;
        let mut budget = 2;
        buffer
            .iterate(&mut pos, &Utf8Codec, |_, _, _| {
                if budget == 0 {
                    return false;
                }
                budget -= 1;
                true
            })
            .unwrap();
        // Two consumed; the third was declined and must be seen again.
        assert_eq!(pos, 2);
        let mut names = Vec::new();
        buffer
            .iterate(&mut pos, &Utf8Codec, |name, _, _| {
                names.push(name.to_owned());
                true
            })
            .unwrap();
        assert_eq!(names, vec!["baz"]);
    }

    #[test]
    fn test_bad_name_is_skipped_not_fatal() {
        let mut buf = BytesMut::new();
        let info = ObjInfo::new(OBJ_TYPE_FILE, 0o644, 0);
        encode_dir_record(&mut buf, &info, &[0xff, 0xfe], 3);
        let bad = DirChunk {
            entries: 1,
            buf: buf.freeze(),
        };
        let buffer = DirBuffer::new(vec![bad, chunk(&[("good", OBJ_TYPE_FILE)])]);

        let mut pos = 0i64;
        let mut names = Vec::new();
        buffer
            .iterate(&mut pos, &Utf8Codec, |name, _, _| {
                names.push(name.to_owned());
                true
            })
            .unwrap();
        assert_eq!(names, vec!["good"]);
        assert_eq!(pos, 2);
    }

    #[test]
    fn test_truncated_chunk_recovers_on_next_chunk() {
        // Chunk claims two entries but carries truncated bytes for them; the
        // trailing chunk still enumerates.
        let mut buf = BytesMut::new();
        let info = ObjInfo::new(OBJ_TYPE_FILE, 0o644, 0);
        encode_dir_record(&mut buf, &info, b"torn", 5);
        let mut raw = buf.freeze().to_vec();
        raw.truncate(raw.len() - 2);
        let torn = DirChunk {
            entries: 2,
            buf: raw.into(),
        };
        let buffer = DirBuffer::new(vec![torn, chunk(&[("tail", OBJ_TYPE_DIRECTORY)])]);

        let mut pos = 0i64;
        let mut names = Vec::new();
        buffer
            .iterate(&mut pos, &Utf8Codec, |name, _, _| {
                names.push(name.to_owned());
                true
            })
            .unwrap();
        assert_eq!(names, vec!["tail"]);
    }

    #[test]
    fn test_identifier_overflow_is_detected() {
        assert_eq!(fake_ino_at(0).unwrap(), FAKE_INO_OFFSET as u64);
        assert_eq!(fake_ino_at(7).unwrap(), 7 + FAKE_INO_OFFSET as u64);
        // The offset addition itself can overflow the cursor width.
        assert!(matches!(
            fake_ino_at(i64::MAX - 1),
            Err(SfError::RangeOverflow)
        ));
        // A negative intermediate cannot narrow into the identifier.
        assert!(matches!(
            fake_ino_at(-(FAKE_INO_OFFSET + 5)),
            Err(SfError::RangeOverflow)
        ));
    }
}
