//! Schema-free reading of protobuf wire data.
//!
//! This is the substrate for `--decode_raw`: a cursor over a byte buffer that
//! can split tags from wire types and pull the primitive encodings out, plus
//! the heuristics that guess whether a length-delimited value is a nested
//! message or a string.

use anyhow::{bail, Result};

/// Largest field number representable in a wire-format tag (2^29 - 1).
pub const MAX_TAG: i32 = 536_870_911;

/// First field number of the range reserved for protobuf internals.
pub const SPECIAL_RESERVED_START: i32 = 19_000;
/// Last field number of the range reserved for protobuf internals.
pub const SPECIAL_RESERVED_END: i32 = 19_999;

/// The low three bits of a wire-format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    StartGroup,
    EndGroup,
    Fixed32,
}

impl WireType {
    fn from_raw(raw: u64) -> Option<WireType> {
        match raw {
            0 => Some(WireType::Varint),
            1 => Some(WireType::Fixed64),
            2 => Some(WireType::LengthDelimited),
            3 => Some(WireType::StartGroup),
            4 => Some(WireType::EndGroup),
            5 => Some(WireType::Fixed32),
            _ => None,
        }
    }
}

/// Returns true if a field number is outside the legal range for message
/// definitions, either out of bounds or within the reserved block.
pub fn is_illegal_tag(tag: i32) -> bool {
    !(1..=MAX_TAG).contains(&tag) || (SPECIAL_RESERVED_START..=SPECIAL_RESERVED_END).contains(&tag)
}

/// Cursor over a buffer of wire-format data.
pub struct CodedReader<'a> {
    buf: &'a [u8],
    index: usize,
}

impl<'a> CodedReader<'a> {
    pub fn new(buf: &'a [u8]) -> CodedReader<'a> {
        CodedReader { buf, index: 0 }
    }

    pub fn eof(&self) -> bool {
        self.index >= self.buf.len()
    }

    fn skip(&mut self, count: usize) -> bool {
        match self.index.checked_add(count) {
            Some(next) if next <= self.buf.len() => {
                self.index = next;
                true
            }
            _ => false,
        }
    }

    /// Reads a varint-encoded integer, the format backing int32, int64,
    /// uint32, uint64, bool, and enum values. At most ten bytes are
    /// consumed; setting bit 64 with the continuation bit still high is an
    /// overflow.
    pub fn decode_varint(&mut self) -> Result<u64> {
        let mut x = 0u64;
        for shift in (0..64).step_by(7) {
            let Some(&b) = self.buf.get(self.index) else {
                bail!("unexpected EOF");
            };
            self.index += 1;
            x |= u64::from(b & 0x7f) << shift;
            if b < 0x80 {
                return Ok(x);
            }
        }
        bail!("proto: integer overflow");
    }

    /// Reads one tag varint and splits it into field number and wire type.
    pub fn decode_tag_and_wire_type(&mut self) -> Result<(i32, WireType)> {
        let v = self.decode_varint()?;
        let Some(wire_type) = WireType::from_raw(v & 7) else {
            bail!("input contained invalid wire type: {}", v & 7);
        };
        let tag = v >> 3;
        if tag > i32::MAX as u64 {
            bail!("tag number out of range: {tag}");
        }
        Ok((tag as i32, wire_type))
    }

    /// Reads a little-endian 64-bit value (fixed64, sfixed64, double).
    pub fn decode_fixed64(&mut self) -> Result<u64> {
        let end = self.index + 8;
        let Some(bytes) = self.buf.get(self.index..end) else {
            bail!("unexpected EOF");
        };
        self.index = end;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a little-endian 32-bit value (fixed32, sfixed32, float).
    pub fn decode_fixed32(&mut self) -> Result<u32> {
        let end = self.index + 4;
        let Some(bytes) = self.buf.get(self.index..end) else {
            bail!("unexpected EOF");
        };
        self.index = end;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(raw))
    }

    /// Reads a length-prefixed byte run, the format backing bytes, string,
    /// and embedded message values.
    pub fn decode_raw_bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.decode_varint()?;
        let Ok(n) = usize::try_from(n) else {
            bail!("proto: bad byte length {n}");
        };
        let Some(end) = self.index.checked_add(n) else {
            bail!("unexpected EOF");
        };
        let Some(bytes) = self.buf.get(self.index..end) else {
            bail!("unexpected EOF");
        };
        self.index = end;
        Ok(bytes)
    }

    fn looks_like_message(&mut self, in_group: bool) -> bool {
        loop {
            if self.eof() {
                // a group must see its "end group" tag before the buffer runs out
                return !in_group;
            }
            let Ok((tag, wire_type)) = self.decode_tag_and_wire_type() else {
                return false;
            };
            if wire_type == WireType::EndGroup {
                return in_group;
            }
            if is_illegal_tag(tag) {
                return false;
            }
            let ok = match wire_type {
                WireType::Varint => self.skip_varint(),
                WireType::Fixed32 => self.skip(4),
                WireType::Fixed64 => self.skip(8),
                WireType::LengthDelimited => self.decode_raw_bytes().is_ok(),
                WireType::StartGroup => self.looks_like_message(true),
                WireType::EndGroup => unreachable!(),
            };
            if !ok {
                return false;
            }
        }
    }

    fn skip_varint(&mut self) -> bool {
        // find the terminating byte (high bit unset) within the 10-byte limit
        let limit = self.buf.len().min(self.index + 10);
        for i in self.index..limit {
            if self.buf[i] & 0x80 == 0 {
                self.index = i + 1;
                return true;
            }
        }
        false
    }
}

/// Heuristic: does this buffer consume cleanly as well-formed wire format
/// with legal field numbers and wire types?
pub fn is_probably_message(data: &[u8]) -> bool {
    CodedReader::new(data).looks_like_message(false)
}

/// Heuristic: is this buffer a valid UTF-8 sequence?
pub fn is_probably_string(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_single_byte() {
        let mut r = CodedReader::new(&[0x2a]);
        assert_eq!(r.decode_varint().unwrap(), 42);
        assert!(r.eof());
    }

    #[test]
    fn varint_multi_byte() {
        // 300 = 0b1_0010_1100
        let mut r = CodedReader::new(&[0xac, 0x02]);
        assert_eq!(r.decode_varint().unwrap(), 300);
    }

    #[test]
    fn varint_max() {
        let mut r = CodedReader::new(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert_eq!(r.decode_varint().unwrap(), u64::MAX);
    }

    #[test]
    fn varint_overflow() {
        let mut r = CodedReader::new(&[0xff; 11]);
        let err = r.decode_varint().unwrap_err();
        assert_eq!(err.to_string(), "proto: integer overflow");
    }

    #[test]
    fn varint_truncated() {
        let mut r = CodedReader::new(&[0x80]);
        assert_eq!(r.decode_varint().unwrap_err().to_string(), "unexpected EOF");
    }

    #[test]
    fn tag_and_wire_type_split() {
        // field 1, varint
        let mut r = CodedReader::new(&[0x08]);
        assert_eq!(r.decode_tag_and_wire_type().unwrap(), (1, WireType::Varint));
        // field 2, length-delimited
        let mut r = CodedReader::new(&[0x12]);
        assert_eq!(r.decode_tag_and_wire_type().unwrap(), (2, WireType::LengthDelimited));
    }

    #[test]
    fn invalid_wire_type_rejected() {
        let mut r = CodedReader::new(&[0x0e]); // field 1, wire type 6
        let err = r.decode_tag_and_wire_type().unwrap_err();
        assert_eq!(err.to_string(), "input contained invalid wire type: 6");
    }

    #[test]
    fn fixed_width_reads() {
        let mut r = CodedReader::new(&[1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(r.decode_fixed64().unwrap(), 1);
        assert_eq!(r.decode_fixed32().unwrap(), 2);
        assert!(r.eof());
    }

    #[test]
    fn raw_bytes_bounds_checked() {
        let mut r = CodedReader::new(&[0x05, b'a', b'b']);
        assert_eq!(r.decode_raw_bytes().unwrap_err().to_string(), "unexpected EOF");
    }

    #[test]
    fn message_heuristic_accepts_valid_encoding() {
        // field 1 varint 42, field 2 string "hi"
        assert!(is_probably_message(&[0x08, 0x2a, 0x12, 0x02, 0x68, 0x69]));
    }

    #[test]
    fn message_heuristic_rejects_text() {
        assert!(!is_probably_message(b"hello world"));
        assert!(is_probably_string(b"hello world"));
        assert!(!is_probably_string(&[0xff, 0xfe]));
    }

    #[test]
    fn message_heuristic_rejects_reserved_tags() {
        // field 19000 varint: tag = 19000 << 3 = 152000 = varint [0xc0, 0xa3, 0x09]
        assert!(!is_probably_message(&[0xc0, 0xa3, 0x09, 0x00]));
    }

    #[test]
    fn message_heuristic_handles_groups() {
        // field 1 start group, field 2 varint 1, field 1 end group
        assert!(is_probably_message(&[0x0b, 0x10, 0x01, 0x0c]));
        // unterminated group
        assert!(!is_probably_message(&[0x0b, 0x10, 0x01]));
    }
}
