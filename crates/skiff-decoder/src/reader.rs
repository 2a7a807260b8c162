//! Byte reader for function bodies.
//!
//! All offsets are relative to the start of the body. LEB128 decoding is
//! strict: an encoding may not use more bytes than the value width needs,
//! and the unused high bits of the final byte must be zero (unsigned) or a
//! copy of the sign bit (signed).

use skiff_core::{DecodeError, DecodeErrorKind};

/// A cursor over a function body that tracks its position.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    /// The full body.
    bytes: &'a [u8],
    /// Current byte offset.
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader at the start of `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Create a reader positioned at `offset`.
    pub fn at(bytes: &'a [u8], offset: u32) -> Self {
        Self {
            bytes,
            pos: (offset as usize).min(bytes.len()),
        }
    }

    #[inline]
    pub fn position(&self) -> u32 {
        self.pos as u32
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Peek at the next byte without consuming it.
    #[inline]
    pub fn peek_u8(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    pub fn read_u8(&mut self, what: &str) -> Result<u8, DecodeError> {
        let byte = self
            .peek_u8()
            .ok_or_else(|| DecodeError::unexpected_eof(self.position(), what))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read exactly `N` bytes.
    pub fn read_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| DecodeError::unexpected_eof(self.position(), what))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    pub fn read_u32_leb(&mut self, what: &str) -> Result<u32, DecodeError> {
        self.read_unsigned(32, what).map(|v| v as u32)
    }

    pub fn read_i32_leb(&mut self, what: &str) -> Result<i32, DecodeError> {
        self.read_signed(32, what).map(|v| v as i32)
    }

    pub fn read_i64_leb(&mut self, what: &str) -> Result<i64, DecodeError> {
        self.read_signed(64, what)
    }

    /// Signed 33-bit LEB, used by block types so that every `u32` type index
    /// is representable next to the negative single-byte encodings.
    pub fn read_i33_leb(&mut self, what: &str) -> Result<i64, DecodeError> {
        self.read_signed(33, what)
    }

    pub fn read_f32(&mut self, what: &str) -> Result<f32, DecodeError> {
        self.read_array::<4>(what)
            .map(|bytes| f32::from_bits(u32::from_le_bytes(bytes)))
    }

    pub fn read_f64(&mut self, what: &str) -> Result<f64, DecodeError> {
        self.read_array::<8>(what)
            .map(|bytes| f64::from_bits(u64::from_le_bytes(bytes)))
    }

    fn read_unsigned(&mut self, bits: u32, what: &str) -> Result<u64, DecodeError> {
        let start = self.position();
        let max_bytes = bits.div_ceil(7);
        let mut result = 0u64;
        let mut shift = 0u32;

        for i in 0..max_bytes {
            let byte = self.read_u8(what)?;
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                if i == max_bytes - 1 {
                    let usable = bits - shift;
                    if u32::from(byte & 0x7F) >> usable != 0 {
                        return Err(malformed(start, what, "extra bits in varint"));
                    }
                }
                return Ok(result);
            }
            shift += 7;
        }
        Err(malformed(start, what, "length overflow while decoding varint"))
    }

    fn read_signed(&mut self, bits: u32, what: &str) -> Result<i64, DecodeError> {
        let start = self.position();
        let max_bytes = bits.div_ceil(7);
        let mut result = 0u64;
        let mut shift = 0u32;

        for i in 0..max_bytes {
            let byte = self.read_u8(what)?;
            result |= u64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 != 0 {
                continue;
            }

            if i == max_bytes - 1 {
                // Sign bit plus unused bits must be all zeros or all ones.
                let usable = bits - (shift - 7);
                let ext = (byte & 0x7F) >> (usable - 1);
                if ext != 0 && ext != 0x7F >> (usable - 1) {
                    return Err(malformed(start, what, "extra bits in varint"));
                }
            }
            if shift < 64 && byte & 0x40 != 0 {
                result |= !0u64 << shift;
            }
            return Ok(result as i64);
        }
        Err(malformed(start, what, "length overflow while decoding varint"))
    }
}

fn malformed(offset: u32, what: &str, detail: &str) -> DecodeError {
    DecodeError::new(
        DecodeErrorKind::MalformedLeb,
        offset,
        format!("{detail} ({what})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_leb() {
        let mut reader = Reader::new(&[0x00, 0x7F, 0x80, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(reader.read_u32_leb("a").unwrap(), 0);
        assert_eq!(reader.read_u32_leb("b").unwrap(), 127);
        assert_eq!(reader.read_u32_leb("c").unwrap(), 128);
        assert_eq!(reader.read_u32_leb("d").unwrap(), u32::MAX);
        assert!(reader.is_at_end());
    }

    #[test]
    fn unsigned_leb_rejects_unused_bits() {
        let mut reader = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        let err = reader.read_u32_leb("index").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::MalformedLeb);
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn unsigned_leb_rejects_overlong() {
        let mut reader = Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]);
        let err = reader.read_u32_leb("index").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::MalformedLeb);
    }

    #[test]
    fn signed_leb() {
        let mut reader = Reader::new(&[0x7F, 0x80, 0x7F, 0x3F, 0x40]);
        assert_eq!(reader.read_i32_leb("a").unwrap(), -1);
        assert_eq!(reader.read_i32_leb("b").unwrap(), -128);
        assert_eq!(reader.read_i32_leb("c").unwrap(), 63);
        assert_eq!(reader.read_i32_leb("d").unwrap(), -64);
    }

    #[test]
    fn signed_leb_extremes() {
        let mut reader = Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x78, 0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
        assert_eq!(reader.read_i32_leb("min").unwrap(), i32::MIN);
        assert_eq!(reader.read_i32_leb("max").unwrap(), i32::MAX);

        let mut reader = Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7F]);
        assert_eq!(reader.read_i64_leb("min").unwrap(), i64::MIN);
    }

    #[test]
    fn signed_leb_rejects_inconsistent_sign_bits() {
        let mut reader = Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x70]);
        let err = reader.read_i32_leb("value").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::MalformedLeb);

        let mut reader = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(reader.read_i64_leb("value").is_err());
    }

    #[test]
    fn s33_covers_u32_indices() {
        let mut reader = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F, 0x40]);
        let value = reader.read_i33_leb("block type").unwrap();
        assert_eq!(value, i64::from(u32::MAX));
        assert_eq!(reader.read_i33_leb("block type").unwrap(), -64);
    }

    #[test]
    fn truncated_input_reports_position() {
        let mut reader = Reader::new(&[0x41, 0x80]);
        reader.read_u8("opcode").unwrap();
        let err = reader.read_i32_leb("i32 constant").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::UnexpectedEof);
        assert_eq!(err.offset, 2);
        assert_eq!(err.message, "expected i32 constant");
    }

    #[test]
    fn floats_are_little_endian() {
        let mut reader = Reader::new(&[0x00, 0x00, 0x80, 0x3F]);
        assert_eq!(reader.read_f32("f32").unwrap(), 1.0);
        assert!(reader.read_f64("f64").is_err());
    }
}
