//! Primitive codec (C1): fixed-width integers, floats and strings, with
//! endianness threaded explicitly through every call.

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Byte order for a single read/write call. Never a crate-wide default —
/// formats in this family mix endianness across sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    fn convert<const N: usize>(self, mut bytes: [u8; N]) -> [u8; N] {
        if self == Endian::Big {
            bytes.reverse();
        }
        bytes
    }
}

/// How a string field is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringEncoding {
    /// Fixed-length, zero-padded to `len` bytes.
    FixedLen(u32),
    /// `prefix_bytes`-wide little/big-endian length prefix, then the bytes.
    LengthPrefixed { prefix_bytes: u8 },
    /// 4-byte length prefix, bytes, no terminator.
    Sized,
    /// 1-byte length prefix, bytes, no terminator.
    Short,
}

fn eof(wanted: u64, err: std::io::Error) -> Error {
    Error::from_io(wanted, err)
}

/// Read extension over [`Read`] for the fixed-width primitives C1 names.
pub trait ByteReader: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).map_err(|e| eof(1, e))?;
        Ok(buf[0])
    }

    fn read_i8(&mut self) -> Result<i8> {
        self.read_u8().map(|v| v as i8)
    }

    fn read_u16(&mut self, endian: Endian) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).map_err(|e| eof(2, e))?;
        Ok(u16::from_le_bytes(endian.convert(buf)))
    }

    fn read_i16(&mut self, endian: Endian) -> Result<i16> {
        self.read_u16(endian).map(|v| v as i16)
    }

    fn read_u32(&mut self, endian: Endian) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).map_err(|e| eof(4, e))?;
        Ok(u32::from_le_bytes(endian.convert(buf)))
    }

    fn read_i32(&mut self, endian: Endian) -> Result<i32> {
        self.read_u32(endian).map(|v| v as i32)
    }

    fn read_u64(&mut self, endian: Endian) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).map_err(|e| eof(8, e))?;
        Ok(u64::from_le_bytes(endian.convert(buf)))
    }

    fn read_i64(&mut self, endian: Endian) -> Result<i64> {
        self.read_u64(endian).map(|v| v as i64)
    }

    fn read_f32(&mut self, endian: Endian) -> Result<f32> {
        self.read_u32(endian).map(f32::from_bits)
    }

    fn read_f64(&mut self, endian: Endian) -> Result<f64> {
        self.read_u64(endian).map(f64::from_bits)
    }

    /// Read an integer of the given byte width (1, 2, 4 or 8), sign-extended
    /// if `signed`. Used by C6 when a field's basic type is resolved only at
    /// schema-interpretation time.
    fn read_int(&mut self, width: u8, signed: bool, endian: Endian) -> Result<i64> {
        Ok(match (width, signed) {
            (1, false) => self.read_u8()? as i64,
            (1, true) => self.read_i8()? as i64,
            (2, false) => self.read_u16(endian)? as i64,
            (2, true) => self.read_i16(endian)? as i64,
            (4, false) => self.read_u32(endian)? as i64,
            (4, true) => self.read_i32(endian)? as i64,
            (8, false) => self.read_u64(endian)? as i64,
            (8, true) => self.read_i64(endian)?,
            (other, _) => {
                return Err(Error::CorruptBlock(format!(
                    "unsupported integer width {other}"
                )))
            }
        })
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)
            .map_err(|e| eof(len as u64, e))?;
        Ok(buf)
    }

    fn read_string(&mut self, encoding: StringEncoding, endian: Endian) -> Result<Vec<u8>> {
        match encoding {
            StringEncoding::FixedLen(len) => {
                let mut raw = self.read_bytes(len as usize)?;
                if let Some(nul) = raw.iter().position(|&b| b == 0) {
                    raw.truncate(nul);
                }
                Ok(raw)
            }
            StringEncoding::LengthPrefixed { prefix_bytes } => {
                let len = self.read_int(prefix_bytes, false, endian)?;
                self.read_bytes(len as usize)
            }
            StringEncoding::Sized => {
                let len = self.read_u32(endian)?;
                self.read_bytes(len as usize)
            }
            StringEncoding::Short => {
                let len = self.read_u8()?;
                self.read_bytes(len as usize)
            }
        }
    }
}

impl<R: Read + ?Sized> ByteReader for R {}

/// Write extension over [`Write`], the mirror image of [`ByteReader`]. Used
/// by C6's writer to guarantee the round-trip property byte for byte.
pub trait ByteWriter: Write {
    fn write_u8(&mut self, value: u8) -> Result<()> {
        Ok(self.write_all(&[value])?)
    }

    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_u8(value as u8)
    }

    fn write_u16(&mut self, value: u16, endian: Endian) -> Result<()> {
        Ok(self.write_all(&endian.convert(value.to_le_bytes()))?)
    }

    fn write_i16(&mut self, value: i16, endian: Endian) -> Result<()> {
        self.write_u16(value as u16, endian)
    }

    fn write_u32(&mut self, value: u32, endian: Endian) -> Result<()> {
        Ok(self.write_all(&endian.convert(value.to_le_bytes()))?)
    }

    fn write_i32(&mut self, value: i32, endian: Endian) -> Result<()> {
        self.write_u32(value as u32, endian)
    }

    fn write_u64(&mut self, value: u64, endian: Endian) -> Result<()> {
        Ok(self.write_all(&endian.convert(value.to_le_bytes()))?)
    }

    fn write_i64(&mut self, value: i64, endian: Endian) -> Result<()> {
        self.write_u64(value as u64, endian)
    }

    fn write_f32(&mut self, value: f32, endian: Endian) -> Result<()> {
        self.write_u32(value.to_bits(), endian)
    }

    fn write_f64(&mut self, value: f64, endian: Endian) -> Result<()> {
        self.write_u64(value.to_bits(), endian)
    }

    fn write_int(&mut self, value: i64, width: u8, endian: Endian) -> Result<()> {
        match width {
            1 => self.write_u8(value as u8),
            2 => self.write_u16(value as u16, endian),
            4 => self.write_u32(value as u32, endian),
            8 => self.write_u64(value as u64, endian),
            other => Err(Error::CorruptBlock(format!(
                "unsupported integer width {other}"
            ))),
        }
    }

    fn write_string(
        &mut self,
        bytes: &[u8],
        encoding: StringEncoding,
        endian: Endian,
    ) -> Result<()> {
        match encoding {
            StringEncoding::FixedLen(len) => {
                let len = len as usize;
                if bytes.len() >= len {
                    self.write_all(&bytes[..len])?;
                } else {
                    self.write_all(bytes)?;
                    let pad = vec![0u8; len - bytes.len()];
                    self.write_all(&pad)?;
                }
                Ok(())
            }
            StringEncoding::LengthPrefixed { prefix_bytes } => {
                self.write_int(bytes.len() as i64, prefix_bytes, endian)?;
                Ok(self.write_all(bytes)?)
            }
            StringEncoding::Sized => {
                self.write_u32(bytes.len() as u32, endian)?;
                Ok(self.write_all(bytes)?)
            }
            StringEncoding::Short => {
                self.write_u8(bytes.len() as u8)?;
                Ok(self.write_all(bytes)?)
            }
        }
    }
}

impl<W: Write + ?Sized> ByteWriter for W {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    #[rstest]
    #[case(1, false, Endian::Little)]
    #[case(1, true, Endian::Little)]
    #[case(2, false, Endian::Little)]
    #[case(2, false, Endian::Big)]
    #[case(4, false, Endian::Little)]
    #[case(4, false, Endian::Big)]
    #[case(8, false, Endian::Little)]
    #[case(8, false, Endian::Big)]
    fn read_int_round_trips_every_width_and_endianness(
        #[case] width: u8,
        #[case] signed: bool,
        #[case] endian: Endian,
    ) {
        let value: i64 = if signed { -5 } else { 5 };
        let mut buf = Vec::new();
        buf.write_int(value, width, endian).unwrap();
        assert_eq!(buf.len(), width as usize);
        let mut cur = Cursor::new(buf);
        assert_eq!(cur.read_int(width, signed, endian).unwrap(), value);
    }

    #[test]
    fn roundtrip_u32_both_endians() {
        for endian in [Endian::Little, Endian::Big] {
            let mut buf = Vec::new();
            buf.write_u32(0xdead_beef, endian).unwrap();
            let mut cur = Cursor::new(buf);
            assert_eq!(cur.read_u32(endian).unwrap(), 0xdead_beef);
        }
    }

    #[test]
    fn short_read_is_end_of_stream() {
        let mut cur = Cursor::new(vec![0u8; 2]);
        let err = cur.read_u32(Endian::Little).unwrap_err();
        assert!(matches!(err, Error::EndOfStream { wanted: 4, .. }));
    }

    #[test]
    fn fixed_len_string_strips_padding() {
        let mut buf = Vec::new();
        buf.write_string(b"hi", StringEncoding::FixedLen(8), Endian::Little)
            .unwrap();
        assert_eq!(buf.len(), 8);
        let mut cur = Cursor::new(buf);
        let s = cur
            .read_string(StringEncoding::FixedLen(8), Endian::Little)
            .unwrap();
        assert_eq!(s, b"hi");
    }

    #[test]
    fn short_string_roundtrip() {
        let mut buf = Vec::new();
        buf.write_string(b"abc", StringEncoding::Short, Endian::Little)
            .unwrap();
        assert_eq!(buf, vec![3, b'a', b'b', b'c']);
    }
}
