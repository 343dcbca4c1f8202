// src/wire.rs
// Minimal tagged/varint binary codec in protobuf's wire layout: each field
// is written as a `(field_number << 3 | wire_type)` tag byte followed by
// either a LEB128 varint (wire type 0) or a length-delimited blob (wire
// type 2, itself length-prefixed with a varint). This produces bit-exact
// bytes against the message field numbering below, so an interoperating
// protobuf decoder reads the same wire format.
//
// The trait-based Encodable/Decodable split and the Read/Write-oriented
// helpers follow the same shape as other hand-rolled binary codecs in the
// Rust ecosystem (e.g. Bitcoin-style compact-size serialization), adapted
// here to protobuf tags/varints instead.

use std::io::{self, Read, Write};

use crate::error::{ChatError, Result};

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_LEN_DELIMITED: u8 = 2;

fn io_err(e: io::Error) -> ChatError {
    ChatError::DecodeWire(e.to_string())
}

/// Write an unsigned LEB128 varint.
pub fn write_varint<W: Write>(w: &mut W, mut value: u64) -> Result<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        w.write_all(&[byte]).map_err(io_err)?;
        if value == 0 {
            break;
        }
    }
    Ok(())
}

/// Read an unsigned LEB128 varint.
pub fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(ChatError::DecodeWire("varint too long".into()));
        }
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte).map_err(io_err)?;
        let byte = byte[0];
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(value)
}

/// Write a field tag: `(field_number << 3) | wire_type`.
pub fn write_tag<W: Write>(w: &mut W, field_number: u32, wire_type: u8) -> Result<()> {
    write_varint(w, ((field_number as u64) << 3) | wire_type as u64)
}

/// Read a field tag, returning `(field_number, wire_type)`.
pub fn read_tag<R: Read>(r: &mut R) -> Result<(u32, u8)> {
    let tag = read_varint(r)?;
    Ok(((tag >> 3) as u32, (tag & 0x7) as u8))
}

/// Write a length-delimited field: varint length prefix, then the bytes.
/// Always copies into a freshly owned buffer on the read side — no aliased
/// views into a shared buffer ever reach a crypto primitive (§4.3).
pub fn write_bytes_field<W: Write>(w: &mut W, field_number: u32, data: &[u8]) -> Result<()> {
    write_tag(w, field_number, WIRE_LEN_DELIMITED)?;
    write_varint(w, data.len() as u64)?;
    w.write_all(data).map_err(io_err)
}

pub fn write_string_field<W: Write>(w: &mut W, field_number: u32, s: &str) -> Result<()> {
    write_bytes_field(w, field_number, s.as_bytes())
}

pub fn write_varint_field<W: Write>(w: &mut W, field_number: u32, value: u64) -> Result<()> {
    write_tag(w, field_number, WIRE_VARINT)?;
    write_varint(w, value)
}

pub fn read_length_delimited<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_varint(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf)
}

pub fn read_string_field<R: Read>(r: &mut R) -> Result<String> {
    let bytes = read_length_delimited(r)?;
    String::from_utf8(bytes).map_err(|e| ChatError::DecodeWire(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v).unwrap();
            let mut cur = Cursor::new(buf);
            assert_eq!(read_varint(&mut cur).unwrap(), v);
        }
    }

    #[test]
    fn tag_round_trip() {
        let mut buf = Vec::new();
        write_tag(&mut buf, 7, WIRE_LEN_DELIMITED).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_tag(&mut cur).unwrap(), (7, WIRE_LEN_DELIMITED));
    }

    #[test]
    fn string_field_round_trip() {
        let mut buf = Vec::new();
        write_string_field(&mut buf, 3, "hello").unwrap();
        let mut cur = Cursor::new(buf);
        let (field, wt) = read_tag(&mut cur).unwrap();
        assert_eq!(field, 3);
        assert_eq!(wt, WIRE_LEN_DELIMITED);
        assert_eq!(read_string_field(&mut cur).unwrap(), "hello");
    }
}
