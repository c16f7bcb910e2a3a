//! Big-endian integers and SQLite varints as stored on b-tree pages.
//!
//! A varint is 1 to 9 bytes. The first eight bytes carry seven bits each,
//! high bit set meaning "more follows"; a ninth byte carries a full eight.

use crate::error::{Error, ErrorCode, Result};

/// Longest encoding of a varint
pub const MAX_VARINT_LEN: usize = 9;

/// Decode the varint at `offset`. Returns (value, bytes consumed).
pub fn read_varint(data: &[u8], offset: usize) -> Result<(u64, usize)> {
    let bytes = data.get(offset..).unwrap_or(&[]);
    let mut value: u64 = 0;
    for (i, &b) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        if i == MAX_VARINT_LEN - 1 {
            return Ok(((value << 8) | b as u64, MAX_VARINT_LEN));
        }
        value = (value << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::with_message(
        ErrorCode::Corrupt,
        format!("truncated varint at offset {}", offset),
    ))
}

/// Decode a varint that must fit in 32 bits (payload sizes).
pub fn read_varint32(data: &[u8], offset: usize) -> Result<(u32, usize)> {
    let (value, n) = read_varint(data, offset)?;
    let value = u32::try_from(value).map_err(|_| {
        Error::with_message(ErrorCode::Corrupt, format!("varint {} exceeds 32 bits", value))
    })?;
    Ok((value, n))
}

/// Number of bytes needed to encode `value`.
pub fn varint_len(value: u64) -> usize {
    if value >> 56 != 0 {
        return MAX_VARINT_LEN;
    }
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Append the encoding of `value` to `out`.
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    let len = varint_len(value);
    if len == MAX_VARINT_LEN {
        let mut v = value >> 8;
        let mut head = [0u8; 8];
        for slot in head.iter_mut().rev() {
            *slot = ((v & 0x7f) as u8) | 0x80;
            v >>= 7;
        }
        out.extend_from_slice(&head);
        out.push(value as u8);
        return;
    }
    for i in (0..len).rev() {
        let group = ((value >> (7 * i)) & 0x7f) as u8;
        out.push(if i == 0 { group } else { group | 0x80 });
    }
}

pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn write_u16(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 2)
        .ok_or_else(|| Error::with_message(ErrorCode::Corrupt, "u16 write out of bounds"))?;
    slot.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn write_u32(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 4)
        .ok_or_else(|| Error::with_message(ErrorCode::Corrupt, "u32 write out of bounds"))?;
    slot.copy_from_slice(&value.to_be_bytes());
    Ok(())
}
