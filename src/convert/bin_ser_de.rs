// Helpers for the fixed-layout binary records kept in the intermediate
// files. Integers are little-endian; slices are u32-length-prefixed.

#[derive(Debug)]
pub(super) struct DeserializeError;

impl std::fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("malformed intermediate record")
    }
}

#[inline]
pub(super) fn serialize_u32_into(value: u32, out: &mut Vec<u8>) {
    out.extend(value.to_le_bytes());
}

#[inline]
pub(super) fn serialize_u64_into(value: u64, out: &mut Vec<u8>) {
    out.extend(value.to_le_bytes());
}

#[inline]
pub(super) fn serialize_i64_into(value: i64, out: &mut Vec<u8>) {
    out.extend(value.to_le_bytes());
}

#[inline]
pub(super) fn serialize_bool_into(value: bool, out: &mut Vec<u8>) {
    out.push(value.into());
}

#[inline]
pub(super) fn serialize_opt_u32_into(value: Option<u32>, out: &mut Vec<u8>) {
    match value {
        None => out.push(0),
        Some(value) => {
            out.push(1);
            serialize_u32_into(value, out);
        }
    }
}

#[inline]
pub(super) fn serialize_byte_slice_into(bytes: &[u8], out: &mut Vec<u8>) {
    serialize_u32_into(u32::try_from(bytes.len()).unwrap(), out);
    out.extend(bytes);
}

pub(super) fn serialize_u32_seq_into(values: &[u32], out: &mut Vec<u8>) {
    serialize_u32_into(u32::try_from(values.len()).unwrap(), out);
    for &value in values {
        serialize_u32_into(value, out);
    }
}

#[inline]
pub(super) fn deserialize_byte_from(src: &mut &[u8]) -> Result<u8, DeserializeError> {
    let (&byte, rest) = src.split_first().ok_or(DeserializeError)?;
    *src = rest;
    Ok(byte)
}

#[inline]
pub(super) fn deserialize_byte_array_from<const N: usize>(
    src: &mut &[u8],
) -> Result<[u8; N], DeserializeError> {
    let array;
    (array, *src) = src.split_first_chunk().ok_or(DeserializeError)?;
    Ok(*array)
}

#[inline]
pub(super) fn deserialize_u32_from(src: &mut &[u8]) -> Result<u32, DeserializeError> {
    Ok(u32::from_le_bytes(deserialize_byte_array_from(src)?))
}

#[inline]
pub(super) fn deserialize_u64_from(src: &mut &[u8]) -> Result<u64, DeserializeError> {
    Ok(u64::from_le_bytes(deserialize_byte_array_from(src)?))
}

#[inline]
pub(super) fn deserialize_i64_from(src: &mut &[u8]) -> Result<i64, DeserializeError> {
    Ok(i64::from_le_bytes(deserialize_byte_array_from(src)?))
}

#[inline]
pub(super) fn deserialize_bool_from(src: &mut &[u8]) -> Result<bool, DeserializeError> {
    match deserialize_byte_from(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(DeserializeError),
    }
}

#[inline]
pub(super) fn deserialize_opt_u32_from(
    src: &mut &[u8],
) -> Result<Option<u32>, DeserializeError> {
    match deserialize_byte_from(src)? {
        0 => Ok(None),
        1 => Ok(Some(deserialize_u32_from(src)?)),
        _ => Err(DeserializeError),
    }
}

pub(super) fn deserialize_byte_slice_from(src: &mut &[u8]) -> Result<Vec<u8>, DeserializeError> {
    let len = deserialize_u32_from(src)? as usize;
    if src.len() < len {
        return Err(DeserializeError);
    }
    let data;
    (data, *src) = src.split_at(len);
    Ok(data.to_vec())
}

pub(super) fn deserialize_u32_seq_from(src: &mut &[u8]) -> Result<Vec<u32>, DeserializeError> {
    let len = deserialize_u32_from(src)? as usize;
    if src.len() < len.checked_mul(4).ok_or(DeserializeError)? {
        return Err(DeserializeError);
    }
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(deserialize_u32_from(src)?);
    }
    Ok(values)
}

/// Hex without separators, for the newline-free stream payloads.
pub(super) fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").unwrap();
    }
    out
}

pub(super) fn from_hex(hex: &[u8]) -> Result<Vec<u8>, DeserializeError> {
    if hex.len() % 2 != 0 {
        return Err(DeserializeError);
    }

    fn digit(c: u8) -> Result<u8, DeserializeError> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            _ => Err(DeserializeError),
        }
    }

    hex.chunks_exact(2)
        .map(|pair| Ok(digit(pair[0])? << 4 | digit(pair[1])?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut out = Vec::new();
        serialize_u32_into(7, &mut out);
        serialize_u64_into(1 << 40, &mut out);
        serialize_i64_into(-12345, &mut out);
        serialize_bool_into(true, &mut out);
        serialize_opt_u32_into(None, &mut out);
        serialize_opt_u32_into(Some(42), &mut out);
        serialize_byte_slice_into(b"payload", &mut out);
        serialize_u32_seq_into(&[1, 2, 3], &mut out);

        let mut src = out.as_slice();
        assert_eq!(deserialize_u32_from(&mut src).unwrap(), 7);
        assert_eq!(deserialize_u64_from(&mut src).unwrap(), 1 << 40);
        assert_eq!(deserialize_i64_from(&mut src).unwrap(), -12345);
        assert!(deserialize_bool_from(&mut src).unwrap());
        assert_eq!(deserialize_opt_u32_from(&mut src).unwrap(), None);
        assert_eq!(deserialize_opt_u32_from(&mut src).unwrap(), Some(42));
        assert_eq!(deserialize_byte_slice_from(&mut src).unwrap(), b"payload");
        assert_eq!(deserialize_u32_seq_from(&mut src).unwrap(), vec![1, 2, 3]);
        assert!(src.is_empty());
    }

    #[test]
    fn hex() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x7f]), "00ab7f");
        assert_eq!(from_hex(b"00ab7f").unwrap(), vec![0x00, 0xab, 0x7f]);
        assert!(from_hex(b"0").is_err());
        assert!(from_hex(b"zz").is_err());
    }

    #[test]
    fn truncated_input() {
        let mut src: &[u8] = &[1, 0];
        assert!(deserialize_u32_from(&mut src).is_err());
        let mut src: &[u8] = &[4, 0, 0, 0, 1, 2];
        assert!(deserialize_byte_slice_from(&mut src).is_err());
    }
}
