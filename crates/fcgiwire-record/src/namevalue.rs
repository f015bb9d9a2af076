//! Name-value pair encoding used by Params and GetValues/GetValuesResult.
//!
//! Each pair is `nameLength valueLength name value`. A length below 128 is
//! one byte; anything larger is four bytes big-endian with the top bit of
//! the first byte set, giving a maximum of 2^31-1.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ParamsError;

/// Largest length the 4-byte form can express.
pub const MAX_PAIR_LENGTH: usize = 0x7fff_ffff;

/// Lengths up to this value use the 1-byte form.
const SHORT_LENGTH_MAX: usize = 0x7f;

/// One name-value pair. Names and values are raw bytes; no text encoding
/// is assumed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NameValuePair {
    pub name: Bytes,
    pub value: Bytes,
}

impl NameValuePair {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// A pair with an empty value, as sent in GetValues queries.
    pub fn name_only(name: impl Into<Bytes>) -> Self {
        Self::new(name, Bytes::new())
    }
}

impl fmt::Debug for NameValuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// Decode every pair in `src`, in order. Duplicate names are kept.
///
/// Decoding stops cleanly at the end of `src`; a length prefix or a
/// name/value cut short is a [`ParamsError`].
pub fn decode_pairs(src: &[u8]) -> Result<Vec<NameValuePair>, ParamsError> {
    let mut pairs = Vec::new();
    let mut offset = 0;

    while offset < src.len() {
        let name_len = read_length(src, &mut offset)?;
        let value_len = read_length(src, &mut offset)?;

        let needed = name_len.saturating_add(value_len);
        let available = src.len() - offset;
        if needed > available {
            return Err(ParamsError::TruncatedBody {
                offset,
                needed,
                available,
            });
        }

        let name = Bytes::copy_from_slice(&src[offset..offset + name_len]);
        offset += name_len;
        let value = Bytes::copy_from_slice(&src[offset..offset + value_len]);
        offset += value_len;
        pairs.push(NameValuePair { name, value });
    }

    Ok(pairs)
}

fn read_length(src: &[u8], offset: &mut usize) -> Result<usize, ParamsError> {
    let start = *offset;
    let Some(&first) = src.get(start) else {
        return Err(ParamsError::TruncatedLength { offset: start });
    };
    if first & 0x80 == 0 {
        *offset += 1;
        return Ok(usize::from(first));
    }
    let Some(bytes) = src.get(start..start + 4) else {
        return Err(ParamsError::TruncatedLength { offset: start });
    };
    *offset += 4;
    let raw = u32::from_be_bytes([bytes[0] & 0x7f, bytes[1], bytes[2], bytes[3]]);
    Ok(raw as usize)
}

fn put_length(len: usize, dst: &mut BytesMut) -> Result<(), ParamsError> {
    if len <= SHORT_LENGTH_MAX {
        dst.put_u8(len as u8);
    } else if len <= MAX_PAIR_LENGTH {
        dst.put_u32(len as u32 | 0x8000_0000);
    } else {
        return Err(ParamsError::LengthOverflow(len));
    }
    Ok(())
}

fn length_size(len: usize) -> usize {
    if len <= SHORT_LENGTH_MAX {
        1
    } else {
        4
    }
}

/// Number of bytes [`encode_pairs`] will produce.
pub fn encoded_len(pairs: &[NameValuePair]) -> usize {
    pairs
        .iter()
        .map(|p| length_size(p.name.len()) + length_size(p.value.len()) + p.name.len() + p.value.len())
        .sum()
}

/// Encode `pairs` in order, choosing the shortest length form.
///
/// Nothing is written if any name or value is too long.
pub fn encode_pairs(pairs: &[NameValuePair], dst: &mut BytesMut) -> Result<(), ParamsError> {
    if let Some(len) = pairs
        .iter()
        .flat_map(|p| [p.name.len(), p.value.len()])
        .find(|&len| len > MAX_PAIR_LENGTH)
    {
        return Err(ParamsError::LengthOverflow(len));
    }

    dst.reserve(encoded_len(pairs));
    for pair in pairs {
        put_length(pair.name.len(), dst)?;
        put_length(pair.value.len(), dst)?;
        dst.put_slice(&pair.name);
        dst.put_slice(&pair.value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(pairs: &[NameValuePair]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_pairs(pairs, &mut buf).unwrap();
        buf
    }

    #[test]
    fn short_lengths_use_one_byte() {
        let buf = encode(&[NameValuePair::new("AB", "xyz")]);
        assert_eq!(&buf[..], b"\x02\x03ABxyz");
    }

    #[test]
    fn long_lengths_use_four_bytes_with_high_bit() {
        let value = vec![b'v'; 200];
        let buf = encode(&[NameValuePair::new("N", value.clone())]);
        assert_eq!(&buf[..5], &[0x01, 0x80, 0x00, 0x00, 200]);
        assert_eq!(buf.len(), 1 + 4 + 1 + 200);

        let pairs = decode_pairs(&buf).unwrap();
        assert_eq!(pairs[0].value.as_ref(), value.as_slice());
    }

    #[test]
    fn boundary_length_127_vs_128() {
        let at = encode(&[NameValuePair::new(vec![b'a'; 127], "")]);
        assert_eq!(at[0], 127);
        let over = encode(&[NameValuePair::new(vec![b'a'; 128], "")]);
        assert_eq!(&over[..4], &[0x80, 0, 0, 128]);
    }

    #[test]
    fn four_byte_form_accepted_for_small_lengths() {
        // Some encoders always use the long form.
        let buf = [0x80, 0, 0, 1, 0x80, 0, 0, 2, b'K', b'v', b'v'];
        let pairs = decode_pairs(&buf).unwrap();
        assert_eq!(pairs, vec![NameValuePair::new("K", "vv")]);
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let input = vec![
            NameValuePair::new("HTTP_COOKIE", "a=1"),
            NameValuePair::new("QUERY_STRING", ""),
            NameValuePair::new("HTTP_COOKIE", "b=2"),
        ];
        let decoded = decode_pairs(&encode(&input)).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn empty_input_is_empty_list() {
        assert!(decode_pairs(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_length_prefix() {
        assert_eq!(
            decode_pairs(&[0x03]).unwrap_err(),
            ParamsError::TruncatedLength { offset: 1 }
        );
        assert_eq!(
            decode_pairs(&[0x80, 0x00]).unwrap_err(),
            ParamsError::TruncatedLength { offset: 0 }
        );
    }

    #[test]
    fn truncated_body() {
        let err = decode_pairs(b"\x04\x02NAMEv").unwrap_err();
        assert_eq!(
            err,
            ParamsError::TruncatedBody {
                offset: 2,
                needed: 6,
                available: 5
            }
        );
    }

    #[test]
    fn encoded_len_matches_output() {
        let pairs = vec![
            NameValuePair::new("SCRIPT_FILENAME", vec![b'/'; 300]),
            NameValuePair::name_only("FCGI_MAX_CONNS"),
        ];
        assert_eq!(encode(&pairs).len(), encoded_len(&pairs));
    }

    #[test]
    fn debug_is_readable() {
        let pair = NameValuePair::new("REQUEST_METHOD", "GET");
        assert_eq!(format!("{pair:?}"), "REQUEST_METHOD=GET");
    }
}
