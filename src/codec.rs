//! Wire codec for the two data shapes that cross the guest boundary.
//!
//! Maps travel as `u32 count`, then `count x (u32 key_len, u32 val_len)`,
//! then `count x (key, 0x00, value, 0x00)`, all little-endian. Buffers travel
//! as raw bytes addressed by `(start, length)` slices. Property paths travel
//! as segments joined with `0x00`.
//!
//! Decoding is deliberately tolerant: guests hand over whatever they built in
//! linear memory, and a truncated or garbled map must degrade to "fewer
//! entries", never to a trap.

use crate::error::WasmError;
use crate::map::ProxyMap;

/// Size in bytes of `map` once encoded.
pub fn encoded_map_size(map: &ProxyMap) -> usize {
    let mut size = 4;
    for (key, value) in map.entries() {
        size += 8 + key.len() + 1 + value.len() + 1;
    }
    size
}

pub fn encode_map(map: &ProxyMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_map_size(map));
    out.extend_from_slice(&(map.len() as u32).to_le_bytes());
    for (key, value) in map.entries() {
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    }
    for (key, value) in map.entries() {
        out.extend_from_slice(key.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

pub fn decode_map(data: &[u8]) -> ProxyMap {
    if data.len() < 4 {
        return ProxyMap::new();
    }
    let count = read_u32(data, 0) as usize;
    let mut data_offset = 4 + count * 8;
    if data_offset >= data.len() && count > 0 {
        return ProxyMap::new();
    }

    let mut map = ProxyMap::with_capacity(count);
    for i in 0..count {
        let key_len = read_u32(data, 4 + i * 8) as usize;
        let val_len = read_u32(data, 4 + i * 8 + 4) as usize;
        let entry_end = match data_offset
            .checked_add(key_len)
            .and_then(|n| n.checked_add(val_len))
            .and_then(|n| n.checked_add(2))
        {
            Some(end) => end,
            None => break,
        };
        if entry_end > data.len() {
            break;
        }
        let key = String::from_utf8_lossy(&data[data_offset..data_offset + key_len]);
        data_offset += key_len + 1;
        let value = String::from_utf8_lossy(&data[data_offset..data_offset + val_len]);
        data_offset += val_len + 1;
        map.add(&key, &value);
    }
    map
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Resolves a guest-requested `(start, length)` view of a buffer.
///
/// A wrapped `start + length` is a bad argument; a length overrunning the end
/// is clamped; a start at or past the end reads as empty.
pub fn buffer_slice(buffer: &[u8], start: u32, length: u32) -> Result<&[u8], WasmError> {
    // Overflow must be caught in the u32 domain the guest works in;
    // widened to usize the sum always fits.
    let end = match start.checked_add(length) {
        Some(end) => end as usize,
        None => return Err(WasmError::bad_argument()),
    };
    let start = start as usize;
    if start >= buffer.len() {
        return Ok(&[]);
    }
    Ok(&buffer[start..end.min(buffer.len())])
}

/// Splices `change` into `existing` over the `(start, length)` range.
///
/// Out-of-range start/length are clamped to the existing buffer; replacing
/// the whole buffer returns the change as-is.
pub fn replace_bytes(existing: &[u8], change: &[u8], start: u32, length: u32) -> Vec<u8> {
    let start = (start as usize).min(existing.len());
    let length = (length as usize).min(existing.len() - start);

    if start == 0 && length == existing.len() {
        return change.to_vec();
    }

    let mut out = Vec::with_capacity(existing.len() - length + change.len());
    out.extend_from_slice(&existing[..start]);
    out.extend_from_slice(change);
    out.extend_from_slice(&existing[start + length..]);
    out
}

/// Joins property-path segments with NUL for the guest.
pub fn encode_path(path: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, segment) in path.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(segment.as_bytes());
    }
    out
}

/// Splits a guest-supplied NUL-joined property path into segments.
///
/// A trailing NUL is tolerated; interior empty segments are preserved.
pub fn decode_path(data: &[u8]) -> Vec<String> {
    let data = match data.split_last() {
        Some((0, rest)) => rest,
        _ => data,
    };
    if data.is_empty() {
        return Vec::new();
    }
    data.split(|b| *b == 0)
        .map(|segment| String::from_utf8_lossy(segment).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_round_trip_preserves_order_and_duplicates() {
        let map = ProxyMap::of(&[
            (":method", "GET"),
            (":path", "/status"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
            ("x-empty", ""),
        ]);
        let encoded = encode_map(&map);
        assert_eq!(encoded.len(), encoded_map_size(&map));
        assert_eq!(decode_map(&encoded), map);
    }

    #[test]
    fn empty_map_round_trips() {
        let map = ProxyMap::new();
        let encoded = encode_map(&map);
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        assert!(decode_map(&encoded).is_empty());
    }

    #[test]
    fn truncated_input_decodes_as_empty() {
        assert!(decode_map(&[]).is_empty());
        assert!(decode_map(&[1, 0]).is_empty());
        // Claims one entry but carries no length table or data.
        assert!(decode_map(&[1, 0, 0, 0]).is_empty());
    }

    #[test]
    fn malformed_entry_stops_decoding() {
        let map = ProxyMap::of(&[("a", "1"), ("b", "2")]);
        let mut encoded = encode_map(&map);
        // Chop the second entry's data off.
        encoded.truncate(encoded.len() - 2);
        let decoded = decode_map(&encoded);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get("a"), Some("1"));
    }

    #[test]
    fn oversized_length_field_does_not_panic() {
        let map = ProxyMap::of(&[("a", "1")]);
        let mut encoded = encode_map(&map);
        // Corrupt the key length to a huge value.
        encoded[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(decode_map(&encoded).is_empty());
    }

    #[test]
    fn buffer_slice_clamps_and_guards() {
        let buffer = b"hello world";
        assert_eq!(buffer_slice(buffer, 0, 5).unwrap(), b"hello");
        assert_eq!(buffer_slice(buffer, 6, 100).unwrap(), b"world");
        assert_eq!(buffer_slice(buffer, 50, 5).unwrap(), b"");
        assert!(buffer_slice(buffer, u32::MAX, 2).is_err());
    }

    #[test]
    fn replace_bytes_splices() {
        assert_eq!(replace_bytes(b"abcdef", b"XY", 2, 2), b"abXYef");
        assert_eq!(replace_bytes(b"abcdef", b"XY", 0, 6), b"XY");
        assert_eq!(replace_bytes(b"abc", b"XY", 10, 5), b"abcXY");
        assert_eq!(replace_bytes(b"", b"XY", 0, 0), b"XY");
        assert_eq!(replace_bytes(b"abc", b"", 1, 1), b"ac");
    }

    #[test]
    fn path_round_trip() {
        let path = vec!["request".to_string(), "path".to_string()];
        let encoded = encode_path(&path);
        assert_eq!(encoded, b"request\0path");
        assert_eq!(decode_path(&encoded), path);
        // Trailing NUL from a C-style guest is tolerated.
        assert_eq!(decode_path(b"request\0path\0"), path);
        assert!(decode_path(b"").is_empty());
    }
}
