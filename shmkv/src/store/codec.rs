//! Record layout of the data segment.
//!
//! The segment is an append-only log of `u32 key_len | key | u32 val_len | val`, little endian.
//! A `val_len` of `u32::MAX` marks the removal of the key, no value bytes follow. Later records
//! replace earlier ones with the same key.
use std::collections::HashMap;

const TOMBSTONE: u32 = u32::MAX;

pub(crate) fn encoded_len(key: &str, value: Option<&[u8]>) -> usize {
    8 + key.len() + value.map_or(0, <[u8]>::len)
}

/// Append one record to `out`.
pub(crate) fn encode(out: &mut Vec<u8>, key: &str, value: Option<&[u8]>) {
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key.as_bytes());

    match value {
        Some(value) => {
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        None => out.extend_from_slice(&TOMBSTONE.to_le_bytes()),
    }
}

/// Encode all live entries, in key order.
pub(crate) fn encode_all<'a>(entries: impl IntoIterator<Item = (&'a String, &'a Vec<u8>)>) -> Vec<u8> {
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = Vec::new();
    for (key, value) in entries {
        encode(&mut out, key, Some(value));
    }
    out
}

/// Replay the records in `data` onto `entries`.
///
/// Returns the number of bytes consumed. Parsing stops at the first truncated or malformed
/// record, everything before it is applied.
pub(crate) fn decode_into(data: &[u8], entries: &mut HashMap<String, Vec<u8>>) -> usize {
    let mut pos = 0;

    while let Some((key, value, next)) = decode_one(data, pos) {
        match value {
            Some(value) => entries.insert(key, value.to_vec()),
            None => entries.remove(&key),
        };
        pos = next;
    }

    pos
}

fn decode_one(data: &[u8], pos: usize) -> Option<(String, Option<&[u8]>, usize)> {
    let key_len = read_u32(data, pos)? as usize;
    let key_start = pos + 4;
    let key = data.get(key_start..key_start.checked_add(key_len)?)?;
    let key = String::from_utf8(key.to_vec()).ok()?;

    let val_pos = key_start + key_len;
    let val_len = read_u32(data, val_pos)?;
    if val_len == TOMBSTONE {
        return Some((key, None, val_pos + 4));
    }

    let val_start = val_pos + 4;
    let val_end = val_start.checked_add(val_len as usize)?;
    let value = data.get(val_start..val_end)?;
    Some((key, Some(value), val_end))
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}
