//! Infohash extraction from raw `.torrent` payloads.
//!
//! Most clients do not return a hash synchronously when a torrent is added by
//! payload, so the adapter computes SHA-1 over the bencoded `info` dictionary
//! locally and later confirms the hash appears in the client's list.

use sha1::{Digest, Sha1};

/// Compute the infohash (lowercase hex) of a bencoded metainfo payload.
///
/// Returns `None` when the payload is not a bencoded dictionary containing an
/// `info` key.
#[must_use]
pub fn infohash_from_metainfo(payload: &[u8]) -> Option<String> {
    let info = info_dict_slice(payload)?;
    let digest = Sha1::digest(info);
    let mut hex = String::with_capacity(40);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    Some(hex)
}

/// Locate the raw bytes of the top-level `info` dictionary.
fn info_dict_slice(payload: &[u8]) -> Option<&[u8]> {
    // Top level must be a dictionary.
    if payload.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    while pos < payload.len() && payload[pos] != b'e' {
        let (key, key_end) = parse_string(payload, pos)?;
        let value_end = skip_value(payload, key_end)?;
        if key == b"info" {
            return Some(&payload[key_end..value_end]);
        }
        pos = value_end;
    }
    None
}

/// Parse a bencoded string at `pos`, returning (content, end offset).
fn parse_string(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let colon = data[pos..].iter().position(|&b| b == b':')? + pos;
    let len: usize = std::str::from_utf8(&data[pos..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if end > data.len() {
        return None;
    }
    Some((&data[start..end], end))
}

/// Return the offset one past the bencoded value starting at `pos`.
fn skip_value(data: &[u8], pos: usize) -> Option<usize> {
    match data.get(pos)? {
        b'd' | b'l' => {
            let mut cursor = pos + 1;
            while *data.get(cursor)? != b'e' {
                cursor = if data[pos] == b'd' {
                    // Dictionary entries are a string key followed by a value.
                    let (_, key_end) = parse_string(data, cursor)?;
                    skip_value(data, key_end)?
                } else {
                    skip_value(data, cursor)?
                };
            }
            Some(cursor + 1)
        }
        b'i' => {
            let end = data[pos..].iter().position(|&b| b == b'e')? + pos;
            Some(end + 1)
        }
        b'0'..=b'9' => parse_string(data, pos).map(|(_, end)| end),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal single-file metainfo with a known info dictionary.
    fn sample_metainfo() -> Vec<u8> {
        let info = b"d6:lengthi1024e4:name8:demo.bin12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let mut payload = Vec::new();
        payload.extend_from_slice(b"d8:announce29:https://tracker.example.org/a4:info");
        payload.extend_from_slice(info);
        payload.push(b'e');
        payload
    }

    #[test]
    fn infohash_matches_sha1_of_info_dict() {
        let payload = sample_metainfo();
        let info = b"d6:lengthi1024e4:name8:demo.bin12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let expected = Sha1::digest(info);
        let mut expected_hex = String::new();
        for byte in expected {
            use std::fmt::Write;
            let _ = write!(expected_hex, "{byte:02x}");
        }
        assert_eq!(infohash_from_metainfo(&payload), Some(expected_hex));
    }

    #[test]
    fn handles_info_not_first_key_and_nested_structures() {
        // `comment` precedes `info`; info contains a nested list of dicts.
        let info = b"d5:filesld6:lengthi1e4:pathl3:fooeed6:lengthi2e4:pathl3:bareee4:name4:demo12:piece lengthi16384e6:pieces20:bbbbbbbbbbbbbbbbbbbbe";
        let mut payload = Vec::new();
        payload.extend_from_slice(b"d7:comment5:hello4:info");
        payload.extend_from_slice(info);
        payload.extend_from_slice(b"8:url-listl23:https://mirror.example/ee");
        let hash = infohash_from_metainfo(&payload).expect("hash");
        assert_eq!(hash.len(), 40);
        let direct = Sha1::digest(info.as_slice());
        let mut direct_hex = String::new();
        for byte in direct {
            use std::fmt::Write;
            let _ = write!(direct_hex, "{byte:02x}");
        }
        assert_eq!(hash, direct_hex);
    }

    #[test]
    fn rejects_non_dictionaries_and_truncated_payloads() {
        assert_eq!(infohash_from_metainfo(b"le"), None);
        assert_eq!(infohash_from_metainfo(b""), None);
        assert_eq!(infohash_from_metainfo(b"d4:info"), None);
        assert_eq!(infohash_from_metainfo(b"d4:spam3:egge"), None);
    }
}
