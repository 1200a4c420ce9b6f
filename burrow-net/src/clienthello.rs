//! TLS ClientHello inspection.
//!
//! Just enough of the TLS record and handshake layout to locate the SNI
//! extension inside a client's opening segment. Used to pick split points
//! that break the server name across TCP segments, and to recover the SNI
//! for failure reporting.

use std::ops::Range;

use rand::Rng;

const TLS_RECORD_HEADER_LEN: usize = 5;
const TLS_HANDSHAKE_HEADER_LEN: usize = 4;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_NAME_TYPE_HOST: u8 = 0x00;

// Split-point band when the segment is not a recognizable ClientHello.
const MIN_SPLIT: usize = 32;
const MAX_SPLIT: usize = 64;

/// Whether `data` starts a TLS handshake record carrying a ClientHello.
pub fn is_client_hello(data: &[u8]) -> bool {
    if data.len() < TLS_RECORD_HEADER_LEN + TLS_HANDSHAKE_HEADER_LEN {
        return false;
    }
    data[0] == CONTENT_TYPE_HANDSHAKE
        && data[1] == 0x03
        && data[2] <= 0x04
        && data[TLS_RECORD_HEADER_LEN] == HANDSHAKE_TYPE_CLIENT_HELLO
}

/// Byte range of the SNI host name within `data`, when present.
pub(crate) fn sni_range(data: &[u8]) -> Option<Range<usize>> {
    if !is_client_hello(data) {
        return None;
    }

    // Record and handshake headers, then client version and random.
    let mut pos = TLS_RECORD_HEADER_LEN + TLS_HANDSHAKE_HEADER_LEN + 2 + 32;

    // Session ID.
    let session_len = *data.get(pos)? as usize;
    pos += 1 + session_len;

    // Cipher suites.
    let suites_len = read_u16(data, pos)? as usize;
    pos += 2 + suites_len;

    // Compression methods.
    let compression_len = *data.get(pos)? as usize;
    pos += 1 + compression_len;

    // Extensions.
    let extensions_len = read_u16(data, pos)? as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(data.len());

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(data, pos)?;
        let ext_len = read_u16(data, pos + 2)? as usize;
        pos += 4;
        if ext_type == EXTENSION_SERVER_NAME && pos + ext_len <= data.len() && ext_len >= 5 {
            // Server name list: 2-byte list length, then entries of
            // (type, 2-byte length, name).
            let name_type = *data.get(pos + 2)?;
            if name_type == SNI_NAME_TYPE_HOST {
                let name_len = read_u16(data, pos + 3)? as usize;
                let start = pos + 5;
                if start + name_len <= data.len() {
                    return Some(start..start + name_len);
                }
            }
            return None;
        }
        pos += ext_len;
    }
    None
}

/// The SNI host name carried by a ClientHello, if any.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    let range = sni_range(data)?;
    String::from_utf8(data[range].to_vec()).ok()
}

/// Choose where to split a first upstream segment.
///
/// When the segment is a ClientHello with an SNI, the point lands in the
/// middle of the host name so it never travels contiguously. Otherwise a
/// pseudo-random point in the 32..=64 band, capped at half the segment.
pub fn split_point(data: &[u8]) -> usize {
    if data.len() < 2 {
        return data.len();
    }
    if let Some(range) = sni_range(data) {
        let point = range.start + range.len() / 2;
        if point > 0 && point < data.len() {
            return point;
        }
    }
    let limit = (data.len() / 2).max(1);
    let point = MIN_SPLIT + rand::rng().random_range(0..=MAX_SPLIT - MIN_SPLIT);
    point.min(limit)
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]))
}
