//! EDNS(0) padding, RFC 7830.
//!
//! Queries are padded to a multiple of 128 bytes (the RFC 8467
//! recommendation) so that their length reveals as little as possible to an
//! on-path observer. A query that already carries a padding option is the
//! application's business and passes through untouched.

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::serialize::binary::BinDecodable;

use crate::error::Result;

/// Block size queries are padded to.
pub const PADDING_BLOCK_SIZE: usize = 128;

// Encoded size of an OPT pseudo-record with no options:
// root name (1) + type (2) + class (2) + ttl (4) + rdlength (2).
const OPT_RR_HEADER_LEN: usize = 11;

// Option code (2) + option length (2).
const OPT_PADDING_HEADER_LEN: usize = 4;

/// Number of padding bytes needed, excluding headers. Assumes `msg_len` is
/// the length of the message without any padding option and that labels are
/// fully compressed.
fn compute_padding_len(msg_len: usize, has_opt: bool) -> usize {
    let mut extra = OPT_PADDING_HEADER_LEN;
    if !has_opt {
        // No OPT record yet, so its header will be added too.
        extra += OPT_RR_HEADER_LEN;
    }
    let rem = (msg_len + extra) % PADDING_BLOCK_SIZE;
    if rem == 0 {
        0
    } else {
        PADDING_BLOCK_SIZE - rem
    }
}

/// Add an EDNS(0) padding option to a raw DNS message.
///
/// Returns the input unchanged when it already carries a padding option.
pub fn add_edns_padding(raw: &[u8]) -> Result<Vec<u8>> {
    let mut msg = Message::from_bytes(raw)?;

    let has_opt = match msg.extensions() {
        Some(edns) => {
            if edns.options().get(EdnsCode::Padding).is_some() {
                return Ok(raw.to_vec());
            }
            true
        }
        None => false,
    };

    // The wire length may compress labels differently than we would, so
    // measure a re-encoded copy rather than trusting `raw.len()`.
    let base_len = msg.to_vec()?.len();
    let pad_len = compute_padding_len(base_len, has_opt);

    let mut edns = msg.extensions().clone().unwrap_or_else(Edns::new);
    edns.options_mut().insert(EdnsOption::Unknown(
        u16::from(EdnsCode::Padding),
        vec![0u8; pad_len],
    ));
    msg.set_edns(edns);

    Ok(msg.to_vec()?)
}
