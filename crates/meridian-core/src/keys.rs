// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The order-preserving byte encoding in which the cluster stores keys.
//!
//! Storage nodes keep keys in a memcomparable form: the encoded bytes compare
//! lexicographically in the same order as the raw keys. Region boundaries
//! reported by the placement service are expressed in this encoding, so any
//! lookup by raw key must encode first.

use std::fmt;

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xff;
const ENC_PAD: u8 = 0x00;

/// Encodes `key` into its memcomparable form.
///
/// The key is split into groups of 8 bytes. Every group is padded with `0x00`
/// up to the group size and followed by a marker byte `0xff - pad_count`. A
/// terminal, fully padded group is always present, which makes the encoding
/// self-delimiting while preserving order.
pub fn encode_bytes(key: &[u8]) -> Vec<u8> {
    let group_count = key.len() / ENC_GROUP_SIZE + 1;
    let mut encoded = Vec::with_capacity(group_count * (ENC_GROUP_SIZE + 1));
    for group in 0..group_count {
        let start = group * ENC_GROUP_SIZE;
        let end = (start + ENC_GROUP_SIZE).min(key.len());
        let pad = ENC_GROUP_SIZE - (end - start);
        encoded.extend_from_slice(&key[start..end]);
        encoded.extend(std::iter::repeat(ENC_PAD).take(pad));
        encoded.push(ENC_MARKER - pad as u8);
    }
    encoded
}

/// Error returned when decoding a memcomparable key fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed memcomparable key: {reason}")]
pub struct DecodeError {
    reason: &'static str,
}

impl DecodeError {
    fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

/// Decodes a key produced by [`encode_bytes`].
pub fn decode_bytes(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut key = Vec::with_capacity(data.len() / (ENC_GROUP_SIZE + 1) * ENC_GROUP_SIZE);
    let mut groups = data.chunks_exact(ENC_GROUP_SIZE + 1);
    loop {
        let Some(group) = groups.next() else {
            return Err(DecodeError::new("missing terminal group"));
        };
        let marker = group[ENC_GROUP_SIZE];
        let pad = (ENC_MARKER - marker) as usize;
        if pad > ENC_GROUP_SIZE {
            return Err(DecodeError::new("invalid marker byte"));
        }
        let used = ENC_GROUP_SIZE - pad;
        if group[used..ENC_GROUP_SIZE].iter().any(|&byte| byte != ENC_PAD) {
            return Err(DecodeError::new("non-zero padding byte"));
        }
        key.extend_from_slice(&group[..used]);
        if pad > 0 {
            if groups.next().is_some() || !groups.remainder().is_empty() {
                return Err(DecodeError::new("bytes after terminal group"));
            }
            return Ok(key);
        }
    }
}

/// Displays a key as lowercase hex for logging.
///
/// Raw keys may contain arbitrary user bytes; log statements must never print
/// them verbatim.
pub struct KeyDisplay<'a>(pub &'a [u8]);

impl fmt::Display for KeyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
