// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Reversible numeric-ID <-> short-ID transform.
//!
//! The textual "bid" of a post is its decimal ID split into groups of seven
//! digits from the right, each group rendered in base 62 (`0-9a-zA-Z`).
//! Every group except the leftmost is zero-padded to four characters.

use crate::error::{ArchiveError, Result};

const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Encode a numeric post ID into its short textual form.
pub fn encode(id: u64) -> String {
    let digits = id.to_string();
    let bytes = digits.as_bytes();

    let mut groups = Vec::new();
    let mut end = bytes.len();
    while end > 0 {
        let start = end.saturating_sub(7);
        // Leading chunk may be shorter than seven digits.
        let chunk: u64 = digits[start..end].parse().expect("decimal substring");
        groups.push(chunk);
        end = start;
    }
    groups.reverse();

    let mut out = String::new();
    for (i, chunk) in groups.iter().enumerate() {
        let encoded = to_base62(*chunk);
        if i == 0 {
            out.push_str(&encoded);
        } else {
            for _ in encoded.len()..4 {
                out.push('0');
            }
            out.push_str(&encoded);
        }
    }
    out
}

/// Decode a short textual ID back into the numeric post ID.
pub fn decode(bid: &str) -> Result<u64> {
    if bid.is_empty() {
        return Err(ArchiveError::validation("empty short id"));
    }

    let bytes = bid.as_bytes();
    let mut groups = Vec::new();
    let mut end = bytes.len();
    while end > 0 {
        let start = end.saturating_sub(4);
        groups.push(from_base62(&bid[start..end])?);
        end = start;
    }
    groups.reverse();

    let mut digits = String::new();
    for (i, chunk) in groups.iter().enumerate() {
        if i == 0 {
            digits.push_str(&chunk.to_string());
        } else {
            // Inner groups always stand for exactly seven decimal digits.
            digits.push_str(&format!("{:07}", chunk));
        }
    }

    digits
        .parse()
        .map_err(|_| ArchiveError::validation(format!("short id {bid:?} overflows u64")))
}

fn to_base62(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(ALPHABET[(n % 62) as usize]);
        n /= 62;
    }
    buf.reverse();
    String::from_utf8(buf).expect("alphabet is ascii")
}

fn from_base62(s: &str) -> Result<u64> {
    let mut n: u64 = 0;
    for c in s.bytes() {
        let v = ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| ArchiveError::validation(format!("invalid base62 char {:?}", c as char)))?;
        n = n
            .checked_mul(62)
            .and_then(|n| n.checked_add(v as u64))
            .ok_or_else(|| ArchiveError::validation("base62 overflow"))?;
    }
    Ok(n)
}
