//! Internet checksum arithmetic (RFC 1071) and incremental updates (RFC 1624).
//!
//! The `replace_*` helpers are what the dataplane uses: constant work, no
//! loops. [`sum_words`] and the `*_checksum` functions walk whole headers and
//! are meant for verification and tooling, not the per-frame path.

use core::net::Ipv4Addr;

/// Folds a 32-bit accumulator into a 16-bit one's-complement sum.
#[inline(always)]
pub const fn fold(mut sum: u32) -> u16 {
    sum = (sum & 0xffff) + (sum >> 16);
    sum = (sum & 0xffff) + (sum >> 16);
    sum as u16
}

/// `HC' = ~(~HC + ~m + m')` for one 16-bit field.
#[inline(always)]
pub const fn replace_u16(check: u16, old: u16, new: u16) -> u16 {
    let sum = (!check as u32) + (!old as u32) + (new as u32);
    !fold(sum)
}

/// `HC' = ~(~HC + ~m + m')` for a 32-bit field taken as two 16-bit words.
#[inline(always)]
pub const fn replace_u32(check: u16, old: u32, new: u32) -> u16 {
    let sum = (!check as u32)
        + ((!old) >> 16)
        + ((!old) & 0xffff)
        + (new >> 16)
        + (new & 0xffff);
    !fold(sum)
}

/// One's-complement sum of `data` as big-endian 16-bit words, starting from
/// `initial`. An odd trailing byte is padded with zero.
pub fn sum_words(initial: u32, data: &[u8]) -> u32 {
    let mut sum = initial as u64;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u32
}

/// Checksum of an IPv4 header whose checksum field has been zeroed.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    !fold(sum_words(0, header))
}

/// TCP/UDP checksum over the IPv4 pseudo-header and `segment`, whose
/// checksum field has been zeroed.
pub fn l4_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = proto;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    !fold(sum_words(sum_words(0, &pseudo), segment))
}

/// True when `data`, checksum field included, sums to `0xffff`.
///
/// This accepts both encodings of a zero checksum.
pub fn verify(initial: u32, data: &[u8]) -> bool {
    fold(sum_words(initial, data)) == 0xffff
}
