//! One's-complement checksums for the IPv4 header and TCP/UDP pseudo-headers.

use smoltcp::wire::IpProtocol;
use std::net::IpAddr;

/// Adds `bytes` to a running one's-complement sum as big-endian 16-bit words.
/// An odd trailing byte is padded with zero.
pub fn accumulate(mut sum: u32, bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum = sum.wrapping_add(u16::from_be_bytes([byte, 0]) as u32);
    }
    sum
}

/// Folds carries back into the low 16 bits and complements the result.
pub fn finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute the ones' complement checksum over a byte slice.
pub fn ones_complement(sum: u32, bytes: &[u8]) -> u16 {
    finish(accumulate(sum, bytes))
}

/// Compute IPv4 header checksum. The checksum field (bytes 10..12) is
/// treated as zero regardless of its current content.
pub fn ipv4_header(header: &[u8]) -> u16 {
    let mut sum = accumulate(0, &header[..10.min(header.len())]);
    if header.len() > 12 {
        sum = accumulate(sum, &header[12..]);
    }
    finish(sum)
}

/// Sum of the pseudo-header shared by TCP and UDP. Returns `None` when the
/// addresses belong to different families.
pub fn pseudo_header(src: IpAddr, dst: IpAddr, protocol: IpProtocol, length: usize) -> Option<u32> {
    let proto = u8::from(protocol) as u32;
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut sum = accumulate(0, &src.octets());
            sum = accumulate(sum, &dst.octets());
            sum = sum.wrapping_add(proto);
            Some(sum.wrapping_add((length as u32) & 0xFFFF))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut sum = accumulate(0, &src.octets());
            sum = accumulate(sum, &dst.octets());
            sum = accumulate(sum, &(length as u32).to_be_bytes());
            Some(sum.wrapping_add(proto))
        }
        _ => None,
    }
}

/// Checksum of a transport segment whose checksum field sits at
/// `checksum_offset`; that field is skipped during the sum.
pub fn transport(
    src: IpAddr,
    dst: IpAddr,
    protocol: IpProtocol,
    segment: &[u8],
    checksum_offset: usize,
) -> Option<u16> {
    let mut sum = pseudo_header(src, dst, protocol, segment.len())?;
    if segment.len() < checksum_offset + 2 {
        return Some(finish(accumulate(sum, segment)));
    }
    // checksum_offset is even for both TCP (16) and UDP (6), so word
    // alignment is preserved across the split
    sum = accumulate(sum, &segment[..checksum_offset]);
    sum = accumulate(sum, &segment[checksum_offset + 2..]);
    Some(finish(sum))
}
