// packages/engine/src/packet/checksum.rs
//! Internet checksum arithmetic (RFC 1071 / RFC 1624)
//!
//! Rewriting a header field never recomputes a checksum from scratch; the old
//! and new field values are folded into the existing checksum instead. The
//! same arithmetic serves plain checksums (IPv4 header) and
//! pseudo-header-inclusive ones (TCP/UDP), because an address rewrite changes
//! the pseudo header by exactly the same words it changes in the IP header.

use std::net::Ipv4Addr;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Add `data` to a running one's-complement accumulator
///
/// Words are big-endian; an odd trailing byte is padded with zero.
pub fn ones_complement_add(mut acc: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc = add_word(acc, u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        acc = add_word(acc, u16::from_be_bytes([*last, 0]));
    }
    acc
}

#[inline]
fn add_word(acc: u32, word: u16) -> u32 {
    let sum = acc + u32::from(word);
    (sum & 0xffff) + (sum >> 16)
}

/// Fold carries into 16 bits (no complement)
pub fn fold(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc as u16
}

/// Checksum of a contiguous block (e.g. an IPv4 header with its check field zeroed)
pub fn checksum(data: &[u8]) -> u16 {
    !fold(ones_complement_add(0, data))
}

/// Accumulator seeded with the IPv4 pseudo header
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let mut acc = ones_complement_add(0, &src.octets());
    acc = ones_complement_add(acc, &dst.octets());
    acc = add_word(acc, u16::from(protocol));
    add_word(acc, length)
}

/// Full TCP/UDP checksum over pseudo header + segment
///
/// The segment's own checksum field must be zero. For UDP a computed zero is
/// transmitted as 0xFFFF, since zero means "no checksum".
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let acc = pseudo_header_sum(src, dst, protocol, segment.len() as u16);
    let csum = !fold(ones_complement_add(acc, segment));
    if protocol == IPPROTO_UDP && csum == 0 {
        0xffff
    } else {
        csum
    }
}

/// True when `data` (checksum field included) sums to all-ones
pub fn verify(data: &[u8]) -> bool {
    fold(ones_complement_add(0, data)) == 0xffff
}

/// True when pseudo header + `segment` (checksum included) sums to all-ones
pub fn verify_transport(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> bool {
    let acc = pseudo_header_sum(src, dst, protocol, segment.len() as u16);
    fold(ones_complement_add(acc, segment)) == 0xffff
}

/// Incrementally update `check` for a 16-bit field changing `old → new`
///
/// RFC 1624 eqn. 3: `HC' = ~(~HC + ~m + m')`.
pub fn replace_u16(check: u16, old: u16, new: u16) -> u16 {
    let acc = u32::from(!check) + u32::from(!old) + u32::from(new);
    !fold(acc)
}

/// Incrementally update `check` for a 32-bit field changing `old → new`
pub fn replace_u32(check: u16, old: u32, new: u32) -> u16 {
    let acc = u32::from(!check)
        + u32::from(!((old >> 16) as u16))
        + u32::from(!(old as u16))
        + u32::from((new >> 16) as u16)
        + u32::from(new as u16);
    !fold(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // IPv4 header from RFC 1071 discussions: 45 00 00 73 00 00 40 00 40 11 ....
    const HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];

    fn with_checksum(mut header: [u8; 20]) -> [u8; 20] {
        let csum = checksum(&header);
        header[10..12].copy_from_slice(&csum.to_be_bytes());
        header
    }

    #[test]
    fn test_known_header_checksum() {
        assert_eq!(checksum(&HEADER), 0xb861);
        assert!(verify(&with_checksum(HEADER)));
    }

    #[test]
    fn test_odd_length_padding() {
        assert_eq!(
            ones_complement_add(0, &[0x12, 0x34, 0x56]),
            ones_complement_add(0, &[0x12, 0x34, 0x56, 0x00])
        );
    }

    #[test]
    fn test_replace_u32_matches_recompute() {
        let mut header = with_checksum(HEADER);
        let old = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
        let new = u32::from(Ipv4Addr::new(10, 0, 0, 1));

        let check = u16::from_be_bytes([header[10], header[11]]);
        let patched = replace_u32(check, old, new);

        header[16..20].copy_from_slice(&new.to_be_bytes());
        header[10..12].copy_from_slice(&patched.to_be_bytes());
        assert!(verify(&header));

        let mut zeroed = header;
        zeroed[10] = 0;
        zeroed[11] = 0;
        assert_eq!(patched, checksum(&zeroed));
    }

    #[test]
    fn test_redundant_patch_keeps_checksum() {
        let header = with_checksum(HEADER);
        let check = u16::from_be_bytes([header[10], header[11]]);
        assert_eq!(replace_u16(check, 0x4011, 0x4011), check);
        assert_eq!(replace_u32(check, 0xc0a8_0001, 0xc0a8_0001), check);
    }

    #[test]
    fn test_udp_zero_becomes_all_ones() {
        // Segment crafted so the sum folds to 0xffff and the checksum to zero
        let src = Ipv4Addr::new(0, 0, 0, 0);
        let dst = Ipv4Addr::new(0, 0, 0, 0);
        let acc = pseudo_header_sum(src, dst, IPPROTO_UDP, 8);
        let filler = 0xffff - fold(acc);
        let mut segment = [0u8; 8];
        segment[0..2].copy_from_slice(&filler.to_be_bytes());
        assert_eq!(transport_checksum(src, dst, IPPROTO_UDP, &segment), 0xffff);
        assert_eq!(transport_checksum(src, dst, IPPROTO_TCP, &segment), 0x0000);
    }

    proptest! {
        #[test]
        fn prop_port_patch_matches_recompute(
            src in any::<u32>(),
            dst in any::<u32>(),
            mut segment in proptest::collection::vec(any::<u8>(), 20..64),
            new_port in any::<u16>(),
        ) {
            let (src, dst) = (Ipv4Addr::from(src), Ipv4Addr::from(dst));
            segment[16] = 0;
            segment[17] = 0;
            let csum = transport_checksum(src, dst, IPPROTO_TCP, &segment);
            segment[16..18].copy_from_slice(&csum.to_be_bytes());

            let old_port = u16::from_be_bytes([segment[2], segment[3]]);
            let patched = replace_u16(csum, old_port, new_port);
            segment[2..4].copy_from_slice(&new_port.to_be_bytes());
            segment[16..18].copy_from_slice(&patched.to_be_bytes());

            prop_assert!(verify_transport(src, dst, IPPROTO_TCP, &segment));
        }

        #[test]
        fn prop_pseudo_header_address_patch(
            src in any::<u32>(),
            dst in any::<u32>(),
            new_dst in any::<u32>(),
            mut segment in proptest::collection::vec(any::<u8>(), 8..48),
        ) {
            let (src, dst, new_dst) =
                (Ipv4Addr::from(src), Ipv4Addr::from(dst), Ipv4Addr::from(new_dst));
            segment[6] = 0;
            segment[7] = 0;
            let csum = transport_checksum(src, dst, IPPROTO_TCP, &segment);
            segment[6..8].copy_from_slice(&csum.to_be_bytes());

            let patched = replace_u32(csum, u32::from(dst), u32::from(new_dst));
            segment[6..8].copy_from_slice(&patched.to_be_bytes());

            prop_assert!(verify_transport(src, new_dst, IPPROTO_TCP, &segment));
        }

        #[test]
        fn prop_redundant_patch_keeps_validity(word in any::<u16>(), extra in any::<u32>()) {
            let mut header = with_checksum(HEADER);
            let check = u16::from_be_bytes([header[10], header[11]]);
            let once = replace_u16(check, word, word);
            let twice = replace_u32(once, extra, extra);
            header[10..12].copy_from_slice(&twice.to_be_bytes());
            prop_assert!(verify(&header));
        }
    }
}
