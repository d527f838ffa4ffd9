//! Internet checksum utilities
//!
//! All word values are read from the packet in network byte order. A
//! checksum adjustment takes an accumulator of `old - new` word sums and
//! folds it into the stored checksum with end-around carry, so a field can
//! be rewritten without resumming the whole packet (RFC 1624).

use std::net::Ipv4Addr;

/// Sum of the two 16-bit words of an address
#[inline]
pub fn addr_words(addr: Ipv4Addr) -> i32 {
    word_sum32(u32::from(addr))
}

/// Sum of the two 16-bit words of a 32-bit field
#[inline]
pub fn word_sum32(value: u32) -> i32 {
    (value >> 16) as i32 + (value & 0xffff) as i32
}

/// Apply an `old - new` word accumulator to a checksum.
pub fn adjust_checksum(accumulate: i32, checksum: u16) -> u16 {
    let mut acc = accumulate + checksum as i32;
    if acc < 0 {
        acc = -acc;
        acc = (acc >> 16) + (acc & 0xffff);
        acc += acc >> 16;
        !(acc as u16)
    } else {
        acc = (acc >> 16) + (acc & 0xffff);
        acc += acc >> 16;
        acc as u16
    }
}

/// Checksum adjustment for fields where zero means "no checksum" (UDP).
///
/// A zero checksum stays zero, and an adjusted result never becomes zero.
pub fn adjust_optional_checksum(accumulate: i32, checksum: u16) -> u16 {
    if checksum == 0 {
        return 0;
    }
    match adjust_checksum(accumulate, checksum) {
        0 => 0xffff,
        sum => sum,
    }
}

/// Update `checksum` for `old_words` being replaced by `new_words`
pub fn differential_checksum(checksum: u16, new_words: &[u16], old_words: &[u16]) -> u16 {
    let accumulate = old_words
        .iter()
        .zip(new_words)
        .fold(0i32, |acc, (&old, &new)| acc + old as i32 - new as i32);
    adjust_checksum(accumulate, checksum)
}

/// Address form of `differential_checksum`
pub fn differential_checksum_addr(checksum: u16, new: Ipv4Addr, old: Ipv4Addr) -> u16 {
    adjust_checksum(addr_words(old) - addr_words(new), checksum)
}

/// Unfolded ones-complement sum of `data`, odd trailing byte padded with zero
fn sum_words(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u32 = 0;
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    sum as u16
}

/// Full Internet checksum over `data`
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data))
}

/// TCP/UDP checksum over an IPv4 pseudo header and `segment`.
///
/// The segment's own checksum field must be zeroed by the caller.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets()) + sum_words(&dst.octets());
    sum += protocol as u32;
    sum += segment.len() as u32;
    sum += sum_words(segment);
    !fold(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internet_checksum_known_header() {
        // RFC 1071 style sample IPv4 header with checksum 0xb861
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(internet_checksum(&header), 0xb861);
    }

    #[test]
    fn test_checksum_over_valid_data_is_zero() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(internet_checksum(&header), 0);
        header[11] = 0x62;
        assert_ne!(internet_checksum(&header), 0);
    }

    #[test]
    fn test_odd_length_padding() {
        assert_eq!(internet_checksum(&[0x01]), !0x0100);
    }

    #[test]
    fn test_differential_matches_full_recompute() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x05, 0x08, 0x08, 0x08, 0x08,
        ];
        let sum = internet_checksum(&header);
        header[10..12].copy_from_slice(&sum.to_be_bytes());

        let old = Ipv4Addr::new(10, 0, 0, 5);
        let new = Ipv4Addr::new(203, 0, 113, 9);
        let adjusted = differential_checksum_addr(sum, new, old);

        header[12..16].copy_from_slice(&new.octets());
        header[10..12].copy_from_slice(&[0, 0]);
        assert_eq!(adjusted, internet_checksum(&header));
    }

    #[test]
    fn test_differential_inverse_restores_checksum() {
        let original = 0x3a7c;
        let old = [0x0a00, 0x0005, 0x1388];
        let new = [0xcb00, 0x7109, 0x8123];

        let forward = differential_checksum(original, &new, &old);
        assert_ne!(forward, original);
        let back = differential_checksum(forward, &old, &new);
        assert_eq!(back, original);
    }

    #[test]
    fn test_adjust_handles_negative_accumulator() {
        // Subtracting a larger word than we add must wrap with end-around borrow
        let sum = adjust_checksum(0x0001 - 0xffff, 0x1234);
        let back = adjust_checksum(0xffff - 0x0001, sum);
        assert_eq!(back, 0x1234);
    }

    #[test]
    fn test_optional_checksum_zero_untouched() {
        assert_eq!(adjust_optional_checksum(0x1234, 0), 0);
        assert_ne!(adjust_optional_checksum(0x1234, 0x0001), 0);
    }

    #[test]
    fn test_transport_checksum_validates() {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let mut udp = vec![0x13, 0x88, 0x00, 0x35, 0x00, 0x0b, 0x00, 0x00, b'a', b'b', b'c'];
        let sum = transport_checksum(src, dst, 17, &udp);
        udp[6..8].copy_from_slice(&sum.to_be_bytes());
        // Summing again including the stored checksum yields zero
        assert_eq!(transport_checksum(src, dst, 17, &udp), 0);
    }
}
