//! Big-endian integer and address primitives shared by the binary codecs.
//!
//! Every multi-byte integer in NAT-PMP, PCP and the IGD pinhole profile is
//! big-endian, and every address crossing those wires travels in 16-byte IPv6
//! form. These helpers are pure and never panic: a read that would cross the
//! end of the buffer fails with [`MalformedPacket`].

use std::net::{IpAddr, Ipv6Addr};

/// A read crossed the end of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("packet too short")]
pub struct MalformedPacket;

/// The 16-byte form of "any IPv4 address" (`::ffff:0:0`).
pub const IPV4_WILDCARD: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0);

/// The 16-byte form of "any IPv6 address" (`::`).
pub const IPV6_WILDCARD: Ipv6Addr = Ipv6Addr::UNSPECIFIED;

/// Read a big-endian `u16` at `offset`.
pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16, MalformedPacket> {
    Ok(u16::from_be_bytes(read_array(buf, offset)?))
}

/// Read a big-endian `u32` at `offset`.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, MalformedPacket> {
    Ok(u32::from_be_bytes(read_array(buf, offset)?))
}

/// Read a big-endian `u64` at `offset`.
pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64, MalformedPacket> {
    Ok(u64::from_be_bytes(read_array(buf, offset)?))
}

/// Copy `N` bytes out of `buf` starting at `offset`.
pub fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], MalformedPacket> {
    let end = offset.checked_add(N).ok_or(MalformedPacket)?;
    buf.get(offset..end)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(MalformedPacket)
}

/// The 16-byte wire form of an address: IPv4 becomes `::ffff:a.b.c.d`.
pub fn to_wire(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Fold a wire address back: the `::ffff:0:0/96` prefix decodes to IPv4.
pub fn from_wire(addr: Ipv6Addr) -> IpAddr {
    match addr.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(addr),
    }
}

/// Read a 16-byte wire address at `offset`.
pub fn read_addr(buf: &[u8], offset: usize) -> Result<Ipv6Addr, MalformedPacket> {
    read_array::<16>(buf, offset).map(Ipv6Addr::from)
}

/// RFC 5952 text form of an IPv6 address: lowercase hextets without leading
/// zeros, the longest zero run (of at least two hextets) compressed to `::`.
///
/// This is the form the IGD pinhole fields require. It differs from the
/// `Display` impl of [`Ipv6Addr`], which prints mapped addresses with a
/// dotted-quad tail (`::ffff:1.2.3.4` instead of `::ffff:102:304`).
pub fn rfc5952(addr: Ipv6Addr) -> String {
    let segments = addr.segments();

    let mut best = (0, 0); // (start, len) of the longest zero run
    let mut current = (0, 0);
    for (i, segment) in segments.iter().enumerate() {
        if *segment == 0 {
            if current.1 == 0 {
                current.0 = i;
            }
            current.1 += 1;
            if current.1 > best.1 {
                best = current;
            }
        } else {
            current.1 = 0;
        }
    }

    let hextets = |segs: &[u16]| {
        segs.iter()
            .map(|s| format!("{s:x}"))
            .collect::<Vec<_>>()
            .join(":")
    };

    if best.1 < 2 {
        return hextets(&segments);
    }
    let head = hextets(&segments[..best.0]);
    let tail = hextets(&segments[best.0 + best.1..]);
    format!("{head}::{tail}")
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_read_integers() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        assert_eq!(read_u16(&buf, 0), Ok(0x0102));
        assert_eq!(read_u16(&buf, 7), Ok(0x0809));
        assert_eq!(read_u32(&buf, 1), Ok(0x0203_0405));
        assert_eq!(read_u64(&buf, 1), Ok(0x0203_0405_0607_0809));
    }

    #[test]
    fn test_reads_past_the_end_fail() {
        let buf = [0u8; 4];
        assert_eq!(read_u16(&buf, 3), Err(MalformedPacket));
        assert_eq!(read_u32(&buf, 1), Err(MalformedPacket));
        assert_eq!(read_u64(&buf, 0), Err(MalformedPacket));
        assert_eq!(read_array::<2>(&buf, usize::MAX), Err(MalformedPacket));
    }

    #[test]
    fn test_wire_form_round_trip() {
        let v4: IpAddr = "10.0.0.2".parse().unwrap();
        let wire = to_wire(v4);
        assert_eq!(wire.octets()[..12], [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(from_wire(wire), v4);

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(from_wire(to_wire(v6)), v6);
    }

    #[test]
    fn test_rfc5952_text_form() {
        let cases = [
            ("::ffff:1.2.3.4", "::ffff:102:304"),
            ("0102:0304:0506:0708:090a:0b0c:0d0e:0f10", "102:304:506:708:90a:b0c:d0e:f10"),
            ("fffe:fdfc:fbfa:f9f8:f7f6:f5f4:f3f2:f1f0", "fffe:fdfc:fbfa:f9f8:f7f6:f5f4:f3f2:f1f0"),
            ("::", "::"),
            ("::1", "::1"),
            ("2001:db8:0:0:1:0:0:1", "2001:db8::1:0:0:1"),
            ("fe80::", "fe80::"),
        ];
        for (input, expected) in cases {
            let addr: Ipv6Addr = input.parse().unwrap();
            assert_eq!(rfc5952(addr), expected, "formatting {input}");
        }
    }

    #[test]
    fn test_wildcards() {
        assert_eq!(rfc5952(IPV4_WILDCARD), "::ffff:0:0");
        assert_eq!(rfc5952(IPV6_WILDCARD), "::");
        assert_eq!(to_wire(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), IPV4_WILDCARD);
    }
}
