//! Encoding and decoding of the option list shared by the PCP opcodes.
//!
//! On the wire an option is `code (u8) | reserved (u8) | length (u16) |
//! value`, zero-padded to a 4 byte boundary. The padding is not part of the
//! declared length. Servers are allowed to care about option order, so the
//! list round-trips in construction order.

use std::net::Ipv6Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::wire::{self, MalformedPacket};

/// Option codes this client understands.
///
/// RFC 6887 defines the first three. The remaining codes sit in the
/// optional-to-process range; anything else round-trips as
/// [`PcpOption::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OptionCode {
    /// The MAP or PEER request is on behalf of a host other than the sender.
    ThirdParty = 1,
    /// The server must not create an alternative mapping if the suggested
    /// external port and address cannot be provided.
    PreferFailure = 2,
    /// Filter incoming packets to the mapping by remote peer.
    Filter = 3,
    /// Free-form description attached to the mapping.
    Description = 128,
    /// Next hop to use for the mapping.
    NextHop = 129,
    /// Bulk port reservation.
    PortReservation = 130,
}

/// A single PCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcpOption {
    /// Map on behalf of the carried internal address.
    ThirdParty(Ipv6Addr),
    /// Fail instead of assigning an alternative external port or address.
    PreferFailure,
    /// Restrict inbound traffic to the given remote peer prefix and port.
    Filter {
        /// Prefix length of the remote peer address.
        prefix_len: u8,
        /// Remote peer port, 0 meaning all ports.
        remote_port: u16,
        /// Remote peer address in wire form.
        remote_addr: Ipv6Addr,
    },
    /// Description text attached to the mapping.
    Description(String),
    /// Next hop address for the mapping.
    NextHop(Ipv6Addr),
    /// Ports reserved in bulk.
    PortReservation(Vec<u16>),
    /// An option code this client does not understand, carried verbatim.
    Unknown {
        /// Raw option code.
        code: u8,
        /// Raw option value, without padding.
        value: Vec<u8>,
    },
}

/// Size of the `code | reserved | length` prelude.
const OPTION_HEADER_SIZE: usize = 4;

/// Wire size of a [`PcpOption::Filter`] value.
const FILTER_VALUE_SIZE: usize = 20;

impl PcpOption {
    fn code(&self) -> u8 {
        match self {
            PcpOption::ThirdParty(_) => OptionCode::ThirdParty.into(),
            PcpOption::PreferFailure => OptionCode::PreferFailure.into(),
            PcpOption::Filter { .. } => OptionCode::Filter.into(),
            PcpOption::Description(_) => OptionCode::Description.into(),
            PcpOption::NextHop(_) => OptionCode::NextHop.into(),
            PcpOption::PortReservation(_) => OptionCode::PortReservation.into(),
            PcpOption::Unknown { code, .. } => *code,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            PcpOption::ThirdParty(_) | PcpOption::NextHop(_) => 16,
            PcpOption::PreferFailure => 0,
            PcpOption::Filter { .. } => FILTER_VALUE_SIZE,
            PcpOption::Description(text) => text.len(),
            PcpOption::PortReservation(ports) => ports.len() * 2,
            PcpOption::Unknown { value, .. } => value.len(),
        }
    }

    /// Exact size this option occupies on the wire, padding included.
    pub fn encoded_size(&self) -> usize {
        OPTION_HEADER_SIZE + pad4(self.value_len())
    }

    /// Append this option to the buffer, padding the value to 4 bytes.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let value_len = self.value_len();
        buf.push(self.code());
        buf.push(0); // reserved
        buf.extend_from_slice(&(value_len as u16).to_be_bytes());
        match self {
            PcpOption::ThirdParty(addr) | PcpOption::NextHop(addr) => {
                buf.extend_from_slice(&addr.octets());
            }
            PcpOption::PreferFailure => {}
            PcpOption::Filter { prefix_len, remote_port, remote_addr } => {
                buf.push(0); // reserved
                buf.push(*prefix_len);
                buf.extend_from_slice(&remote_port.to_be_bytes());
                buf.extend_from_slice(&remote_addr.octets());
            }
            PcpOption::Description(text) => buf.extend_from_slice(text.as_bytes()),
            PcpOption::PortReservation(ports) => {
                for port in ports {
                    buf.extend_from_slice(&port.to_be_bytes());
                }
            }
            PcpOption::Unknown { value, .. } => buf.extend_from_slice(value),
        }
        for _ in value_len..pad4(value_len) {
            buf.push(0);
        }
    }

    /// Decode the option starting at `offset`. Returns the option and the
    /// offset of the next one, past the padding.
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), MalformedPacket> {
        let header: [u8; OPTION_HEADER_SIZE] = wire::read_array(buf, offset)?;
        let code = header[0];
        // header[1] reserved
        let value_len = u16::from_be_bytes([header[2], header[3]]) as usize;

        let value_start = offset + OPTION_HEADER_SIZE;
        let value: &[u8] = buf
            .get(value_start..value_start + value_len)
            .ok_or(MalformedPacket)?;
        let next = value_start + pad4(value_len);
        if next > buf.len() {
            return Err(MalformedPacket);
        }

        let option = match OptionCode::try_from(code) {
            Ok(OptionCode::ThirdParty) => {
                PcpOption::ThirdParty(Ipv6Addr::from(exact::<16>(value)?))
            }
            Ok(OptionCode::PreferFailure) => {
                if value_len != 0 {
                    return Err(MalformedPacket);
                }
                PcpOption::PreferFailure
            }
            Ok(OptionCode::Filter) => {
                let value = exact::<FILTER_VALUE_SIZE>(value)?;
                PcpOption::Filter {
                    // value[0] reserved
                    prefix_len: value[1],
                    remote_port: u16::from_be_bytes([value[2], value[3]]),
                    remote_addr: Ipv6Addr::from(wire::read_array::<16>(&value, 4)?),
                }
            }
            Ok(OptionCode::Description) => PcpOption::Description(
                String::from_utf8(value.to_vec()).map_err(|_| MalformedPacket)?,
            ),
            Ok(OptionCode::NextHop) => PcpOption::NextHop(Ipv6Addr::from(exact::<16>(value)?)),
            Ok(OptionCode::PortReservation) => {
                if value_len % 2 != 0 {
                    return Err(MalformedPacket);
                }
                PcpOption::PortReservation(
                    value
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect(),
                )
            }
            Err(_) => PcpOption::Unknown { code, value: value.to_vec() },
        };
        Ok((option, next))
    }

    /// Decode every option in `buf`, preserving wire order.
    pub fn decode_all(buf: &[u8]) -> Result<Vec<Self>, MalformedPacket> {
        let mut options = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (option, next) = Self::decode(buf, offset)?;
            options.push(option);
            offset = next;
        }
        Ok(options)
    }

    /// Encode a whole option list in order.
    pub fn encode_all(options: &[Self], buf: &mut Vec<u8>) {
        for option in options {
            option.encode_into(buf);
        }
    }
}

/// Round `len` up to the next multiple of 4.
fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

fn exact<const N: usize>(value: &[u8]) -> Result<[u8; N], MalformedPacket> {
    if value.len() != N {
        return Err(MalformedPacket);
    }
    wire::read_array(value, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(options: Vec<PcpOption>) {
        let mut buf = Vec::new();
        PcpOption::encode_all(&options, &mut buf);
        assert_eq!(buf.len() % 4, 0, "options must stay 4-byte aligned");
        assert_eq!(PcpOption::decode_all(&buf), Ok(options));
    }

    #[test]
    fn test_known_options_round_trip() {
        round_trip(vec![PcpOption::ThirdParty("2001:db8::7".parse().unwrap())]);
        round_trip(vec![PcpOption::PreferFailure]);
        round_trip(vec![PcpOption::Filter {
            prefix_len: 128,
            remote_port: 443,
            remote_addr: "::ffff:8.8.8.8".parse().unwrap(),
        }]);
        round_trip(vec![PcpOption::Description("storage node".into())]);
        round_trip(vec![PcpOption::NextHop("fe80::1".parse().unwrap())]);
        round_trip(vec![PcpOption::PortReservation(vec![6000, 6001, 6002])]);
    }

    #[test]
    fn test_unknown_options_are_preserved() {
        round_trip(vec![PcpOption::Unknown { code: 200, value: vec![1, 2, 3] }]);
    }

    #[test]
    fn test_wire_order_is_construction_order() {
        round_trip(vec![
            PcpOption::PreferFailure,
            PcpOption::Description("a".into()),
            PcpOption::Unknown { code: 210, value: vec![] },
            PcpOption::ThirdParty("::1".parse().unwrap()),
        ]);
    }

    #[test]
    fn test_padding_is_zero_and_skipped() {
        let mut buf = Vec::new();
        PcpOption::Description("ab".into()).encode_into(&mut buf);
        assert_eq!(buf, vec![128, 0, 0, 2, b'a', b'b', 0, 0]);

        let decoded = PcpOption::decode_all(&buf).unwrap();
        assert_eq!(decoded, vec![PcpOption::Description("ab".into())]);
    }

    #[test]
    fn test_truncated_option_fails() {
        // header promises 16 bytes of value, none follow
        let buf = [1u8, 0, 0, 16];
        assert_eq!(PcpOption::decode_all(&buf), Err(MalformedPacket));
        // header itself cut short
        assert_eq!(PcpOption::decode_all(&[1u8, 0]), Err(MalformedPacket));
    }

    #[test]
    fn test_known_option_with_wrong_length_fails() {
        let buf = [2u8, 0, 0, 4, 0, 0, 0, 0]; // PREFER_FAILURE carries no value
        assert_eq!(PcpOption::decode_all(&buf), Err(MalformedPacket));
    }
}
