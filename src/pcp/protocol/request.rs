//! A PCP request.

use std::net::{IpAddr, Ipv6Addr};
use std::num::NonZeroU16;

use crate::wire;

use super::{
    opcode_data::{MapData, OpcodeData, PeerData},
    options::PcpOption,
    Version,
};

/// A PCP Request.
///
/// See [RFC 6887 Request Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// [`Version`] to use in this request.
    pub(super) version: Version,
    /// Requested lifetime in seconds.
    pub(super) lifetime_seconds: u32,
    /// IP Address of the client.
    ///
    /// An IPv4 address is represented as an IPv4-mapped IPv6 address.
    pub(super) client_addr: Ipv6Addr,
    /// Data associated to the [`super::Opcode`] in this request.
    pub(super) opcode_data: OpcodeData,
    /// Options, encoded after the opcode data in construction order.
    pub(super) options: Vec<PcpOption>,
}

impl Request {
    /// Size of the common request header, in bytes.
    pub const HEADER_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // reserved
        4 + // lifetime
        16; // client ip

    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        let Request {
            version,
            lifetime_seconds,
            client_addr,
            opcode_data,
            options,
        } = self;
        let options_size: usize = options.iter().map(PcpOption::encoded_size).sum();
        let mut buf =
            Vec::with_capacity(Self::HEADER_SIZE + opcode_data.encoded_size() + options_size);
        // buf[0]
        buf.push((*version).into());
        // buf[1]
        buf.push(opcode_data.opcode().into());
        // buf[2] reserved
        buf.push(0);
        // buf[3] reserved
        buf.push(0);
        // buf[4..8]
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        // buf[8..24]
        buf.extend_from_slice(&client_addr.octets());
        // buf[24..]
        opcode_data.encode_into(&mut buf);
        PcpOption::encode_all(options, &mut buf);

        buf
    }

    /// Create an announce request.
    pub fn announce(client_addr: IpAddr) -> Request {
        Request {
            version: Version::Pcp,
            // the announce opcode requires a lifetime of 0 and to ignore the
            // lifetime on response
            lifetime_seconds: 0,
            client_addr: wire::to_wire(client_addr),
            // the announce opcode carries no opcode-specific payload
            opcode_data: OpcodeData::Announce,
            options: Vec::new(),
        }
    }

    /// Create a MAP request.
    ///
    /// Passing `None` for the preferred external port or address lets the
    /// server choose.
    #[allow(clippy::too_many_arguments)]
    pub fn mapping(
        nonce: [u8; 12],
        protocol: crate::PortType,
        local_port: NonZeroU16,
        client_addr: IpAddr,
        preferred_external_port: Option<NonZeroU16>,
        preferred_external_address: Option<IpAddr>,
        lifetime_seconds: u32,
        options: Vec<PcpOption>,
    ) -> Request {
        Request {
            version: Version::Pcp,
            lifetime_seconds,
            client_addr: wire::to_wire(client_addr),
            opcode_data: OpcodeData::Map(MapData {
                nonce,
                protocol,
                local_port: local_port.into(),
                // a client with no external port preference must use 0
                external_port: preferred_external_port.map(Into::into).unwrap_or_default(),
                external_address: preferred_external_address
                    .map(wire::to_wire)
                    .unwrap_or_else(|| wildcard_for(client_addr)),
            }),
            options,
        }
    }

    /// Create a PEER request: a mapping restricted to a single remote peer.
    #[allow(clippy::too_many_arguments)]
    pub fn peer(
        nonce: [u8; 12],
        protocol: crate::PortType,
        local_port: NonZeroU16,
        client_addr: IpAddr,
        preferred_external_port: Option<NonZeroU16>,
        preferred_external_address: Option<IpAddr>,
        remote_port: NonZeroU16,
        remote_address: IpAddr,
        lifetime_seconds: u32,
        options: Vec<PcpOption>,
    ) -> Request {
        Request {
            version: Version::Pcp,
            lifetime_seconds,
            client_addr: wire::to_wire(client_addr),
            opcode_data: OpcodeData::Peer(PeerData {
                map: MapData {
                    nonce,
                    protocol,
                    local_port: local_port.into(),
                    external_port: preferred_external_port.map(Into::into).unwrap_or_default(),
                    external_address: preferred_external_address
                        .map(wire::to_wire)
                        .unwrap_or_else(|| wildcard_for(client_addr)),
                },
                remote_port: remote_port.into(),
                remote_address: wire::to_wire(remote_address),
            }),
            options,
        }
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: super::Opcode, rng: &mut R) -> Self {
        let opcode_data = OpcodeData::random(opcode, rng);
        let addr_octets: [u8; 16] = rng.gen();
        Request {
            version: Version::Pcp,
            lifetime_seconds: rng.gen(),
            client_addr: Ipv6Addr::from(addr_octets),
            opcode_data,
            options: Vec::new(),
        }
    }

    #[cfg(test)]
    #[track_caller]
    fn decode(buf: &[u8]) -> Self {
        let version: Version = buf[0].try_into().unwrap();
        let opcode: super::Opcode = buf[1].try_into().unwrap();
        // buf[2] reserved
        // buf[3] reserved
        let lifetime_seconds = wire::read_u32(buf, 4).unwrap();
        let client_addr = wire::read_addr(buf, 8).unwrap();

        let opcode_data = OpcodeData::decode(opcode, &buf[24..]).unwrap();
        let options =
            PcpOption::decode_all(&buf[Self::HEADER_SIZE + opcode_data.encoded_size()..]).unwrap();
        Self {
            version,
            lifetime_seconds,
            client_addr,
            opcode_data,
            options,
        }
    }
}

/// The wire wildcard matching the family of `addr`.
fn wildcard_for(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(_) => wire::IPV4_WILDCARD,
        IpAddr::V6(_) => wire::IPV6_WILDCARD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    use crate::PortType;

    #[test]
    fn test_encode_decode_announce_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(super::super::Opcode::Announce, &mut gen);
        let encoded = request.encode();
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_encode_decode_map_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(super::super::Opcode::Map, &mut gen);
        let encoded = request.encode();
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_encode_decode_peer_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(super::super::Opcode::Peer, &mut gen);
        let encoded = request.encode();
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_options_survive_the_round_trip_in_order() {
        let request = Request::mapping(
            [7; 12],
            PortType::Udp,
            NonZeroU16::new(4004).unwrap(),
            "192.168.1.7".parse().unwrap(),
            None,
            None,
            7200,
            vec![
                PcpOption::PreferFailure,
                PcpOption::Description("node".into()),
            ],
        );
        let encoded = request.encode();
        // 4-byte aligned option block after header and MAP data
        assert_eq!(encoded.len(), 24 + 36 + 4 + 8);
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_mapping_defaults_to_family_wildcard() {
        let request = Request::mapping(
            [0; 12],
            PortType::Tcp,
            NonZeroU16::new(1).unwrap(),
            "10.0.0.2".parse().unwrap(),
            None,
            None,
            0,
            Vec::new(),
        );
        let OpcodeData::Map(map) = &request.opcode_data else {
            panic!("expected map data");
        };
        assert_eq!(map.external_address, wire::IPV4_WILDCARD);
        assert_eq!(map.external_port, 0);
    }
}
