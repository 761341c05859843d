//! Encoding and decoding of the data associated with an [`Opcode`].

use std::net::Ipv6Addr;

use crate::{wire, PortType};

use super::Opcode;

/// Data associated to an [`Opcode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpcodeData {
    /// Data for an [`Opcode::Announce`] request or response: none.
    Announce,
    /// Data for an [`Opcode::Map`] request or response.
    Map(MapData),
    /// Data for an [`Opcode::Peer`] request or response.
    Peer(PeerData),
}

/// [`OpcodeData`] associated to an [`Opcode::Map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapData {
    /// Nonce of the request, copied into the response to correlate the two.
    pub nonce: [u8; 12],
    /// Transport protocol of the mapping.
    pub protocol: PortType,
    /// Internal port of the mapping.
    pub local_port: u16,
    /// External port: suggested in requests (0 lets the server choose),
    /// assigned in responses.
    pub external_port: u16,
    /// External address in wire form: suggested in requests (the wildcard
    /// lets the server choose), assigned in responses.
    pub external_address: Ipv6Addr,
}

/// [`OpcodeData`] associated to an [`Opcode::Peer`].
///
/// A PEER mapping is a MAP mapping constrained to a single remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerData {
    /// The MAP fields common to both opcodes.
    pub map: MapData,
    /// Remote peer port. Never zero.
    pub remote_port: u16,
    /// Remote peer address in wire form.
    pub remote_address: Ipv6Addr,
}

/// Error returned when decoding [`OpcodeData`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidOpcodeData {
    /// Data block is too short or structurally wrong.
    Malformed,
    /// A field that must be non-zero was zero.
    RequiredNonZero,
}

impl MapData {
    /// Size of the opcode-specific data of an [`Opcode::Map`] packet.
    pub const ENCODED_SIZE: usize = // parts
        12 + // nonce
        1 + // protocol
        3 + // reserved
        2 + // local port
        2 + // external port
        16; // external address

    /// Encode this [`MapData`].
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let MapData {
            nonce,
            protocol,
            local_port,
            external_port,
            external_address,
        } = self;
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[0..12].copy_from_slice(nonce);
        buf[12] = (*protocol).into();
        // buf[13..16] reserved
        buf[16..18].copy_from_slice(&local_port.to_be_bytes());
        buf[18..20].copy_from_slice(&external_port.to_be_bytes());
        buf[20..].copy_from_slice(&external_address.octets());

        buf
    }

    /// Decode a [`MapData`] from the start of `buf`. Trailing bytes (the
    /// option list) are left to the caller.
    pub fn decode(buf: &[u8]) -> Result<Self, InvalidOpcodeData> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(InvalidOpcodeData::Malformed);
        }

        let nonce = wire::read_array::<12>(buf, 0).expect("length was verified");

        let protocol = buf[12]
            .try_into()
            .map_err(|_| InvalidOpcodeData::Malformed)?;

        // buf[13..16] reserved

        let local_port = wire::read_u16(buf, 16).expect("length was verified");
        let external_port = wire::read_u16(buf, 18).expect("length was verified");
        let external_address = wire::read_addr(buf, 20).expect("length was verified");

        Ok(MapData {
            nonce,
            protocol,
            local_port,
            external_port,
            external_address,
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(rng: &mut R) -> MapData {
        let octets: [u8; 16] = rng.gen();
        MapData {
            nonce: rng.gen(),
            protocol: if rng.gen() { PortType::Udp } else { PortType::Tcp },
            local_port: rng.gen(),
            external_port: rng.gen(),
            external_address: octets.into(),
        }
    }
}

impl PeerData {
    /// Size of the opcode-specific data of an [`Opcode::Peer`] packet.
    pub const ENCODED_SIZE: usize = // parts
        MapData::ENCODED_SIZE + // the MAP block
        2 + // remote peer port
        2 + // reserved
        16; // remote peer address

    /// Encode this [`PeerData`].
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let PeerData {
            map,
            remote_port,
            remote_address,
        } = self;
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[..MapData::ENCODED_SIZE].copy_from_slice(&map.encode());
        buf[36..38].copy_from_slice(&remote_port.to_be_bytes());
        // buf[38..40] reserved
        buf[40..].copy_from_slice(&remote_address.octets());

        buf
    }

    /// Decode a [`PeerData`] from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, InvalidOpcodeData> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(InvalidOpcodeData::Malformed);
        }

        let map = MapData::decode(buf)?;
        if map.local_port == 0 || map.external_port == 0 {
            return Err(InvalidOpcodeData::RequiredNonZero);
        }

        let remote_port = wire::read_u16(buf, 36).expect("length was verified");
        if remote_port == 0 {
            return Err(InvalidOpcodeData::RequiredNonZero);
        }
        // buf[38..40] reserved
        let remote_address = wire::read_addr(buf, 40).expect("length was verified");

        Ok(PeerData {
            map,
            remote_port,
            remote_address,
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(rng: &mut R) -> PeerData {
        let octets: [u8; 16] = rng.gen();
        let mut map = MapData::random(rng);
        map.local_port = rng.gen_range(1..=u16::MAX);
        map.external_port = rng.gen_range(1..=u16::MAX);
        PeerData {
            map,
            remote_port: rng.gen_range(1..=u16::MAX),
            remote_address: octets.into(),
        }
    }
}

impl OpcodeData {
    /// Get the associated [`Opcode`].
    pub fn opcode(&self) -> Opcode {
        match self {
            OpcodeData::Announce => Opcode::Announce,
            OpcodeData::Map(_) => Opcode::Map,
            OpcodeData::Peer(_) => Opcode::Peer,
        }
    }

    /// Encode this [`OpcodeData`] into the buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            OpcodeData::Announce => {}
            OpcodeData::Map(map_data) => buf.extend_from_slice(&map_data.encode()),
            OpcodeData::Peer(peer_data) => buf.extend_from_slice(&peer_data.encode()),
        }
    }

    /// Exact size an encoded [`OpcodeData`] will have.
    pub const fn encoded_size(&self) -> usize {
        match self {
            OpcodeData::Announce => 0,
            OpcodeData::Map(_) => MapData::ENCODED_SIZE,
            OpcodeData::Peer(_) => PeerData::ENCODED_SIZE,
        }
    }

    /// Decode the [`OpcodeData`] expected for a given [`Opcode`].
    pub fn decode(opcode: Opcode, buf: &[u8]) -> Result<Self, InvalidOpcodeData> {
        match opcode {
            Opcode::Announce => Ok(OpcodeData::Announce),
            Opcode::Map => MapData::decode(buf).map(OpcodeData::Map),
            Opcode::Peer => PeerData::decode(buf).map(OpcodeData::Peer),
        }
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> OpcodeData {
        match opcode {
            Opcode::Announce => OpcodeData::Announce,
            Opcode::Map => OpcodeData::Map(MapData::random(rng)),
            Opcode::Peer => OpcodeData::Peer(PeerData::random(rng)),
        }
    }
}
