//! A NAT-PMP request.

use crate::PortType;

use super::{Opcode, Version};

/// A NAT-PMP Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Request to determine the gateway's external address.
    ExternalAddress,
    /// Request to register a mapping with the NAT-PMP gateway.
    Mapping {
        /// Protocol to use for this mapping.
        proto: PortType,
        /// Local port to map.
        local_port: u16,
        /// Preferred external port, 0 letting the gateway choose.
        external_port: u16,
        /// Requested lifetime in seconds for the mapping. A lifetime of 0
        /// with an external port of 0 destroys the mapping.
        lifetime_seconds: u32,
    },
}

impl Request {
    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![
                Version::NatPmp.into(),
                Opcode::DetermineExternalAddress.into(),
            ],
            Request::Mapping {
                proto,
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = vec![Version::NatPmp.into(), Opcode::map(*proto).into()];
                buf.push(0); // reserved
                buf.push(0); // reserved
                buf.extend_from_slice(&local_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        match opcode {
            Opcode::DetermineExternalAddress => Request::ExternalAddress,
            Opcode::MapUdp => Request::Mapping {
                proto: PortType::Udp,
                local_port: rng.gen(),
                external_port: rng.gen(),
                lifetime_seconds: rng.gen(),
            },
            Opcode::MapTcp => Request::Mapping {
                proto: PortType::Tcp,
                local_port: rng.gen(),
                external_port: rng.gen(),
                lifetime_seconds: rng.gen(),
            },
        }
    }

    #[cfg(test)]
    #[track_caller]
    fn decode(buf: &[u8]) -> Self {
        use crate::wire;

        let _version: Version = buf[0].try_into().unwrap();
        let opcode: Opcode = buf[1].try_into().unwrap();
        // check if this is a mapping request, or an external address request
        match opcode {
            Opcode::DetermineExternalAddress => Request::ExternalAddress,
            Opcode::MapUdp | Opcode::MapTcp => {
                // buf[2] reserved
                // buf[3] reserved

                let local_port = wire::read_u16(buf, 4).unwrap();
                let external_port = wire::read_u16(buf, 6).unwrap();
                let lifetime_seconds = wire::read_u32(buf, 8).unwrap();
                Request::Mapping {
                    proto: if opcode == Opcode::MapUdp {
                        PortType::Udp
                    } else {
                        PortType::Tcp
                    },
                    local_port,
                    external_port,
                    lifetime_seconds,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn test_encode_decode_addr_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(Opcode::DetermineExternalAddress, &mut gen);
        let encoded = request.encode();
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_encode_decode_map_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        for opcode in [Opcode::MapUdp, Opcode::MapTcp] {
            let request = Request::random(opcode, &mut gen);
            let encoded = request.encode();
            assert_eq!(encoded.len(), 12);
            assert_eq!(request, Request::decode(&encoded));
        }
    }
}
