//! A NAT-PMP response.

use std::net::Ipv4Addr;

use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};

use crate::{wire, PortType};

use super::{Opcode, Version};

/// A NAT-PMP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Answer to an external address request.
    PublicAddress {
        /// Seconds since the gateway's mapping state was last reset.
        epoch_time: u32,
        /// The external address of the gateway.
        public_ip: Ipv4Addr,
    },
    /// Answer to a mapping request.
    PortMap {
        /// Protocol of the mapping.
        proto: PortType,
        /// Seconds since the gateway's mapping state was last reset.
        epoch_time: u32,
        /// Internal port of the mapping.
        private_port: u16,
        /// External port assigned to the mapping.
        external_port: u16,
        /// Lifetime granted to the mapping.
        lifetime_seconds: u32,
    },
}

/// Result codes of a NAT-PMP response when said code is an error.
///
/// See [RFC 6886 Result Codes](https://www.rfc-editor.org/rfc/rfc6886#section-3.5)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Display, thiserror::Error,
)]
#[repr(u16)]
pub enum ErrorCode {
    /// The gateway does not support this version of the protocol.
    #[display("sent version is not supported")]
    UnsupportedVersion = 1,
    /// Functionality is supported but not allowed, e.g. the box supports
    /// mapping, but the user has turned the feature off.
    #[display("operation not authorized")]
    NotAuthorizedOrRefused = 2,
    /// Network failure, e.g. the NAT box itself has not obtained a DHCP lease.
    #[display("spurious network failure")]
    NetworkFailure = 3,
    /// The NAT box cannot create any more mappings at this time.
    #[display("not enough resources for this request")]
    OutOfResources = 4,
    /// The gateway does not support the requested operation.
    #[display("opcode is not supported")]
    UnsupportedOpcode = 5,
}

/// Result code of a NAT-PMP response.
#[derive(Debug)]
pub enum ResultCode {
    /// The operation succeeded.
    Success,
    /// The operation failed. See [`ErrorCode`].
    Error(ErrorCode),
}

impl TryFrom<u16> for ResultCode {
    type Error = TryFromPrimitiveError<ErrorCode>;

    fn try_from(value: u16) -> Result<Self, TryFromPrimitiveError<ErrorCode>> {
        if value == 0 {
            Ok(ResultCode::Success)
        } else {
            ErrorCode::try_from(value).map(ResultCode::Error)
        }
    }
}

/// Errors that can occur when decoding a [`Response`] from a gateway.
#[derive(Debug, Clone, Copy, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Response is too short or is otherwise malformed.
    #[display("response is malformed")]
    Malformed,
    /// The [`Response::INDICATOR`] is not present.
    #[display("packet does not appear to be a response")]
    NotAResponse,
    /// The received opcode is not recognized.
    #[display("invalid opcode received")]
    InvalidOpcode,
    /// The received version is not recognized.
    #[display("invalid version received")]
    InvalidVersion,
    /// The received result code is not recognized.
    #[display("invalid result code received")]
    InvalidResultCode,
}

/// Failure to obtain a usable [`Response`]: either the bytes don't decode, or
/// they decode to a gateway-reported error.
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The bytes could not be decoded.
    DecodeError(DecodeError),
    /// The gateway answered with a non-success result code.
    ErrorCode(ErrorCode),
}

impl From<Error> for crate::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::DecodeError(DecodeError::NotAResponse)
            | Error::DecodeError(DecodeError::InvalidOpcode) => crate::Error::UnexpectedOpcode,
            Error::DecodeError(_) => crate::Error::MalformedPacket,
            Error::ErrorCode(code) => crate::Error::NatPmp(code),
        }
    }
}

impl Response {
    /// Minimum size of an encoded [`Response`] sent by a gateway to this client.
    pub const MIN_SIZE: usize = // parts of a public ip response
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        4; // public ip

    /// Maximum size of an encoded [`Response`] sent by a gateway to this client.
    pub const MAX_SIZE: usize = // parts of a mapping response
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        2 + // private port
        2 + // public port
        4; // lifetime

    /// Indicator ORd into the [`Opcode`] to indicate a response packet.
    pub const INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::MIN_SIZE || buf.len() > Self::MAX_SIZE {
            return Err(Error::DecodeError(DecodeError::Malformed));
        }
        let _: Version = buf[0]
            .try_into()
            .map_err(|_| Error::DecodeError(DecodeError::InvalidVersion))?;
        let opcode = buf[1];
        if opcode & Self::INDICATOR != Self::INDICATOR {
            return Err(Error::DecodeError(DecodeError::NotAResponse));
        }
        let opcode: Opcode = (opcode & !Self::INDICATOR)
            .try_into()
            .map_err(|_| Error::DecodeError(DecodeError::InvalidOpcode))?;

        let result_code: ResultCode = wire::read_u16(buf, 2)
            .expect("length was verified")
            .try_into()
            .map_err(|_| Error::DecodeError(DecodeError::InvalidResultCode))?;
        match result_code {
            ResultCode::Success => {}
            ResultCode::Error(error_code) => return Err(Error::ErrorCode(error_code)),
        }

        let epoch_time = wire::read_u32(buf, 4).expect("length was verified");

        let response = match opcode {
            Opcode::DetermineExternalAddress => {
                if buf.len() != Self::MIN_SIZE {
                    return Err(Error::DecodeError(DecodeError::Malformed));
                }
                let ip_bytes: [u8; 4] = wire::read_array(buf, 8).expect("length was verified");
                Response::PublicAddress {
                    epoch_time,
                    public_ip: ip_bytes.into(),
                }
            }
            other @ (Opcode::MapUdp | Opcode::MapTcp) => {
                if buf.len() != Self::MAX_SIZE {
                    return Err(Error::DecodeError(DecodeError::Malformed));
                }
                let proto = if other == Opcode::MapUdp {
                    PortType::Udp
                } else {
                    PortType::Tcp
                };

                let private_port = wire::read_u16(buf, 8).expect("length was verified");
                let external_port = wire::read_u16(buf, 10).expect("length was verified");
                let lifetime_seconds = wire::read_u32(buf, 12).expect("length was verified");
                Response::PortMap {
                    proto,
                    epoch_time,
                    private_port,
                    external_port,
                    lifetime_seconds,
                }
            }
        };

        Ok(response)
    }

    /// Whether a raw datagram looks like the response to a request with
    /// `opcode`. Responses repeat the request opcode with the top bit set.
    pub(crate) fn matches_opcode(buf: &[u8], opcode: Opcode) -> bool {
        buf.len() >= Self::MIN_SIZE
            && buf[0] == u8::from(Version::NatPmp)
            && buf[1] == Self::INDICATOR | u8::from(opcode)
    }

    #[cfg(test)]
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![Version::NatPmp.into()];
        match self {
            Response::PublicAddress {
                epoch_time,
                public_ip,
            } => {
                buf.push(Self::INDICATOR | u8::from(Opcode::DetermineExternalAddress));
                buf.extend_from_slice(&0u16.to_be_bytes());
                buf.extend_from_slice(&epoch_time.to_be_bytes());
                buf.extend_from_slice(&public_ip.octets());
            }
            Response::PortMap {
                proto,
                epoch_time,
                private_port,
                external_port,
                lifetime_seconds,
            } => {
                buf.push(Self::INDICATOR | u8::from(Opcode::map(*proto)));
                buf.extend_from_slice(&0u16.to_be_bytes());
                buf.extend_from_slice(&epoch_time.to_be_bytes());
                buf.extend_from_slice(&private_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{Rng, SeedableRng};

    #[test]
    fn test_decode_public_address_response() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let octets: [u8; 4] = gen.gen();
        let response = Response::PublicAddress {
            epoch_time: gen.gen(),
            public_ip: octets.into(),
        };
        let encoded = response.encode();
        assert_eq!(encoded.len(), Response::MIN_SIZE);
        assert_eq!(Ok(response), Response::decode(&encoded));
    }

    #[test]
    fn test_decode_port_map_response() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        for proto in [PortType::Udp, PortType::Tcp] {
            let response = Response::PortMap {
                proto,
                epoch_time: gen.gen(),
                private_port: gen.gen(),
                external_port: gen.gen(),
                lifetime_seconds: gen.gen(),
            };
            let encoded = response.encode();
            assert_eq!(encoded.len(), Response::MAX_SIZE);
            assert_eq!(Ok(response), Response::decode(&encoded));
        }
    }

    #[test]
    fn test_error_result_codes_surface() {
        let response = Response::PortMap {
            proto: PortType::Udp,
            epoch_time: 0,
            private_port: 1,
            external_port: 2,
            lifetime_seconds: 3,
        };
        let mut encoded = response.encode();
        encoded[2..4].copy_from_slice(&3u16.to_be_bytes()); // NETWORK_FAILURE
        assert_eq!(
            Response::decode(&encoded),
            Err(Error::ErrorCode(ErrorCode::NetworkFailure))
        );
    }

    #[test]
    fn test_length_limits() {
        assert_eq!(
            Response::decode(&[0, 0x80]),
            Err(Error::DecodeError(DecodeError::Malformed))
        );
        assert_eq!(
            Response::decode(&[0u8; Response::MAX_SIZE + 1]),
            Err(Error::DecodeError(DecodeError::Malformed))
        );
    }

    #[test]
    fn test_request_packets_are_rejected() {
        let response = Response::PublicAddress {
            epoch_time: 0,
            public_ip: Ipv4Addr::LOCALHOST,
        };
        let mut encoded = response.encode();
        encoded[1] &= !Response::INDICATOR;
        assert_eq!(
            Response::decode(&encoded),
            Err(Error::DecodeError(DecodeError::NotAResponse))
        );
    }

    #[test]
    fn test_matchers() {
        let response = Response::PortMap {
            proto: PortType::Udp,
            epoch_time: 0,
            private_port: 1,
            external_port: 2,
            lifetime_seconds: 3,
        };
        let encoded = response.encode();
        assert!(Response::matches_opcode(&encoded, Opcode::MapUdp));
        assert!(!Response::matches_opcode(&encoded, Opcode::MapTcp));
        assert!(!Response::matches_opcode(
            &encoded,
            Opcode::DetermineExternalAddress
        ));
    }
}
