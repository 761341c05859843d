//! NAT-PMP wire format.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::PortType;

pub mod request;
pub mod response;

pub use request::Request;
pub use response::{ErrorCode, Response};

/// Port to use when acting as a server. This is the one we direct requests to.
pub const SERVER_PORT: u16 = 5351;

/// NAT-PMP Version.
///
/// The RFC explicitly pins NAT-PMP to version `0`; its successor PCP starts
/// at `2` because non-compliant devices had already squatted on `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// NAT-PMP identifies its version with a `0` byte.
    NatPmp = 0,
}

/// Opcode of a NAT-PMP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // 3.2.  Determining the External Address
    /// Request the public IP address of the gateway.
    DetermineExternalAddress = 0,
    // 3.3.  Requesting a Mapping
    /// Map a UDP port on the gateway.
    MapUdp = 1,
    /// Map a TCP port on the gateway.
    MapTcp = 2,
}

impl Opcode {
    /// The map opcode for a transport protocol.
    pub fn map(protocol: PortType) -> Opcode {
        match protocol {
            PortType::Udp => Opcode::MapUdp,
            PortType::Tcp => Opcode::MapTcp,
        }
    }
}
