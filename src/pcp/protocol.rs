//! PCP wire format.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod opcode_data;
pub mod options;
pub mod request;
pub mod response;

pub use opcode_data::{MapData, OpcodeData, PeerData};
pub use options::{OptionCode, PcpOption};
pub use request::Request;
pub use response::{ErrorCode, Response};

// PCP and NAT-PMP share the same ports, reassigned by IANA from the older
// version to the new one. See
// <https://datatracker.ietf.org/doc/html/rfc6887#section-19>

/// Port to use when acting as a client. This is the one we bind to.
pub const CLIENT_PORT: u16 = 5350;

/// Port to use when acting as a server. This is the one we direct requests to.
pub const SERVER_PORT: u16 = 5351;

/// PCP Version
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// PCP Version according to [RFC 6887 Version Negotiation](https://datatracker.ietf.org/doc/html/rfc6887#section-9)
    // Version 2
    Pcp = 2,
}

/// Opcode as defined in [RFC 6887 IANA Considerations](https://datatracker.ietf.org/doc/html/rfc6887#section-19)
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Announce Opcode.
    ///
    /// Used by the server to announce changes to clients. These include restarts
    /// (indicating loss of state) and changes to mappings and external ip addresses.
    ///
    /// See [RFC 6887 ANNOUNCE Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-14.1)
    Announce = 0,
    /// Map Opcode.
    ///
    /// Used to obtain endpoint-independent mappings.
    ///
    /// See [RFC 6887 MAP Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-11)
    Map = 1,
    /// Peer Opcode.
    ///
    /// Used to obtain mappings restricted to a single remote peer.
    ///
    /// See [RFC 6887 PEER Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-12)
    Peer = 2,
}
