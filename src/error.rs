//! Error taxonomy shared by every mapping protocol.

use crate::{nat_pmp, pcp, upnp, wire};

/// Errors produced while negotiating, refreshing or releasing a port mapping.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied value was out of range or missing where required.
    ///
    /// Raised at message construction time, before anything is sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Response bytes violate the expected wire layout.
    #[error("malformed packet")]
    MalformedPacket,
    /// The response carries an opcode that does not answer the request.
    #[error("unexpected opcode")]
    UnexpectedOpcode,
    /// The PCP server answered with a non-success result code.
    #[error("pcp server error: {0}")]
    Pcp(#[from] pcp::protocol::ErrorCode),
    /// The NAT-PMP gateway answered with a non-success result code.
    #[error("nat-pmp gateway error: {0}")]
    NatPmp(#[from] nat_pmp::protocol::ErrorCode),
    /// The IGD answered a SOAP action with a fault.
    #[error("soap fault: {0}")]
    Soap(#[from] upnp::protocol::SoapFault),
    /// The retry schedule was exhausted without a matching reply.
    #[error("gateway did not respond within the allowed time")]
    Timeout,
    /// Failure in the underlying socket.
    #[error("network failure: {0}")]
    Network(#[from] std::io::Error),
    /// No discovered gateway produced a mapping.
    #[error("no port mapping protocol available")]
    Unsupported,
    /// The operation was cancelled. Gateway state already installed is not
    /// rolled back; release it explicitly.
    #[error("operation cancelled")]
    Cancelled,
    /// A previously held mapping can no longer be refreshed.
    #[error("mapping lost")]
    MappingLost,
}

impl Error {
    /// Whether the session layer may retry the failed operation.
    ///
    /// Only transient gateway conditions qualify; every codec error and every
    /// other protocol result code aborts the exchange.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Pcp(code) => matches!(
                code,
                pcp::protocol::ErrorCode::NetworkFailure | pcp::protocol::ErrorCode::NoResources
            ),
            Error::NatPmp(code) => matches!(
                code,
                nat_pmp::protocol::ErrorCode::NetworkFailure
                    | nat_pmp::protocol::ErrorCode::OutOfResources
            ),
            Error::Timeout | Error::Network(_) => true,
            _ => false,
        }
    }
}

impl From<wire::MalformedPacket> for Error {
    fn from(_: wire::MalformedPacket) -> Self {
        Error::MalformedPacket
    }
}
