//! A PCP response.

use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};

use crate::wire;

use super::{
    opcode_data::{InvalidOpcodeData, OpcodeData},
    options::PcpOption,
    Opcode, Version,
};

/// ResultCode in a [`Response`] when it's successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SuccessCode {
    /// Result code indicating a successful response.
    Success = 0,
}

/// ResultCode in a [`Response`], when said code is an error.
/// [`SuccessCode`] handles the success case.
///
/// Refer to [RFC 6887 Result Codes](https://datatracker.ietf.org/doc/html/rfc6887#section-7.4)
// NOTE: docs for each variant are largely adapted from the RFC's description of each code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Display, thiserror::Error,
)]
#[repr(u8)]
pub enum ErrorCode {
    /// The version number at the start of the PCP Request header is not recognized by the PCP
    /// server.
    #[display("sent version is not supported")]
    UnsuppVersion = 1,
    /// The requested operation is disabled for this PCP client, or the PCP client requested an
    /// operation that cannot be fulfilled by the PCP server's security policy.
    #[display("operation not authorized")]
    NotAuthorized = 2,
    /// The request could not be successfully parsed.
    #[display("could not parse the request")]
    MalformedRequest = 3,
    /// Unsupported Opcode.
    #[display("opcode is not supported")]
    UnsuppOpcode = 4,
    /// Unsupported option. This error only occurs if the option is in the mandatory-to-process
    /// range.
    #[display("option is not supported")]
    UnsuppOption = 5,
    /// Malformed option (e.g., appears too many times, invalid length).
    #[display("option could not be parsed")]
    MalformedOption = 6,
    /// The PCP server or the device it controls is experiencing a network failure of some sort
    /// (e.g., has not yet obtained an external IP address). This is a short lifetime error.
    #[display("spurious network failure")]
    NetworkFailure = 7,
    /// Request is well-formed and valid, but the server has insufficient resources to complete the
    /// requested operation at this time. This is a short lifetime error.
    #[display("not enough resources for this request")]
    NoResources = 8,
    /// Unsupported transport protocol, e.g., SCTP in a NAT that handles only UDP and TCP. This is
    /// a long lifetime error.
    #[display("unsupported protocol")]
    UnsuppProtocol = 9,
    /// This attempt to create a new mapping would exceed this subscriber's port quota. This is a
    /// short lifetime error.
    #[display("quota exceeded")]
    UserExQuota = 10,
    /// The suggested external port and/or external address cannot be provided.
    #[display("requested external address cannot be provided")]
    CannotProvideExternal = 11,
    /// The source IP address of the request packet does not match the contents of the PCP Client's
    /// IP Address field.
    #[display("sender and declared ip do not match")]
    AddressMismatch = 12,
    /// The PCP server was not able to create the filters in this request.
    #[display("excessive remote peers in filter option")]
    ExcessiveRemotePeers = 13,
}

/// Result code of a PCP response.
#[derive(Debug)]
pub enum ResultCode {
    /// A success result code. See [`SuccessCode`].
    Success,
    /// An error code. See [`ErrorCode`].
    Error(ErrorCode),
}

impl TryFrom<u8> for ResultCode {
    type Error = TryFromPrimitiveError<ErrorCode>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<ErrorCode>> {
        if let Ok(SuccessCode::Success) = SuccessCode::try_from(value) {
            Ok(ResultCode::Success)
        } else {
            ErrorCode::try_from(value).map(ResultCode::Error)
        }
    }
}

impl From<ResultCode> for u8 {
    fn from(value: ResultCode) -> Self {
        match value {
            ResultCode::Success => SuccessCode::Success.into(),
            ResultCode::Error(e) => e.into(),
        }
    }
}

/// A successful PCP response or notification.
///
/// See [RFC 6887 Response Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Lifetime in seconds that can be assumed by this response.
    ///
    /// For map requests, this lifetime is how long to assume a mapping will last.
    pub lifetime_seconds: u32,
    /// Epoch time of the server.
    pub epoch_time: u32,
    /// Data of the response.
    pub data: OpcodeData,
    /// Options echoed or added by the server, in wire order.
    pub options: Vec<PcpOption>,
}

/// Errors that can occur when decoding a [`Response`] from a server.
#[derive(Debug, Clone, Copy, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Response is too short or is otherwise malformed.
    #[display("response is malformed")]
    Malformed,
    /// The [`Response::RESPONSE_INDICATOR`] is not present.
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
    /// The received opcode data could not be decoded.
    #[display("invalid opcode data received")]
    InvalidOpcodeData,
    /// A field that must be non-zero was zero.
    #[display("zero in a required non-zero field")]
    RequiredNonZero,
    /// The option list could not be decoded.
    #[display("invalid options received")]
    InvalidOption,
}

/// Failure to obtain a usable [`Response`]: either the bytes don't decode, or
/// they decode to a server-reported error.
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The bytes could not be decoded.
    DecodeError(DecodeError),
    /// The server answered with a non-success result code.
    ErrorCode(ErrorCode),
}

impl From<Error> for crate::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::DecodeError(DecodeError::NotAResponse)
            | Error::DecodeError(DecodeError::InvalidOpcode) => crate::Error::UnexpectedOpcode,
            Error::DecodeError(DecodeError::RequiredNonZero) => {
                crate::Error::InvalidArgument("zero in a required non-zero field")
            }
            Error::DecodeError(_) => crate::Error::MalformedPacket,
            Error::ErrorCode(code) => crate::Error::Pcp(code),
        }
    }
}

impl Response {
    /// Max size of a PCP packet as indicated in
    /// [RFC 6887 Common Request and Response Header Format](https://datatracker.ietf.org/doc/html/rfc6887#section-7)
    pub const MAX_SIZE: usize = 1100;

    /// Size of the common header of an encoded [`Response`].
    pub const HEADER_SIZE: usize = // parts
        1 + // version
        1 + // opcode ORd with [`Response::RESPONSE_INDICATOR`]
        1 + // reserved
        1 + // result code
        4 + // lifetime
        4 + // epoch time
        12; // reserved

    /// Indicator ORd into the [`Opcode`] to indicate a response packet.
    pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::HEADER_SIZE || buf.len() > Self::MAX_SIZE {
            return Err(Error::DecodeError(DecodeError::Malformed));
        }

        let _version: Version = buf[0]
            .try_into()
            .map_err(|_| Error::DecodeError(DecodeError::InvalidVersion))?;

        let opcode = buf[1];
        if opcode & Self::RESPONSE_INDICATOR != Self::RESPONSE_INDICATOR {
            return Err(Error::DecodeError(DecodeError::NotAResponse));
        }
        let opcode: Opcode = (opcode & !Self::RESPONSE_INDICATOR)
            .try_into()
            .map_err(|_| Error::DecodeError(DecodeError::InvalidOpcode))?;

        // buf[2] reserved

        // return early if the result code is an error
        let result_code: ResultCode = buf[3]
            .try_into()
            .map_err(|_| Error::DecodeError(DecodeError::InvalidResultCode))?;
        match result_code {
            ResultCode::Success => {}
            ResultCode::Error(error_code) => return Err(Error::ErrorCode(error_code)),
        }

        let lifetime_seconds = wire::read_u32(buf, 4).expect("length was verified");
        let epoch_time = wire::read_u32(buf, 8).expect("length was verified");

        // buf[12..24] reserved

        let data = OpcodeData::decode(opcode, &buf[Self::HEADER_SIZE..]).map_err(|e| match e {
            InvalidOpcodeData::Malformed => Error::DecodeError(DecodeError::InvalidOpcodeData),
            InvalidOpcodeData::RequiredNonZero => Error::DecodeError(DecodeError::RequiredNonZero),
        })?;

        let options = PcpOption::decode_all(&buf[Self::HEADER_SIZE + data.encoded_size()..])
            .map_err(|_| Error::DecodeError(DecodeError::InvalidOption))?;

        Ok(Response {
            lifetime_seconds,
            epoch_time,
            data,
            options,
        })
    }

    /// Whether a raw datagram looks like the response to a request carrying
    /// `nonce`. Used to discard unrelated traffic before a full decode.
    pub(crate) fn matches_nonce(buf: &[u8], opcode: Opcode, nonce: &[u8; 12]) -> bool {
        buf.len() >= Self::HEADER_SIZE + 12
            && buf[0] == u8::from(Version::Pcp)
            && buf[1] == Self::RESPONSE_INDICATOR | u8::from(opcode)
            && buf[Self::HEADER_SIZE..Self::HEADER_SIZE + 12] == nonce[..]
    }

    /// Whether a raw datagram looks like a response with `opcode`. Used for
    /// opcodes that do not carry a nonce.
    pub(crate) fn matches_opcode(buf: &[u8], opcode: Opcode) -> bool {
        buf.len() >= Self::HEADER_SIZE
            && buf[0] == u8::from(Version::Pcp)
            && buf[1] == Self::RESPONSE_INDICATOR | u8::from(opcode)
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        let data = OpcodeData::random(opcode, rng);
        Self {
            lifetime_seconds: rng.gen(),
            epoch_time: rng.gen(),
            data,
            options: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let Response {
            lifetime_seconds,
            epoch_time,
            data,
            options,
        } = self;
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + data.encoded_size());
        // version
        buf.push(Version::Pcp.into());
        // response indicator and opcode
        let opcode: u8 = data.opcode().into();
        buf.push(Response::RESPONSE_INDICATOR | opcode);
        // reserved
        buf.push(0);
        // result code
        buf.push(ResultCode::Success.into());
        // lifetime
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        // epoch
        buf.extend_from_slice(&epoch_time.to_be_bytes());
        // reserved
        for _ in 12..Response::HEADER_SIZE {
            buf.push(0)
        }
        data.encode_into(&mut buf);
        PcpOption::encode_all(options, &mut buf);
        buf
    }
}
