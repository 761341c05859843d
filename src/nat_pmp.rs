//! Definitions and utilities to interact with a NAT-PMP gateway.

use std::{
    net::Ipv4Addr,
    num::NonZeroU16,
    time::Duration,
};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    retry::{self, Schedule, UdpTransport},
    Error, PortType,
};

pub mod protocol;

/// Timeout to receive a probe response from a NAT-PMP gateway.
const PROBE_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// A mapping successfully registered with a NAT-PMP gateway.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Local ip used to create this mapping.
    local_ip: Ipv4Addr,
    /// Local port used to create this mapping.
    local_port: NonZeroU16,
    /// Gateway address used to register this mapping.
    gateway: Ipv4Addr,
    /// Transport protocol of the mapping.
    protocol: PortType,
    /// External port of the mapping.
    external_port: NonZeroU16,
    /// External address of the gateway. NAT-PMP maps onto the gateway's own
    /// external address, learned with a separate exchange.
    external_address: Ipv4Addr,
    /// Allowed time for this mapping as informed by the gateway.
    lifetime_seconds: u32,
}

impl Mapping {
    /// Attempt to register a new mapping with the NAT-PMP gateway.
    pub async fn new(
        local_ip: Ipv4Addr,
        local_port: NonZeroU16,
        gateway: Ipv4Addr,
        protocol: PortType,
        preferred_external_port: Option<NonZeroU16>,
        lifetime_seconds: u32,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        let socket = connect(local_ip, gateway).await?;

        // the map response does not carry the external address, ask for it
        // first
        let external_address = external_address_exchange(&socket, cancel).await?;

        let req = protocol::Request::Mapping {
            proto: protocol,
            local_port: local_port.get(),
            external_port: preferred_external_port.map(NonZeroU16::get).unwrap_or_default(),
            lifetime_seconds,
        };
        let (external_port, lifetime_seconds) =
            map_exchange(&socket, &req, local_port, protocol, cancel).await?;

        Ok(Mapping {
            local_ip,
            local_port,
            gateway,
            protocol,
            external_port,
            external_address,
            lifetime_seconds,
        })
    }

    /// Renew the mapping before its lifetime elapses.
    ///
    /// NAT-PMP renewal is the original request again. The gateway may assign
    /// a different external port; the new endpoint is published either way.
    pub async fn refresh(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let socket = connect(self.local_ip, self.gateway).await?;

        let req = protocol::Request::Mapping {
            proto: self.protocol,
            local_port: self.local_port.get(),
            external_port: self.external_port.get(),
            lifetime_seconds: self.lifetime_seconds,
        };
        let (external_port, lifetime_seconds) =
            map_exchange(&socket, &req, self.local_port, self.protocol, cancel).await?;

        self.external_port = external_port;
        self.lifetime_seconds = lifetime_seconds;
        trace!(
            "nat-pmp mapping renewed for {}s at {}:{}",
            lifetime_seconds,
            self.external_address,
            self.external_port
        );
        Ok(())
    }

    /// Release the mapping: a request with both the requested lifetime and
    /// the external port set to zero.
    pub async fn release(self) -> Result<(), Error> {
        let Mapping {
            local_ip,
            local_port,
            gateway,
            protocol,
            ..
        } = self;

        let socket = connect(local_ip, gateway).await?;

        let req = protocol::Request::Mapping {
            proto: protocol,
            local_port: local_port.get(),
            external_port: 0,
            lifetime_seconds: 0,
        };
        socket.send(&req.encode()).await?;

        // mapping deletion is a notification, no point in waiting for the response
        Ok(())
    }

    pub(crate) fn external(&self) -> (std::net::IpAddr, NonZeroU16) {
        (self.external_address.into(), self.external_port)
    }

    pub(crate) fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_seconds.into())
    }
}

/// Run one external address exchange.
async fn external_address_exchange(
    socket: &UdpSocket,
    cancel: &CancellationToken,
) -> Result<Ipv4Addr, Error> {
    let encoded = protocol::Request::ExternalAddress.encode();
    let mut transport = UdpTransport::new(socket, &encoded);
    let datagram = retry::exchange(&mut transport, Schedule::NatPmp, cancel, |buf| {
        protocol::Response::matches_opcode(buf, protocol::Opcode::DetermineExternalAddress)
    })
    .await?;

    match protocol::Response::decode(&datagram).map_err(Error::from)? {
        protocol::Response::PublicAddress { public_ip, .. } => Ok(public_ip),
        protocol::Response::PortMap { .. } => Err(Error::UnexpectedOpcode),
    }
}

/// Run one map exchange and return the verified external port and lifetime.
async fn map_exchange(
    socket: &UdpSocket,
    req: &protocol::Request,
    local_port: NonZeroU16,
    protocol: PortType,
    cancel: &CancellationToken,
) -> Result<(NonZeroU16, u32), Error> {
    let encoded = req.encode();
    let mut transport = UdpTransport::new(socket, &encoded);
    let datagram = retry::exchange(&mut transport, Schedule::NatPmp, cancel, |buf| {
        protocol::Response::matches_opcode(buf, protocol::Opcode::map(protocol))
    })
    .await?;

    match protocol::Response::decode(&datagram).map_err(Error::from)? {
        protocol::Response::PortMap {
            proto,
            private_port,
            external_port,
            lifetime_seconds,
            ..
        } => {
            if proto != protocol {
                return Err(Error::UnexpectedOpcode);
            }
            if private_port != local_port.get() {
                return Err(Error::InvalidArgument(
                    "mapped local port does not match the requested one",
                ));
            }
            let external_port = external_port
                .try_into()
                .map_err(|_| Error::InvalidArgument("received 0 external port for mapping"))?;
            Ok((external_port, lifetime_seconds))
        }
        protocol::Response::PublicAddress { .. } => Err(Error::UnexpectedOpcode),
    }
}

/// Probes the gateway for NAT-PMP support with a single external address
/// exchange.
pub async fn probe_available(local_ip: Ipv4Addr, gateway: Ipv4Addr) -> bool {
    match probe_available_fallible(local_ip, gateway).await {
        Ok(public_ip) => {
            trace!("probe response: {public_ip}");
            true
        }
        Err(e) => {
            debug!("probe failed: {e}");
            false
        }
    }
}

async fn probe_available_fallible(local_ip: Ipv4Addr, gateway: Ipv4Addr) -> Result<Ipv4Addr, Error> {
    let socket = connect(local_ip, gateway).await?;
    socket.send(&protocol::Request::ExternalAddress.encode()).await?;

    let mut buffer = vec![0; protocol::Response::MAX_SIZE];
    let read = tokio::time::timeout(PROBE_RECV_TIMEOUT, socket.recv(&mut buffer))
        .await
        .map_err(|_| Error::Timeout)??;

    match protocol::Response::decode(&buffer[..read]).map_err(Error::from)? {
        protocol::Response::PublicAddress { public_ip, .. } => Ok(public_ip),
        protocol::Response::PortMap { .. } => Err(Error::UnexpectedOpcode),
    }
}

/// Create a socket bound to the local address and connected to the NAT-PMP
/// port of the gateway.
async fn connect(local_ip: Ipv4Addr, gateway: Ipv4Addr) -> Result<UdpSocket, Error> {
    let socket = UdpSocket::bind((local_ip, 0)).await?;
    socket.connect((gateway, protocol::SERVER_PORT)).await?;
    Ok(socket)
}
