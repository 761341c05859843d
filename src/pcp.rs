//! Definitions and utilities to interact with a PCP server.

use std::{net::IpAddr, num::NonZeroU16, time::Duration};

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    retry::{self, Schedule, UdpTransport},
    wire, Error, PortType,
};

pub mod protocol;

/// Timeout to receive a probe response from a PCP server. Probes are raced
/// against the other protocols, so they fail fast instead of walking the
/// full retransmission schedule.
const PROBE_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// A mapping successfully registered with a PCP server.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Local ip used to create this mapping.
    local_ip: IpAddr,
    /// Local port used to create this mapping.
    local_port: NonZeroU16,
    /// Gateway address used to register this mapping.
    gateway: IpAddr,
    /// Transport protocol of the mapping.
    protocol: PortType,
    /// External port of the mapping.
    external_port: NonZeroU16,
    /// External address of the mapping.
    external_address: IpAddr,
    /// Allowed time for this mapping as informed by the server.
    lifetime_seconds: u32,
    /// The nonce of the mapping, used for modifications with the PCP server,
    /// for example renewing or releasing the mapping.
    nonce: [u8; 12],
}

impl Mapping {
    /// Attempt to register a new mapping with the PCP server on the provided gateway.
    pub async fn new(
        local_ip: IpAddr,
        local_port: NonZeroU16,
        gateway: IpAddr,
        protocol: PortType,
        preferred_external: Option<(IpAddr, NonZeroU16)>,
        lifetime_seconds: u32,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        let socket = connect(local_ip, gateway).await?;

        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let (preferred_address, preferred_port) = match preferred_external {
            Some((addr, port)) => (Some(addr), Some(port)),
            None => (None, None),
        };

        let req = protocol::Request::mapping(
            nonce,
            protocol,
            local_port,
            local_ip,
            preferred_port,
            preferred_address,
            lifetime_seconds,
            Vec::new(),
        );

        let (map, lifetime_seconds) = map_exchange(&socket, &req, &nonce, cancel).await?;

        if map.protocol != protocol {
            return Err(Error::UnexpectedOpcode);
        }
        if map.local_port != local_port.get() {
            return Err(Error::InvalidArgument(
                "mapped local port does not match the requested one",
            ));
        }
        let external_port = map
            .external_port
            .try_into()
            .map_err(|_| Error::InvalidArgument("received 0 external port for mapping"))?;
        let external_address = wire::from_wire(map.external_address);

        Ok(Mapping {
            local_ip,
            local_port,
            gateway,
            protocol,
            external_port,
            external_address,
            lifetime_seconds,
            nonce,
        })
    }

    /// Renew the mapping before its lifetime elapses, keeping the nonce and
    /// asking the server to keep the assigned external endpoint.
    pub async fn refresh(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let socket = connect(self.local_ip, self.gateway).await?;

        let req = protocol::Request::mapping(
            self.nonce,
            self.protocol,
            self.local_port,
            self.local_ip,
            Some(self.external_port),
            Some(self.external_address),
            self.lifetime_seconds,
            Vec::new(),
        );

        let (map, lifetime_seconds) = map_exchange(&socket, &req, &self.nonce, cancel).await?;

        let external_port = map
            .external_port
            .try_into()
            .map_err(|_| Error::InvalidArgument("received 0 external port for mapping"))?;
        // the server may move the mapping on renewal; publish whatever it
        // assigned
        self.external_port = external_port;
        self.external_address = wire::from_wire(map.external_address);
        self.lifetime_seconds = lifetime_seconds;
        trace!(
            "pcp mapping renewed for {}s at {}:{}",
            lifetime_seconds,
            self.external_address,
            self.external_port
        );
        Ok(())
    }

    /// Release the mapping: a MAP request with a lifetime of zero.
    pub async fn release(self) -> Result<(), Error> {
        let Mapping {
            nonce,
            local_ip,
            local_port,
            gateway,
            protocol,
            ..
        } = self;

        let socket = connect(local_ip, gateway).await?;

        let req =
            protocol::Request::mapping(nonce, protocol, local_port, local_ip, None, None, 0, Vec::new());

        socket.send(&req.encode()).await?;

        // mapping deletion is a notification, no point in waiting for the response
        Ok(())
    }

    pub(crate) fn external(&self) -> (IpAddr, NonZeroU16) {
        (self.external_address, self.external_port)
    }

    pub(crate) fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_seconds.into())
    }
}

/// Run one MAP exchange and return the verified opcode data and lifetime.
async fn map_exchange(
    socket: &UdpSocket,
    req: &protocol::Request,
    nonce: &[u8; 12],
    cancel: &CancellationToken,
) -> Result<(protocol::MapData, u32), Error> {
    let encoded = req.encode();
    let mut transport = UdpTransport::new(socket, &encoded);
    let datagram = retry::exchange(&mut transport, Schedule::Pcp, cancel, |buf| {
        protocol::Response::matches_nonce(buf, protocol::Opcode::Map, nonce)
    })
    .await?;

    let response = protocol::Response::decode(&datagram).map_err(Error::from)?;
    let protocol::Response {
        lifetime_seconds,
        epoch_time: _,
        data,
        options: _,
    } = response;

    match data {
        protocol::OpcodeData::Map(map) => {
            debug_assert_eq!(&map.nonce, nonce, "matcher verified the nonce");
            Ok((map, lifetime_seconds))
        }
        _ => Err(Error::UnexpectedOpcode),
    }
}

/// Probes the gateway for PCP support with a single ANNOUNCE exchange.
pub async fn probe_available(local_ip: IpAddr, gateway: IpAddr) -> bool {
    match probe_available_fallible(local_ip, gateway).await {
        Ok(response) => {
            trace!("probe response: {response:?}");
            match response.data {
                protocol::OpcodeData::Announce => true,
                _ => {
                    debug!("server returned an unexpected response type for probe");
                    // misbehaving server is not useful
                    false
                }
            }
        }
        Err(e) => {
            debug!("probe failed: {e}");
            false
        }
    }
}

async fn probe_available_fallible(
    local_ip: IpAddr,
    gateway: IpAddr,
) -> Result<protocol::Response, Error> {
    let socket = connect(local_ip, gateway).await?;
    let req = protocol::Request::announce(local_ip);
    socket.send(&req.encode()).await?;

    let mut buffer = vec![0; protocol::Response::MAX_SIZE];
    let read = tokio::time::timeout(PROBE_RECV_TIMEOUT, socket.recv(&mut buffer))
        .await
        .map_err(|_| Error::Timeout)??;

    protocol::Response::decode(&buffer[..read]).map_err(Error::from)
}

/// Create a socket bound to the local address and connected to the PCP port
/// of the gateway.
async fn connect(local_ip: IpAddr, gateway: IpAddr) -> Result<UdpSocket, Error> {
    let socket = UdpSocket::bind((local_ip, 0)).await?;
    socket.connect((gateway, protocol::SERVER_PORT)).await?;
    Ok(socket)
}
