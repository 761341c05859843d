//! Definitions and utilities to interact with UPnP IGD gateways.
//!
//! Covers the IPv4 internet gateway profiles (WANIPConnection v1/v2,
//! WANPPPConnection v1) and the IPv6 firewall pinhole profile
//! (WANIPv6FirewallControl).

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4},
    num::NonZeroU16,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, trace};
use url::Url;

use crate::{Error, PortType};

pub mod protocol;
pub mod ssdp;

use protocol::{request, response, ActionRequest, ControlEndpoint};

/// Maximum duration a SOAP round trip can take.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// UPnP error code for a conflicting mapping on IGD:1.
const CONFLICT_IGD1: u16 = 718;

/// UPnP error code for a conflicting mapping on IGD:2.
const CONFLICT_IGD2: u16 = 725;

/// The IGD service profiles this client can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// `WANIPConnection:1`.
    WanIpV1,
    /// `WANIPConnection:2`, the IGD:2 revision.
    WanIpV2,
    /// `WANPPPConnection:1`.
    WanPpp,
    /// `WANIPv6FirewallControl:1`, the IPv6 pinhole profile.
    Ipv6Firewall,
}

impl ServiceKind {
    /// Every profile, in the order they are searched for.
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::WanIpV1,
        ServiceKind::WanIpV2,
        ServiceKind::WanPpp,
        ServiceKind::Ipv6Firewall,
    ];

    /// The service type URN of this profile.
    pub fn urn(&self) -> &'static str {
        match self {
            ServiceKind::WanIpV1 => "urn:schemas-upnp-org:service:WANIPConnection:1",
            ServiceKind::WanIpV2 => "urn:schemas-upnp-org:service:WANIPConnection:2",
            ServiceKind::WanPpp => "urn:schemas-upnp-org:service:WANPPPConnection:1",
            ServiceKind::Ipv6Firewall => "urn:schemas-upnp-org:service:WANIPv6FirewallControl:1",
        }
    }

    /// Classify an advertised service type URN.
    pub fn from_urn(urn: &str) -> Option<Self> {
        ServiceKind::ALL.into_iter().find(|kind| kind.urn() == urn)
    }

    /// Whether this profile forwards IPv4 ports (as opposed to opening IPv6
    /// pinholes).
    pub fn is_port_mapping(&self) -> bool {
        !matches!(self, ServiceKind::Ipv6Firewall)
    }
}

/// An IGD control endpoint discovered via SSDP.
#[derive(Debug, Clone)]
pub struct Gateway {
    kind: ServiceKind,
    service_type: String,
    control_url: Url,
    /// The local address of the interface the gateway was discovered on,
    /// when the search was bound to one.
    local_ip: Option<Ipv4Addr>,
}

// identity is the service, not the interface it was discovered through
impl PartialEq for Gateway {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.service_type == other.service_type
            && self.control_url == other.control_url
    }
}

impl Eq for Gateway {}

impl Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.service_type, self.control_url)
    }
}

impl Gateway {
    /// The profile this gateway's service implements.
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn endpoint(&self) -> ControlEndpoint {
        ControlEndpoint {
            host: ssdp::authority(&self.control_url),
            control_path: self.control_url.path().to_string(),
            service_type: self.service_type.clone(),
        }
    }

    /// Send one action and return the raw HTTP response bytes.
    ///
    /// Every request closes its connection (`Connection: Close`), matching
    /// how the request bytes are framed.
    async fn perform(&self, action: &ActionRequest) -> Result<Vec<u8>, Error> {
        let host = self.control_url.host_str().ok_or(Error::Unsupported)?;
        let port = self.control_url.port().unwrap_or(80);
        let round_trip = async {
            let mut stream = TcpStream::connect((host, port)).await?;
            stream.write_all(&action.dump()).await?;
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await?;
            Ok::<_, std::io::Error>(raw)
        };
        let raw = tokio::time::timeout(REQUEST_TIMEOUT, round_trip)
            .await
            .map_err(|_| Error::Timeout)??;
        trace!(action = action.action(), len = raw.len(), "soap round trip done");
        Ok(raw)
    }

    /// Ask the gateway for its external address.
    pub async fn external_ip(&self) -> Result<IpAddr, Error> {
        let raw = self
            .perform(&request::get_external_ip_address(&self.endpoint()))
            .await?;
        response::parse_external_ip_address(&raw)
    }

    /// Query a specific mapping by external port and protocol.
    pub async fn port_mapping_entry(
        &self,
        external_port: NonZeroU16,
        protocol: PortType,
    ) -> Result<response::PortMappingEntry, Error> {
        let raw = self
            .perform(&request::get_specific_port_mapping_entry(
                &self.endpoint(),
                None,
                external_port,
                protocol,
            ))
            .await?;
        response::parse_specific_port_mapping_entry(&raw)
    }

    /// Query the IPv6 firewall state.
    pub async fn firewall_status(&self) -> Result<response::FirewallStatus, Error> {
        let raw = self
            .perform(&request::get_firewall_status(&self.endpoint()))
            .await?;
        response::parse_firewall_status(&raw)
    }

    /// Ask how long the firewall keeps outbound state alive for the given
    /// flow, in seconds.
    pub async fn outbound_pinhole_timeout(
        &self,
        remote_host: Option<IpAddr>,
        remote_port: u16,
        internal_client: Option<IpAddr>,
        internal_port: u16,
        protocol: PortType,
    ) -> Result<u32, Error> {
        let raw = self
            .perform(&request::get_outbound_pinhole_timeout(
                &self.endpoint(),
                remote_host,
                remote_port,
                internal_client,
                internal_port,
                protocol,
            ))
            .await?;
        response::parse_outbound_pinhole_timeout(&raw)
    }

    async fn add_port(
        &self,
        external_port: NonZeroU16,
        protocol: PortType,
        local_addr: SocketAddrV4,
        description: &str,
        lease_seconds: u32,
    ) -> Result<(), Error> {
        let internal_port = NonZeroU16::new(local_addr.port())
            .ok_or(Error::InvalidArgument("internal port must be non-zero"))?;
        let raw = self
            .perform(&request::add_port_mapping(
                &self.endpoint(),
                None,
                external_port,
                protocol,
                internal_port,
                *local_addr.ip(),
                description,
                lease_seconds,
            ))
            .await?;
        response::parse_empty("AddPortMapping", &raw)
    }

    async fn add_any_port(
        &self,
        preferred_external_port: NonZeroU16,
        protocol: PortType,
        local_addr: SocketAddrV4,
        description: &str,
        lease_seconds: u32,
    ) -> Result<NonZeroU16, Error> {
        let internal_port = NonZeroU16::new(local_addr.port())
            .ok_or(Error::InvalidArgument("internal port must be non-zero"))?;
        let raw = self
            .perform(&request::add_any_port_mapping(
                &self.endpoint(),
                None,
                preferred_external_port,
                protocol,
                internal_port,
                *local_addr.ip(),
                description,
                lease_seconds,
            ))
            .await?;
        response::parse_add_any_port_mapping(&raw)
    }

    async fn remove_port(
        &self,
        external_port: NonZeroU16,
        protocol: PortType,
    ) -> Result<(), Error> {
        let raw = self
            .perform(&request::delete_port_mapping(
                &self.endpoint(),
                None,
                external_port,
                protocol,
            ))
            .await?;
        response::parse_empty("DeletePortMapping", &raw)
    }
}

/// The gateways found by one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct Gateways {
    /// First gateway offering an IPv4 port mapping service.
    pub wan: Option<Gateway>,
    /// First gateway offering the IPv6 firewall pinhole service.
    pub firewall: Option<Gateway>,
}

/// Search for IGD gateways, fanning the SSDP search out over every given
/// local address in parallel.
///
/// With no local addresses the search goes out once, unbound, over the
/// default multicast route.
pub async fn probe_available(locals: &[Ipv4Addr]) -> Gateways {
    let searches: Vec<Option<Ipv4Addr>> = if locals.is_empty() {
        vec![None]
    } else {
        locals.iter().copied().map(Some).collect()
    };
    let results = futures::future::join_all(searches.into_iter().map(ssdp::search)).await;

    let mut gateways = Gateways::default();
    for result in results {
        let services = match result {
            Ok(services) => services,
            Err(e) => {
                debug!("upnp probe failed: {e}");
                continue;
            }
        };
        for service in services {
            let gateway = Gateway {
                kind: service.kind,
                service_type: service.service_type,
                control_url: service.control_url,
                local_ip: service.local_ip,
            };
            let slot = if gateway.kind.is_port_mapping() {
                &mut gateways.wan
            } else {
                &mut gateways.firewall
            };
            if slot.is_none() {
                trace!("discovered {gateway}");
                *slot = Some(gateway);
            }
        }
    }
    gateways
}

/// The local address that routes towards the gateway, used as the internal
/// client of a mapping when the discovery bind address is unknown.
async fn local_ip_to(gateway: &Gateway) -> Result<Ipv4Addr, Error> {
    let host = gateway.control_url.host_str().ok_or(Error::Unsupported)?;
    let port = gateway.control_url.port().unwrap_or(80);
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((host, port)).await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(local) => Ok(local),
        IpAddr::V6(_) => Err(Error::Unsupported),
    }
}

/// A port mapping registered with an IGD's WAN connection service.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// The gateway service used to create this mapping.
    gateway: Gateway,
    /// The external address obtained by this mapping.
    external_ip: IpAddr,
    /// External port obtained by this mapping.
    external_port: NonZeroU16,
    /// Local address the mapping forwards to.
    local_addr: SocketAddrV4,
    /// Transport protocol of the mapping.
    protocol: PortType,
    /// Lease granted to the mapping.
    lifetime_seconds: u32,
    /// Description registered with the mapping.
    description: String,
}

impl Mapping {
    /// Register a mapping, searching across the local addresses for a
    /// gateway if none is known.
    ///
    /// The internal client of the mapping is the local address facing the
    /// chosen gateway. A conflicting external port falls back to
    /// `AddAnyPortMapping` on IGD:2 services; IGD:1 only gets the preferred
    /// and the local port tried in turn.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new(
        locals: &[Ipv4Addr],
        local_port: NonZeroU16,
        gateway: Option<Gateway>,
        preferred_port: Option<NonZeroU16>,
        protocol: PortType,
        lifetime_seconds: u32,
        description: String,
    ) -> Result<Self, Error> {
        // search for a gateway if there is not one already
        let gateway = match gateway {
            Some(known_gateway) => known_gateway,
            None => probe_available(locals).await.wan.ok_or(Error::Unsupported)?,
        };

        let local_ip = match gateway.local_ip {
            Some(local) => local,
            None => local_ip_to(&gateway).await?,
        };
        let local_addr = SocketAddrV4::new(local_ip, local_port.into());

        let external_ip = gateway.external_ip().await?;

        let mut last_error = None;
        for external_port in candidate_ports(preferred_port, local_port) {
            match gateway
                .add_port(external_port, protocol, local_addr, &description, lifetime_seconds)
                .await
            {
                Ok(()) => {
                    return Ok(Mapping {
                        gateway,
                        external_ip,
                        external_port,
                        local_addr,
                        protocol,
                        lifetime_seconds,
                        description,
                    })
                }
                Err(e) => {
                    if is_conflict(&e) && gateway.kind == ServiceKind::WanIpV2 {
                        let external_port = gateway
                            .add_any_port(
                                external_port,
                                protocol,
                                local_addr,
                                &description,
                                lifetime_seconds,
                            )
                            .await?;
                        return Ok(Mapping {
                            gateway,
                            external_ip,
                            external_port,
                            local_addr,
                            protocol,
                            lifetime_seconds,
                            description,
                        });
                    }
                    debug!("failed to map external port {external_port}: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::Unsupported))
    }

    /// Renew the lease by re-registering the same mapping.
    pub(crate) async fn refresh(&mut self) -> Result<(), Error> {
        self.gateway
            .add_port(
                self.external_port,
                self.protocol,
                self.local_addr,
                &self.description,
                self.lifetime_seconds,
            )
            .await
    }

    /// Remove the mapping from the gateway.
    pub(crate) async fn release(self) -> Result<(), Error> {
        let Mapping {
            gateway,
            external_port,
            protocol,
            ..
        } = self;
        gateway.remove_port(external_port, protocol).await
    }

    // external indicates what endpoint the mapping can be reached from on
    // the outside.
    pub(crate) fn external(&self) -> (IpAddr, NonZeroU16) {
        (self.external_ip, self.external_port)
    }

    pub(crate) fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_seconds.into())
    }
}

impl Display for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UPnP mapping {} -> {}:{}",
            self.local_addr, self.external_ip, self.external_port
        )
    }
}

/// An inbound pinhole opened on an IGD's IPv6 firewall control service.
#[derive(Debug, Clone)]
pub struct Pinhole {
    /// The gateway service used to open this pinhole.
    gateway: Gateway,
    /// Identifier assigned by the firewall, used to update and delete.
    unique_id: String,
    /// Local address the pinhole admits traffic to.
    local_ip: Ipv6Addr,
    /// Local port the pinhole admits traffic to.
    local_port: NonZeroU16,
    /// Transport protocol of the pinhole.
    protocol: PortType,
    /// Lease granted to the pinhole.
    lifetime_seconds: u32,
}

impl Pinhole {
    /// Open a pinhole admitting inbound traffic from any remote host,
    /// searching across the local addresses for a firewall control service
    /// if none is known.
    pub(crate) async fn new(
        locals: &[Ipv4Addr],
        local_ip: Ipv6Addr,
        local_port: NonZeroU16,
        gateway: Option<Gateway>,
        protocol: PortType,
        lifetime_seconds: u32,
    ) -> Result<Self, Error> {
        let gateway = match gateway {
            Some(known_gateway) => known_gateway,
            None => probe_available(locals)
                .await
                .firewall
                .ok_or(Error::Unsupported)?,
        };

        let status = gateway.firewall_status().await?;
        if !status.firewall_enabled || !status.inbound_pinhole_allowed {
            debug!("firewall does not accept inbound pinholes: {status:?}");
            return Err(Error::Unsupported);
        }

        let action = request::add_pinhole(
            &gateway.endpoint(),
            None,
            0,
            Some(IpAddr::V6(local_ip)),
            local_port.get(),
            protocol,
            lifetime_seconds,
        )?;
        let raw = gateway.perform(&action).await?;
        let unique_id = response::parse_add_pinhole(&raw)?;

        Ok(Pinhole {
            gateway,
            unique_id,
            local_ip,
            local_port,
            protocol,
            lifetime_seconds,
        })
    }

    /// Extend the pinhole's lease.
    pub(crate) async fn refresh(&mut self) -> Result<(), Error> {
        let action = request::update_pinhole(
            &self.gateway.endpoint(),
            &self.unique_id,
            self.lifetime_seconds,
        )?;
        let raw = self.gateway.perform(&action).await?;
        response::parse_empty("UpdatePinhole", &raw)
    }

    /// Close the pinhole.
    pub(crate) async fn release(self) -> Result<(), Error> {
        let action = request::delete_pinhole(&self.gateway.endpoint(), &self.unique_id);
        let raw = self.gateway.perform(&action).await?;
        response::parse_empty("DeletePinhole", &raw)
    }

    /// A pinhole has no translated endpoint; it admits traffic straight to
    /// the internal address.
    pub(crate) fn external(&self) -> (IpAddr, NonZeroU16) {
        (IpAddr::V6(self.local_ip), self.local_port)
    }

    pub(crate) fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_seconds.into())
    }
}

impl Display for Pinhole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IPv6 pinhole {} for [{}]:{}",
            self.unique_id, self.local_ip, self.local_port
        )
    }
}

/// External ports to try, in order: the caller's preference first, then the
/// local port.
fn candidate_ports(
    preferred: Option<NonZeroU16>,
    local_port: NonZeroU16,
) -> impl Iterator<Item = NonZeroU16> {
    let fallback = (preferred != Some(local_port)).then_some(local_port);
    preferred.into_iter().chain(fallback)
}

/// Whether a mapping failure means the external port is taken. IGD:1 and
/// IGD:2 report this with different UPnP error codes.
fn is_conflict(error: &Error) -> bool {
    match error {
        Error::Soap(fault) => matches!(
            fault.upnp_error_code,
            Some(CONFLICT_IGD1) | Some(CONFLICT_IGD2)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_urns_round_trip() {
        for kind in ServiceKind::ALL {
            assert_eq!(ServiceKind::from_urn(kind.urn()), Some(kind));
        }
        assert_eq!(
            ServiceKind::from_urn("urn:schemas-upnp-org:service:Layer3Forwarding:1"),
            None
        );
    }

    #[test]
    fn test_candidate_ports() {
        let preferred = NonZeroU16::new(6000).unwrap();
        let local = NonZeroU16::new(7000).unwrap();
        assert_eq!(
            candidate_ports(Some(preferred), local).collect::<Vec<_>>(),
            vec![preferred, local]
        );
        assert_eq!(
            candidate_ports(None, local).collect::<Vec<_>>(),
            vec![local]
        );
        assert_eq!(
            candidate_ports(Some(local), local).collect::<Vec<_>>(),
            vec![local]
        );
    }

    #[test]
    fn test_conflict_codes() {
        for (code, expected) in [(718, true), (725, true), (501, false)] {
            let error = Error::Soap(protocol::SoapFault {
                http_status: 500,
                fault_code: "s:Client".to_string(),
                fault_string: "UPnPError".to_string(),
                upnp_error_code: Some(code),
                upnp_error_description: None,
            });
            assert_eq!(is_conflict(&error), expected, "code {code}");
        }
        assert!(!is_conflict(&Error::Timeout));
    }
}
