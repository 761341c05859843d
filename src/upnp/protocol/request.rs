//! Typed builders for the IGD actions this client performs.
//!
//! Each builder fixes the child element order of its action; gateways parse
//! these positionally more often than the schema admits.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU16;

use crate::{wire, Error, PortType};

use super::{escape_xml, ActionRequest};

/// Location of a control endpoint: host authority, control URL path and
/// service type URN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    /// Host authority for the `Host` header, e.g. `192.168.1.1:5000`.
    pub host: String,
    /// Path of the control URL, e.g. `/ctl/IPConn`.
    pub control_path: String,
    /// Service type URN the actions are addressed to.
    pub service_type: String,
}

impl ControlEndpoint {
    fn request(&self, action: &'static str, arguments: Vec<(&'static str, String)>) -> ActionRequest {
        ActionRequest {
            host: self.host.clone(),
            control_path: self.control_path.clone(),
            service_type: self.service_type.clone(),
            action,
            arguments,
        }
    }
}

/// `TCP`/`UDP`, the form the port mapping actions take.
fn protocol_name(protocol: PortType) -> &'static str {
    match protocol {
        PortType::Tcp => "TCP",
        PortType::Udp => "UDP",
    }
}

/// Dotted quad, or the empty string for "any remote host".
fn v4_field(addr: Option<Ipv4Addr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}

/// 16-byte wire form rendered as RFC 5952 text, or the empty string for a
/// wildcard. The pinhole profile expects hextets even for mapped IPv4.
fn pinhole_field(addr: Option<IpAddr>) -> String {
    addr.map(|a| wire::rfc5952(wire::to_wire(a))).unwrap_or_default()
}

/// `AddPortMapping` on a WANIPConnection or WANPPPConnection service.
#[allow(clippy::too_many_arguments)]
pub fn add_port_mapping(
    endpoint: &ControlEndpoint,
    remote_host: Option<Ipv4Addr>,
    external_port: NonZeroU16,
    protocol: PortType,
    internal_port: NonZeroU16,
    internal_client: Ipv4Addr,
    description: &str,
    lease_seconds: u32,
) -> ActionRequest {
    endpoint.request(
        "AddPortMapping",
        vec![
            ("NewRemoteHost", v4_field(remote_host)),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol_name(protocol).to_string()),
            ("NewInternalPort", internal_port.to_string()),
            ("NewInternalClient", internal_client.to_string()),
            ("NewEnabled", "1".to_string()),
            ("NewPortMappingDescription", escape_xml(description)),
            ("NewLeaseDuration", lease_seconds.to_string()),
        ],
    )
}

/// `AddAnyPortMapping`, the IGD:2 variant that lets the gateway move the
/// external port instead of failing on a conflict.
#[allow(clippy::too_many_arguments)]
pub fn add_any_port_mapping(
    endpoint: &ControlEndpoint,
    remote_host: Option<Ipv4Addr>,
    external_port: NonZeroU16,
    protocol: PortType,
    internal_port: NonZeroU16,
    internal_client: Ipv4Addr,
    description: &str,
    lease_seconds: u32,
) -> ActionRequest {
    endpoint.request(
        "AddAnyPortMapping",
        vec![
            ("NewRemoteHost", v4_field(remote_host)),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol_name(protocol).to_string()),
            ("NewInternalPort", internal_port.to_string()),
            ("NewInternalClient", internal_client.to_string()),
            ("NewEnabled", "1".to_string()),
            ("NewPortMappingDescription", escape_xml(description)),
            ("NewLeaseDuration", lease_seconds.to_string()),
        ],
    )
}

/// `DeletePortMapping`.
pub fn delete_port_mapping(
    endpoint: &ControlEndpoint,
    remote_host: Option<Ipv4Addr>,
    external_port: NonZeroU16,
    protocol: PortType,
) -> ActionRequest {
    endpoint.request(
        "DeletePortMapping",
        vec![
            ("NewRemoteHost", v4_field(remote_host)),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol_name(protocol).to_string()),
        ],
    )
}

/// `GetExternalIPAddress`.
pub fn get_external_ip_address(endpoint: &ControlEndpoint) -> ActionRequest {
    endpoint.request("GetExternalIPAddress", Vec::new())
}

/// `GetSpecificPortMappingEntry`.
pub fn get_specific_port_mapping_entry(
    endpoint: &ControlEndpoint,
    remote_host: Option<Ipv4Addr>,
    external_port: NonZeroU16,
    protocol: PortType,
) -> ActionRequest {
    endpoint.request(
        "GetSpecificPortMappingEntry",
        vec![
            ("NewRemoteHost", v4_field(remote_host)),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol_name(protocol).to_string()),
        ],
    )
}

/// `AddPinhole` on a WANIPv6FirewallControl service.
///
/// `None` addresses and zero ports are wildcards. The lease must be
/// non-zero; the firewall profile has no infinite leases.
pub fn add_pinhole(
    endpoint: &ControlEndpoint,
    remote_host: Option<IpAddr>,
    remote_port: u16,
    internal_client: Option<IpAddr>,
    internal_port: u16,
    protocol: PortType,
    lease_seconds: u32,
) -> Result<ActionRequest, Error> {
    if lease_seconds == 0 {
        return Err(Error::InvalidArgument("pinhole lease must be non-zero"));
    }
    Ok(endpoint.request(
        "AddPinhole",
        vec![
            ("RemoteHost", pinhole_field(remote_host)),
            ("RemotePort", remote_port.to_string()),
            ("InternalClient", pinhole_field(internal_client)),
            ("InternalPort", internal_port.to_string()),
            ("Protocol", u8::from(protocol).to_string()),
            ("LeaseTime", lease_seconds.to_string()),
        ],
    ))
}

/// `DeletePinhole`.
pub fn delete_pinhole(endpoint: &ControlEndpoint, unique_id: &str) -> ActionRequest {
    endpoint.request(
        "DeletePinhole",
        vec![("UniqueID", escape_xml(unique_id))],
    )
}

/// `UpdatePinhole`: extend the lease of an existing pinhole.
pub fn update_pinhole(
    endpoint: &ControlEndpoint,
    unique_id: &str,
    lease_seconds: u32,
) -> Result<ActionRequest, Error> {
    if lease_seconds == 0 {
        return Err(Error::InvalidArgument("pinhole lease must be non-zero"));
    }
    Ok(endpoint.request(
        "UpdatePinhole",
        vec![
            ("UniqueID", escape_xml(unique_id)),
            ("NewLeaseTime", lease_seconds.to_string()),
        ],
    ))
}

/// `GetOutboundPinholeTimeout`.
pub fn get_outbound_pinhole_timeout(
    endpoint: &ControlEndpoint,
    remote_host: Option<IpAddr>,
    remote_port: u16,
    internal_client: Option<IpAddr>,
    internal_port: u16,
    protocol: PortType,
) -> ActionRequest {
    endpoint.request(
        "GetOutboundPinholeTimeout",
        vec![
            ("RemoteHost", pinhole_field(remote_host)),
            ("RemotePort", remote_port.to_string()),
            ("InternalClient", pinhole_field(internal_client)),
            ("InternalPort", internal_port.to_string()),
            ("Protocol", u8::from(protocol).to_string()),
        ],
    )
}

/// `GetFirewallStatus`.
pub fn get_firewall_status(endpoint: &ControlEndpoint) -> ActionRequest {
    endpoint.request("GetFirewallStatus", Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ControlEndpoint {
        ControlEndpoint {
            host: "fake".to_string(),
            control_path: "/controllink".to_string(),
            service_type: "service:type".to_string(),
        }
    }

    fn expected(action: &str, content_length: usize, children: &str) -> String {
        format!(
            "POST /controllink HTTP/1.1\r\n\
             Host: fake\r\n\
             Content-Type: text/xml\r\n\
             SOAPAction: service:type#{action}\r\n\
             Connection: Close\r\n\
             Cache-Control: no-cache\r\n\
             Pragma: no-cache\r\n\
             Content-Length: {content_length}\r\n\
             \r\n\
             <?xml version=\"1.0\"?>\r\n\
             <soap:Envelope xmlns:soap=\"http://www.w3.org/2003/05/soap-envelope/\" \
             soap:encodingStyle=\"http://www.w3.org/2003/05/soap-encoding\">\r\n\
             <soap:Body>\r\n\
             <u:{action} xmlns:u=\"service:type\">\r\n\
             {children}\
             </u:{action}>\r\n\
             </soap:Body>\r\n\
             </soap:Envelope>\r\n"
        )
    }

    #[test]
    fn test_delete_pinhole_dump() {
        let request = delete_pinhole(&endpoint(), "12345");
        let text = String::from_utf8(request.dump()).unwrap();

        assert_eq!(
            text,
            expected("DeletePinhole", 290, "<UniqueID>12345</UniqueID>\r\n")
        );
    }

    #[test]
    fn test_add_pinhole_tcp_with_ipv4_dump() {
        // the firewall profile is IPv6-only on paper, but some gateways
        // accept mapped IPv4 addresses, so they are rendered rather than
        // rejected
        let request = add_pinhole(
            &endpoint(),
            Some("1.2.3.4".parse().unwrap()),
            15,
            Some("5.6.7.8".parse().unwrap()),
            12345,
            PortType::Tcp,
            1000,
        )
        .unwrap();
        let text = String::from_utf8(request.dump()).unwrap();

        assert_eq!(
            text,
            expected(
                "AddPinhole",
                464,
                "<RemoteHost>::ffff:102:304</RemoteHost>\r\n\
                 <RemotePort>15</RemotePort>\r\n\
                 <InternalClient>::ffff:506:708</InternalClient>\r\n\
                 <InternalPort>12345</InternalPort>\r\n\
                 <Protocol>6</Protocol>\r\n\
                 <LeaseTime>1000</LeaseTime>\r\n"
            )
        );
    }

    #[test]
    fn test_add_pinhole_udp_with_ipv6_dump() {
        let request = add_pinhole(
            &endpoint(),
            Some("0102:0304:0506:0708:090a:0b0c:0d0e:0f10".parse().unwrap()),
            15,
            Some("fffe:fdfc:fbfa:f9f8:f7f6:f5f4:f3f2:f1f0".parse().unwrap()),
            12345,
            PortType::Udp,
            1000,
        )
        .unwrap();
        let text = String::from_utf8(request.dump()).unwrap();

        assert_eq!(
            text,
            expected(
                "AddPinhole",
                507,
                "<RemoteHost>102:304:506:708:90a:b0c:d0e:f10</RemoteHost>\r\n\
                 <RemotePort>15</RemotePort>\r\n\
                 <InternalClient>fffe:fdfc:fbfa:f9f8:f7f6:f5f4:f3f2:f1f0</InternalClient>\r\n\
                 <InternalPort>12345</InternalPort>\r\n\
                 <Protocol>17</Protocol>\r\n\
                 <LeaseTime>1000</LeaseTime>\r\n"
            )
        );
    }

    #[test]
    fn test_add_pinhole_wildcards_dump() {
        let request = add_pinhole(&endpoint(), None, 0, None, 0, PortType::Udp, 1000).unwrap();
        let text = String::from_utf8(request.dump()).unwrap();

        assert_eq!(
            text,
            expected(
                "AddPinhole",
                432,
                "<RemoteHost></RemoteHost>\r\n\
                 <RemotePort>0</RemotePort>\r\n\
                 <InternalClient></InternalClient>\r\n\
                 <InternalPort>0</InternalPort>\r\n\
                 <Protocol>17</Protocol>\r\n\
                 <LeaseTime>1000</LeaseTime>\r\n"
            )
        );
    }

    #[test]
    fn test_add_pinhole_rejects_zero_lease() {
        let result = add_pinhole(&endpoint(), None, 0, None, 0, PortType::Udp, 0);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_content_length_matches_body() {
        let request = add_port_mapping(
            &endpoint(),
            None,
            NonZeroU16::new(8080).unwrap(),
            PortType::Tcp,
            NonZeroU16::new(8080).unwrap(),
            "192.168.1.7".parse().unwrap(),
            "portmapper",
            7200,
        );
        let dump = request.dump();
        let text = String::from_utf8(dump).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let declared: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, body.len());
    }

    #[test]
    fn test_add_port_mapping_children_in_order() {
        let request = add_port_mapping(
            &endpoint(),
            None,
            NonZeroU16::new(600).unwrap(),
            PortType::Udp,
            NonZeroU16::new(700).unwrap(),
            "10.0.0.7".parse().unwrap(),
            "a <description>",
            0,
        );
        let text = String::from_utf8(request.dump()).unwrap();
        assert!(text.contains(
            "<NewRemoteHost></NewRemoteHost>\r\n\
             <NewExternalPort>600</NewExternalPort>\r\n\
             <NewProtocol>UDP</NewProtocol>\r\n\
             <NewInternalPort>700</NewInternalPort>\r\n\
             <NewInternalClient>10.0.0.7</NewInternalClient>\r\n\
             <NewEnabled>1</NewEnabled>\r\n\
             <NewPortMappingDescription>a &lt;description&gt;</NewPortMappingDescription>\r\n\
             <NewLeaseDuration>0</NewLeaseDuration>\r\n"
        ));
        assert!(text.contains("SOAPAction: service:type#AddPortMapping"));
    }

    #[test]
    fn test_delete_and_query_children() {
        let request = delete_port_mapping(
            &endpoint(),
            Some("9.9.9.9".parse().unwrap()),
            NonZeroU16::new(600).unwrap(),
            PortType::Tcp,
        );
        let text = String::from_utf8(request.dump()).unwrap();
        assert!(text.contains(
            "<NewRemoteHost>9.9.9.9</NewRemoteHost>\r\n\
             <NewExternalPort>600</NewExternalPort>\r\n\
             <NewProtocol>TCP</NewProtocol>\r\n"
        ));

        let request = update_pinhole(&endpoint(), "99", 1200).unwrap();
        let text = String::from_utf8(request.dump()).unwrap();
        assert!(text.contains("<UniqueID>99</UniqueID>\r\n<NewLeaseTime>1200</NewLeaseTime>\r\n"));
    }
}
