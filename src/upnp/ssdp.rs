//! SSDP discovery of IGD control endpoints.
//!
//! An M-SEARCH is multicast for every service profile of interest; gateways
//! answer with a unicast HTTP-over-UDP response whose `LOCATION` header
//! points at the device description. The description's device tree is then
//! walked for matching services and their control URLs.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, trace};
use url::Url;
use xmltree::{Element, XMLNode};

use crate::Error;

use super::{protocol::HttpResponse, ServiceKind};

/// The SSDP multicast group.
pub(super) const SSDP_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// The SSDP port.
pub(super) const SSDP_PORT: u16 = 1900;

/// How long gateways get to answer an M-SEARCH.
pub(super) const SEARCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for fetching a device description.
const FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// A service advertised by a gateway, located and classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct DiscoveredService {
    /// Which profile the service implements.
    pub kind: ServiceKind,
    /// The exact service type URN the device advertised.
    pub service_type: String,
    /// Resolved control URL for SOAP actions.
    pub control_url: Url,
    /// The local address the search that found the service was bound to,
    /// when it was bound to a specific interface.
    pub local_ip: Option<Ipv4Addr>,
}

/// The M-SEARCH datagram for a search target.
pub(super) fn m_search(target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST}:{SSDP_PORT}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 1\r\n\
         ST: {target}\r\n\
         \r\n"
    )
}

/// Extract the device description URL out of an M-SEARCH answer.
pub(super) fn location_from_response(text: &str) -> Option<Url> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("location"))
        .and_then(|(_, value)| Url::parse(value.trim()).ok())
}

/// Walk the description's device tree and collect every matching service,
/// resolving control URLs against the description location.
pub(super) fn services_from_description(
    location: &Url,
    body: &[u8],
) -> Result<Vec<DiscoveredService>, Error> {
    let root = Element::parse(body).map_err(|_| Error::MalformedPacket)?;
    let device = root.get_child("device").ok_or(Error::MalformedPacket)?;

    let mut services = Vec::new();
    collect_services(location, device, &mut services);
    Ok(services)
}

fn collect_services(location: &Url, device: &Element, out: &mut Vec<DiscoveredService>) {
    if let Some(list) = device.get_child("serviceList") {
        for service in children_named(list, "service") {
            let Some(service_type) = child_text(service, "serviceType") else {
                continue;
            };
            let Some(kind) = ServiceKind::from_urn(&service_type) else {
                continue;
            };
            let Some(control) = child_text(service, "controlURL") else {
                continue;
            };
            match location.join(control.trim()) {
                Ok(control_url) => out.push(DiscoveredService {
                    kind,
                    service_type,
                    control_url,
                    local_ip: None,
                }),
                Err(e) => trace!("unusable control url {control:?}: {e}"),
            }
        }
    }
    if let Some(list) = device.get_child("deviceList") {
        for sub_device in children_named(list, "device") {
            collect_services(location, sub_device, out);
        }
    }
}

fn children_named<'a>(element: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> {
    element
        .children
        .iter()
        .filter_map(XMLNode::as_element)
        .filter(move |child| child.name == name)
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .and_then(|child| child.get_text())
        .map(|text| text.trim().to_string())
}

/// Multicast an M-SEARCH for every profile and return the services of every
/// gateway that answered within the window.
///
/// Binding to a specific local address sends the search out of that
/// interface; searches across interfaces run as separate calls.
pub(super) async fn search(local: Option<Ipv4Addr>) -> Result<Vec<DiscoveredService>, Error> {
    let socket = UdpSocket::bind((local.unwrap_or(Ipv4Addr::UNSPECIFIED), 0)).await?;
    let destination = SocketAddrV4::new(SSDP_MULTICAST, SSDP_PORT);
    for kind in ServiceKind::ALL {
        socket
            .send_to(m_search(kind.urn()).as_bytes(), destination)
            .await?;
    }

    let mut locations = Vec::new();
    let mut seen = HashSet::new();
    let deadline = tokio::time::Instant::now() + SEARCH_TIMEOUT;
    let mut buf = vec![0u8; 2048];
    loop {
        let received =
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_elapsed) => break,
                Ok(received) => received,
            };
        let (read, from) = received?;
        let Ok(text) = std::str::from_utf8(&buf[..read]) else {
            continue;
        };
        match location_from_response(text) {
            Some(location) => {
                trace!("ssdp answer from {from}: {location}");
                if seen.insert(location.clone()) {
                    locations.push(location);
                }
            }
            None => trace!("ssdp answer from {from} without a location"),
        }
    }

    let mut services: Vec<DiscoveredService> = Vec::new();
    for location in locations {
        match fetch_description(&location).await {
            Ok(body) => match services_from_description(&location, &body) {
                Ok(found) => {
                    for mut service in found {
                        service.local_ip = local;
                        if !services.contains(&service) {
                            services.push(service);
                        }
                    }
                }
                Err(e) => debug!("unusable device description at {location}: {e}"),
            },
            Err(e) => debug!("failed to fetch device description at {location}: {e}"),
        }
    }
    Ok(services)
}

/// Fetch a device description with a plain HTTP GET.
async fn fetch_description(location: &Url) -> Result<Vec<u8>, Error> {
    if location.scheme() != "http" {
        return Err(Error::Unsupported);
    }
    let host = location.host_str().ok_or(Error::MalformedPacket)?;
    let port = location.port().unwrap_or(80);

    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Close\r\n\
         \r\n",
        location.path(),
        authority(location)
    );

    let fetch = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(request.as_bytes()).await?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        Ok::<_, std::io::Error>(raw)
    };
    let raw = tokio::time::timeout(FETCH_TIMEOUT, fetch)
        .await
        .map_err(|_| Error::Timeout)??;

    let response = HttpResponse::parse(&raw)?;
    if response.status != 200 {
        return Err(Error::MalformedPacket);
    }
    Ok(response.body)
}

/// The `Host` header form of a URL: host, plus the port when explicit.
pub(super) fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_m_search_format() {
        let datagram = m_search("urn:schemas-upnp-org:service:WANIPConnection:1");
        assert_eq!(
            datagram,
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 1\r\n\
             ST: urn:schemas-upnp-org:service:WANIPConnection:1\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_location_from_response() {
        let response = "HTTP/1.1 200 OK\r\n\
            CACHE-CONTROL: max-age=120\r\n\
            ST: urn:schemas-upnp-org:service:WANIPConnection:1\r\n\
            USN: uuid:abc::urn:schemas-upnp-org:service:WANIPConnection:1\r\n\
            Location: http://192.168.1.1:5000/rootDesc.xml\r\n\
            \r\n";
        assert_eq!(
            location_from_response(response).unwrap().as_str(),
            "http://192.168.1.1:5000/rootDesc.xml"
        );
        assert_eq!(location_from_response("HTTP/1.1 200 OK\r\n\r\n"), None);
    }

    #[test]
    fn test_services_from_description() {
        let description = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/ctl/L3F</controlURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                <controlURL>/ctl/IPConn</controlURL>
              </service>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPv6FirewallControl:1</serviceType>
                <controlURL>http://192.168.1.1:5000/ctl/IP6FCtl</controlURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#;
        let location = Url::parse("http://192.168.1.1:5000/rootDesc.xml").unwrap();

        let services = services_from_description(&location, description.as_bytes()).unwrap();

        assert_eq!(services.len(), 2);
        assert_eq!(services[0].kind, ServiceKind::WanIpV1);
        assert_eq!(
            services[0].control_url.as_str(),
            "http://192.168.1.1:5000/ctl/IPConn"
        );
        assert_eq!(services[1].kind, ServiceKind::Ipv6Firewall);
        assert_eq!(
            services[1].control_url.as_str(),
            "http://192.168.1.1:5000/ctl/IP6FCtl"
        );
    }

    #[test]
    fn test_description_without_device_is_rejected() {
        let result = services_from_description(
            &Url::parse("http://192.168.1.1/desc.xml").unwrap(),
            b"<root></root>",
        );
        assert!(matches!(result, Err(Error::MalformedPacket)));
    }

    #[test]
    fn test_authority_includes_explicit_port() {
        let url = Url::parse("http://192.168.1.1:5000/rootDesc.xml").unwrap();
        assert_eq!(authority(&url), "192.168.1.1:5000");
        let url = Url::parse("http://192.168.1.1/rootDesc.xml").unwrap();
        assert_eq!(authority(&url), "192.168.1.1");
    }
}
