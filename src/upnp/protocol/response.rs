//! Typed views over the answers to the actions in [`super::request`].

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU16;

use crate::Error;

use super::parse_response;

/// An entry returned by `GetSpecificPortMappingEntry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingEntry {
    /// Internal port of the mapping.
    pub internal_port: u16,
    /// Internal client the mapping forwards to.
    pub internal_client: Ipv4Addr,
    /// Whether the mapping is enabled.
    pub enabled: bool,
    /// Description attached to the mapping.
    pub description: String,
    /// Remaining lease duration in seconds, 0 meaning static.
    pub lease_seconds: u32,
}

/// The firewall state reported by `GetFirewallStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallStatus {
    /// Whether the IPv6 firewall is enabled at all.
    pub firewall_enabled: bool,
    /// Whether clients are allowed to create inbound pinholes.
    pub inbound_pinhole_allowed: bool,
}

/// Parse an answer that carries no fields, only success or a fault.
pub fn parse_empty(action: &str, raw: &[u8]) -> Result<(), Error> {
    parse_response(action, raw).map(drop)
}

/// Parse the answer to `GetExternalIPAddress`.
pub fn parse_external_ip_address(raw: &[u8]) -> Result<IpAddr, Error> {
    let fields = parse_response("GetExternalIPAddress", raw)?;
    field(&fields, "NewExternalIPAddress")?
        .parse()
        .map_err(|_| Error::MalformedPacket)
}

/// Parse the answer to `AddAnyPortMapping`: the external port the gateway
/// actually reserved.
pub fn parse_add_any_port_mapping(raw: &[u8]) -> Result<NonZeroU16, Error> {
    let fields = parse_response("AddAnyPortMapping", raw)?;
    let port: u16 = field(&fields, "NewReservedPort")?
        .parse()
        .map_err(|_| Error::MalformedPacket)?;
    port.try_into()
        .map_err(|_| Error::InvalidArgument("gateway reserved port 0"))
}

/// Parse the answer to `AddPinhole`: the identifier of the new pinhole.
pub fn parse_add_pinhole(raw: &[u8]) -> Result<String, Error> {
    let fields = parse_response("AddPinhole", raw)?;
    field(&fields, "UniqueID").map(str::to_string)
}

/// Parse the answer to `GetSpecificPortMappingEntry`.
pub fn parse_specific_port_mapping_entry(raw: &[u8]) -> Result<PortMappingEntry, Error> {
    let fields = parse_response("GetSpecificPortMappingEntry", raw)?;
    Ok(PortMappingEntry {
        internal_port: field(&fields, "NewInternalPort")?
            .parse()
            .map_err(|_| Error::MalformedPacket)?,
        internal_client: field(&fields, "NewInternalClient")?
            .parse()
            .map_err(|_| Error::MalformedPacket)?,
        enabled: bool_field(&fields, "NewEnabled")?,
        description: field(&fields, "NewPortMappingDescription")?.to_string(),
        lease_seconds: field(&fields, "NewLeaseDuration")?
            .parse()
            .map_err(|_| Error::MalformedPacket)?,
    })
}

/// Parse the answer to `GetOutboundPinholeTimeout`, in seconds.
pub fn parse_outbound_pinhole_timeout(raw: &[u8]) -> Result<u32, Error> {
    let fields = parse_response("GetOutboundPinholeTimeout", raw)?;
    field(&fields, "OutboundPinholeTimeout")?
        .parse()
        .map_err(|_| Error::MalformedPacket)
}

/// Parse the answer to `GetFirewallStatus`.
pub fn parse_firewall_status(raw: &[u8]) -> Result<FirewallStatus, Error> {
    let fields = parse_response("GetFirewallStatus", raw)?;
    Ok(FirewallStatus {
        firewall_enabled: bool_field(&fields, "FirewallEnabled")?,
        inbound_pinhole_allowed: bool_field(&fields, "InboundPinholeAllowed")?,
    })
}

fn field<'a>(fields: &'a [(String, String)], name: &str) -> Result<&'a str, Error> {
    fields
        .iter()
        .find(|(field_name, _)| field_name == name)
        .map(|(_, value)| value.as_str())
        .ok_or(Error::MalformedPacket)
}

fn bool_field(fields: &[(String, String)], name: &str) -> Result<bool, Error> {
    match field(fields, name)? {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(Error::MalformedPacket),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_ok(action: &str, children: &str) -> Vec<u8> {
        let body = format!(
            "<?xml version=\"1.0\"?>\r\n\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\">\r\n\
             <s:Body>\r\n\
             <u:{action}Response xmlns:u=\"service:type\">\r\n\
             {children}\
             </u:{action}Response>\r\n\
             </s:Body>\r\n\
             </s:Envelope>\r\n"
        );
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    #[test]
    fn test_parse_external_ip_address() {
        let raw = http_ok(
            "GetExternalIPAddress",
            "<NewExternalIPAddress>203.0.113.9</NewExternalIPAddress>\r\n",
        );
        assert_eq!(
            parse_external_ip_address(&raw).unwrap(),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_add_any_port_mapping() {
        let raw = http_ok("AddAnyPortMapping", "<NewReservedPort>60123</NewReservedPort>\r\n");
        assert_eq!(parse_add_any_port_mapping(&raw).unwrap().get(), 60123);
    }

    #[test]
    fn test_parse_add_pinhole() {
        let raw = http_ok("AddPinhole", "<UniqueID>42</UniqueID>\r\n");
        assert_eq!(parse_add_pinhole(&raw).unwrap(), "42");
    }

    #[test]
    fn test_parse_empty_response() {
        let raw = http_ok("DeletePortMapping", "");
        assert!(parse_empty("DeletePortMapping", &raw).is_ok());
        // fields of another action don't satisfy this one
        assert!(parse_empty("AddPortMapping", &raw).is_err());
    }

    #[test]
    fn test_parse_specific_port_mapping_entry() {
        let raw = http_ok(
            "GetSpecificPortMappingEntry",
            "<NewInternalPort>9999</NewInternalPort>\r\n\
             <NewInternalClient>192.168.1.7</NewInternalClient>\r\n\
             <NewEnabled>1</NewEnabled>\r\n\
             <NewPortMappingDescription>portmapper</NewPortMappingDescription>\r\n\
             <NewLeaseDuration>3600</NewLeaseDuration>\r\n",
        );
        assert_eq!(
            parse_specific_port_mapping_entry(&raw).unwrap(),
            PortMappingEntry {
                internal_port: 9999,
                internal_client: "192.168.1.7".parse().unwrap(),
                enabled: true,
                description: "portmapper".to_string(),
                lease_seconds: 3600,
            }
        );
    }

    #[test]
    fn test_parse_firewall_status() {
        let raw = http_ok(
            "GetFirewallStatus",
            "<FirewallEnabled>1</FirewallEnabled>\r\n\
             <InboundPinholeAllowed>0</InboundPinholeAllowed>\r\n",
        );
        assert_eq!(
            parse_firewall_status(&raw).unwrap(),
            FirewallStatus {
                firewall_enabled: true,
                inbound_pinhole_allowed: false,
            }
        );
    }

    #[test]
    fn test_parse_outbound_pinhole_timeout() {
        let raw = http_ok(
            "GetOutboundPinholeTimeout",
            "<OutboundPinholeTimeout>35</OutboundPinholeTimeout>\r\n",
        );
        assert_eq!(parse_outbound_pinhole_timeout(&raw).unwrap(), 35);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let raw = http_ok(
            "GetExternalIPAddress",
            "<SomethingElse>1</SomethingElse>\r\n\
             <NewExternalIPAddress>203.0.113.9</NewExternalIPAddress>\r\n",
        );
        assert!(parse_external_ip_address(&raw).is_ok());
    }
}
