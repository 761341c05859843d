//! The SOAP-over-HTTP wire format spoken by IGD control endpoints.
//!
//! Requests are produced byte-exact: the gateway ecosystem is full of
//! fragile HTTP parsers, so the header order, the envelope text and the
//! `Content-Length` are all fixed here rather than left to an HTTP client.

use std::fmt;

use xmltree::{Element, XMLNode};

use crate::Error;

pub mod request;
pub mod response;

pub use request::ControlEndpoint;

/// A single SOAP action ready to be sent to a control endpoint.
///
/// Carries the host authority, the control URL path, the service type URN,
/// the action name and the ordered child element list. [`ActionRequest::dump`]
/// produces the canonical HTTP/1.1 byte form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub(super) host: String,
    pub(super) control_path: String,
    pub(super) service_type: String,
    pub(super) action: &'static str,
    /// Child elements in document order. Values are already XML-escaped.
    pub(super) arguments: Vec<(&'static str, String)>,
}

impl ActionRequest {
    /// The canonical byte form of this request: an HTTP/1.1 POST whose
    /// `Content-Length` is the exact byte length of the SOAP body.
    pub fn dump(&self) -> Vec<u8> {
        let mut body = String::from("<?xml version=\"1.0\"?>\r\n");
        body.push_str(
            "<soap:Envelope xmlns:soap=\"http://www.w3.org/2003/05/soap-envelope/\" \
             soap:encodingStyle=\"http://www.w3.org/2003/05/soap-encoding\">\r\n",
        );
        body.push_str("<soap:Body>\r\n");
        body.push_str(&format!(
            "<u:{} xmlns:u=\"{}\">\r\n",
            self.action, self.service_type
        ));
        for (name, value) in &self.arguments {
            body.push_str(&format!("<{name}>{value}</{name}>\r\n"));
        }
        body.push_str(&format!("</u:{}>\r\n", self.action));
        body.push_str("</soap:Body>\r\n");
        body.push_str("</soap:Envelope>\r\n");

        let mut buf = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: text/xml\r\n\
             SOAPAction: {}#{}\r\n\
             Connection: Close\r\n\
             Cache-Control: no-cache\r\n\
             Pragma: no-cache\r\n\
             Content-Length: {}\r\n\
             \r\n",
            self.control_path,
            self.host,
            self.service_type,
            self.action,
            body.len()
        )
        .into_bytes();
        buf.extend_from_slice(body.as_bytes());
        buf
    }

    /// The action name this request performs.
    pub fn action(&self) -> &'static str {
        self.action
    }
}

/// Escape text for use as an XML element value.
pub(super) fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Fault reported by the IGD for a SOAP action.
///
/// IGD:1 and IGD:2 disagree on some error codes (a conflicting mapping is
/// 718 on the former and 725 on the latter), so both the raw SOAP fault and
/// the UPnP-specific code are kept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct SoapFault {
    /// HTTP status code of the response carrying the fault.
    pub http_status: u16,
    /// Raw `<faultcode>` value.
    pub fault_code: String,
    /// Raw `<faultstring>` value.
    pub fault_string: String,
    /// `<UPnPError><errorCode>` when present.
    pub upnp_error_code: Option<u16>,
    /// `<UPnPError><errorDescription>` when present.
    pub upnp_error_description: Option<String>,
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, http status {}",
            self.fault_string, self.fault_code, self.http_status
        )?;
        if let Some(code) = self.upnp_error_code {
            write!(f, ", upnp error {code}")?;
        }
        write!(f, ")")
    }
}

/// A parsed HTTP/1.1 response: status line, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code from the status line.
    pub status: u16,
    /// Header name/value pairs in wire order.
    pub headers: Vec<(String, String)>,
    /// The bytes following the blank line.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Parse raw response bytes. The transport reads to EOF (`Connection:
    /// Close`), but a `Content-Length` header still bounds the body when
    /// present.
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let header_end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or(Error::MalformedPacket)?;
        let head = std::str::from_utf8(&raw[..header_end]).map_err(|_| Error::MalformedPacket)?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().ok_or(Error::MalformedPacket)?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().ok_or(Error::MalformedPacket)?;
        if !version.starts_with("HTTP/") {
            return Err(Error::MalformedPacket);
        }
        let status = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(Error::MalformedPacket)?;

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or(Error::MalformedPacket)?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut body = raw[header_end + 4..].to_vec();
        let content_length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok());
        if let Some(len) = content_length {
            if len > body.len() {
                return Err(Error::MalformedPacket);
            }
            body.truncate(len);
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Decode the SOAP answer to `action`.
///
/// A `200 OK` yields the ordered children of `<ACTIONResponse>`; anything
/// else is expected to carry a `<Fault>` and surfaces as [`Error::Soap`].
/// Unknown elements inside the response are kept (callers pick the fields
/// they need); unknown top-level XML is malformed.
pub fn parse_response(action: &str, raw: &[u8]) -> Result<Vec<(String, String)>, Error> {
    let http = HttpResponse::parse(raw)?;
    let envelope =
        Element::parse(http.body.as_slice()).map_err(|_| Error::MalformedPacket)?;
    if envelope.name != "Envelope" {
        return Err(Error::MalformedPacket);
    }
    let body = envelope.get_child("Body").ok_or(Error::MalformedPacket)?;

    if http.status == 200 {
        let response_name = format!("{action}Response");
        let response = body
            .get_child(response_name.as_str())
            .ok_or(Error::MalformedPacket)?;
        let fields = response
            .children
            .iter()
            .filter_map(XMLNode::as_element)
            .map(|child| {
                let value = child.get_text().map(|t| t.into_owned()).unwrap_or_default();
                (child.name.clone(), value)
            })
            .collect();
        Ok(fields)
    } else {
        Err(Error::Soap(parse_fault(http.status, body)?))
    }
}

fn parse_fault(http_status: u16, body: &Element) -> Result<SoapFault, Error> {
    let fault = body.get_child("Fault").ok_or(Error::MalformedPacket)?;
    let child_text = |name: &str| {
        fault
            .get_child(name)
            .and_then(|c| c.get_text())
            .map(|t| t.into_owned())
    };
    let fault_code = child_text("faultcode").unwrap_or_default();
    let fault_string = child_text("faultstring").unwrap_or_default();

    let upnp_error = fault
        .get_child("detail")
        .and_then(|detail| detail.get_child("UPnPError"));
    let upnp_error_code = upnp_error
        .and_then(|e| e.get_child("errorCode"))
        .and_then(|c| c.get_text())
        .and_then(|t| t.trim().parse().ok());
    let upnp_error_description = upnp_error
        .and_then(|e| e.get_child("errorDescription"))
        .and_then(|c| c.get_text())
        .map(|t| t.into_owned());

    Ok(SoapFault {
        http_status,
        fault_code,
        fault_string,
        upnp_error_code,
        upnp_error_description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
        assert_eq!(escape_xml("plain"), "plain");
    }

    #[test]
    fn test_parse_http_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: 5\r\n\r\nhellotrailing";
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers,
            vec![
                ("Content-Type".to_string(), "text/xml".to_string()),
                ("Content-Length".to_string(), "5".to_string()),
            ]
        );
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_parse_http_response_without_blank_line_fails() {
        assert!(matches!(
            HttpResponse::parse(b"HTTP/1.1 200 OK\r\n"),
            Err(Error::MalformedPacket)
        ));
    }

    #[test]
    fn test_parse_successful_soap_response() {
        let body = "<?xml version=\"1.0\"?>\r\n\
            <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\">\r\n\
            <s:Body>\r\n\
            <u:GetExternalIPAddressResponse xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">\r\n\
            <NewExternalIPAddress>203.0.113.7</NewExternalIPAddress>\r\n\
            </u:GetExternalIPAddressResponse>\r\n\
            </s:Body>\r\n\
            </s:Envelope>";
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        let fields = parse_response("GetExternalIPAddress", raw.as_bytes()).unwrap();
        assert_eq!(
            fields,
            vec![("NewExternalIPAddress".to_string(), "203.0.113.7".to_string())]
        );
    }

    #[test]
    fn test_parse_fault_preserves_both_codes() {
        let body = "<?xml version=\"1.0\"?>\r\n\
            <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\">\r\n\
            <s:Body>\r\n\
            <s:Fault>\r\n\
            <faultcode>s:Client</faultcode>\r\n\
            <faultstring>UPnPError</faultstring>\r\n\
            <detail>\r\n\
            <UPnPError xmlns=\"urn:schemas-upnp-org:control-1-0\">\r\n\
            <errorCode>718</errorCode>\r\n\
            <errorDescription>ConflictInMappingEntry</errorDescription>\r\n\
            </UPnPError>\r\n\
            </detail>\r\n\
            </s:Fault>\r\n\
            </s:Body>\r\n\
            </s:Envelope>";
        let raw = format!(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        let err = parse_response("AddPortMapping", raw.as_bytes()).unwrap_err();
        let Error::Soap(fault) = err else {
            panic!("expected a soap fault, got {err:?}");
        };
        assert_eq!(fault.http_status, 500);
        assert_eq!(fault.fault_code, "s:Client");
        assert_eq!(fault.fault_string, "UPnPError");
        assert_eq!(fault.upnp_error_code, Some(718));
        assert_eq!(
            fault.upnp_error_description.as_deref(),
            Some("ConflictInMappingEntry")
        );
    }

    #[test]
    fn test_unknown_top_level_xml_is_rejected() {
        let body = "<not-soap></not-soap>";
        let raw = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
        assert!(matches!(
            parse_response("GetExternalIPAddress", raw.as_bytes()),
            Err(Error::MalformedPacket)
        ));
    }
}
