//! Helpers for finding the gateways and local addresses to map from.
//!
//! Every local interface with a gateway is a discovery candidate; a host may
//! sit behind several (a VPN owning the default route next to a residential
//! router, container networking, a multi-homed box), and the one speaking a
//! mapping protocol is not necessarily the default route. The platform APIs
//! (via `default-net`) are tried first. Some environments (containers,
//! stripped-down distros, locked-down Android builds) return nothing there
//! while the route command still works, so the routing table output is
//! parsed as a fallback.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context, Result};
use tracing::debug;

/// A local interface together with the gateway reachable through it.
///
/// This is used as the destination for UPnP, NAT-PMP and PCP queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GatewayCandidate {
    /// Name of the interface.
    pub interface: String,
    /// Ip of the gateway behind the interface.
    pub gateway: IpAddr,
    /// Local IPv4 address on the interface, if any.
    pub local_v4: Option<Ipv4Addr>,
    /// Local global-scope IPv6 address on the interface, if any.
    pub local_v6: Option<Ipv6Addr>,
}

impl GatewayCandidate {
    /// The local/gateway pair a PCP exchange would use. PCP is dual stack;
    /// the local address has to match the gateway's family.
    pub fn pcp_route(&self) -> Option<(IpAddr, IpAddr)> {
        match self.gateway {
            IpAddr::V4(_) => self
                .local_v4
                .map(|local| (IpAddr::V4(local), self.gateway)),
            IpAddr::V6(_) => self
                .local_v6
                .map(|local| (IpAddr::V6(local), self.gateway)),
        }
    }

    /// The local/gateway pair a NAT-PMP exchange would use. NAT-PMP is IPv4
    /// only.
    pub fn pmp_route(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        match (self.local_v4, self.gateway) {
            (Some(local), IpAddr::V4(gateway)) => Some((local, gateway)),
            _ => None,
        }
    }
}

/// Enumerate every interface that has a gateway, the default route first.
///
/// Falls back to the route command when the platform APIs come up empty.
pub(crate) async fn gateway_candidates() -> Result<Vec<GatewayCandidate>> {
    let mut candidates: Vec<GatewayCandidate> = default_net::get_interfaces()
        .into_iter()
        .filter_map(candidate_from_interface)
        .collect();

    // the default route is the most likely home router, try it first
    if let Ok(default) = default_net::get_default_interface() {
        if let Some(position) = candidates
            .iter()
            .position(|candidate| candidate.interface == default.name)
        {
            candidates[..=position].rotate_right(1);
        }
    }

    if candidates.is_empty() {
        let gateway = route_table_gateway()
            .await
            .context("no gateway found on any interface")?;
        let local_v4 = match default_net::interface::get_local_ipaddr() {
            Some(IpAddr::V4(local)) => Some(local),
            _ => None,
        };
        candidates.push(GatewayCandidate {
            interface: "default".to_string(),
            gateway,
            local_v4,
            local_v6: local_ipv6(),
        });
    }

    debug!("gateway candidates: {candidates:?}");
    Ok(candidates)
}

fn candidate_from_interface(
    interface: default_net::interface::Interface,
) -> Option<GatewayCandidate> {
    let gateway = interface.gateway?;
    let local_v4 = interface
        .ipv4
        .iter()
        .map(|net| net.addr)
        .find(is_usable_v4);
    let local_v6 = interface
        .ipv6
        .iter()
        .map(|net| net.addr)
        .find(is_global_v6);
    Some(GatewayCandidate {
        interface: interface.name,
        gateway: gateway.ip_addr,
        local_v4,
        local_v6,
    })
}

/// A local IPv6 address suitable for an inbound firewall pinhole: global
/// scope, so the firewall can address it from the outside.
fn local_ipv6() -> Option<Ipv6Addr> {
    default_net::get_interfaces()
        .into_iter()
        .flat_map(|interface| interface.ipv6)
        .map(|net| net.addr)
        .find(is_global_v6)
}

fn is_usable_v4(addr: &Ipv4Addr) -> bool {
    !addr.is_unspecified() && !addr.is_loopback() && !addr.is_multicast()
}

fn is_global_v6(addr: &Ipv6Addr) -> bool {
    let is_link_local = addr.segments()[0] & 0xffc0 == 0xfe80;
    let is_unique_local = addr.segments()[0] & 0xfe00 == 0xfc00;
    !addr.is_loopback() && !addr.is_unspecified() && !is_link_local && !is_unique_local
}

/// Ask the routing table for the default gateway by running the platform's
/// route command.
pub(crate) async fn route_table_gateway() -> Option<IpAddr> {
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    return None;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let (command, args, parse): (_, &[&str], fn(&str) -> Option<IpAddr>) =
        ("ip", &["route", "show", "default"], parse_ip_route);
    #[cfg(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "macos",
        target_os = "ios"
    ))]
    let (command, args, parse): (_, &[&str], fn(&str) -> Option<IpAddr>) =
        ("netstat", &["-rn"], parse_netstat);
    #[cfg(target_os = "windows")]
    let (command, args, parse): (_, &[&str], fn(&str) -> Option<IpAddr>) =
        ("ipconfig", &[], parse_ipconfig);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    ))]
    {
        let stdout = run_command(command, args).await?;
        parse(&stdout)
    }
}

#[allow(dead_code)]
async fn run_command(command: &str, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new(command)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => String::from_utf8(output.stdout).ok(),
        Ok(output) => {
            debug!("{command} exited with {}", output.status);
            None
        }
        Err(e) => {
            debug!("failed to run {command}: {e}");
            None
        }
    }
}

/// Parses the gateway out of `ip route show default` output.
///
/// Searches for a line like `default via 192.168.1.1 dev wlan0 proto dhcp`.
#[allow(dead_code)]
fn parse_ip_route(stdout: &str) -> Option<IpAddr> {
    for line in stdout.lines() {
        let mut fields = line.split_ascii_whitespace();
        if fields.next() != Some("default") {
            continue;
        }
        if fields.next() != Some("via") {
            continue;
        }
        if let Some(addr) = fields.next().and_then(|f| f.parse().ok()) {
            return Some(addr);
        }
    }
    None
}

/// Parses the gateway out of `netstat -rn` output.
///
/// Searches for a line like `default  192.168.1.1  UGScg  en0` in the
/// routing table dump.
#[allow(dead_code)]
fn parse_netstat(stdout: &str) -> Option<IpAddr> {
    for line in stdout.lines() {
        let mut fields = line.split_ascii_whitespace();
        if !matches!(fields.next(), Some("default") | Some("0.0.0.0")) {
            continue;
        }
        if let Some(addr) = fields.next().and_then(|f| f.parse().ok()) {
            return Some(addr);
        }
    }
    None
}

/// Parses the gateway out of `ipconfig` output.
///
/// Searches for a line like `Default Gateway . . . . . . . . . : 192.168.1.1`.
#[allow(dead_code)]
fn parse_ipconfig(stdout: &str) -> Option<IpAddr> {
    for line in stdout.lines() {
        if !line.trim_start().starts_with("Default Gateway") {
            continue;
        }
        if let Some(addr) = line
            .rsplit_once(':')
            .and_then(|(_, value)| value.trim().parse().ok())
        {
            return Some(addr);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_route() {
        let stdout = "default via 192.168.178.1 dev wlp3s0 proto dhcp metric 600\n";
        assert_eq!(
            parse_ip_route(stdout),
            Some("192.168.178.1".parse().unwrap())
        );
        assert_eq!(parse_ip_route("10.0.0.0/24 dev eth0 scope link\n"), None);
    }

    #[test]
    fn test_parse_netstat() {
        let stdout = "\
Routing tables

Internet:
Destination        Gateway            Flags               Netif Expire
default            192.168.1.1        UGScg                 en0
127                127.0.0.1          UCS                   lo0

Internet6:
Destination        Gateway            Flags               Netif Expire
default            fe80::1%en0        UGcg                  en0
";
        assert_eq!(parse_netstat(stdout), Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_ipconfig() {
        let stdout = "\
Ethernet adapter Ethernet:

   Connection-specific DNS Suffix  . : home
   IPv4 Address. . . . . . . . . . . : 192.168.1.17
   Subnet Mask . . . . . . . . . . . : 255.255.255.0
   Default Gateway . . . . . . . . . : 192.168.1.1
";
        assert_eq!(parse_ipconfig(stdout), Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_is_global_v6() {
        assert!(is_global_v6(&"2001:db8::7".parse().unwrap()));
        assert!(!is_global_v6(&"fe80::1".parse().unwrap()));
        assert!(!is_global_v6(&"fd00::1".parse().unwrap()));
        assert!(!is_global_v6(&Ipv6Addr::LOCALHOST));
        assert!(!is_global_v6(&Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn test_routes_match_the_gateway_family() {
        let dual = GatewayCandidate {
            interface: "eth0".to_string(),
            gateway: "192.168.1.1".parse().unwrap(),
            local_v4: Some("192.168.1.7".parse().unwrap()),
            local_v6: Some("2001:db8::7".parse().unwrap()),
        };
        assert_eq!(
            dual.pcp_route(),
            Some(("192.168.1.7".parse().unwrap(), "192.168.1.1".parse().unwrap()))
        );
        assert_eq!(
            dual.pmp_route(),
            Some(("192.168.1.7".parse().unwrap(), "192.168.1.1".parse().unwrap()))
        );

        // an IPv6 gateway still gets a PCP route, never a NAT-PMP one
        let v6_only = GatewayCandidate {
            interface: "wg0".to_string(),
            gateway: "fe80::1".parse().unwrap(),
            local_v4: None,
            local_v6: Some("2001:db8::9".parse().unwrap()),
        };
        assert_eq!(
            v6_only.pcp_route(),
            Some(("2001:db8::9".parse().unwrap(), "fe80::1".parse().unwrap()))
        );
        assert_eq!(v6_only.pmp_route(), None);

        // no address of the gateway's family means no route
        let mismatched = GatewayCandidate {
            interface: "eth1".to_string(),
            gateway: "10.0.0.1".parse().unwrap(),
            local_v4: None,
            local_v6: Some("2001:db8::a".parse().unwrap()),
        };
        assert_eq!(mismatched.pcp_route(), None);
        assert_eq!(mismatched.pmp_route(), None);
    }
}
