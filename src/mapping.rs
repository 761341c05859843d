//! A port mapping created with one of the supported protocols.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    num::NonZeroU16,
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{nat_pmp, pcp, upnp, Error, PortType};

/// Margin subtracted from the lease to schedule a renewal: a mapping is
/// renewed at `expiry - max(60s, lifetime / 2)`.
const RENEW_SAFETY_MARGIN: Duration = Duration::from_secs(60);

pub(super) trait PortMapped: std::fmt::Debug + Unpin {
    /// The endpoint the mapping can be reached at from the outside.
    fn external(&self) -> (IpAddr, NonZeroU16);
    /// Lease granted by the gateway.
    fn lifetime(&self) -> Duration;
    /// How long after it was obtained the mapping should be renewed.
    fn renew_after(&self) -> Duration {
        let lifetime = self.lifetime();
        lifetime.saturating_sub(RENEW_SAFETY_MARGIN.max(lifetime / 2))
    }
}

/// A port mapping created with one of the supported protocols.
#[derive(derive_more::Debug)]
pub enum Mapping {
    /// A PCP mapping.
    #[debug("{_0:?}")]
    Pcp(pcp::Mapping),
    /// A NAT-PMP mapping.
    #[debug("{_0:?}")]
    NatPmp(nat_pmp::Mapping),
    /// A UPnP IGD port mapping.
    #[debug("{_0:?}")]
    Upnp(upnp::Mapping),
    /// An IPv6 firewall pinhole.
    #[debug("{_0:?}")]
    Pinhole(upnp::Pinhole),
}

impl Mapping {
    /// Create a new PCP mapping.
    pub(crate) async fn new_pcp(
        local_ip: IpAddr,
        local_port: NonZeroU16,
        gateway: IpAddr,
        protocol: PortType,
        external_addr: Option<(IpAddr, NonZeroU16)>,
        lifetime_seconds: u32,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        pcp::Mapping::new(
            local_ip,
            local_port,
            gateway,
            protocol,
            external_addr,
            lifetime_seconds,
            cancel,
        )
        .await
        .map(Self::Pcp)
    }

    /// Create a new NAT-PMP mapping.
    pub(crate) async fn new_nat_pmp(
        local_ip: Ipv4Addr,
        local_port: NonZeroU16,
        gateway: Ipv4Addr,
        protocol: PortType,
        external_port: Option<NonZeroU16>,
        lifetime_seconds: u32,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        nat_pmp::Mapping::new(
            local_ip,
            local_port,
            gateway,
            protocol,
            external_port,
            lifetime_seconds,
            cancel,
        )
        .await
        .map(Self::NatPmp)
    }

    /// Create a new UPnP mapping.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new_upnp(
        locals: &[Ipv4Addr],
        local_port: NonZeroU16,
        gateway: Option<upnp::Gateway>,
        external_port: Option<NonZeroU16>,
        protocol: PortType,
        lifetime_seconds: u32,
        description: String,
    ) -> Result<Self, Error> {
        upnp::Mapping::new(
            locals,
            local_port,
            gateway,
            external_port,
            protocol,
            lifetime_seconds,
            description,
        )
        .await
        .map(Self::Upnp)
    }

    /// Open a new IPv6 firewall pinhole.
    pub(crate) async fn new_pinhole(
        locals: &[Ipv4Addr],
        local_ip: Ipv6Addr,
        local_port: NonZeroU16,
        gateway: Option<upnp::Gateway>,
        protocol: PortType,
        lifetime_seconds: u32,
    ) -> Result<Self, Error> {
        upnp::Pinhole::new(locals, local_ip, local_port, gateway, protocol, lifetime_seconds)
            .await
            .map(Self::Pinhole)
    }

    /// Release the mapping.
    pub(crate) async fn release(self) -> Result<(), Error> {
        match self {
            Mapping::Pcp(m) => m.release().await,
            Mapping::NatPmp(m) => m.release().await,
            Mapping::Upnp(m) => m.release().await,
            Mapping::Pinhole(m) => m.release().await,
        }
    }

    /// Renew the mapping once.
    pub(crate) async fn refresh(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        match self {
            Mapping::Pcp(m) => m.refresh(cancel).await,
            Mapping::NatPmp(m) => m.refresh(cancel).await,
            Mapping::Upnp(m) => m.refresh().await,
            Mapping::Pinhole(m) => m.refresh().await,
        }
    }

    /// Renew the mapping, retrying transient failures with an exponential
    /// backoff capped at a quarter of the lease.
    ///
    /// Gives up with [`Error::MappingLost`] on a non-retryable failure, or
    /// once the lease itself would have elapsed.
    pub(crate) async fn refresh_with_backoff(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let lifetime = self.lifetime();
        let cap = (lifetime / 4).max(Duration::from_secs(1));
        let deadline = tokio::time::Instant::now() + lifetime;
        let mut delay = Duration::from_secs(1).min(cap);
        loop {
            match self.refresh(cancel).await {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_retryable() => {
                    let wake_up = tokio::time::Instant::now() + delay;
                    if wake_up >= deadline {
                        debug!("giving up renewal, lease elapsed: {e}");
                        return Err(Error::MappingLost);
                    }
                    debug!("transient renewal failure, retrying in {delay:?}: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep_until(wake_up) => {}
                    }
                    delay = (delay * 2).min(cap);
                }
                Err(e) => {
                    debug!("renewal failed: {e}");
                    return Err(Error::MappingLost);
                }
            }
        }
    }
}

impl PortMapped for Mapping {
    fn external(&self) -> (IpAddr, NonZeroU16) {
        match self {
            Mapping::Pcp(m) => m.external(),
            Mapping::NatPmp(m) => m.external(),
            Mapping::Upnp(m) => m.external(),
            Mapping::Pinhole(m) => m.external(),
        }
    }

    fn lifetime(&self) -> Duration {
        match self {
            Mapping::Pcp(m) => m.lifetime(),
            Mapping::NatPmp(m) => m.lifetime(),
            Mapping::Upnp(m) => m.lifetime(),
            Mapping::Pinhole(m) => m.lifetime(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedLifetime(Duration);

    impl PortMapped for FixedLifetime {
        fn external(&self) -> (IpAddr, NonZeroU16) {
            (IpAddr::V4(Ipv4Addr::LOCALHOST), NonZeroU16::new(1).unwrap())
        }

        fn lifetime(&self) -> Duration {
            self.0
        }
    }

    #[test]
    fn test_renew_after_keeps_the_safety_margin() {
        // long leases renew at half time
        let two_hours = FixedLifetime(Duration::from_secs(7200));
        assert_eq!(two_hours.renew_after(), Duration::from_secs(3600));

        // short leases renew at least a minute before expiry
        let brief = FixedLifetime(Duration::from_secs(100));
        assert_eq!(brief.renew_after(), Duration::from_secs(40));

        // leases under the margin renew immediately
        let tiny = FixedLifetime(Duration::from_secs(30));
        assert_eq!(tiny.renew_after(), Duration::ZERO);
    }
}
