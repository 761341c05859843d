//! Port mapping client and service.
//!
//! Talks to the local gateway with whichever port mapping protocol it
//! answers: PCP ([RFC 6887]), NAT-PMP ([RFC 6886]) or UPnP IGD, including
//! the IGD:2 IPv6 firewall pinhole profile. A long-running [`Service`]
//! probes the gateway, obtains a mapping for the configured local port,
//! renews it before the lease runs out and publishes the external address
//! on a watch channel.
//!
//! [RFC 6887]: https://datatracker.ietf.org/doc/html/rfc6887
//! [RFC 6886]: https://datatracker.ietf.org/doc/html/rfc6886

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU16,
    time::{Duration, Instant},
};

use anyhow::Result;
use futures::StreamExt;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, Instrument};

use iroh_metrics::inc;

use current_mapping::CurrentMapping;

mod current_mapping;
mod error;
mod interfaces;
mod mapping;
mod metrics;
mod retry;
mod util;
pub mod wire;

pub mod nat_pmp;
pub mod pcp;
pub mod upnp;

pub use error::Error;
pub use metrics::Metrics;

/// If a port mapping service has been seen within the last
/// [`AVAILABILITY_TRUST_DURATION`] it will not be probed again.
const AVAILABILITY_TRUST_DURATION: Duration = Duration::from_secs(60 * 10); // 10 minutes

/// Capacity of the channel to communicate with the long-running service.
const SERVICE_CHANNEL_CAPACITY: usize = 32; // should be plenty

/// If a port mapping service has not been seen within the last
/// [`UNAVAILABILITY_TRUST_DURATION`] we allow trying a mapping using said
/// protocol.
const UNAVAILABILITY_TRUST_DURATION: Duration = Duration::from_secs(5);

/// The recommended mapping lifetime, two hours. See
/// <https://datatracker.ietf.org/doc/html/rfc6886#section-3.3>
pub const DEFAULT_MAPPING_LIFETIME_SECONDS: u32 = 60 * 60 * 2;

/// A transport protocol a port can be mapped for, with its IANA protocol
/// number as the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PortType {
    /// TCP, IANA protocol number 6.
    Tcp = 6,
    /// UDP, IANA protocol number 17.
    Udp = 17,
}

/// Output of a port mapping probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
#[display("portmap={{ UPnP: {upnp}, PMP: {pmp}, PCP: {pcp}, Pinhole: {pinhole} }}")]
pub struct ProbeOutput {
    /// If UPnP can be considered available.
    pub upnp: bool,
    /// If PCP can be considered available.
    pub pcp: bool,
    /// If PMP can be considered available.
    pub pmp: bool,
    /// If an IPv6 firewall pinhole service can be considered available.
    pub pinhole: bool,
}

impl ProbeOutput {
    /// Indicates if all port mapping protocols are available.
    pub fn all_available(&self) -> bool {
        self.upnp && self.pcp && self.pmp && self.pinhole
    }
}

#[derive(derive_more::Debug)]
enum Message {
    /// Attempt to get a mapping if the local port is set but there is no mapping.
    ProcureMapping,
    /// Request to update the local port.
    ///
    /// The resulting external address can be obtained subscribing using
    /// [`Client::watch_external_address`].
    /// A value of `None` will deactivate port mapping.
    UpdateLocalPort {
        local_port: Option<NonZeroU16>,
    },
    /// Request to probe the port mapping protocols.
    ///
    /// The requester should wait for the result at the [`oneshot::Receiver`]
    /// counterpart of the [`oneshot::Sender`].
    Probe {
        /// Sender side to communicate the result of the probe.
        #[debug("_")]
        result_tx: oneshot::Sender<Result<ProbeOutput, String>>,
    },
}

/// Configures the port mapping protocols and parameters used by the
/// [`Service`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether UPnP is enabled.
    pub enable_upnp: bool,
    /// Whether PCP is enabled.
    pub enable_pcp: bool,
    /// Whether NAT-PMP is enabled.
    pub enable_nat_pmp: bool,
    /// Whether the IPv6 firewall pinhole profile is enabled.
    pub enable_pinhole: bool,
    /// Transport protocol mappings are requested for.
    pub protocol: PortType,
    /// Requested mapping lifetime in seconds.
    pub lifetime_seconds: u32,
    /// Description registered with UPnP mappings.
    pub description: String,
}

impl Default for Config {
    /// By default all port mapping protocols are enabled and UDP mappings
    /// with the recommended lifetime are requested.
    fn default() -> Self {
        Config {
            enable_upnp: true,
            enable_pcp: true,
            enable_nat_pmp: true,
            enable_pinhole: true,
            protocol: PortType::Udp,
            lifetime_seconds: DEFAULT_MAPPING_LIFETIME_SECONDS,
            description: "portmapper".into(),
        }
    }
}

/// Port mapping client.
#[derive(Debug, Clone)]
pub struct Client {
    /// A watcher over the most recent external address obtained from port
    /// mapping.
    ///
    /// See [`watch::Receiver`].
    port_mapping: watch::Receiver<Option<SocketAddr>>,
    /// Channel used to communicate with the port mapping service.
    service_tx: mpsc::Sender<Message>,
    /// A handle to the service that will cancel the spawned task once the
    /// client is dropped.
    _service_handle: std::sync::Arc<util::CancelOnDrop>,
}

impl Client {
    /// Creates a client that uses the default configuration.
    ///
    /// See [`Config::default`].
    pub async fn default() -> Self {
        Self::new(Config::default()).await
    }

    /// Create a new port mapping client.
    pub async fn new(config: Config) -> Self {
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);

        let (service, watcher) = Service::new(config, service_rx);

        let handle = util::CancelOnDrop::new(
            "portmap_service",
            tokio::spawn(
                async move { service.run().await }.instrument(info_span!("portmapper.service")),
            )
            .abort_handle(),
        );

        Client {
            port_mapping: watcher,
            service_tx,
            _service_handle: std::sync::Arc::new(handle),
        }
    }

    /// Request a probe to the port mapping protocols.
    ///
    /// Returns the [`oneshot::Receiver`] used to obtain the result of the
    /// probe.
    pub fn probe(&self) -> oneshot::Receiver<Result<ProbeOutput, String>> {
        let (result_tx, result_rx) = oneshot::channel();

        if let Err(e) = self.service_tx.try_send(Message::Probe { result_tx }) {
            use mpsc::error::TrySendError::*;

            // recover the sender and return the error there
            let (result_tx, e) = match e {
                Full(Message::Probe { result_tx }) => (result_tx, "Port mapping channel full"),
                Closed(Message::Probe { result_tx }) => (result_tx, "Port mapping channel closed"),
                Full(_) | Closed(_) => unreachable!("Sent value is a probe."),
            };

            // sender was just created. If it's dropped we have two send error and are likely
            // shutting down
            // NOTE: second Err is infallible match due to being the sent value
            if let Err(Err(e)) = result_tx.send(Err(e.into())) {
                trace!("Failed to request probe: {e}")
            }
        }
        result_rx
    }

    /// Try to get a mapping for the last local port if there isn't one already.
    pub fn procure_mapping(&self) {
        // requester can't really do anything with this error if returned, so we log it
        if let Err(e) = self.service_tx.try_send(Message::ProcureMapping) {
            trace!("Failed to request mapping {e}")
        }
    }

    /// Update the local port.
    ///
    /// If the port changes, this will trigger a port mapping attempt.
    pub fn update_local_port(&self, local_port: NonZeroU16) {
        let local_port = Some(local_port);
        // requester can't really do anything with this error if returned, so we log it
        if let Err(e) = self
            .service_tx
            .try_send(Message::UpdateLocalPort { local_port })
        {
            trace!("Failed to update local port {e}")
        }
    }

    /// Deactivate port mapping.
    pub fn deactivate(&self) {
        // requester can't really do anything with this error if returned, so we log it
        if let Err(e) = self
            .service_tx
            .try_send(Message::UpdateLocalPort { local_port: None })
        {
            trace!("Failed to deactivate port mapping {e}")
        }
    }

    /// Watch the external address for changes in the mappings.
    pub fn watch_external_address(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.port_mapping.clone()
    }
}

/// A port mapping protocol that can be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapper {
    /// Port Control Protocol.
    Pcp,
    /// NAT Port Mapping Protocol.
    NatPmp,
    /// UPnP IGD WAN connection service.
    Upnp,
    /// UPnP IGD IPv6 firewall pinhole service.
    Pinhole,
}

/// Rank the mappers worth attempting: PCP supersedes NAT-PMP, IGD is the
/// most deployed but least reliable, and a pinhole only helps hosts with
/// global IPv6, so it goes last.
///
/// A protocol that a recent probe did not find is skipped, unless the probe
/// information is stale. UPnP performs its own discovery and stays as the
/// last resort whenever it is enabled.
fn mapper_order(output: ProbeOutput, config: &Config, recently_probed: bool) -> Vec<Mapper> {
    let mut order = Vec::new();
    if config.enable_pcp && (output.pcp || !recently_probed) {
        order.push(Mapper::Pcp);
    }
    if config.enable_nat_pmp && (output.pmp || !recently_probed) {
        order.push(Mapper::NatPmp);
    }
    if config.enable_upnp {
        order.push(Mapper::Upnp);
    }
    if config.enable_pinhole && (output.pinhole || !recently_probed) {
        order.push(Mapper::Pinhole);
    }
    order
}

/// Port mapping protocol information obtained during a probe.
#[derive(Debug)]
struct Probe {
    /// When was the probe last updated.
    last_probe: Instant,
    /// The last discovered WAN connection gateway and when it was last seen.
    last_upnp_gateway: Option<(upnp::Gateway, Instant)>,
    /// The last discovered IPv6 firewall gateway and when it was last seen.
    last_firewall_gateway: Option<(upnp::Gateway, Instant)>,
    /// The (local address, gateway) pair PCP last answered on, and when.
    last_pcp: Option<((IpAddr, IpAddr), Instant)>,
    /// The (local address, gateway) pair NAT-PMP last answered on, and when.
    last_pmp: Option<((Ipv4Addr, Ipv4Addr), Instant)>,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            last_probe: Instant::now() - AVAILABILITY_TRUST_DURATION,
            last_upnp_gateway: None,
            last_firewall_gateway: None,
            last_pcp: None,
            last_pmp: None,
        }
    }
}

impl Probe {
    /// Create a new probe based on a previous output.
    ///
    /// Every per-protocol probe fans out over all gateway candidates in
    /// parallel and keeps the first route that answered.
    async fn new(
        config: Config,
        output: ProbeOutput,
        candidates: Vec<interfaces::GatewayCandidate>,
    ) -> Probe {
        let Config {
            enable_upnp,
            enable_pcp,
            enable_nat_pmp,
            enable_pinhole,
            ..
        } = config;
        let upnp_locals: Vec<Ipv4Addr> = candidates
            .iter()
            .filter_map(|candidate| candidate.local_v4)
            .collect();
        let pcp_routes: Vec<(IpAddr, IpAddr)> = candidates
            .iter()
            .filter_map(interfaces::GatewayCandidate::pcp_route)
            .collect();
        let pmp_routes: Vec<(Ipv4Addr, Ipv4Addr)> = candidates
            .iter()
            .filter_map(interfaces::GatewayCandidate::pmp_route)
            .collect();

        let mut upnp_probing_task = util::MaybeFuture {
            inner: ((enable_upnp && !output.upnp) || (enable_pinhole && !output.pinhole)).then(
                || {
                    Box::pin(async move {
                        inc!(Metrics, upnp_probes);
                        let gateways = upnp::probe_available(&upnp_locals).await;
                        let now = Instant::now();
                        (
                            gateways.wan.map(|gateway| (gateway, now)),
                            gateways.firewall.map(|gateway| (gateway, now)),
                        )
                    })
                },
            ),
        };

        let mut pcp_probing_task = util::MaybeFuture {
            inner: (enable_pcp && !output.pcp).then(|| {
                Box::pin(async move {
                    inc!(Metrics, pcp_probes);
                    let probes = pcp_routes.into_iter().map(|(local_ip, gateway)| async move {
                        pcp::probe_available(local_ip, gateway)
                            .await
                            .then_some((local_ip, gateway))
                    });
                    futures::future::join_all(probes)
                        .await
                        .into_iter()
                        .flatten()
                        .next()
                        .map(|route| (route, Instant::now()))
                })
            }),
        };

        let mut pmp_probing_task = util::MaybeFuture {
            inner: (enable_nat_pmp && !output.pmp).then(|| {
                Box::pin(async move {
                    inc!(Metrics, pmp_probes);
                    let probes = pmp_routes.into_iter().map(|(local_ip, gateway)| async move {
                        nat_pmp::probe_available(local_ip, gateway)
                            .await
                            .then_some((local_ip, gateway))
                    });
                    futures::future::join_all(probes)
                        .await
                        .into_iter()
                        .flatten()
                        .next()
                        .map(|route| (route, Instant::now()))
                })
            }),
        };

        let mut upnp_done = upnp_probing_task.inner.is_none();
        let mut pcp_done = pcp_probing_task.inner.is_none();
        let mut pmp_done = pmp_probing_task.inner.is_none();

        let mut probe = Probe {
            last_probe: Instant::now(),
            ..Default::default()
        };

        while !upnp_done || !pcp_done || !pmp_done {
            tokio::select! {
                (last_upnp_gateway, last_firewall_gateway) = &mut upnp_probing_task, if !upnp_done => {
                    trace!("tick: upnp probe ready");
                    probe.last_upnp_gateway = last_upnp_gateway;
                    probe.last_firewall_gateway = last_firewall_gateway;
                    upnp_done = true;
                },
                last_pmp = &mut pmp_probing_task, if !pmp_done => {
                    trace!("tick: pmp probe ready");
                    probe.last_pmp = last_pmp;
                    pmp_done = true;
                },
                last_pcp = &mut pcp_probing_task, if !pcp_done => {
                    trace!("tick: pcp probe ready");
                    probe.last_pcp = last_pcp;
                    pcp_done = true;
                },
            }
        }

        probe
    }

    /// Returns a [`ProbeOutput`] indicating which services can be considered
    /// available.
    fn output(&self) -> ProbeOutput {
        let now = Instant::now();
        let trusted = |last_seen: Option<Instant>| {
            last_seen
                .map(|instant| instant + AVAILABILITY_TRUST_DURATION > now)
                .unwrap_or_default()
        };

        ProbeOutput {
            upnp: trusted(self.last_upnp_gateway.as_ref().map(|(_, seen)| *seen)),
            pcp: trusted(self.last_pcp.map(|(_, seen)| seen)),
            pmp: trusted(self.last_pmp.map(|(_, seen)| seen)),
            pinhole: trusted(self.last_firewall_gateway.as_ref().map(|(_, seen)| *seen)),
        }
    }

    /// Updates a probe with the `Some` values of another probe that is
    /// _assumed_ newer.
    fn update(&mut self, probe: Probe) {
        let Probe {
            last_probe,
            last_upnp_gateway,
            last_firewall_gateway,
            last_pcp,
            last_pmp,
        } = probe;
        if last_upnp_gateway.is_some() {
            inc!(Metrics, upnp_available);
            let new_gateway = last_upnp_gateway.as_ref().map(|(gateway, _)| gateway);
            let old_gateway = self.last_upnp_gateway.as_ref().map(|(gateway, _)| gateway);
            if new_gateway != old_gateway {
                inc!(Metrics, upnp_gateway_updated);
                debug!(
                    "upnp gateway changed {:?} -> {:?}",
                    old_gateway.map(|gw| gw.to_string()).unwrap_or("None".into()),
                    new_gateway.map(|gw| gw.to_string()).unwrap_or("None".into())
                )
            };
            self.last_upnp_gateway = last_upnp_gateway;
        }
        if last_firewall_gateway.is_some() {
            inc!(Metrics, pinhole_available);
            self.last_firewall_gateway = last_firewall_gateway;
        }
        if last_pcp.is_some() {
            inc!(Metrics, pcp_available);
            self.last_pcp = last_pcp;
        }
        if last_pmp.is_some() {
            inc!(Metrics, pmp_available);
            self.last_pmp = last_pmp;
        }

        self.last_probe = last_probe;
    }
}

// mainly to make clippy happy
type ProbeResult = Result<ProbeOutput, String>;

/// A port mapping service.
#[derive(Debug)]
pub struct Service {
    config: Config,
    /// Local port to map.
    local_port: Option<NonZeroU16>,
    /// Channel over which the service is informed of messages.
    ///
    /// The service will stop when all senders are gone.
    rx: mpsc::Receiver<Message>,
    /// Currently active mapping.
    current_mapping: CurrentMapping,
    /// Last updated probe.
    full_probe: Probe,
    /// Task attempting to get or renew a port mapping, with the token that
    /// cancels it at its next suspension point.
    ///
    /// This task will be cancelled if a request to set the local port
    /// arrives before it's finished.
    mapping_task: Option<(
        util::AbortingJoinHandle<Result<mapping::Mapping, Error>>,
        CancellationToken,
    )>,
    /// Task probing the necessary protocols.
    ///
    /// Requests for a probe that arrive while this task is still in progress
    /// will receive the same result.
    probing_task: Option<(
        util::AbortingJoinHandle<Probe>,
        Vec<oneshot::Sender<ProbeResult>>,
    )>,
}

impl Service {
    fn new(
        config: Config,
        rx: mpsc::Receiver<Message>,
    ) -> (Self, watch::Receiver<Option<SocketAddr>>) {
        let (current_mapping, watcher) = CurrentMapping::new();
        let service = Service {
            config,
            local_port: None,
            rx,
            current_mapping,
            full_probe: Default::default(),
            mapping_task: None,
            probing_task: None,
        };

        (service, watcher)
    }

    /// Clears the current mapping and releases it.
    async fn invalidate_mapping(&mut self) {
        if let Some(old_mapping) = self.current_mapping.update(None) {
            if let Err(e) = old_mapping.release().await {
                debug!("failed to release mapping {e}");
            }
        }
    }

    async fn run(mut self) -> Result<()> {
        debug!("portmap starting");
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    trace!("tick: msg {msg:?}");
                    match msg {
                        Some(msg) => {
                            self.handle_msg(msg).await;
                        },
                        None => {
                            debug!("portmap service channel dropped. Likely shutting down.");
                            break;
                        }
                    }
                }
                mapping_result = util::MaybeFuture{ inner: self.mapping_task.as_mut().map(|(fut, _cancel)| fut) } => {
                    trace!("tick: mapping ready");
                    // regardless of outcome, the task is finished, clear it
                    self.mapping_task = None;
                    // there isn't really a way to react to a join error here. Flatten it to make
                    // it easier to work with
                    let result = match mapping_result {
                        Ok(result) => result,
                        Err(join_err) => {
                            debug!("failed to obtain a result {join_err}");
                            Err(Error::Cancelled)
                        }
                    };
                    self.on_mapping_result(result).await;
                }
                probe_result = util::MaybeFuture{ inner: self.probing_task.as_mut().map(|(fut, _rec)| fut) } => {
                    trace!("tick: probe ready");
                    // retrieve the receivers and clear the task
                    let receivers = self.probing_task.take().expect("is some").1;
                    let probe_result = probe_result.map_err(|join_err| anyhow::anyhow!("Failed to obtain a result {join_err}"));
                    self.on_probe_result(probe_result, receivers).await;
                }
                Some(event) = self.current_mapping.next() => {
                    trace!("tick: mapping event {event:?}");
                    self.on_mapping_event(event).await;
                }
            }
        }
        Ok(())
    }

    async fn on_mapping_event(&mut self, event: current_mapping::Event) {
        match event {
            current_mapping::Event::Renew { .. } => {
                if self.mapping_task.is_some() {
                    // a new mapping is underway, the old one will be replaced
                    return;
                }
                if let Some(mut mapping) = CurrentMapping::take(&mut self.current_mapping) {
                    inc!(Metrics, mapping_renewals);
                    let cancel = CancellationToken::new();
                    let task_cancel = cancel.clone();
                    let handle = tokio::spawn(
                        async move {
                            mapping.refresh_with_backoff(&task_cancel).await?;
                            Ok(mapping)
                        }
                        .instrument(info_span!("portmapper.renew")),
                    );
                    self.mapping_task = Some((handle.into(), cancel));
                }
            }
            current_mapping::Event::Expired {
                external_ip,
                external_port,
            } => {
                self.invalidate_mapping().await;
                self.get_mapping(Some((external_ip, external_port))).await;
            }
        }
    }

    async fn on_probe_result(
        &mut self,
        result: Result<Probe>,
        receivers: Vec<oneshot::Sender<ProbeResult>>,
    ) {
        let result = match result {
            Err(e) => Err(e.to_string()),
            Ok(probe) => {
                self.full_probe.update(probe);
                // NOTE: the gateway of the current mapping could have changed and the mapping
                // still be reported as active
                let output = self.full_probe.output();
                debug!("probe output {output}");
                Ok(output)
            }
        };
        for tx in receivers {
            // ignore the error. If the receiver is no longer there we don't really care
            let _ = tx.send(result.clone());
        }
    }

    async fn on_mapping_result(&mut self, result: Result<mapping::Mapping, Error>) {
        match result {
            Ok(mapping) => {
                let old_external = self.current_mapping.external();
                let new_external = {
                    use mapping::PortMapped;
                    mapping.external()
                };
                if old_external != Some(new_external) {
                    inc!(Metrics, external_address_updated);
                }
                self.current_mapping.update(Some(mapping));
            }
            Err(e) => {
                debug!("failed to get a port mapping {e}");
                inc!(Metrics, mapping_failures);
            }
        }
    }

    async fn handle_msg(&mut self, msg: Message) {
        match msg {
            Message::ProcureMapping => self.update_local_port(self.local_port).await,
            Message::UpdateLocalPort { local_port } => self.update_local_port(local_port).await,
            Message::Probe { result_tx } => self.probe_request(result_tx).await,
        }
    }

    /// Updates the local port of the port mapping service.
    ///
    /// If the port changed, any port mapping task is cancelled. If the new
    /// port is some, it will start a new port mapping task.
    async fn update_local_port(&mut self, local_port: Option<NonZeroU16>) {
        // ignore requests to update the local port in a way that does not produce a change
        if local_port != self.local_port {
            inc!(Metrics, local_port_updates);
            let old_port = std::mem::replace(&mut self.local_port, local_port);

            // clear the current mapping task if any

            let dropped_task = self.mapping_task.take();
            // check if the dropped task had finished to reduce log noise
            let did_cancel = dropped_task
                .map(|(task, cancel)| {
                    cancel.cancel();
                    !task.is_finished()
                })
                .unwrap_or_default();

            if did_cancel {
                debug!(
                    "canceled mapping task due to local port update. Old: {:?} New: {:?}",
                    old_port, self.local_port
                )
            }

            // get the current external port if any to try to get it again
            let external_addr = self.current_mapping.external();

            // since the port has changed, the current mapping is no longer valid and should be
            // released

            if external_addr.is_some() {
                self.invalidate_mapping().await;
            }

            // start a new mapping task to account for the new port if necessary
            self.get_mapping(external_addr).await;
        } else if self.current_mapping.external().is_none() {
            // if the local port has not changed, but there is no active mapping try to get one
            self.get_mapping(None).await
        }
    }

    async fn get_mapping(&mut self, external_addr: Option<(IpAddr, NonZeroU16)>) {
        let Some(local_port) = self.local_port else {
            return;
        };
        inc!(Metrics, mapping_attempts);

        let candidates = match interfaces::gateway_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => return debug!("can't get mapping: {e}"),
        };

        let output = self.full_probe.output();
        let recently_probed =
            self.full_probe.last_probe + UNAVAILABILITY_TRUST_DURATION > Instant::now();
        let order = mapper_order(output, &self.config, recently_probed);
        if order.is_empty() {
            return debug!("no mapping protocol available");
        }

        debug!(
            "getting a port mapping for local port {local_port} -> {external_addr:?} via {order:?} over {} gateway candidates",
            candidates.len()
        );

        let pcp_route = self.full_probe.last_pcp.map(|(route, _last_seen)| route);
        let pmp_route = self.full_probe.last_pmp.map(|(route, _last_seen)| route);
        let upnp_gateway = self
            .full_probe
            .last_upnp_gateway
            .as_ref()
            .map(|(gateway, _last_seen)| gateway.clone());
        let firewall_gateway = self
            .full_probe
            .last_firewall_gateway
            .as_ref()
            .map(|(gateway, _last_seen)| gateway.clone());

        let config = self.config.clone();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(
            async move {
                try_mappers(
                    order,
                    local_port,
                    candidates,
                    external_addr,
                    ProbedGateways {
                        pcp_route,
                        pmp_route,
                        upnp_gateway,
                        firewall_gateway,
                    },
                    config,
                    task_cancel,
                )
                .await
            }
            .instrument(info_span!("portmapper.map")),
        );
        self.mapping_task = Some((handle.into(), cancel));
    }

    /// Handles a probe request.
    ///
    /// If there is a task getting a probe, the receiver will be added with
    /// any other waiting for a result. If no probe is underway, a result can
    /// be returned immediately if it's still considered valid. Otherwise, a
    /// new probe task will be started.
    async fn probe_request(&mut self, result_tx: oneshot::Sender<Result<ProbeOutput, String>>) {
        match self.probing_task.as_mut() {
            Some((_task_handle, receivers)) => receivers.push(result_tx),
            None => {
                let probe_output = self.full_probe.output();
                if probe_output.all_available() {
                    // we don't care if the requester is no longer there
                    let _ = result_tx.send(Ok(probe_output));
                } else {
                    inc!(Metrics, probes_started);

                    let candidates = match interfaces::gateway_candidates().await {
                        Ok(candidates) => candidates,
                        Err(e) => {
                            // there is no guarantee this will be displayed, so log it anyway
                            debug!("could not start probe: {e}");
                            let _ = result_tx.send(Err(e.to_string()));
                            return;
                        }
                    };

                    let config = self.config.clone();
                    let handle = tokio::spawn(
                        async move { Probe::new(config, probe_output, candidates).await }
                            .instrument(info_span!("portmapper.probe")),
                    );
                    let receivers = vec![result_tx];
                    self.probing_task = Some((handle.into(), receivers));
                }
            }
        }
    }
}

/// The gateways the last probe found, per protocol. Routes discovered by a
/// probe are attempted before walking the remaining candidates blind.
#[derive(Debug, Default)]
struct ProbedGateways {
    pcp_route: Option<(IpAddr, IpAddr)>,
    pmp_route: Option<(Ipv4Addr, Ipv4Addr)>,
    upnp_gateway: Option<upnp::Gateway>,
    firewall_gateway: Option<upnp::Gateway>,
}

/// Walk the ranked mappers and return the first mapping obtained.
///
/// Within each mapper, every gateway candidate that offers a route for the
/// protocol is attempted in turn, so a gateway answering on a secondary
/// interface still gets its chance.
async fn try_mappers(
    order: Vec<Mapper>,
    local_port: NonZeroU16,
    candidates: Vec<interfaces::GatewayCandidate>,
    external_addr: Option<(IpAddr, NonZeroU16)>,
    probed: ProbedGateways,
    config: Config,
    cancel: CancellationToken,
) -> Result<mapping::Mapping, Error> {
    let v4_locals: Vec<Ipv4Addr> = candidates
        .iter()
        .filter_map(|candidate| candidate.local_v4)
        .collect();

    let mut last_error = None;
    for mapper in order {
        let attempt = match mapper {
            Mapper::Pcp => {
                let routes = route_order(
                    probed.pcp_route,
                    candidates.iter().filter_map(interfaces::GatewayCandidate::pcp_route),
                );
                let mut outcome = Err(Error::Unsupported);
                for (local_ip, gateway) in routes {
                    outcome = mapping::Mapping::new_pcp(
                        local_ip,
                        local_port,
                        gateway,
                        config.protocol,
                        external_addr,
                        config.lifetime_seconds,
                        &cancel,
                    )
                    .await;
                    match &outcome {
                        Ok(_) | Err(Error::Cancelled) => break,
                        Err(e) => debug!("pcp mapping via {gateway} failed: {e}"),
                    }
                }
                outcome
            }
            Mapper::NatPmp => {
                let routes = route_order(
                    probed.pmp_route,
                    candidates.iter().filter_map(interfaces::GatewayCandidate::pmp_route),
                );
                let mut outcome = Err(Error::Unsupported);
                for (local_ip, gateway) in routes {
                    outcome = mapping::Mapping::new_nat_pmp(
                        local_ip,
                        local_port,
                        gateway,
                        config.protocol,
                        external_addr.map(|(_addr, port)| port),
                        config.lifetime_seconds,
                        &cancel,
                    )
                    .await;
                    match &outcome {
                        Ok(_) | Err(Error::Cancelled) => break,
                        Err(e) => debug!("nat-pmp mapping via {gateway} failed: {e}"),
                    }
                }
                outcome
            }
            Mapper::Upnp => {
                mapping::Mapping::new_upnp(
                    &v4_locals,
                    local_port,
                    probed.upnp_gateway.clone(),
                    external_addr.map(|(_addr, port)| port),
                    config.protocol,
                    config.lifetime_seconds,
                    config.description.clone(),
                )
                .await
            }
            Mapper::Pinhole => {
                let mut outcome = Err(Error::Unsupported);
                for local_v6 in candidates.iter().filter_map(|candidate| candidate.local_v6) {
                    outcome = mapping::Mapping::new_pinhole(
                        &v4_locals,
                        local_v6,
                        local_port,
                        probed.firewall_gateway.clone(),
                        config.protocol,
                        config.lifetime_seconds,
                    )
                    .await;
                    match &outcome {
                        Ok(_) | Err(Error::Cancelled) => break,
                        Err(e) => debug!("pinhole for {local_v6} failed: {e}"),
                    }
                }
                outcome
            }
        };
        match attempt {
            Ok(mapping) => return Ok(mapping),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                debug!("{mapper:?} mapping failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(Error::Unsupported))
}

/// The routes to attempt for a datagram protocol: the probed one first,
/// then every candidate route not already covered by it.
fn route_order<R: PartialEq>(
    probed: Option<R>,
    candidates: impl Iterator<Item = R>,
) -> Vec<R> {
    let mut routes: Vec<R> = probed.into_iter().collect();
    for route in candidates {
        if !routes.contains(&route) {
            routes.push(route);
        }
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapper_order_prefers_pcp() {
        let all = ProbeOutput {
            upnp: true,
            pcp: true,
            pmp: true,
            pinhole: true,
        };
        let order = mapper_order(all, &Config::default(), true);
        assert_eq!(
            order,
            vec![Mapper::Pcp, Mapper::NatPmp, Mapper::Upnp, Mapper::Pinhole]
        );
    }

    #[test]
    fn test_mapper_order_skips_recently_missing_protocols() {
        let only_upnp = ProbeOutput {
            upnp: true,
            ..Default::default()
        };
        let order = mapper_order(only_upnp, &Config::default(), true);
        assert_eq!(order, vec![Mapper::Upnp]);

        // stale probe information does not disqualify anyone
        let order = mapper_order(only_upnp, &Config::default(), false);
        assert_eq!(
            order,
            vec![Mapper::Pcp, Mapper::NatPmp, Mapper::Upnp, Mapper::Pinhole]
        );
    }

    #[test]
    fn test_mapper_order_honors_config() {
        let all = ProbeOutput {
            upnp: true,
            pcp: true,
            pmp: true,
            pinhole: true,
        };
        let config = Config {
            enable_pcp: false,
            enable_pinhole: false,
            ..Config::default()
        };
        let order = mapper_order(all, &config, true);
        assert_eq!(order, vec![Mapper::NatPmp, Mapper::Upnp]);

        let nothing = Config {
            enable_upnp: false,
            enable_pcp: false,
            enable_nat_pmp: false,
            enable_pinhole: false,
            ..Config::default()
        };
        assert!(mapper_order(all, &nothing, false).is_empty());
    }

    #[test]
    fn test_probe_output_display() {
        let output = ProbeOutput {
            upnp: true,
            ..Default::default()
        };
        assert_eq!(
            output.to_string(),
            "portmap={ UPnP: true, PMP: false, PCP: false, Pinhole: false }"
        );
    }

    #[test]
    fn test_port_type_iana_numbers() {
        assert_eq!(u8::from(PortType::Tcp), 6);
        assert_eq!(u8::from(PortType::Udp), 17);
        assert_eq!(PortType::try_from(17u8).unwrap(), PortType::Udp);
        assert!(PortType::try_from(0u8).is_err());
    }
}
