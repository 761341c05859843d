//! Counters kept by the mapping service.

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Metrics tracked by the port mapping service.
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    /*
     * General port mapping metrics
     */
    pub probes_started: Counter,
    pub local_port_updates: Counter,
    pub mapping_attempts: Counter,
    pub mapping_failures: Counter,
    pub mapping_renewals: Counter,
    pub external_address_updated: Counter,

    /*
     * Per protocol metrics
     */
    pub upnp_probes: Counter,
    pub upnp_available: Counter,
    pub upnp_gateway_updated: Counter,
    pub pinhole_available: Counter,
    pub pcp_probes: Counter,
    pub pcp_available: Counter,
    pub pmp_probes: Counter,
    pub pmp_available: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            probes_started: Counter::new("Number of probing tasks started."),
            local_port_updates: Counter::new("Number of updates to the local port."),
            mapping_attempts: Counter::new("Number of mapping tasks started."),
            mapping_failures: Counter::new("Number of failed mapping tasks."),
            mapping_renewals: Counter::new("Number of mapping renewals."),
            external_address_updated: Counter::new(
                "Number of times the external address obtained via port mapping was updated.",
            ),
            upnp_probes: Counter::new("Number of UPnP probes executed."),
            upnp_available: Counter::new("Number of UPnP probes that found it available."),
            upnp_gateway_updated: Counter::new(
                "Number of UPnP probes that resulted in a gateway different to the previous one.",
            ),
            pinhole_available: Counter::new(
                "Number of probes that found an IPv6 firewall control service.",
            ),
            pcp_probes: Counter::new("Number of PCP probes executed."),
            pcp_available: Counter::new("Number of PCP probes that found it available."),
            pmp_probes: Counter::new("Number of NAT-PMP probes executed."),
            pmp_available: Counter::new("Number of NAT-PMP probes that found it available."),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "portmap"
    }
}
