use std::fmt;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use nfproxy_nft::{RuleHandle, TableFamily};
use tracing::warn;

use crate::{Error, Result, names};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// Kubernetes defaults an absent protocol to TCP.
    pub fn parse(proto: Option<&str>) -> Protocol {
        match proto {
            Some("UDP") => Protocol::Udp,
            Some("SCTP") => Protocol::Sctp,
            _ => Protocol::Tcp,
        }
    }

    /// The API wire form, used for chain-name fingerprints so that names
    /// match what a previous process computed from the same objects.
    pub fn wire(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    /// Lower-case nftables keyword.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        })
    }
}

/// Identity of one service port, unique across the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SvcPortKey {
    pub namespace: String,
    pub name: String,
    pub port_name: String,
    pub protocol: Protocol,
}

impl SvcPortKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        port_name: impl Into<String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port_name: port_name.into(),
            protocol,
        }
    }
}

impl fmt::Display for SvcPortKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.port_name.is_empty() {
            write!(f, "{}/{}", self.namespace, self.name)
        } else {
            write!(f, "{}/{}:{}", self.namespace, self.name, self.port_name)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionAffinity {
    None,
    ClientIp { timeout_secs: i32 },
}

/// Everything the reconciler tracks for one installed service port,
/// including the rule handles it owns per chain.
#[derive(Debug)]
pub struct ServicePortInfo {
    pub cluster_ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub node_port: u16,
    pub external_ips: Vec<IpAddr>,
    pub lb_ips: Vec<IpAddr>,
    pub session_affinity: SessionAffinity,
    pub family: TableFamily,
    pub has_endpoints: bool,
    pub svc_id: String,
    owned: ahash::HashMap<TableFamily, ahash::HashMap<String, Vec<RuleHandle>>>,
}

impl ServicePortInfo {
    pub fn from_service(key: &SvcPortKey, port: &ServicePort, svc: &Service) -> Result<Self> {
        let spec = svc
            .spec
            .as_ref()
            .ok_or_else(|| Error::UnexpectedObject(format!("service {key} has no spec")))?;

        let cluster_ip = spec
            .cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .ok_or_else(|| {
                Error::UnexpectedObject(format!("service {key} has no usable cluster IP"))
            })?;

        let svc_port = u16::try_from(port.port).map_err(|_| Error::InvalidPort {
            name: key.to_string(),
            port: port.port,
        })?;
        if svc_port == 0 {
            return Err(Error::InvalidPort {
                name: key.to_string(),
                port: 0,
            });
        }
        let node_port = port
            .node_port
            .and_then(|np| u16::try_from(np).ok())
            .unwrap_or(0);

        let external_ips = parse_ips(key, spec.external_ips.iter().flatten());
        let lb_ips = parse_ips(
            key,
            svc.status
                .iter()
                .filter_map(|s| s.load_balancer.as_ref())
                .flat_map(|lb| lb.ingress.iter().flatten())
                .filter_map(|ingress| ingress.ip.as_ref()),
        );

        let session_affinity = match spec.session_affinity.as_deref() {
            Some("ClientIP") => SessionAffinity::ClientIp {
                timeout_secs: spec
                    .session_affinity_config
                    .as_ref()
                    .and_then(|c| c.client_ip.as_ref())
                    .and_then(|c| c.timeout_seconds)
                    .unwrap_or(10800),
            },
            _ => SessionAffinity::None,
        };

        Ok(Self {
            cluster_ip,
            port: svc_port,
            protocol: key.protocol,
            node_port,
            external_ips,
            lb_ips,
            session_affinity,
            family: table_family_of(&cluster_ip),
            has_endpoints: false,
            svc_id: names::service_id(key),
            owned: ahash::HashMap::default(),
        })
    }

    /// All virtual addresses a client can use to reach this service port.
    pub fn virtual_ips(&self) -> impl Iterator<Item = &IpAddr> {
        std::iter::once(&self.cluster_ip)
            .chain(self.external_ips.iter())
            .chain(self.lb_ips.iter())
    }

    pub fn handles(&self, family: TableFamily, chain: &str) -> &[RuleHandle] {
        self.owned
            .get(&family)
            .and_then(|chains| chains.get(chain))
            .map_or(&[], Vec::as_slice)
    }

    pub fn set_handles(&mut self, family: TableFamily, chain: impl Into<String>, handles: Vec<RuleHandle>) {
        self.owned
            .entry(family)
            .or_default()
            .insert(chain.into(), handles);
    }

    pub fn append_handles(&mut self, family: TableFamily, chain: &str, handles: &[RuleHandle]) {
        self.owned
            .entry(family)
            .or_default()
            .entry(chain.to_string())
            .or_default()
            .extend_from_slice(handles);
    }

    pub fn owned_chains(&self, family: TableFamily) -> impl Iterator<Item = (&str, &[RuleHandle])> {
        self.owned
            .get(&family)
            .into_iter()
            .flat_map(|chains| chains.iter())
            .map(|(chain, handles)| (chain.as_str(), handles.as_slice()))
    }
}

/// One programmed backend of a service port.
#[derive(Clone, Debug)]
pub struct EndpointInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub is_local: bool,
    pub family: TableFamily,
    pub chain: String,
    pub rule_handles: Vec<RuleHandle>,
}

impl EndpointInfo {
    /// Value identity used when matching a watcher-delivered address
    /// against the programmed endpoint list.
    pub fn same_backend(&self, ip: &IpAddr, port: u16, protocol: Protocol, is_local: bool) -> bool {
        self.ip == *ip
            && self.port == port
            && self.protocol == protocol
            && self.is_local == is_local
            && self.family == table_family_of(ip)
    }
}

pub type ServiceMap = ahash::HashMap<SvcPortKey, ServicePortInfo>;
pub type EndpointsMap = ahash::HashMap<SvcPortKey, Vec<EndpointInfo>>;

pub fn table_family_of(ip: &IpAddr) -> TableFamily {
    match ip {
        IpAddr::V4(_) => TableFamily::V4,
        IpAddr::V6(_) => TableFamily::V6,
    }
}

/// Headless and ExternalName services never get proxy rules.
pub fn should_skip_service(svc: &Service) -> bool {
    let Some(spec) = &svc.spec else {
        return true;
    };
    if spec.type_.as_deref() == Some("ExternalName") {
        return true;
    }
    !matches!(spec.cluster_ip.as_deref(), Some(ip) if !ip.is_empty() && ip != "None")
}

fn parse_ips<'a>(key: &SvcPortKey, ips: impl Iterator<Item = &'a String>) -> Vec<IpAddr> {
    ips.filter_map(|ip| match ip.parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!(service = %key, %e, "skipping unparseable IP {}", ip);
            None
        }
    })
    .collect()
}
