//! Chain and rule programming for the proxy's slice of the NAT table.
//!
//! The manager owns the chain graph: the shared dispatcher and nodeports
//! chains, the no-endpoints set, three chains per service port and one
//! chain per backend. Callers keep the returned rule handles; the manager
//! itself is stateless apart from the driver it wraps.

use std::net::IpAddr;

use nfproxy_nft::{BaseChain, NftDriver, RuleHandle, TableFamily};

use crate::Result;
use crate::names;
use crate::types::Protocol;

pub const SVC_CHAIN_PREFIX: &str = "k8s-nfproxy-svc-";
pub const FW_CHAIN_PREFIX: &str = "k8s-nfproxy-fw-";
pub const XLB_CHAIN_PREFIX: &str = "k8s-nfproxy-xlb-";
pub const SEP_CHAIN_PREFIX: &str = "k8s-nfproxy-sep-";

pub const NAT_SERVICES_CHAIN: &str = "k8s-nfproxy-services";
pub const NAT_NODEPORTS_CHAIN: &str = "k8s-nfproxy-nodeports";
pub const NAT_PREROUTING_CHAIN: &str = "k8s-nfproxy-prerouting";
pub const NAT_OUTPUT_CHAIN: &str = "k8s-nfproxy-output";
pub const NAT_POSTROUTING_CHAIN: &str = "k8s-nfproxy-postrouting";
pub const NO_ENDPOINTS_SET: &str = "k8s-nfproxy-no-endpoints";

/// Packets DNATed back to their own sender are marked so postrouting
/// masquerades them, otherwise the backend would see its own address as
/// the source and reply to itself.
pub const HAIRPIN_MARK: u32 = 0x4000;

pub fn svc_chain(svc_id: &str) -> String {
    format!("{SVC_CHAIN_PREFIX}{svc_id}")
}

pub fn fw_chain(svc_id: &str) -> String {
    format!("{FW_CHAIN_PREFIX}{svc_id}")
}

pub fn xlb_chain(svc_id: &str) -> String {
    format!("{XLB_CHAIN_PREFIX}{svc_id}")
}

pub fn sep_chain(endpoint_id: &str) -> String {
    format!("{SEP_CHAIN_PREFIX}{endpoint_id}")
}

pub struct Topology<D> {
    driver: D,
}

impl<D: NftDriver> Topology<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// Build the per-family skeleton from scratch: hooks, dispatcher,
    /// nodeports chain and the no-endpoints set. The table is reset first;
    /// the watchers replay the full cluster state on startup, so nothing
    /// from a previous run is worth keeping.
    pub fn ensure_base(&mut self, family: TableFamily) -> Result<()> {
        let ipx = family.keyword();

        self.driver.reset_table(family)?;

        self.driver.ensure_set(
            family,
            NO_ENDPOINTS_SET,
            &format!("inet_proto . {} . inet_service", family.addr_type()),
        )?;

        self.driver.ensure_chain(family, NAT_SERVICES_CHAIN)?;
        self.driver.append_rule(
            family,
            NAT_SERVICES_CHAIN,
            &format!("meta l4proto . {ipx} daddr . th dport @{NO_ENDPOINTS_SET} reject"),
        )?;
        self.driver.ensure_chain(family, NAT_NODEPORTS_CHAIN)?;

        self.driver.ensure_base_chain(
            family,
            NAT_PREROUTING_CHAIN,
            &BaseChain {
                chain_type: "nat",
                hook: "prerouting",
                priority: -100,
            },
        )?;
        self.driver.append_rule(
            family,
            NAT_PREROUTING_CHAIN,
            &format!("jump {NAT_SERVICES_CHAIN}"),
        )?;
        self.driver.append_rule(
            family,
            NAT_PREROUTING_CHAIN,
            &format!("fib daddr type local jump {NAT_NODEPORTS_CHAIN}"),
        )?;

        self.driver.ensure_base_chain(
            family,
            NAT_OUTPUT_CHAIN,
            &BaseChain {
                chain_type: "nat",
                hook: "output",
                priority: -100,
            },
        )?;
        self.driver.append_rule(
            family,
            NAT_OUTPUT_CHAIN,
            &format!("jump {NAT_SERVICES_CHAIN}"),
        )?;

        self.driver.ensure_base_chain(
            family,
            NAT_POSTROUTING_CHAIN,
            &BaseChain {
                chain_type: "nat",
                hook: "postrouting",
                priority: 100,
            },
        )?;
        self.driver.append_rule(
            family,
            NAT_POSTROUTING_CHAIN,
            &format!("meta mark {HAIRPIN_MARK:#x} masquerade"),
        )?;

        Ok(())
    }

    /// Ensure the three service-level chains exist.
    pub fn install_service_chains(&mut self, family: TableFamily, svc_id: &str) -> Result<()> {
        self.driver.ensure_chain(family, &svc_chain(svc_id))?;
        self.driver.ensure_chain(family, &fw_chain(svc_id))?;
        self.driver.ensure_chain(family, &xlb_chain(svc_id))?;
        Ok(())
    }

    pub fn delete_service_chains(&mut self, family: TableFamily, svc_id: &str) -> Result<()> {
        self.driver.delete_chain(family, &svc_chain(svc_id))?;
        self.driver.delete_chain(family, &fw_chain(svc_id))?;
        self.driver.delete_chain(family, &xlb_chain(svc_id))?;
        Ok(())
    }

    pub fn program_cluster_ip(
        &mut self,
        family: TableFamily,
        svc_chain: &str,
        cluster_ip: &IpAddr,
        proto: Protocol,
        port: u16,
    ) -> Result<Vec<RuleHandle>> {
        let handle = self.driver.append_rule(
            family,
            NAT_SERVICES_CHAIN,
            &format!(
                "{} daddr {cluster_ip} {proto} dport {port} jump {svc_chain}",
                family.keyword()
            ),
        )?;
        Ok(vec![handle])
    }

    pub fn program_node_port(
        &mut self,
        family: TableFamily,
        svc_chain: &str,
        proto: Protocol,
        node_port: u16,
    ) -> Result<Vec<RuleHandle>> {
        let handle = self.driver.append_rule(
            family,
            NAT_NODEPORTS_CHAIN,
            &format!("{proto} dport {node_port} jump {svc_chain}"),
        )?;
        Ok(vec![handle])
    }

    /// External-IP rules are inserted right after `after` so the
    /// dispatcher keeps its cluster -> external -> loadbalancer order.
    /// The last returned handle is the insertion point for the next group.
    pub fn program_external_ips(
        &mut self,
        family: TableFamily,
        svc_chain: &str,
        ips: &[IpAddr],
        proto: Protocol,
        port: u16,
        after: RuleHandle,
    ) -> Result<Vec<RuleHandle>> {
        let mut handles = Vec::with_capacity(ips.len());
        let mut position = after;
        for ip in ips {
            let handle = self.driver.insert_rule(
                family,
                NAT_SERVICES_CHAIN,
                position,
                &format!(
                    "{} daddr {ip} {proto} dport {port} jump {svc_chain}",
                    family.keyword()
                ),
            )?;
            handles.push(handle);
            position = handle;
        }
        Ok(handles)
    }

    /// Populate the firewall chain loadbalancer traffic lands in. Without
    /// source restrictions on the service everything is forwarded on.
    pub fn program_lb_firewall(
        &mut self,
        family: TableFamily,
        svc_id: &str,
    ) -> Result<Vec<RuleHandle>> {
        let handle = self.driver.append_rule(
            family,
            &fw_chain(svc_id),
            &format!("jump {}", svc_chain(svc_id)),
        )?;
        Ok(vec![handle])
    }

    pub fn program_lb_ips(
        &mut self,
        family: TableFamily,
        svc_id: &str,
        ips: &[IpAddr],
        proto: Protocol,
        port: u16,
        after: RuleHandle,
    ) -> Result<Vec<RuleHandle>> {
        let fw = fw_chain(svc_id);
        let mut handles = Vec::with_capacity(ips.len());
        let mut position = after;
        for ip in ips {
            let handle = self.driver.insert_rule(
                family,
                NAT_SERVICES_CHAIN,
                position,
                &format!(
                    "{} daddr {ip} {proto} dport {port} jump {fw}",
                    family.keyword()
                ),
            )?;
            handles.push(handle);
            position = handle;
        }
        Ok(handles)
    }

    /// Atomically swap the service chain's dispatch rules for an N-way
    /// random split over `endpoint_chains`: every chain but the last gets
    /// `numgen random mod <remaining> == 0`, the last takes what is left.
    pub fn program_endpoints(
        &mut self,
        family: TableFamily,
        svc_chain: &str,
        endpoint_chains: &[String],
        previous: &[RuleHandle],
    ) -> Result<Vec<RuleHandle>> {
        let total = endpoint_chains.len();
        let rules: Vec<String> = endpoint_chains
            .iter()
            .enumerate()
            .map(|(i, chain)| {
                if i + 1 == total {
                    format!("jump {chain}")
                } else {
                    format!("numgen random mod {} == 0 jump {chain}", total - i)
                }
            })
            .collect();
        Ok(self
            .driver
            .replace_rules(family, svc_chain, previous, &rules)?)
    }

    /// Create the backend chain if needed and install its two rules: the
    /// hairpin mark for traffic a backend sends to its own service, then
    /// the DNAT to the backend.
    pub fn add_endpoint_rules(
        &mut self,
        family: TableFamily,
        chain: &str,
        ip: &IpAddr,
        proto: Protocol,
        port: u16,
    ) -> Result<Vec<RuleHandle>> {
        self.driver.ensure_chain(family, chain)?;
        let mark = self.driver.append_rule(
            family,
            chain,
            &format!(
                "{} saddr {ip} meta mark set {HAIRPIN_MARK:#x}",
                family.keyword()
            ),
        )?;
        let dnat = self.driver.append_rule(
            family,
            chain,
            &format!("meta l4proto {proto} dnat to {}", names::host_port(ip, port)),
        )?;
        Ok(vec![mark, dnat])
    }

    pub fn delete_rules(
        &mut self,
        family: TableFamily,
        chain: &str,
        handles: &[RuleHandle],
    ) -> Result<()> {
        for handle in handles {
            self.driver.delete_rule(family, chain, *handle)?;
        }
        Ok(())
    }

    pub fn delete_chain(&mut self, family: TableFamily, chain: &str) -> Result<()> {
        self.driver.delete_chain(family, chain)?;
        Ok(())
    }

    pub fn add_to_no_endpoints(
        &mut self,
        family: TableFamily,
        proto: Protocol,
        ip: &IpAddr,
        port: u16,
    ) -> Result<()> {
        self.driver
            .add_set_element(family, NO_ENDPOINTS_SET, &format!("{proto} . {ip} . {port}"))?;
        Ok(())
    }

    pub fn remove_from_no_endpoints(
        &mut self,
        family: TableFamily,
        proto: Protocol,
        ip: &IpAddr,
        port: u16,
    ) -> Result<()> {
        self.driver.remove_set_element(
            family,
            NO_ENDPOINTS_SET,
            &format!("{proto} . {ip} . {port}"),
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn driver(&self) -> &D {
        &self.driver
    }
}
