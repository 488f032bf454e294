//! The reconciler between watched cluster objects and the programmed
//! ruleset.
//!
//! One mutex serialises every mutation of the service map, the endpoints
//! map and the kernel state they describe; each handler holds it for its
//! whole mutating section, so the ruleset observed after a batch of events
//! equals the events applied one at a time in arrival order.

pub mod endpoints;
pub mod services;
pub mod slices;

use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use nfproxy_nft::{NftDriver, TableFamily};
use tracing::{debug, error, warn};

use crate::Result;
use crate::cache::{ObjectCache, ObjectKey};
use crate::names;
use crate::topology::{self, Topology};
use crate::types::{
    EndpointInfo, EndpointsMap, ServiceMap, ServicePortInfo, SvcPortKey, table_family_of,
};

/// The callback surface the cluster watchers drive. All entry points are
/// infallible: failures are logged with the object identity and the next
/// authoritative watch event is expected to restore the invariants.
pub trait Proxy {
    fn add_service(&self, svc: &Service);
    fn update_service(&self, old: &Service, new: &Service);
    fn delete_service(&self, svc: &Service);
    fn add_endpoints(&self, ep: &Endpoints);
    fn update_endpoints(&self, old: &Endpoints, new: &Endpoints);
    fn delete_endpoints(&self, ep: &Endpoints);
    fn add_endpoint_slice(&self, slice: &EndpointSlice);
    fn update_endpoint_slice(&self, old: &EndpointSlice, new: &EndpointSlice);
    fn delete_endpoint_slice(&self, slice: &EndpointSlice);
}

pub(crate) struct ProxyState<D> {
    pub(crate) topology: Topology<D>,
    pub(crate) service_map: ServiceMap,
    pub(crate) endpoints_map: EndpointsMap,
}

pub struct ServiceProxy<D> {
    pub(crate) hostname: String,
    pub(crate) state: Mutex<ProxyState<D>>,
    pub(crate) cache: ObjectCache,
}

impl<D: NftDriver> ServiceProxy<D> {
    pub fn new(topology: Topology<D>, hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: Mutex::new(ProxyState {
                topology,
                service_map: ServiceMap::default(),
                endpoints_map: EndpointsMap::default(),
            }),
            cache: ObjectCache::default(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ProxyState<D>> {
        self.state.lock().unwrap()
    }
}

impl<D: NftDriver> Proxy for ServiceProxy<D> {
    fn add_service(&self, svc: &Service) {
        if let Err(e) = self.handle_add_service(svc) {
            error!(service = %ObjectKey::from_meta(&svc.metadata), %e, "AddService failed");
        }
    }

    fn update_service(&self, old: &Service, new: &Service) {
        if let Err(e) = self.handle_update_service(old, new) {
            error!(service = %ObjectKey::from_meta(&new.metadata), %e, "UpdateService failed");
        }
    }

    fn delete_service(&self, svc: &Service) {
        if let Err(e) = self.handle_delete_service(svc) {
            error!(service = %ObjectKey::from_meta(&svc.metadata), %e, "DeleteService failed");
        }
    }

    fn add_endpoints(&self, ep: &Endpoints) {
        if let Err(e) = self.handle_add_endpoints(ep) {
            error!(endpoints = %ObjectKey::from_meta(&ep.metadata), %e, "AddEndpoints failed");
        }
    }

    fn update_endpoints(&self, old: &Endpoints, new: &Endpoints) {
        if let Err(e) = self.handle_update_endpoints(old, new) {
            error!(endpoints = %ObjectKey::from_meta(&new.metadata), %e, "UpdateEndpoints failed");
        }
    }

    fn delete_endpoints(&self, ep: &Endpoints) {
        if let Err(e) = self.handle_delete_endpoints(ep) {
            error!(endpoints = %ObjectKey::from_meta(&ep.metadata), %e, "DeleteEndpoints failed");
        }
    }

    fn add_endpoint_slice(&self, slice: &EndpointSlice) {
        if let Err(e) = self.handle_add_endpoint_slice(slice) {
            error!(slice = %ObjectKey::from_meta(&slice.metadata), %e, "AddEndpointSlice failed");
        }
    }

    fn update_endpoint_slice(&self, old: &EndpointSlice, new: &EndpointSlice) {
        if let Err(e) = self.handle_update_endpoint_slice(old, new) {
            error!(slice = %ObjectKey::from_meta(&new.metadata), %e, "UpdateEndpointSlice failed");
        }
    }

    fn delete_endpoint_slice(&self, slice: &EndpointSlice) {
        if let Err(e) = self.handle_delete_endpoint_slice(slice) {
            error!(slice = %ObjectKey::from_meta(&slice.metadata), %e, "DeleteEndpointSlice failed");
        }
    }
}

/// Program one backend: its chain, its rules, its map entry, and the
/// service chain dispatch that now includes it.
pub(crate) fn add_endpoint<D: NftDriver>(
    state: &mut ProxyState<D>,
    hostname: &str,
    key: &SvcPortKey,
    ip: IpAddr,
    node_name: Option<&str>,
    port: u16,
) -> Result<()> {
    let family = table_family_of(&ip);
    let is_local = node_name == Some(hostname);
    let chain = topology::sep_chain(&names::endpoint_id(key, &ip, port));

    let handles = state
        .topology
        .add_endpoint_rules(family, &chain, &ip, key.protocol, port)?;

    state
        .endpoints_map
        .entry(key.clone())
        .or_default()
        .push(EndpointInfo {
            ip,
            port,
            protocol: key.protocol,
            is_local,
            family,
            chain,
            rule_handles: handles,
        });

    update_service_chain(state, key, family)
}

/// Tear one backend down. The service chain is rewritten before the
/// backend chain goes away so the dispatcher never references a deleted
/// chain.
pub(crate) fn delete_endpoint<D: NftDriver>(
    state: &mut ProxyState<D>,
    hostname: &str,
    key: &SvcPortKey,
    ip: IpAddr,
    node_name: Option<&str>,
    port: u16,
) -> Result<()> {
    let family = table_family_of(&ip);
    let is_local = node_name == Some(hostname);

    let Some(eps) = state.endpoints_map.get_mut(key) else {
        return Ok(());
    };
    let Some(idx) = eps
        .iter()
        .position(|ep| ep.same_backend(&ip, port, key.protocol, is_local))
    else {
        return Ok(());
    };
    let ep = eps.remove(idx);

    update_service_chain(state, key, family)?;
    state
        .topology
        .delete_rules(family, &ep.chain, &ep.rule_handles)?;
    state.topology.delete_chain(family, &ep.chain)?;

    if state.endpoints_map.get(key).is_some_and(Vec::is_empty) {
        state.endpoints_map.remove(key);
        debug!(service = %key, "no more endpoints");
        let ProxyState {
            topology,
            service_map,
            ..
        } = state;
        if let Some(info) = service_map.get_mut(key) {
            match add_no_endpoints(topology, info) {
                Ok(()) => info.has_endpoints = false,
                Err(e) => {
                    error!(service = %key, %e, "failed to add service to the no-endpoints set")
                }
            }
        }
    }
    Ok(())
}

/// Rewrite a service chain's dispatch rules from the current endpoint
/// list. Called on every endpoint add/remove; flips the service out of the
/// no-endpoints set on its first backend.
pub(crate) fn update_service_chain<D: NftDriver>(
    state: &mut ProxyState<D>,
    key: &SvcPortKey,
    family: TableFamily,
) -> Result<()> {
    let ProxyState {
        topology,
        service_map,
        endpoints_map,
    } = state;
    let Some(info) = service_map.get_mut(key) else {
        // endpoints can arrive before their service; the AddService that
        // follows wires them up
        return Ok(());
    };

    let chain = topology::svc_chain(&info.svc_id);
    let ep_chains: Vec<String> = endpoints_map
        .get(key)
        .into_iter()
        .flatten()
        .filter(|ep| ep.family == family)
        .map(|ep| ep.chain.clone())
        .collect();

    let previous = info.handles(family, &chain).to_vec();
    if ep_chains.is_empty() {
        if !previous.is_empty() {
            topology.delete_rules(family, &chain, &previous)?;
            info.set_handles(family, chain, Vec::new());
        }
        return Ok(());
    }

    if !info.has_endpoints {
        if let Err(e) = remove_no_endpoints(topology, info) {
            warn!(service = %key, %e, "failed to remove service from the no-endpoints set");
        }
        info.has_endpoints = true;
    }
    let handles = topology.program_endpoints(family, &chain, &ep_chains, &previous)?;
    info.set_handles(family, chain, handles);
    Ok(())
}

/// Register every virtual address of the service port in the set that
/// rejects traffic to backendless services.
pub(crate) fn add_no_endpoints<D: NftDriver>(
    topology: &mut Topology<D>,
    info: &ServicePortInfo,
) -> Result<()> {
    for ip in info.virtual_ips() {
        topology.add_to_no_endpoints(info.family, info.protocol, ip, info.port)?;
    }
    Ok(())
}

pub(crate) fn remove_no_endpoints<D: NftDriver>(
    topology: &mut Topology<D>,
    info: &ServicePortInfo,
) -> Result<()> {
    for ip in info.virtual_ips() {
        topology.remove_from_no_endpoints(info.family, info.protocol, ip, info.port)?;
    }
    Ok(())
}

/// Resource versions are opaque strings, numeric in practice. When both
/// parse, newer means strictly greater; otherwise any difference is
/// treated as the cache being ahead.
pub(crate) fn version_newer(cached: &str, delivered: &str) -> bool {
    match (cached.parse::<u64>(), delivered.parse::<u64>()) {
        (Ok(c), Ok(d)) => c > d,
        _ => cached != delivered,
    }
}

#[cfg(test)]
mod test;
