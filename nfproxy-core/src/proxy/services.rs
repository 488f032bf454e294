use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use nfproxy_nft::NftDriver;
use tracing::{debug, error, info, warn};

use crate::cache::ObjectKey;
use crate::{Error, Result};
use crate::proxy::{
    ProxyState, ServiceProxy, add_no_endpoints, remove_no_endpoints, update_service_chain,
    version_newer,
};
use crate::topology::{self, NAT_NODEPORTS_CHAIN, NAT_SERVICES_CHAIN};
use crate::types::{Protocol, ServicePortInfo, SvcPortKey, should_skip_service};

impl<D: NftDriver> ServiceProxy<D> {
    pub(crate) fn handle_add_service(&self, svc: &Service) -> Result<()> {
        let id = ObjectKey::from_meta(&svc.metadata);
        info!(service = %id, "AddService");
        if should_skip_service(svc) {
            debug!(service = %id, "skipping headless or ExternalName service");
            return Ok(());
        }
        self.cache.store_service(svc);

        for port in service_ports(svc) {
            let key = svc_port_key(&id, port);
            if let Err(e) = self.add_service_port(&key, port, svc) {
                error!(service = %key, %e, "failed to program service port");
            }
        }
        Ok(())
    }

    fn add_service_port(&self, key: &SvcPortKey, port: &ServicePort, svc: &Service) -> Result<()> {
        let mut state = self.lock();
        if state.service_map.contains_key(key) {
            let e = Error::AlreadyExists(key.to_string());
            warn!(service = %key, %e, "skipping service port add");
            return Ok(());
        }

        let mut info = ServicePortInfo::from_service(key, port, svc)?;
        let family = info.family;
        let chain = topology::svc_chain(&info.svc_id);
        state.topology.install_service_chains(family, &info.svc_id)?;

        // The dispatcher keeps cluster -> external -> loadbalancer order
        // for this service; `position` tracks where the next group goes.
        let handles = state.topology.program_cluster_ip(
            family,
            &chain,
            &info.cluster_ip,
            info.protocol,
            info.port,
        )?;
        let mut position = handles.last().copied();
        info.set_handles(family, NAT_SERVICES_CHAIN, handles);

        if info.node_port != 0 {
            let handles =
                state
                    .topology
                    .program_node_port(family, &chain, info.protocol, info.node_port)?;
            info.set_handles(family, NAT_NODEPORTS_CHAIN, handles);
        }

        if !info.external_ips.is_empty()
            && let Some(after) = position
        {
            let handles = state.topology.program_external_ips(
                family,
                &chain,
                &info.external_ips,
                info.protocol,
                info.port,
                after,
            )?;
            position = handles.last().copied().or(position);
            info.append_handles(family, NAT_SERVICES_CHAIN, &handles);
        }

        if !info.lb_ips.is_empty()
            && let Some(after) = position
        {
            let fw_handles = state.topology.program_lb_firewall(family, &info.svc_id)?;
            info.set_handles(family, topology::fw_chain(&info.svc_id), fw_handles);
            let handles = state.topology.program_lb_ips(
                family,
                &info.svc_id,
                &info.lb_ips,
                info.protocol,
                info.port,
                after,
            )?;
            info.append_handles(family, NAT_SERVICES_CHAIN, &handles);
        }

        let has_backends = state
            .endpoints_map
            .get(key)
            .is_some_and(|eps| !eps.is_empty());
        if has_backends {
            state.service_map.insert(key.clone(), info);
            update_service_chain(&mut state, key, family)?;
        } else {
            add_no_endpoints(&mut state.topology, &info)?;
            state.service_map.insert(key.clone(), info);
        }
        Ok(())
    }

    pub(crate) fn handle_delete_service(&self, svc: &Service) -> Result<()> {
        let id = ObjectKey::from_meta(&svc.metadata);
        info!(service = %id, "DeleteService");
        for port in service_ports(svc) {
            let key = svc_port_key(&id, port);
            if let Err(e) = self.delete_service_port(&key) {
                error!(service = %key, %e, "failed to remove service port");
            }
        }
        self.cache.remove_service(&id.namespace, &id.name);
        Ok(())
    }

    fn delete_service_port(&self, key: &SvcPortKey) -> Result<()> {
        let mut state = self.lock();
        let ProxyState {
            topology,
            service_map,
            ..
        } = &mut *state;
        let Some(info) = service_map.get(key) else {
            warn!(service = %key, "service port does not exist");
            return Ok(());
        };
        let family = info.family;

        if !info.has_endpoints
            && let Err(e) = remove_no_endpoints(topology, info)
        {
            error!(service = %key, %e, "failed to remove service from the no-endpoints set");
        }

        for (chain, handles) in info.owned_chains(family) {
            if handles.is_empty() {
                continue;
            }
            if let Err(e) = topology.delete_rules(family, chain, handles) {
                error!(service = %key, chain, %e, "failed to delete service rules");
            }
        }
        // Endpoint chains stay; they belong to the endpoints map.
        if let Err(e) = topology.delete_service_chains(family, &info.svc_id) {
            error!(service = %key, %e, "failed to delete service chains");
        }

        service_map.remove(key);
        Ok(())
    }

    /// A changed service is reprogrammed by tearing the old ports down and
    /// installing the new ones; an unchanged one is left alone. The cached
    /// copy wins over the delivered `old` when it is newer.
    pub(crate) fn handle_update_service(&self, old: &Service, new: &Service) -> Result<()> {
        let id = ObjectKey::from_meta(&new.metadata);
        let authoritative = self.authoritative_old_service(&id, old);
        if !service_surface_changed(&authoritative, new) {
            self.cache.store_service(new);
            return Ok(());
        }
        info!(service = %id, "UpdateService reprogramming changed service");
        self.handle_delete_service(&authoritative)?;
        self.handle_add_service(new)
    }

    fn authoritative_old_service(&self, id: &ObjectKey, old: &Service) -> Service {
        let Ok(cached) = self.cache.service_version(&id.namespace, &id.name) else {
            return old.clone();
        };
        let delivered = old
            .metadata
            .resource_version
            .clone()
            .unwrap_or_default();
        if version_newer(&cached, &delivered) {
            warn!(service = %id, %cached, %delivered, "old service is stale; using the cached copy");
            self.cache
                .service(&id.namespace, &id.name)
                .unwrap_or_else(|_| old.clone())
        } else {
            old.clone()
        }
    }
}

fn service_ports(svc: &Service) -> impl Iterator<Item = &ServicePort> {
    svc.spec
        .iter()
        .flat_map(|spec| spec.ports.iter())
        .flatten()
}

fn svc_port_key(id: &ObjectKey, port: &ServicePort) -> SvcPortKey {
    SvcPortKey::new(
        &id.namespace,
        &id.name,
        port.name.clone().unwrap_or_default(),
        Protocol::parse(port.protocol.as_deref()),
    )
}

/// Whether anything the dataplane depends on differs between the two
/// copies: cluster IP, the port list, node ports, protocols, external or
/// loadbalancer IPs, or the skip predicate itself.
fn service_surface_changed(old: &Service, new: &Service) -> bool {
    if should_skip_service(old) != should_skip_service(new) {
        return true;
    }
    let surface = |svc: &Service| {
        let spec = svc.spec.as_ref();
        let ports: Vec<_> = spec
            .and_then(|s: &ServiceSpec| s.ports.as_ref())
            .into_iter()
            .flatten()
            .map(|p| {
                (
                    p.name.clone().unwrap_or_default(),
                    p.port,
                    p.protocol.clone().unwrap_or_else(|| "TCP".into()),
                    p.node_port.unwrap_or(0),
                )
            })
            .collect();
        let lb_ips: Vec<_> = svc
            .status
            .iter()
            .filter_map(|s| s.load_balancer.as_ref())
            .flat_map(|lb| lb.ingress.iter().flatten())
            .filter_map(|ingress| ingress.ip.clone())
            .collect();
        (
            spec.and_then(|s| s.cluster_ip.clone()),
            spec.and_then(|s| s.external_ips.clone()),
            ports,
            lb_ips,
        )
    };
    surface(old) != surface(new)
}
