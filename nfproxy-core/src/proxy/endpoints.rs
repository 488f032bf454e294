//! Handlers for the legacy core/v1 Endpoints API.
//!
//! Add and Delete are both expressed through Update against an empty copy
//! carrying the same identity, so the whole legacy surface is one
//! symmetric diff at (service port, address, port) granularity.

use std::net::IpAddr;

use k8s_openapi::api::core::v1::Endpoints;
use nfproxy_nft::NftDriver;
use tracing::{debug, error, warn};

use crate::Result;
use crate::cache::ObjectKey;
use crate::names;
use crate::proxy::{ServiceProxy, add_endpoint, delete_endpoint};
use crate::types::{Protocol, SvcPortKey};

impl<D: NftDriver> ServiceProxy<D> {
    pub(crate) fn handle_add_endpoints(&self, ep: &Endpoints) -> Result<()> {
        let id = ObjectKey::from_meta(&ep.metadata);
        debug!(endpoints = %id, "AddEndpoints");
        self.handle_update_endpoints(&empty_shell(ep), ep)
    }

    pub(crate) fn handle_delete_endpoints(&self, ep: &Endpoints) -> Result<()> {
        let id = ObjectKey::from_meta(&ep.metadata);
        debug!(endpoints = %id, "DeleteEndpoints");
        self.handle_update_endpoints(ep, &empty_shell(ep))?;
        self.cache.remove_endpoints(&id.namespace, &id.name);
        Ok(())
    }

    pub(crate) fn handle_update_endpoints(&self, old: &Endpoints, new: &Endpoints) -> Result<()> {
        let id = ObjectKey::from_meta(&new.metadata);
        if id.namespace.is_empty() && id.name.is_empty() {
            // service deletion triggers an endpoints update with no
            // identity; nothing to reconcile against
            return Ok(());
        }
        if self.cache.service_has_slices(&id.namespace, &id.name) {
            debug!(endpoints = %id, "ignoring legacy Endpoints for a slice-managed service");
            return Ok(());
        }
        if old.subsets == new.subsets {
            return Ok(());
        }
        self.cache.store_endpoints(new);

        let old_backends = subset_backends(&id, old);
        let new_backends = subset_backends(&id, new);

        let mut state = self.lock();
        for b in &new_backends {
            if contains_backend(&old_backends, b) {
                continue;
            }
            if let Err(e) = add_endpoint(
                &mut state,
                &self.hostname,
                &b.key,
                b.ip,
                b.node_name.as_deref(),
                b.port,
            ) {
                error!(
                    service = %b.key,
                    endpoint = %names::host_port(&b.ip, b.port),
                    %e,
                    "failed to add endpoint"
                );
            }
        }
        for b in &old_backends {
            if contains_backend(&new_backends, b) || !state.endpoints_map.contains_key(&b.key) {
                continue;
            }
            if let Err(e) = delete_endpoint(
                &mut state,
                &self.hostname,
                &b.key,
                b.ip,
                b.node_name.as_deref(),
                b.port,
            ) {
                error!(
                    service = %b.key,
                    endpoint = %names::host_port(&b.ip, b.port),
                    %e,
                    "failed to remove endpoint"
                );
            }
        }
        Ok(())
    }
}

/// Same identity, no subsets. Diffing a real object against its shell
/// yields pure adds or pure deletes.
fn empty_shell(ep: &Endpoints) -> Endpoints {
    Endpoints {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: ep.metadata.name.clone(),
            namespace: ep.metadata.namespace.clone(),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) struct SubsetBackend {
    pub key: SvcPortKey,
    pub ip: IpAddr,
    pub node_name: Option<String>,
    pub port: u16,
}

pub(crate) fn subset_backends(id: &ObjectKey, ep: &Endpoints) -> Vec<SubsetBackend> {
    let mut out = Vec::new();
    for subset in ep.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let port_number = match u16::try_from(port.port) {
                Ok(p) if p != 0 => p,
                _ => {
                    warn!(endpoints = %id, port = port.port, "ignoring invalid endpoint port");
                    continue;
                }
            };
            let key = SvcPortKey::new(
                &id.namespace,
                &id.name,
                port.name.clone().unwrap_or_default(),
                Protocol::parse(port.protocol.as_deref()),
            );
            for addr in subset.addresses.iter().flatten() {
                let Ok(ip) = addr.ip.parse::<IpAddr>() else {
                    warn!(endpoints = %id, addr = %addr.ip, "ignoring endpoint address with invalid host");
                    continue;
                };
                out.push(SubsetBackend {
                    key: key.clone(),
                    ip,
                    node_name: addr.node_name.clone(),
                    port: port_number,
                });
            }
        }
    }
    out
}

fn contains_backend(backends: &[SubsetBackend], wanted: &SubsetBackend) -> bool {
    backends
        .iter()
        .any(|b| b.key == wanted.key && b.ip == wanted.ip && b.port == wanted.port)
}
