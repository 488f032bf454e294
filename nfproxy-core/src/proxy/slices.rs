//! Handlers for discovery.k8s.io EndpointSlices, the preferred endpoint
//! source. Every slice is flattened to (service port, address, port, ready)
//! tuples; updates walk the ready-transition table against the cached copy
//! of the slice, which is authoritative when the watcher delivers a stale
//! `old`.

use std::net::IpAddr;

use k8s_openapi::api::discovery::v1::{EndpointConditions, EndpointSlice};
use nfproxy_nft::NftDriver;
use tracing::{debug, error, warn};

use crate::cache::{ObjectKey, SERVICE_NAME_LABEL};
use crate::names;
use crate::proxy::{ServiceProxy, add_endpoint, delete_endpoint, version_newer};
use crate::types::{Protocol, SvcPortKey};
use crate::{Error, Result};

impl<D: NftDriver> ServiceProxy<D> {
    pub(crate) fn handle_add_endpoint_slice(&self, slice: &EndpointSlice) -> Result<()> {
        let id = ObjectKey::from_meta(&slice.metadata);
        debug!(slice = %id, "AddEndpointSlice");
        self.cache.store_slice(slice);

        let backends = process_slice(slice)?;
        let mut state = self.lock();
        // not-ready tuples are skipped; a later update flips them ready
        for b in backends.iter().filter(|b| b.ready) {
            if let Err(e) = add_endpoint(
                &mut state,
                &self.hostname,
                &b.key,
                b.ip,
                b.node_name.as_deref(),
                b.port,
            ) {
                error!(
                    slice = %id,
                    endpoint = %names::host_port(&b.ip, b.port),
                    %e,
                    "failed to add endpoint"
                );
            }
        }
        Ok(())
    }

    pub(crate) fn handle_delete_endpoint_slice(&self, slice: &EndpointSlice) -> Result<()> {
        let id = ObjectKey::from_meta(&slice.metadata);
        debug!(slice = %id, "DeleteEndpointSlice");

        let backends = process_slice(slice)?;
        {
            let mut state = self.lock();
            for b in backends.iter().filter(|b| b.ready) {
                if !state.endpoints_map.contains_key(&b.key) {
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
                        slice = %id,
                        endpoint = %names::host_port(&b.ip, b.port),
                        %e,
                        "failed to remove endpoint"
                    );
                }
            }
        }
        self.cache.remove_slice(&id.namespace, &id.name);
        Ok(())
    }

    pub(crate) fn handle_update_endpoint_slice(
        &self,
        old: &EndpointSlice,
        new: &EndpointSlice,
    ) -> Result<()> {
        let id = ObjectKey::from_meta(&new.metadata);
        debug!(slice = %id, "UpdateEndpointSlice");

        let stored = self.authoritative_old_slice(&id, old);
        let old_backends = process_slice(&stored).unwrap_or_default();
        let new_backends = process_slice(new)?;

        {
            let mut state = self.lock();
            for b in &new_backends {
                let previous = old_backends
                    .iter()
                    .find(|o| o.key == b.key && o.ip == b.ip && o.port == b.port);
                let action = match previous {
                    // new tuple arriving ready
                    None if b.ready => Some(true),
                    // known tuple flipping not-ready -> ready
                    Some(p) if b.ready && !p.ready => Some(true),
                    // known tuple flipping ready -> not-ready
                    Some(p) if !b.ready && p.ready => Some(false),
                    _ => None,
                };
                match action {
                    Some(true) => {
                        if let Err(e) = add_endpoint(
                            &mut state,
                            &self.hostname,
                            &b.key,
                            b.ip,
                            b.node_name.as_deref(),
                            b.port,
                        ) {
                            error!(
                                slice = %id,
                                endpoint = %names::host_port(&b.ip, b.port),
                                %e,
                                "failed to add endpoint"
                            );
                        }
                    }
                    Some(false) => {
                        if !state.endpoints_map.contains_key(&b.key) {
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
                                slice = %id,
                                endpoint = %names::host_port(&b.ip, b.port),
                                %e,
                                "failed to remove endpoint"
                            );
                        }
                    }
                    None => {}
                }
            }

            // tuples that disappeared from the slice while ready
            for o in old_backends.iter().filter(|o| o.ready) {
                let still_present = new_backends
                    .iter()
                    .any(|n| n.key == o.key && n.ip == o.ip && n.port == o.port);
                if still_present || !state.endpoints_map.contains_key(&o.key) {
                    continue;
                }
                if let Err(e) = delete_endpoint(
                    &mut state,
                    &self.hostname,
                    &o.key,
                    o.ip,
                    o.node_name.as_deref(),
                    o.port,
                ) {
                    error!(
                        slice = %id,
                        endpoint = %names::host_port(&o.ip, o.port),
                        %e,
                        "failed to remove endpoint"
                    );
                }
            }
        }

        self.cache.store_slice(new);
        Ok(())
    }

    fn authoritative_old_slice(&self, id: &ObjectKey, old: &EndpointSlice) -> EndpointSlice {
        let Ok(cached) = self.cache.slice_version(&id.namespace, &id.name) else {
            error!(slice = %id, "endpoint slice missing from cache on update");
            return old.clone();
        };
        let delivered = old.metadata.resource_version.clone().unwrap_or_default();
        if cached != delivered {
            warn!(slice = %id, %cached, %delivered, "mismatched old endpoint slice version");
        }
        if version_newer(&cached, &delivered) {
            self.cache
                .slice(&id.namespace, &id.name)
                .unwrap_or_else(|_| old.clone())
        } else {
            old.clone()
        }
    }
}

pub(crate) struct SliceBackend {
    pub key: SvcPortKey,
    pub ip: IpAddr,
    pub node_name: Option<String>,
    pub port: u16,
    pub ready: bool,
}

/// The cartesian product of a slice's addresses and ports, keyed by the
/// owning service from the `kubernetes.io/service-name` label. Slices
/// without the label yield nothing.
pub(crate) fn process_slice(slice: &EndpointSlice) -> Result<Vec<SliceBackend>> {
    let id = ObjectKey::from_meta(&slice.metadata);
    let Some(service_name) = slice
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SERVICE_NAME_LABEL))
    else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for endpoint in &slice.endpoints {
        let ready = endpoint_ready(endpoint.conditions.as_ref());
        for port in slice.ports.iter().flatten() {
            let Some(raw_port) = port.port else {
                continue;
            };
            let port_number = u16::try_from(raw_port).ok().filter(|p| *p != 0).ok_or(
                Error::InvalidPort {
                    name: format!("{id}:{}", port.name.as_deref().unwrap_or_default()),
                    port: raw_port,
                },
            )?;
            let key = SvcPortKey::new(
                &id.namespace,
                service_name,
                port.name.clone().unwrap_or_default(),
                Protocol::parse(port.protocol.as_deref()),
            );
            for addr in &endpoint.addresses {
                let Ok(ip) = addr.parse::<IpAddr>() else {
                    warn!(slice = %id, %addr, "ignoring endpoint address with invalid host");
                    continue;
                };
                out.push(SliceBackend {
                    key: key.clone(),
                    ip,
                    node_name: endpoint.node_name.clone(),
                    port: port_number,
                    ready,
                });
            }
        }
    }
    Ok(out)
}

/// An absent ready condition means unknown, which consumers are told to
/// treat as ready.
fn endpoint_ready(conditions: Option<&EndpointConditions>) -> bool {
    conditions.and_then(|c| c.ready).unwrap_or(true)
}
