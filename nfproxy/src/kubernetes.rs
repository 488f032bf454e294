//! Watch loops feeding the reconciler.
//!
//! The proxy wants Add/Update(old, new)/Delete callbacks, while a watcher
//! stream only carries the current object. Each loop keeps the previous
//! copy of every object so it can replay the stream as the callback
//! protocol, including synthesizing deletes for objects that vanished
//! during a relist.

use std::pin::pin;
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Resource, ResourceExt};
use nfproxy_core::Proxy;
use nfproxy_core::cache::ObjectKey;
use serde::de::DeserializeOwned;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics;
use crate::{Error, Result};

pub(crate) enum ResourceEvent<'a, K> {
    Add(&'a K),
    Update(&'a K, &'a K),
    Delete(&'a K),
}

/// Turns the watcher event stream back into Add/Update/Delete callbacks by
/// remembering the last copy of every object.
struct WatchState<K> {
    last_seen: ahash::HashMap<ObjectKey, K>,
    relisted: Option<ahash::HashSet<ObjectKey>>,
}

impl<K> WatchState<K>
where
    K: Resource + Clone,
    K::DynamicType: Default,
{
    fn new() -> Self {
        Self {
            last_seen: ahash::HashMap::default(),
            relisted: None,
        }
    }

    fn apply<F>(&mut self, event: Event<K>, dispatch: &mut F)
    where
        F: FnMut(ResourceEvent<'_, K>),
    {
        match event {
            Event::Init => {
                self.relisted = Some(ahash::HashSet::default());
            }
            Event::InitApply(obj) | Event::Apply(obj) => {
                let key = object_key(&obj);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key.clone());
                }
                match self.last_seen.get(&key) {
                    Some(prev) => dispatch(ResourceEvent::Update(prev, &obj)),
                    None => dispatch(ResourceEvent::Add(&obj)),
                }
                self.last_seen.insert(key, obj);
            }
            Event::Delete(obj) => {
                self.last_seen.remove(&object_key(&obj));
                dispatch(ResourceEvent::Delete(&obj));
            }
            Event::InitDone => {
                // objects that disappeared while we were not watching
                let Some(relisted) = self.relisted.take() else {
                    return;
                };
                let gone: Vec<ObjectKey> = self
                    .last_seen
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                for key in gone {
                    if let Some(obj) = self.last_seen.remove(&key) {
                        dispatch(ResourceEvent::Delete(&obj));
                    }
                }
            }
        }
    }
}

fn object_key<K>(obj: &K) -> ObjectKey
where
    K: Resource,
    K::DynamicType: Default,
{
    ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

async fn watch_resource<K, F>(
    api: Api<K>,
    kind: &'static str,
    cancel: CancellationToken,
    mut dispatch: F,
) -> Result<()>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned + Send + 'static,
    K::DynamicType: Clone + Default,
    F: FnMut(ResourceEvent<'_, K>),
{
    let mut state = WatchState::new();
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = pin!(stream);
    info!(kind, "started watch");
    loop {
        let event = select! {
            _ = cancel.cancelled() => return Ok(()),
            event = stream.try_next() => event?,
        };
        let Some(event) = event else {
            return Err(Error::WatchClosed(kind));
        };
        state.apply(event, &mut dispatch);
    }
}

/// Run the Service, Endpoints and EndpointSlice watches until cancellation
/// or the first stream failure.
pub(crate) async fn run<P>(
    client: kube::Client,
    proxy: Arc<P>,
    cancel: CancellationToken,
) -> Result<()>
where
    P: Proxy + Send + Sync + 'static,
{
    let services: Api<Service> = Api::all(client.clone());
    let endpoints: Api<Endpoints> = Api::all(client.clone());
    let slices: Api<EndpointSlice> = Api::all(client);

    let svc_proxy = Arc::clone(&proxy);
    let service_watch = watch_resource(
        services,
        "Service",
        cancel.clone(),
        move |event| match event {
            ResourceEvent::Add(svc) => {
                metrics::watch_event("service", "add");
                svc_proxy.add_service(svc);
            }
            ResourceEvent::Update(old, new) => {
                metrics::watch_event("service", "update");
                svc_proxy.update_service(old, new);
            }
            ResourceEvent::Delete(svc) => {
                metrics::watch_event("service", "delete");
                svc_proxy.delete_service(svc);
            }
        },
    );

    let ep_proxy = Arc::clone(&proxy);
    let endpoints_watch = watch_resource(
        endpoints,
        "Endpoints",
        cancel.clone(),
        move |event| match event {
            ResourceEvent::Add(ep) => {
                metrics::watch_event("endpoints", "add");
                ep_proxy.add_endpoints(ep);
            }
            ResourceEvent::Update(old, new) => {
                metrics::watch_event("endpoints", "update");
                ep_proxy.update_endpoints(old, new);
            }
            ResourceEvent::Delete(ep) => {
                metrics::watch_event("endpoints", "delete");
                ep_proxy.delete_endpoints(ep);
            }
        },
    );

    let slice_proxy = Arc::clone(&proxy);
    let slice_watch = watch_resource(
        slices,
        "EndpointSlice",
        cancel,
        move |event| match event {
            ResourceEvent::Add(slice) => {
                metrics::watch_event("endpointslice", "add");
                slice_proxy.add_endpoint_slice(slice);
            }
            ResourceEvent::Update(old, new) => {
                metrics::watch_event("endpointslice", "update");
                slice_proxy.update_endpoint_slice(old, new);
            }
            ResourceEvent::Delete(slice) => {
                metrics::watch_event("endpointslice", "delete");
                slice_proxy.delete_endpoint_slice(slice);
            }
        },
    );

    select! {
        res = service_watch => res,
        res = endpoints_watch => res,
        res = slice_watch => res,
    }
}
