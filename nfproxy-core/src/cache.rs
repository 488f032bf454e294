//! Last-seen copies of watched objects.
//!
//! Watchers can deliver an Update whose `old` lags what was actually
//! programmed. The cache keeps the newest copy of every Service, Endpoints
//! and EndpointSlice it has processed so handlers can diff against an
//! authoritative old instead of trusting the caller.

use std::sync::Mutex;

use k8s_openapi::Metadata;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::warn;

use crate::{Error, Result};

pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Namespaced identity of a watched object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

struct KindCache<T> {
    kind: &'static str,
    objects: ahash::HashMap<ObjectKey, T>,
}

impl<T> KindCache<T>
where
    T: Metadata<Ty = ObjectMeta> + Clone,
{
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: ahash::HashMap::default(),
        }
    }

    fn get(&self, namespace: &str, name: &str) -> Result<T> {
        self.objects
            .get(&ObjectKey::new(namespace, name))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: self.kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn version(&self, namespace: &str, name: &str) -> Result<String> {
        self.objects
            .get(&ObjectKey::new(namespace, name))
            .and_then(|o| o.metadata().resource_version.clone())
            .ok_or_else(|| Error::NotFound {
                kind: self.kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn store(&mut self, obj: &T) {
        self.objects
            .insert(ObjectKey::from_meta(obj.metadata()), obj.clone());
    }

    fn remove(&mut self, namespace: &str, name: &str) {
        if self
            .objects
            .remove(&ObjectKey::new(namespace, name))
            .is_none()
        {
            warn!("{} {}/{} not found in the cache", self.kind, namespace, name);
        }
    }
}

struct Caches {
    services: KindCache<Service>,
    endpoints: KindCache<Endpoints>,
    slices: KindCache<EndpointSlice>,
}

pub struct ObjectCache {
    inner: Mutex<Caches>,
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Caches {
                services: KindCache::new("service"),
                endpoints: KindCache::new("endpoints"),
                slices: KindCache::new("endpoint slice"),
            }),
        }
    }
}

impl ObjectCache {
    pub fn service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.inner.lock().unwrap().services.get(namespace, name)
    }

    pub fn service_version(&self, namespace: &str, name: &str) -> Result<String> {
        self.inner.lock().unwrap().services.version(namespace, name)
    }

    pub fn store_service(&self, svc: &Service) {
        self.inner.lock().unwrap().services.store(svc);
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.inner.lock().unwrap().services.remove(namespace, name);
    }

    pub fn store_endpoints(&self, ep: &Endpoints) {
        self.inner.lock().unwrap().endpoints.store(ep);
    }

    pub fn remove_endpoints(&self, namespace: &str, name: &str) {
        self.inner.lock().unwrap().endpoints.remove(namespace, name);
    }

    pub fn slice(&self, namespace: &str, name: &str) -> Result<EndpointSlice> {
        self.inner.lock().unwrap().slices.get(namespace, name)
    }

    pub fn slice_version(&self, namespace: &str, name: &str) -> Result<String> {
        self.inner.lock().unwrap().slices.version(namespace, name)
    }

    pub fn store_slice(&self, slice: &EndpointSlice) {
        self.inner.lock().unwrap().slices.store(slice);
    }

    pub fn remove_slice(&self, namespace: &str, name: &str) {
        self.inner.lock().unwrap().slices.remove(namespace, name);
    }

    /// Whether any cached EndpointSlice claims this service via the
    /// `kubernetes.io/service-name` label. Used to give slices precedence
    /// over legacy Endpoints objects for the same service.
    pub fn service_has_slices(&self, namespace: &str, service_name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.slices.objects.iter().any(|(key, slice)| {
            key.namespace == namespace
                && slice
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(SERVICE_NAME_LABEL))
                    .is_some_and(|owner| owner == service_name)
        })
    }
}
