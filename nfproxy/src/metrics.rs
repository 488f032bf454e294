use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("nfproxy")));

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatchLabels {
    pub kind: String,
    pub op: String,
}

static WATCH_EVENTS: LazyLock<Family<WatchLabels, Counter>> = LazyLock::new(Family::default);

pub fn register() {
    let mut registry = REGISTRY.write().unwrap();
    registry.register(
        "watch_events",
        "Watch events dispatched to the proxy",
        WATCH_EVENTS.clone(),
    );
}

pub fn watch_event(kind: &'static str, op: &'static str) {
    WATCH_EVENTS
        .get_or_create(&WatchLabels {
            kind: kind.into(),
            op: op.into(),
        })
        .inc();
}
