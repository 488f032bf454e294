use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort as CoreEndpointPort, EndpointSubset, Endpoints,
    LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort, ServiceSpec, ServiceStatus,
};
use k8s_openapi::api::discovery::v1::{
    Endpoint, EndpointConditions, EndpointPort, EndpointSlice,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::cache::SERVICE_NAME_LABEL;
use crate::testutil::FakeKernel;
use crate::topology::{
    NAT_NODEPORTS_CHAIN, NAT_SERVICES_CHAIN, NO_ENDPOINTS_SET, SEP_CHAIN_PREFIX,
};

use super::*;

fn new_proxy() -> ServiceProxy<FakeKernel> {
    let mut topology = Topology::new(FakeKernel::default());
    topology.ensure_base(TableFamily::V4).unwrap();
    topology.ensure_base(TableFamily::V6).unwrap();
    ServiceProxy::new(topology, "node-a")
}

fn service(cluster_ip: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("web".into()),
            namespace: Some("default".into()),
            resource_version: Some("1".into()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.into()),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: 80,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn slice(version: &str, backends: &[(&str, bool)]) -> EndpointSlice {
    let mut labels = BTreeMap::new();
    labels.insert(SERVICE_NAME_LABEL.to_string(), "web".to_string());
    EndpointSlice {
        address_type: "IPv4".into(),
        metadata: ObjectMeta {
            name: Some("web-abc12".into()),
            namespace: Some("default".into()),
            labels: Some(labels),
            resource_version: Some(version.into()),
            ..Default::default()
        },
        endpoints: backends
            .iter()
            .map(|(ip, ready)| Endpoint {
                addresses: vec![(*ip).into()],
                conditions: Some(EndpointConditions {
                    ready: Some(*ready),
                    ..Default::default()
                }),
                node_name: Some("node-b".into()),
                ..Default::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            name: Some("http".into()),
            port: Some(8080),
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
    }
}

fn endpoints(addrs: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some("web".into()),
            namespace: Some("default".into()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                addrs
                    .iter()
                    .map(|ip| EndpointAddress {
                        ip: (*ip).into(),
                        node_name: Some("node-b".into()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![CoreEndpointPort {
                name: Some("http".into()),
                port: 8080,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

fn key() -> SvcPortKey {
    SvcPortKey::new("default", "web", "http", crate::types::Protocol::Tcp)
}

fn svc_chain_name() -> String {
    topology::svc_chain(&names::service_id(&key()))
}

fn sep_chain_name(ip: &str, port: u16) -> String {
    topology::sep_chain(&names::endpoint_id(&key(), &ip.parse().unwrap(), port))
}

#[test]
fn test_cluster_ip_service_with_single_endpoint() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    proxy.add_endpoint_slice(&slice("5", &[("10.244.1.5", true)]));

    let state = proxy.lock();
    let kernel = state.topology.driver();

    let svc_chain = svc_chain_name();
    let sep_chain = sep_chain_name("10.244.1.5", 8080);
    assert!(kernel.has_chain(TableFamily::V4, &svc_chain));
    assert!(kernel.has_chain(TableFamily::V4, &sep_chain));

    let dispatcher = kernel.rules(TableFamily::V4, NAT_SERVICES_CHAIN);
    assert!(
        dispatcher
            .iter()
            .any(|r| r == &format!("ip daddr 10.96.0.10 tcp dport 80 jump {svc_chain}"))
    );

    assert_eq!(
        kernel.rules(TableFamily::V4, &svc_chain),
        vec![format!("jump {sep_chain}")]
    );
    assert_eq!(
        kernel.rules(TableFamily::V4, &sep_chain),
        vec![
            "ip saddr 10.244.1.5 meta mark set 0x4000".to_string(),
            "meta l4proto tcp dnat to 10.244.1.5:8080".to_string(),
        ]
    );
    assert_eq!(kernel.set_len(TableFamily::V4, NO_ENDPOINTS_SET), 0);

    assert!(state.service_map.get(&key()).is_some_and(|i| i.has_endpoints));
    assert_eq!(state.endpoints_map.get(&key()).map(Vec::len), Some(1));
}

#[test]
fn test_endpoint_ready_flip_toggles_no_endpoints_set() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    proxy.add_endpoint_slice(&slice("5", &[("10.244.1.5", true)]));

    // ready -> not ready: the backend leaves the dispatch, the tuple
    // lands in the no-endpoints set
    proxy.update_endpoint_slice(
        &slice("5", &[("10.244.1.5", true)]),
        &slice("6", &[("10.244.1.5", false)]),
    );
    {
        let state = proxy.lock();
        let kernel = state.topology.driver();
        assert!(kernel.rules(TableFamily::V4, &svc_chain_name()).is_empty());
        assert!(kernel.set_contains(
            TableFamily::V4,
            NO_ENDPOINTS_SET,
            "tcp . 10.96.0.10 . 80"
        ));
        assert!(!state.service_map.get(&key()).unwrap().has_endpoints);
    }

    // and back again
    proxy.update_endpoint_slice(
        &slice("6", &[("10.244.1.5", false)]),
        &slice("7", &[("10.244.1.5", true)]),
    );
    let state = proxy.lock();
    let kernel = state.topology.driver();
    assert_eq!(
        kernel.rules(TableFamily::V4, &svc_chain_name()),
        vec![format!("jump {}", sep_chain_name("10.244.1.5", 8080))]
    );
    assert_eq!(kernel.set_len(TableFamily::V4, NO_ENDPOINTS_SET), 0);
    assert!(state.service_map.get(&key()).unwrap().has_endpoints);
}

#[test]
fn test_node_port_and_lb_service_rule_order() {
    let mut svc = service("10.96.0.11");
    svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30080);
    svc.status = Some(ServiceStatus {
        load_balancer: Some(LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some("1.2.3.4".into()),
                ..Default::default()
            }]),
        }),
        ..Default::default()
    });

    let proxy = new_proxy();
    proxy.add_service(&svc);

    let state = proxy.lock();
    let kernel = state.topology.driver();
    let svc_id = names::service_id(&key());

    let dispatcher = kernel.rules(TableFamily::V4, NAT_SERVICES_CHAIN);
    let cluster = dispatcher
        .iter()
        .position(|r| r.contains("10.96.0.11"))
        .unwrap();
    let lb = dispatcher.iter().position(|r| r.contains("1.2.3.4")).unwrap();
    assert!(cluster < lb, "cluster-IP rule must precede the LB rule");
    assert!(dispatcher[lb].contains(&topology::fw_chain(&svc_id)));

    assert_eq!(
        kernel.rules(TableFamily::V4, NAT_NODEPORTS_CHAIN),
        vec![format!("tcp dport 30080 jump {}", topology::svc_chain(&svc_id))]
    );
    assert_eq!(
        kernel.rules(TableFamily::V4, &topology::fw_chain(&svc_id)),
        vec![format!("jump {}", topology::svc_chain(&svc_id))]
    );
}

#[test]
fn test_ipv6_service_lands_in_ip6_table() {
    let proxy = new_proxy();
    proxy.add_service(&service("fd00::1"));

    let state = proxy.lock();
    let kernel = state.topology.driver();
    let svc_chain = svc_chain_name();

    assert!(kernel.has_chain(TableFamily::V6, &svc_chain));
    assert!(!kernel.has_chain(TableFamily::V4, &svc_chain));

    let dispatcher = kernel.rules(TableFamily::V6, NAT_SERVICES_CHAIN);
    assert!(
        dispatcher
            .iter()
            .any(|r| r == &format!("ip6 daddr fd00::1 tcp dport 80 jump {svc_chain}"))
    );
    assert!(kernel.set_contains(TableFamily::V6, NO_ENDPOINTS_SET, "tcp . fd00::1 . 80"));
    assert_eq!(kernel.set_len(TableFamily::V4, NO_ENDPOINTS_SET), 0);
}

#[test]
fn test_delete_service_retains_endpoint_chains() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    proxy.add_endpoint_slice(&slice("5", &[("10.244.1.5", true)]));
    proxy.delete_service(&service("10.96.0.10"));

    let state = proxy.lock();
    let kernel = state.topology.driver();
    let svc_id = names::service_id(&key());

    // the endpoint chain belongs to the endpoints map and survives
    assert!(kernel.has_chain(TableFamily::V4, &sep_chain_name("10.244.1.5", 8080)));
    assert!(!kernel.has_chain(TableFamily::V4, &topology::svc_chain(&svc_id)));
    assert!(!kernel.has_chain(TableFamily::V4, &topology::fw_chain(&svc_id)));
    assert!(!kernel.has_chain(TableFamily::V4, &topology::xlb_chain(&svc_id)));

    let dispatcher = kernel.rules(TableFamily::V4, NAT_SERVICES_CHAIN);
    assert_eq!(dispatcher.len(), 1, "only the no-endpoints guard remains");

    assert!(state.service_map.is_empty());
    assert_eq!(state.endpoints_map.get(&key()).map(Vec::len), Some(1));
    assert_eq!(kernel.set_len(TableFamily::V4, NO_ENDPOINTS_SET), 0);
}

#[test]
fn test_stale_old_slice_is_replaced_by_cached_copy() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    proxy.add_endpoint_slice(&slice("5", &[("10.244.1.5", true)]));
    proxy.update_endpoint_slice(
        &slice("5", &[("10.244.1.5", true)]),
        &slice("7", &[("10.244.1.5", true), ("10.244.1.6", true)]),
    );

    // the watcher replays a stale old (v5); the cache holds v7, which must
    // win, so this update only removes 10.244.1.5
    proxy.update_endpoint_slice(
        &slice("5", &[("10.244.1.5", true)]),
        &slice("8", &[("10.244.1.6", true)]),
    );

    let state = proxy.lock();
    let kernel = state.topology.driver();
    assert_eq!(state.endpoints_map.get(&key()).map(Vec::len), Some(1));
    assert!(!kernel.has_chain(TableFamily::V4, &sep_chain_name("10.244.1.5", 8080)));
    assert_eq!(
        kernel.rules(TableFamily::V4, &svc_chain_name()),
        vec![format!("jump {}", sep_chain_name("10.244.1.6", 8080))]
    );
}

#[test]
fn test_add_then_delete_service_restores_ruleset() {
    let proxy = new_proxy();
    let baseline = proxy.lock().topology.driver().snapshot(TableFamily::V4);

    proxy.add_service(&service("10.96.0.10"));
    assert_ne!(
        proxy.lock().topology.driver().snapshot(TableFamily::V4),
        baseline
    );

    proxy.delete_service(&service("10.96.0.10"));
    assert_eq!(
        proxy.lock().topology.driver().snapshot(TableFamily::V4),
        baseline
    );
}

#[test]
fn test_endpoints_arriving_before_their_service() {
    let proxy = new_proxy();
    proxy.add_endpoint_slice(&slice("5", &[("10.244.1.5", true)]));

    // no service yet: the chain exists but nothing dispatches to it
    {
        let state = proxy.lock();
        assert!(state.service_map.is_empty());
        assert_eq!(state.endpoints_map.get(&key()).map(Vec::len), Some(1));
    }

    proxy.add_service(&service("10.96.0.10"));
    let state = proxy.lock();
    let kernel = state.topology.driver();
    assert!(state.service_map.get(&key()).unwrap().has_endpoints);
    assert_eq!(
        kernel.rules(TableFamily::V4, &svc_chain_name()),
        vec![format!("jump {}", sep_chain_name("10.244.1.5", 8080))]
    );
    assert_eq!(kernel.set_len(TableFamily::V4, NO_ENDPOINTS_SET), 0);
}

#[test]
fn test_update_slice_equals_explicit_adds_and_deletes() {
    // one proxy walks the transition table...
    let via_update = new_proxy();
    via_update.add_service(&service("10.96.0.10"));
    via_update.add_endpoint_slice(&slice("1", &[("10.244.1.5", true), ("10.244.1.6", false)]));
    via_update.update_endpoint_slice(
        &slice("1", &[("10.244.1.5", true), ("10.244.1.6", false)]),
        &slice(
            "2",
            &[("10.244.1.5", false), ("10.244.1.6", true), ("10.244.1.7", true)],
        ),
    );

    // ...the other receives the final state directly
    let direct = new_proxy();
    direct.add_service(&service("10.96.0.10"));
    direct.add_endpoint_slice(&slice(
        "2",
        &[("10.244.1.5", false), ("10.244.1.6", true), ("10.244.1.7", true)],
    ));

    assert_eq!(
        via_update.lock().topology.driver().text_snapshot(TableFamily::V4),
        direct.lock().topology.driver().text_snapshot(TableFamily::V4),
    );
}

#[test]
fn test_group_order_survives_service_churn() {
    let mut svc = service("10.96.0.12");
    svc.metadata.name = Some("gateway".into());
    {
        let spec = svc.spec.as_mut().unwrap();
        spec.external_ips = Some(vec!["192.0.2.1".into(), "192.0.2.2".into()]);
        spec.ports.as_mut().unwrap()[0].node_port = Some(30090);
    }
    svc.status = Some(ServiceStatus {
        load_balancer: Some(LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some("1.2.3.4".into()),
                ..Default::default()
            }]),
        }),
        ..Default::default()
    });

    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    proxy.add_service(&svc);
    proxy.delete_service(&svc);
    proxy.add_service(&svc);

    let state = proxy.lock();
    let dispatcher = state
        .topology
        .driver()
        .rules(TableFamily::V4, NAT_SERVICES_CHAIN);

    let find = |needle: &str| {
        dispatcher
            .iter()
            .position(|r| r.contains(needle))
            .unwrap_or_else(|| panic!("no dispatcher rule matching {needle}"))
    };
    let cluster = find("10.96.0.12");
    let ext1 = find("192.0.2.1");
    let ext2 = find("192.0.2.2");
    let lb = find("1.2.3.4");
    assert!(cluster < ext1 && ext1 < ext2 && ext2 < lb);
}

#[test]
fn test_legacy_endpoints_lifecycle() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    proxy.add_endpoints(&endpoints(&["10.244.1.5", "10.244.1.6"]));

    {
        let state = proxy.lock();
        let kernel = state.topology.driver();
        assert_eq!(state.endpoints_map.get(&key()).map(Vec::len), Some(2));
        assert_eq!(
            kernel
                .chains_with_prefix(TableFamily::V4, SEP_CHAIN_PREFIX)
                .len(),
            2
        );
        assert_eq!(kernel.rules(TableFamily::V4, &svc_chain_name()).len(), 2);
    }

    // shrink to one backend
    proxy.update_endpoints(&endpoints(&["10.244.1.5", "10.244.1.6"]), &endpoints(&["10.244.1.5"]));
    {
        let state = proxy.lock();
        let kernel = state.topology.driver();
        assert_eq!(state.endpoints_map.get(&key()).map(Vec::len), Some(1));
        assert_eq!(
            kernel.rules(TableFamily::V4, &svc_chain_name()),
            vec![format!("jump {}", sep_chain_name("10.244.1.5", 8080))]
        );
    }

    proxy.delete_endpoints(&endpoints(&["10.244.1.5"]));
    let state = proxy.lock();
    let kernel = state.topology.driver();
    assert!(state.endpoints_map.get(&key()).is_none());
    assert!(kernel.set_contains(TableFamily::V4, NO_ENDPOINTS_SET, "tcp . 10.96.0.10 . 80"));
    assert!(!state.service_map.get(&key()).unwrap().has_endpoints);
}

#[test]
fn test_legacy_endpoints_yield_to_slices() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    proxy.add_endpoint_slice(&slice("5", &[("10.244.1.5", true)]));

    // the same service speaks through the legacy API too; slices win
    proxy.add_endpoints(&endpoints(&["10.244.9.9"]));

    let state = proxy.lock();
    assert_eq!(state.endpoints_map.get(&key()).map(Vec::len), Some(1));
    assert_eq!(
        state.endpoints_map.get(&key()).unwrap()[0].ip,
        "10.244.1.5".parse::<std::net::IpAddr>().unwrap()
    );
}

#[test]
fn test_duplicate_add_service_is_rejected() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    let baseline = proxy.lock().topology.driver().snapshot(TableFamily::V4);

    // a second add for the same port must not double-program anything
    proxy.add_service(&service("10.96.0.10"));
    assert_eq!(
        proxy.lock().topology.driver().snapshot(TableFamily::V4),
        baseline
    );
}

#[test]
fn test_update_service_reprograms_changed_cluster_ip() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));

    let mut changed = service("10.96.0.20");
    changed.metadata.resource_version = Some("2".into());
    proxy.update_service(&service("10.96.0.10"), &changed);

    let state = proxy.lock();
    let dispatcher = state
        .topology
        .driver()
        .rules(TableFamily::V4, NAT_SERVICES_CHAIN);
    assert!(dispatcher.iter().any(|r| r.contains("10.96.0.20")));
    assert!(!dispatcher.iter().any(|r| r.contains("10.96.0.10")));
    assert!(state.topology.driver().set_contains(
        TableFamily::V4,
        NO_ENDPOINTS_SET,
        "tcp . 10.96.0.20 . 80"
    ));
}

#[test]
fn test_update_service_without_changes_is_a_noop() {
    let proxy = new_proxy();
    proxy.add_service(&service("10.96.0.10"));
    let baseline = proxy.lock().topology.driver().snapshot(TableFamily::V4);

    let mut same = service("10.96.0.10");
    same.metadata.resource_version = Some("2".into());
    proxy.update_service(&service("10.96.0.10"), &same);

    assert_eq!(
        proxy.lock().topology.driver().snapshot(TableFamily::V4),
        baseline
    );
}

#[test]
fn test_skipped_services_program_nothing() {
    let proxy = new_proxy();
    let baseline = proxy.lock().topology.driver().snapshot(TableFamily::V4);

    proxy.add_service(&service("None"));
    let mut external_name = service("");
    external_name.spec.as_mut().unwrap().type_ = Some("ExternalName".into());
    proxy.add_service(&external_name);

    assert_eq!(
        proxy.lock().topology.driver().snapshot(TableFamily::V4),
        baseline
    );
}
