//! Deterministic chain-name fingerprints.
//!
//! A restarted proxy must compute the same names a previous process left in
//! the kernel, so the inputs are exactly the stable identity of the object:
//! no timestamps, no pointers, no map iteration order.

use std::net::IpAddr;

use sha2::{Digest, Sha256};

use crate::types::SvcPortKey;

const ID_LEN: usize = 16;

/// Identifier for the per-service-port chains
/// (`k8s-nfproxy-svc-`/`-fw-`/`-xlb-`).
pub fn service_id(key: &SvcPortKey) -> String {
    fingerprint(format!("{key}{}", key.protocol.wire()).as_bytes())
}

/// Identifier for a backend's `k8s-nfproxy-sep-` chain.
pub fn endpoint_id(key: &SvcPortKey, ip: &IpAddr, port: u16) -> String {
    let endpoint = host_port(ip, port);
    fingerprint(format!("{key}{}{endpoint}", key.protocol.wire()).as_bytes())
}

/// `ip:port`, bracketing IPv6 the way nftables and the rest of the world
/// expect.
pub fn host_port(ip: &IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(ip) => format!("{ip}:{port}"),
        IpAddr::V6(ip) => format!("[{ip}]:{port}"),
    }
}

fn fingerprint(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    let mut encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &digest);
    encoded.truncate(ID_LEN);
    encoded
}
