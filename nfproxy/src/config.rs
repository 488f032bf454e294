use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(version, about = "nftables-based Kubernetes service proxy", long_about = None)]
pub struct Args {
    /// Name of the node the proxy runs on, used to detect local endpoints
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// nftables table owned by the proxy
    #[arg(long, default_value = "nfproxy")]
    pub nft_table: String,

    /// Path to the nft binary
    #[arg(long, default_value = "nft")]
    pub nft_bin: PathBuf,

    /// Also program the ip6 NAT table
    #[arg(long, default_value_t = true)]
    pub ipv6: bool,

    /// Readiness and metrics listener
    #[arg(long, default_value = "0.0.0.0:9953")]
    pub status_address: SocketAddr,

    /// Override for the API server URL
    #[arg(long)]
    pub cluster_url: Option<http::Uri>,
}
