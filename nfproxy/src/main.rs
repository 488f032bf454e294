mod config;
mod error;
mod http;
mod kubernetes;
mod metrics;

pub(crate) use crate::error::{Error, Result};

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use nfproxy_core::ServiceProxy;
use nfproxy_core::topology::Topology;
use nfproxy_nft::{NftBin, NftCli, TableFamily};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Args;

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "nfproxy exited with error");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nfproxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: Args) -> Result<()> {
    metrics::register();

    info!("loading cluster config");
    let mut kube_config = kube::Config::infer().await?;
    if let Some(url) = args.cluster_url.clone() {
        kube_config.cluster_url = url;
    }
    let client = kube::Client::try_from(kube_config)?;

    info!(table = %args.nft_table, "building nftables base topology");
    let driver = NftCli::new(NftBin::new(args.nft_bin.clone()), args.nft_table.clone());
    let mut topology = Topology::new(driver);
    topology.ensure_base(TableFamily::V4)?;
    if args.ipv6 {
        topology.ensure_base(TableFamily::V6)?;
    }

    let proxy = Arc::new(ServiceProxy::new(topology, args.node_name.clone()));

    let cancel = CancellationToken::new();
    let ready = CancellationToken::new();
    tokio::spawn(http::serve(
        args.status_address,
        ready.clone(),
        cancel.child_token(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    // the watchers replay the full cluster state from here on
    ready.cancel();
    kubernetes::run(client, proxy, cancel).await
}
