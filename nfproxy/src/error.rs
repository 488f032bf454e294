use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Config(#[from] kube::config::InferConfigError),

    #[error("watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error(transparent)]
    Core(#[from] nfproxy_core::Error),

    #[error("{0} watch stream closed")]
    WatchClosed(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
