use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} {namespace}/{name} not found in the cache")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("service port {0} already exists")]
    AlreadyExists(String),

    #[error("invalid port {port} for {name}")]
    InvalidPort { name: String, port: i32 },

    #[error("driver error: {0}")]
    Driver(#[from] nfproxy_nft::Error),

    #[error("unexpected object: {0}")]
    UnexpectedObject(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
