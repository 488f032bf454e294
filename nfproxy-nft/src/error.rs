use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("nft exited with {status}: {stderr}")]
    Nft { status: i32, stderr: String },

    #[error("nft did not echo a handle for: {0}")]
    MissingHandle(String),

    #[error("failed to parse nft output: {0}")]
    Parse(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
