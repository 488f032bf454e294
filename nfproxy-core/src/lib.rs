pub mod cache;
mod error;
pub mod names;
pub mod proxy;
pub mod topology;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use proxy::{Proxy, ServiceProxy};
