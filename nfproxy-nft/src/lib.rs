pub mod driver;
mod error;
pub mod exec;

pub use driver::{BaseChain, NftDriver, RuleHandle, TableFamily};
pub use error::{Error, Result};
pub use exec::{NftBin, NftCli, NftRunner};
