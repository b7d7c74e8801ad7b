#![deny(clippy::await_holding_refcell_ref)]

pub mod client;
pub mod common;
pub mod gateway;
pub mod job;
pub mod registry;
pub mod script;
pub mod session;
pub mod tracker;

pub type Error = crate::common::error::HpcError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub use common::JobId;

pub const HPCBENCH_VERSION: &str = {
    match option_env!("HPCBENCH_BUILD_VERSION") {
        Some(version) => version,
        None => env!("CARGO_PKG_VERSION"),
    }
};
