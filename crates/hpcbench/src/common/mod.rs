pub mod cli;
pub mod config;
pub mod error;
pub mod idcounter;
pub mod manager;
pub mod parser;
pub mod setup;
pub mod utils;

pub use idcounter::JobId;
