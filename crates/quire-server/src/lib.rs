//! quire-server: configuration and background work for the block engine
//! daemon. The binary in `main.rs` wires these to the command line.

pub mod config;
pub mod store;
pub mod sweeper;

pub use config::ServerConfig;
pub use store::Store;
