pub mod config;
pub mod rpc;
pub mod wire;

pub use config::*;
pub use rpc::*;
pub use wire::*;
