//! Wire vocabulary of the ticketing contract and a typed JSON-RPC client for it.

pub mod contract;
pub mod rpc;
pub mod types;

pub use types::*;
