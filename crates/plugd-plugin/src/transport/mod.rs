//! Stdio transport to out-of-process plugin backends.

pub mod process;
pub mod rpc;

pub use process::ProcessClient;
pub use rpc::{RpcConnection, RpcFrame};
