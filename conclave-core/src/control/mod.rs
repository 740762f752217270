//! Per-node control socket: addressing, wire protocol and the node-side server

pub mod address;
pub mod protocol;
pub mod server;

pub use address::{AddressResolver, SocketDir, node_endpoint};
pub use protocol::{COMMAND_NAMES, ControlCommand, ControlResponse, ResponseStatus};
pub use server::{ControlServer, NodeHandler};
