//! Transport-agnostic core of the room synchronization hub: wire codec,
//! protocol types, the identity/room registry, the NV engine, the
//! broadcast scheduler, the RPC router, the discovery responder, and the
//! lifecycle manager. Nothing in this crate touches a socket directly;
//! `netsync-transport` supplies the `Transport`/`RequestSocket`/
//! `PublishSocket` traits this crate's loops are built around, and
//! `netsync-server` wires the two together into a running process.

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod nv;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod rpc;
