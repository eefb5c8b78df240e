#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bridge;

mod dns_cache;
mod engine;
mod flow;
mod nat;
mod pool;
mod udp;

pub use engine::{EngineConfig, EngineHandle, spawn as spawn_engine};
pub use nat::{EntryKind, NatTable, TcpState};
pub use pool::ConnectionPool;
pub use udp::DnsMode;
