#![cfg_attr(test, allow(clippy::unwrap_used))]

mod profile;
mod state;
mod stats;

pub use profile::{
    DnsSettings, LastConnection, Profile, ProfileError, ProfileId, RouterMode, RouterSettings,
    Transport,
};
pub use state::{ConnectionState, StateCell};
pub use stats::{StatsSnapshot, TrafficStats};
