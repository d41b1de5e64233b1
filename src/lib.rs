#[macro_use]
extern crate anyhow;

pub mod channel;
pub mod config;
pub mod filter;
pub mod frequency;
pub mod frontend;
pub mod multicast;
pub mod presets;
pub mod rtcp;
pub mod rtp;
pub mod sap;
pub mod status;
pub mod supervisor;
pub mod system;

pub use {
    channel::{Channel, ChannelRegistry, ChannelTemplate},
    config::ConfigTree,
    frontend::{Frontend, FrontendDriver},
    presets::PresetTable,
    system::System,
};
