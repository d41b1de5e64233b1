use {
    crate::{
        channel::{ChannelRegistry, ChannelTemplate},
        filter::Timing,
        frontend::Frontend,
        multicast::{avahi::ServiceAnnouncer, GroupAddr, OutputSockets},
        presets::PresetTable,
    },
    std::sync::Arc,
};

/// The process-wide singletons, built during startup and frozen before
/// the channel factories run. Everything long-lived hangs off an
/// `Arc<System>`; only the channel registry and the front-end status
/// area stay internally mutable.
pub struct System {
    pub presets: PresetTable,
    pub frontend: Arc<Frontend>,
    pub output: OutputSockets,
    pub announcer: Arc<dyn ServiceAnnouncer>,
    pub registry: ChannelRegistry,
    pub timing: Timing,
    pub global_template: ChannelTemplate,
    /// The global data group, the default destination for sections
    /// without their own `data=`.
    pub data_group: GroupAddr,
    /// The status/command group shared by every channel.
    pub status_group: GroupAddr,
    pub instance: String,
    pub hostname: String,
    pub iface: Option<String>,
    /// GPS time at startup; RTCP sender reports count from here.
    pub start_gps_ns: i64,
}
