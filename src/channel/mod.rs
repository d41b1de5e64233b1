pub mod template;

pub use template::{ChannelTemplate, DemodParams};

use {
    crate::{
        config::ConfigTree,
        frequency::{parse_frequency, ssrc_from_token},
        frontend::Frontend,
        multicast::{self, avahi, GroupAddr, DEFAULT_RTCP_PORT, DEFAULT_RTP_PORT, DEFAULT_STAT_PORT},
        rtcp,
        rtp::{payload_type, Encoding, RtpState},
        sap, supervisor,
        system::System,
    },
    anyhow::{Context, Result},
    std::{
        collections::HashMap,
        fmt,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
    },
};

/// Attempts at resolving an SSRC collision before the frequency is
/// dropped.
pub const SSRC_RETRY_LIMIT: u32 = 100;

const FREQ_KEYS: [&str; 11] = [
    "freq", "freq0", "freq1", "freq2", "freq3", "freq4", "freq5", "freq6", "freq7", "freq8",
    "freq9",
];

#[derive(Debug, Clone, Copy)]
struct TuneState {
    frequency: f64,
    idle_blocks: u32,
}

/// One active demodulator pipeline. Identity is the 32-bit RTP SSRC;
/// 0 is reserved. The channel owns its output destinations, RTP
/// counters and side threads, and borrows the front end.
pub struct Channel {
    ssrc: AtomicU32,
    pub frontend: Arc<Frontend>,

    pub data_dest: SocketAddr,
    pub status_dest: SocketAddr,
    pub rtcp_dest: Option<SocketAddr>,
    pub ttl: u8,
    pub samprate: u32,
    pub channels: u8,
    pub encoding: Encoding,
    pub payload_type: u8,
    pub preset: Option<String>,
    pub demod: DemodParams,

    pub rtp: RtpState,
    errors: AtomicU64,

    dynamic: bool,
    lifetime_blocks: u32,
    tune: Mutex<TuneState>,
    running: AtomicBool,
    demod_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Channel {
    /// Value-copies the template into a new channel. Only scalar and
    /// owned fields cross; dynamic buffers are created by the
    /// channel's own start path.
    fn from_template(
        ssrc: u32,
        template: &ChannelTemplate,
        frontend: Arc<Frontend>,
        data_dest: SocketAddr,
        status_dest: SocketAddr,
        dynamic: bool,
    ) -> Channel {
        Channel {
            ssrc: AtomicU32::new(ssrc),
            frontend,
            data_dest,
            status_dest,
            rtcp_dest: template
                .rtcp
                .then(|| SocketAddr::new(data_dest.ip(), DEFAULT_RTCP_PORT)),
            ttl: template.ttl,
            samprate: template.samprate,
            channels: template.channels,
            encoding: template.encoding,
            payload_type: payload_type(template.encoding, template.samprate, template.channels),
            preset: template.preset.clone(),
            demod: template.demod,
            rtp: RtpState::default(),
            errors: AtomicU64::new(0),
            dynamic,
            lifetime_blocks: template.lifetime_blocks,
            tune: Mutex::new(TuneState {
                frequency: 0.0,
                idle_blocks: template.lifetime_blocks,
            }),
            running: AtomicBool::new(true),
            demod_thread: Mutex::new(None),
        }
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn frequency(&self) -> f64 {
        self.tune.lock().unwrap_or_else(|e| e.into_inner()).frequency
    }

    /// Retunes the channel and resets its idle budget.
    pub fn set_frequency(&self, hz: f64) {
        let mut tune = self.tune.lock().unwrap_or_else(|e| e.into_inner());
        tune.frequency = hz;
        tune.idle_blocks = self.lifetime_blocks;
    }

    /// Marks command activity, restarting the idle budget.
    pub fn touch(&self) {
        let mut tune = self.tune.lock().unwrap_or_else(|e| e.into_inner());
        tune.idle_blocks = self.lifetime_blocks;
    }

    /// Ages the channel by one block. True when a dynamic channel
    /// parked at 0 Hz has exhausted its idle budget.
    pub fn age_block(&self) -> bool {
        if !self.dynamic {
            return false;
        }
        let mut tune = self.tune.lock().unwrap_or_else(|e| e.into_inner());
        if tune.frequency != 0.0 {
            return false;
        }
        tune.idle_blocks = tune.idle_blocks.saturating_sub(1);
        tune.idle_blocks == 0
    }

    #[inline]
    pub fn bump_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Asks the side threads to wind down.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(filter) = self.frontend.filter() {
            filter.wake_all();
        }
    }

    fn set_demod_thread(&self, handle: thread::JoinHandle<()>) {
        *self.demod_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Joins the demodulator thread; `stop` must have run first.
    pub fn join_demod(&self) {
        let handle = self.demod_thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ssrc {}: {:.0} Hz, {}/{}/{} -> {}",
            self.ssrc(),
            self.frequency(),
            self.encoding,
            self.samprate,
            self.channels,
            self.data_dest
        )
    }
}

/// All channels in the process, keyed by SSRC. Mutated by the channel
/// factory and the status task; the lock is never held across a socket
/// operation.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<u32, Arc<Channel>>>,
    started: AtomicUsize,
}

impl ChannelRegistry {
    pub fn new() -> ChannelRegistry {
        ChannelRegistry::default()
    }

    /// Claims a unique non-zero SSRC at or above `desired` and
    /// registers the channel built for it. Collisions increment and
    /// retry up to the limit.
    pub fn create(
        &self,
        desired: u32,
        make: impl FnOnce(u32) -> Channel,
    ) -> Result<Arc<Channel>> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut ssrc = desired;
        for _ in 0..SSRC_RETRY_LIMIT {
            if ssrc != 0 && !channels.contains_key(&ssrc) {
                let channel = Arc::new(make(ssrc));
                channels.insert(ssrc, channel.clone());
                self.started.fetch_add(1, Ordering::Relaxed);
                return Ok(channel);
            }
            ssrc = ssrc.wrapping_add(1);
        }
        bail!("no free SSRC within {SSRC_RETRY_LIMIT} of {desired}")
    }

    /// Registers a channel under exactly `ssrc`, never retrying; used
    /// for command-created channels whose identity the commander chose.
    pub fn create_exact(
        &self,
        ssrc: u32,
        make: impl FnOnce(u32) -> Channel,
    ) -> Result<Arc<Channel>> {
        ensure!(ssrc != 0, "SSRC 0 is reserved");
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        ensure!(!channels.contains_key(&ssrc), "SSRC {ssrc} already in use");
        let channel = Arc::new(make(ssrc));
        channels.insert(ssrc, channel.clone());
        self.started.fetch_add(1, Ordering::Relaxed);
        Ok(channel)
    }

    pub fn get(&self, ssrc: u32) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ssrc)
            .cloned()
    }

    pub fn remove(&self, ssrc: u32) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channels started over the process lifetime, including any since
    /// torn down.
    #[inline]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn ssrcs(&self) -> Vec<u32> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

/// Demodulator thread body. The bin slice, inverse FFT and detector run
/// downstream of the master filter; here the channel keeps its RTP
/// clock aligned with the block stream and reacts to teardown.
fn demod_loop(channel: Arc<Channel>) {
    let Some(filter) = channel.frontend.filter() else {
        return;
    };
    let input = channel.frontend.samprate.max(1);
    let samples_per_block =
        (filter.dims().l as u64 * u64::from(channel.samprate) / u64::from(input)).max(1) as u32;
    let timeout = 2 * std::time::Duration::from_secs_f64(
        filter.dims().l as f64 / f64::from(input),
    );

    let mut seen = filter.blocks();
    while channel.is_running() && !supervisor::should_stop() {
        let now = filter.wait_block(seen, timeout);
        if now > seen {
            seen = now;
            channel
                .rtp
                .timestamp
                .fetch_add(samples_per_block, Ordering::Relaxed);
        }
    }
}

/// Spawns the demodulator and the optional SAP/RTCP side threads for a
/// freshly created channel.
pub fn start_channel(
    sys: &Arc<System>,
    channel: &Arc<Channel>,
    template: &ChannelTemplate,
) -> Result<()> {
    let handle = thread::Builder::new()
        .name(format!("demod {}", channel.ssrc()))
        .spawn({
            let channel = channel.clone();
            move || demod_loop(channel)
        })
        .context("spawning demodulator thread")?;
    channel.set_demod_thread(handle);

    if template.sap {
        sap::spawn(sys, channel)?;
    }
    if template.rtcp {
        rtcp::spawn(sys, channel)?;
    }
    Ok(())
}

/// Tears one channel down: out of the registry first, threads joined
/// after, so no lock is held while waiting.
pub fn destroy_channel(sys: &System, channel: &Arc<Channel>) {
    sys.registry.remove(channel.ssrc());
    channel.stop();
    channel.join_demod();
    log::debug!("channel {} destroyed", channel.ssrc());
}

/// Resolves the section's output group, advertising it when the
/// section names its own; sections without `data=` share the global
/// group.
fn section_group(
    sys: &Arc<System>,
    section: &str,
    template: &ChannelTemplate,
) -> Result<GroupAddr> {
    let Some(name) = &template.data_group else {
        return Ok(sys.data_group.clone());
    };
    if *name == sys.data_group.name || multicast::ensure_local(name) == sys.data_group.name {
        return Ok(sys.data_group.clone());
    }

    let group = multicast::resolve_group(name, DEFAULT_RTP_PORT, template.use_dns);
    let service = if template.encoding.is_opus() {
        avahi::SERVICE_OPUS
    } else {
        avahi::SERVICE_RTP
    };
    avahi::advertise(
        sys.announcer.as_ref(),
        service,
        &format!("{} {}", sys.instance, section),
        &group,
        template.ttl.max(sys.output.configured_ttl()),
    )?;
    if let SocketAddr::V4(addr) = group.addr {
        if let Err(err) = sys.output.join(*addr.ip()) {
            log::warn!("[{section}] {err:#}");
        }
    }
    Ok(group)
}

/// The channel factory for one section: template, group advertisement,
/// one channel per parsed frequency token, side threads. Returns the
/// number of channels started.
pub fn channel_factory(sys: &Arc<System>, config: &ConfigTree, section: &str) -> Result<usize> {
    let sec = config
        .section(section)
        .with_context(|| format!("no such section [{section}]"))?;
    if config.get_bool(section, "disable").unwrap_or(false) {
        log::debug!("[{section}] disabled");
        return Ok(0);
    }

    let template = ChannelTemplate::build(
        config,
        &sys.presets,
        Some(section),
        sys.timing.idle_timeout_blocks(),
    );
    let group = section_group(sys, section, &template)?;
    let data_dest = group.addr;
    let status_dest = SocketAddr::new(group.addr.ip(), DEFAULT_STAT_PORT);

    // freq0..freq9 exist to sidestep the INI line-length limit
    let mut tokens: Vec<&str> = Vec::new();
    for key in FREQ_KEYS {
        if let Some(list) = sec.get(key) {
            tokens.extend(list.split_whitespace());
        }
    }

    let ssrc_override = config.get_int(section, "ssrc").map(|v| v as u32);

    let mut started = 0;
    for token in tokens {
        let Some(frequency) = parse_frequency(token) else {
            log::warn!("[{section}] cannot parse frequency {token}");
            continue;
        };
        let desired = ssrc_override.unwrap_or_else(|| ssrc_from_token(token));
        if desired == 0 {
            log::warn!("[{section}] {token}: SSRC 0 is reserved, channel skipped");
            continue;
        }

        let channel = match sys.registry.create(desired, |ssrc| {
            Channel::from_template(
                ssrc,
                &template,
                sys.frontend.clone(),
                data_dest,
                status_dest,
                false,
            )
        }) {
            Ok(channel) => channel,
            Err(err) => {
                log::warn!("[{section}] {token}: {err:#}");
                continue;
            }
        };
        channel.set_frequency(frequency);
        start_channel(sys, &channel, &template)?;
        log::debug!("[{section}] {channel}");
        started += 1;
    }
    Ok(started)
}

/// Creates a channel on demand for a command addressed to an unknown
/// SSRC. Dynamic channels inherit the global template, start parked at
/// 0 Hz, and expire once their idle budget runs out.
pub fn create_dynamic_channel(sys: &Arc<System>, ssrc: u32) -> Result<Arc<Channel>> {
    let template = sys.global_template.clone();
    let status_dest = SocketAddr::new(sys.data_group.addr.ip(), DEFAULT_STAT_PORT);
    let channel = sys.registry.create_exact(ssrc, |ssrc| {
        Channel::from_template(
            ssrc,
            &template,
            sys.frontend.clone(),
            sys.data_group.addr,
            status_dest,
            true,
        )
    })?;
    start_channel(sys, &channel, &template)?;
    log::debug!("dynamic {channel}");
    Ok(channel)
}

#[cfg(test)]
mod test {
    use super::*;
    use {
        crate::{
            filter::{FftParams, Timing},
            frontend,
            multicast::avahi::RecordRegistry,
            presets::PresetTable,
            rtcp, sap, status,
        },
        quickcheck_macros::quickcheck,
        std::{collections::HashSet, sync::OnceLock},
    };

    fn build_system(extra: &str) -> Arc<System> {
        let source = format!(
            "[global]\nhardware = rig\nblocktime = 20\noverlap = 5\n\
             [rig]\ndevice = sig_gen\nsamprate = 16000\n{extra}"
        );
        let config = ConfigTree::from_ini_str(&source).unwrap();
        let timing = Timing::from_config(&config).unwrap();
        let fe = frontend::bind(&config, timing, FftParams::default()).unwrap();
        let presets = PresetTable::from_tree(ConfigTree::default());
        let global_template = ChannelTemplate::build(
            &config,
            &presets,
            None,
            timing.idle_timeout_blocks(),
        );
        let data_group = multicast::resolve_group("bench-pcm", DEFAULT_RTP_PORT, false);
        let status_group = GroupAddr {
            name: data_group.name.clone(),
            addr: SocketAddr::new(data_group.addr.ip(), DEFAULT_STAT_PORT),
            synthesized: true,
        };
        Arc::new(System {
            presets,
            frontend: fe,
            output: multicast::OutputSockets::open(None, 1, 48).unwrap(),
            announcer: Arc::new(RecordRegistry::new()),
            registry: ChannelRegistry::new(),
            timing,
            global_template,
            data_group,
            status_group,
            instance: "bench".into(),
            hostname: "bench".into(),
            iface: None,
            start_gps_ns: rtcp::gps_time_ns(),
        })
    }

    fn run_factory(sys: &Arc<System>, section_body: &str) -> usize {
        let config = ConfigTree::from_ini_str(&format!("[hf]\n{section_body}")).unwrap();
        channel_factory(sys, &config, "hf").unwrap()
    }

    #[test]
    fn single_static_channel() {
        let sys = build_system("");
        let started = run_factory(&sys, "freq = 7200000\n");
        assert_eq!(started, 1);
        let channel = sys.registry.get(7_200_000).unwrap();
        assert_eq!(channel.frequency(), 7_200_000.0);
        // RTCP is off by default
        assert!(channel.rtcp_dest.is_none());
        assert_eq!(channel.status_dest.port(), DEFAULT_STAT_PORT);
    }

    #[test]
    fn ssrc_collision_increments() {
        let sys = build_system("");
        let started = run_factory(&sys, "freq = 7200000 7200000\n");
        assert_eq!(started, 2);
        let mut ssrcs = sys.registry.ssrcs();
        ssrcs.sort_unstable();
        assert_eq!(ssrcs, vec![7_200_000, 7_200_001]);
    }

    #[test]
    fn explicit_ssrc_override() {
        let sys = build_system("");
        run_factory(&sys, "freq = 7.2M\nssrc = 42\n");
        let channel = sys.registry.get(42).unwrap();
        assert_eq!(channel.frequency(), 7_200_000.0);
    }

    #[test]
    fn reserved_ssrc_skips_channel() {
        let sys = build_system("");
        // the digits of "0" derive SSRC 0, which is reserved
        assert_eq!(run_factory(&sys, "freq = 0\n"), 0);
        assert!(sys.registry.is_empty());
    }

    #[test]
    fn unparsable_tokens_are_skipped() {
        let sys = build_system("");
        assert_eq!(run_factory(&sys, "freq = 7200000 garbage 3.5M\n"), 2);
        assert_eq!(sys.registry.len(), 2);
    }

    #[test]
    fn freq_keys_split_long_lists() {
        let sys = build_system("");
        let started = run_factory(&sys, "freq0 = 1000000 2000000\nfreq1 = 3000000\n");
        assert_eq!(started, 3);
    }

    #[test]
    fn disabled_sections_start_nothing() {
        let sys = build_system("");
        assert_eq!(run_factory(&sys, "disable = yes\nfreq = 7200000\n"), 0);
    }

    #[test]
    fn rtcp_destination_is_adjacent_port() {
        let sys = build_system("");
        run_factory(&sys, "freq = 7200000\nrtcp = yes\n");
        let channel = sys.registry.get(7_200_000).unwrap();
        let rtcp_dest = channel.rtcp_dest.unwrap();
        assert_eq!(rtcp_dest.port(), DEFAULT_RTCP_PORT);
        assert_eq!(rtcp_dest.ip(), channel.data_dest.ip());
    }

    #[test]
    fn section_group_is_advertised_and_sdp_describes_it() {
        let sys = build_system("");
        run_factory(&sys, "freq = 7200000\ndata = hf-pcm\nsap = yes\n");
        let channel = sys.registry.get(7_200_000).unwrap();
        assert_ne!(channel.data_dest, sys.data_group.addr);

        let sdp = sap::build_sdp(
            std::net::Ipv4Addr::new(10, 0, 0, 1),
            "bench 7200000",
            channel.data_dest,
            channel.ttl,
            &channel,
        );
        assert!(sdp.contains(&format!("m=audio {} RTP/AVP", channel.data_dest.port())));
        // 12 kHz mono s16be has no static assignment
        assert!(sdp.contains(&format!("a=rtpmap:{} L16/12000/1", channel.payload_type)));
    }

    #[test]
    fn dynamic_channel_expires_when_idle_at_zero_hz() {
        let sys = build_system("");
        let channel = create_dynamic_channel(&sys, 99).unwrap();
        assert!(channel.is_dynamic());
        assert_eq!(channel.frequency(), 0.0);

        for _ in 0..sys.timing.idle_timeout_blocks() {
            status::tick(&sys);
        }
        assert!(sys.registry.get(99).is_none());
        assert!(!channel.is_running());
    }

    #[test]
    fn retuned_dynamic_channel_survives() {
        let sys = build_system("");
        let channel = create_dynamic_channel(&sys, 99).unwrap();
        channel.set_frequency(14_074_000.0);
        for _ in 0..2 * sys.timing.idle_timeout_blocks() {
            status::tick(&sys);
        }
        assert!(sys.registry.get(99).is_some());
        destroy_channel(&sys, &channel);
    }

    #[test]
    fn static_channels_never_age() {
        let sys = build_system("");
        run_factory(&sys, "freq = 7200000\n");
        let channel = sys.registry.get(7_200_000).unwrap();
        channel.set_frequency(0.0);
        for _ in 0..2 * sys.timing.idle_timeout_blocks() {
            status::tick(&sys);
        }
        assert!(sys.registry.get(7_200_000).is_some());
        destroy_channel(&sys, &channel);
    }

    #[test]
    fn commands_create_and_retune_dynamic_channels() {
        let sys = build_system("");
        status::handle_command(
            &sys,
            status::Command {
                ssrc: Some(555),
                frequency: Some(3_573_000.0),
                ..status::Command::default()
            },
        );
        let channel = sys.registry.get(555).unwrap();
        assert!(channel.is_dynamic());
        assert_eq!(channel.frequency(), 3_573_000.0);
        destroy_channel(&sys, &channel);
    }

    #[test]
    fn rtcp_cadence_once_per_second() {
        use std::time::{Duration, Instant};

        let sys = build_system("");
        let listener = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let dest = listener.local_addr().unwrap();

        let mut template = sys.global_template.clone();
        template.rtcp = true;
        let channel = sys
            .registry
            .create(777, |ssrc| {
                let mut channel = Channel::from_template(
                    ssrc,
                    &template,
                    sys.frontend.clone(),
                    sys.data_group.addr,
                    SocketAddr::new(sys.data_group.addr.ip(), DEFAULT_STAT_PORT),
                    false,
                );
                channel.rtcp_dest = Some(dest);
                channel
            })
            .unwrap();
        rtcp::spawn(&sys, &channel).unwrap();

        let mut buffer = [0u8; 512];
        let mut reports = 0;
        let deadline = Instant::now() + Duration::from_millis(2600);
        while Instant::now() < deadline {
            if let Ok((length, _)) = listener.recv_from(&mut buffer) {
                assert!(length > 28);
                assert_eq!(buffer[0], 0x80);
                assert_eq!(
                    u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
                    777
                );
                reports += 1;
            }
        }
        assert!(
            (2..=3).contains(&reports),
            "{reports} sender reports in 2.6 s"
        );
        assert_eq!(channel.errors(), 0);
        destroy_channel(&sys, &channel);
    }

    fn shared_system() -> &'static Arc<System> {
        static SYS: OnceLock<Arc<System>> = OnceLock::new();
        SYS.get_or_init(|| build_system(""))
    }

    #[quickcheck]
    fn registry_ssrcs_stay_unique(desired: Vec<u32>) -> bool {
        let sys = shared_system();
        for d in desired {
            let _ = sys.registry.create(d, |ssrc| {
                Channel::from_template(
                    ssrc,
                    &sys.global_template,
                    sys.frontend.clone(),
                    sys.data_group.addr,
                    SocketAddr::new(sys.data_group.addr.ip(), DEFAULT_STAT_PORT),
                    false,
                )
            });
        }
        let ssrcs = sys.registry.ssrcs();
        let unique: HashSet<u32> = ssrcs.iter().copied().collect();
        unique.len() == ssrcs.len() && !unique.contains(&0)
    }
}
