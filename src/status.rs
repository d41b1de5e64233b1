use {
    crate::{channel, multicast, supervisor, system::System},
    anyhow::{Context, Result},
    std::{
        io::ErrorKind,
        net::{SocketAddr, UdpSocket},
        sync::Arc,
        thread,
        time::Instant,
    },
};

/// First packet byte on the status group.
pub const PKT_STATUS: u8 = 0;
pub const PKT_CMD: u8 = 1;

// TLV tags shared with the control utilities
const TAG_EOL: u8 = 0;
const TAG_OUTPUT_SSRC: u8 = 12;
const TAG_INPUT_SAMPRATE: u8 = 19;
const TAG_RF_GAIN: u8 = 26;
const TAG_RF_ATTEN: u8 = 27;
const TAG_RADIO_FREQUENCY: u8 = 33;

/// A decoded per-channel command. Settings beyond these pass through
/// to the DSP layer and are not interpreted here.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Command {
    pub ssrc: Option<u32>,
    pub frequency: Option<f64>,
    pub rf_gain: Option<f32>,
    pub rf_atten: Option<f32>,
}

/// Decodes a command packet; anything malformed is dropped silently,
/// the group is open to arbitrary senders.
pub fn decode_command(packet: &[u8]) -> Option<Command> {
    if packet.first() != Some(&PKT_CMD) {
        return None;
    }
    let mut command = Command::default();
    let mut at = 1;
    while at + 2 <= packet.len() {
        let tag = packet[at];
        let len = usize::from(packet[at + 1]);
        at += 2;
        if tag == TAG_EOL {
            break;
        }
        if at + len > packet.len() {
            return None;
        }
        let value = &packet[at..at + len];
        at += len;
        match tag {
            TAG_OUTPUT_SSRC if len == 4 => {
                command.ssrc = Some(u32::from_be_bytes(value.try_into().ok()?));
            }
            TAG_RADIO_FREQUENCY if len == 8 => {
                command.frequency =
                    Some(f64::from_bits(u64::from_be_bytes(value.try_into().ok()?)));
            }
            TAG_RF_GAIN if len == 4 => {
                command.rf_gain = Some(f32::from_bits(u32::from_be_bytes(value.try_into().ok()?)));
            }
            TAG_RF_ATTEN if len == 4 => {
                command.rf_atten =
                    Some(f32::from_bits(u32::from_be_bytes(value.try_into().ok()?)));
            }
            _ => {} // unknown settings belong to the DSP layer
        }
    }
    Some(command)
}

/// Encodes a minimal status report for one channel.
pub fn encode_status(ssrc: u32, frequency: f64) -> Vec<u8> {
    let mut packet = Vec::with_capacity(20);
    packet.push(PKT_STATUS);
    packet.push(TAG_OUTPUT_SSRC);
    packet.push(4);
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.push(TAG_RADIO_FREQUENCY);
    packet.push(8);
    packet.extend_from_slice(&frequency.to_bits().to_be_bytes());
    packet.push(TAG_EOL);
    packet.push(0);
    packet
}

/// Encodes the front-end metadata broadcast.
pub fn encode_frontend_status(samprate: u32, frequency: f64) -> Vec<u8> {
    let mut packet = Vec::with_capacity(20);
    packet.push(PKT_STATUS);
    packet.push(TAG_INPUT_SAMPRATE);
    packet.push(4);
    packet.extend_from_slice(&samprate.to_be_bytes());
    packet.push(TAG_RADIO_FREQUENCY);
    packet.push(8);
    packet.extend_from_slice(&frequency.to_bits().to_be_bytes());
    packet.push(TAG_EOL);
    packet.push(0);
    packet
}

/// Opens the status/command receive socket and starts the
/// `radio_status` task plus the front-end metadata broadcaster. The
/// send side reuses the TTL>0 media socket.
pub fn spawn(sys: &Arc<System>) -> Result<()> {
    let group = match sys.status_group.addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => bail!("status group must be IPv4"),
    };
    let socket =
        multicast::open_receive(group, sys.iface.as_deref()).context("opening status socket")?;
    socket
        .set_read_timeout(Some(sys.timing.block_duration()))
        .context("status socket timeout")?;

    let status_sys = sys.clone();
    thread::Builder::new()
        .name("radio_status".into())
        .spawn(move || run(&status_sys, socket))
        .context("spawning status thread")?;

    let metadata_sys = sys.clone();
    thread::Builder::new()
        .name("fe_status".into())
        .spawn(move || broadcast_metadata(&metadata_sys))
        .context("spawning metadata thread")?;
    Ok(())
}

/// Waits on the front-end status condition the capture thread signals
/// and rebroadcasts the metadata, throttled to one packet per second.
fn broadcast_metadata(sys: &System) {
    let Some(dest) = sys.frontend.metadata_dest.get().copied() else {
        return;
    };
    let mut last_sent = Instant::now();
    let mut announced = sys.frontend.status();

    loop {
        let status = sys.frontend.wait_status(std::time::Duration::from_secs(1));
        if supervisor::should_stop() {
            return;
        }
        if status == announced || last_sent.elapsed() < std::time::Duration::from_secs(1) {
            continue;
        }
        last_sent = Instant::now();
        announced = status;
        let packet = encode_frontend_status(sys.frontend.samprate, status.frequency);
        let _ = sys.output.routed().send_to(&packet, dest);
    }
}

/// Single long-running endpoint task: reads commands, answers with
/// status, and ages dynamic channels at block cadence.
fn run(sys: &Arc<System>, socket: UdpSocket) {
    let block = sys.timing.block_duration();
    let mut last_tick = Instant::now();
    let mut buffer = [0u8; 2048];

    while !supervisor::should_stop() {
        match socket.recv_from(&mut buffer) {
            Ok((length, _)) => {
                if let Some(command) = decode_command(&buffer[..length]) {
                    handle_command(sys, command);
                }
            }
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
            Err(err) => log::warn!("status socket: {err}"),
        }

        while last_tick.elapsed() >= block {
            last_tick += block;
            tick(sys);
        }
    }
}

/// One block tick: age every dynamic channel parked at 0 Hz, destroy
/// the expired ones.
pub fn tick(sys: &System) {
    for channel in sys.registry.snapshot() {
        if channel.age_block() {
            log::info!("channel {} idle, destroying", channel.ssrc());
            channel::destroy_channel(sys, &channel);
        }
    }
}

/// Applies one command. Unknown SSRCs create a dynamic channel from the
/// global template; every addressed channel answers with its status.
pub fn handle_command(sys: &Arc<System>, command: Command) {
    let Some(ssrc) = command.ssrc else {
        return;
    };
    if ssrc == 0 {
        return;
    }

    let channel = match sys.registry.get(ssrc) {
        Some(channel) => channel,
        None => match channel::create_dynamic_channel(sys, ssrc) {
            Ok(channel) => channel,
            Err(err) => {
                log::warn!("cannot create channel {ssrc}: {err:#}");
                return;
            }
        },
    };

    if let Some(frequency) = command.frequency {
        channel.set_frequency(frequency);
    }
    // RF settings forward to the front end; drivers without the
    // capability just refuse
    if let Some(db) = command.rf_gain {
        if let Err(err) = sys.frontend.set_rf_gain(db) {
            log::debug!("{err:#}");
        }
    }
    if let Some(db) = command.rf_atten {
        if let Err(err) = sys.frontend.set_rf_atten(db) {
            log::debug!("{err:#}");
        }
    }
    channel.touch();

    let report = encode_status(channel.ssrc(), channel.frequency());
    if sys
        .output
        .routed()
        .send_to(&report, channel.status_dest)
        .is_err()
    {
        channel.bump_errors();
    }
}
