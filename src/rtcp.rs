use {
    crate::{channel::Channel, supervisor, system::System},
    anyhow::{Context, Result},
    std::{
        sync::Arc,
        thread,
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;
/// Unix time of the GPS epoch, 1980-01-06.
const GPS_EPOCH_UNIX: i64 = 315_964_800;
/// GPS-UTC offset; no leap second has been scheduled since 2017.
const GPS_UTC_OFFSET: i64 = 18;

const RTCP_SR: u8 = 200;
const RTCP_SDES: u8 = 202;

const SDES_CNAME: u8 = 1;
const SDES_NAME: u8 = 2;
const SDES_EMAIL: u8 = 3;
const SDES_TOOL: u8 = 6;

/// Nanoseconds since the GPS epoch.
pub fn gps_time_ns() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() as i64 - GPS_EPOCH_UNIX + GPS_UTC_OFFSET) * 1_000_000_000
        + i64::from(now.subsec_nanos())
}

/// The current wall clock as an NTP timestamp: whole seconds offset to
/// the 1900 epoch, fraction in 2^-32 second units.
fn ntp_now() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seconds = (now.as_secs() + NTP_EPOCH_OFFSET) as u32;
    let fraction = (u64::from(now.subsec_nanos()) << 32) / 1_000_000_000;
    (seconds, fraction as u32)
}

/// Source-description strings attached to every compound packet.
#[derive(Debug, Clone)]
pub struct Sdes {
    pub cname: String,
    pub name: String,
    pub email: String,
    pub tool: String,
}

impl Sdes {
    pub fn for_host(hostname: &str, name: &str) -> Sdes {
        Sdes {
            cname: format!("radio@{hostname}"),
            name: name.to_string(),
            email: format!("radio@{hostname}"),
            tool: concat!("radiod ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

fn push_u32(packet: &mut Vec<u8>, value: u32) {
    packet.extend_from_slice(&value.to_be_bytes());
}

/// Builds the Sender Report + SDES compound packet for one channel.
pub fn build_compound(
    ssrc: u32,
    ntp: (u32, u32),
    rtp_timestamp: u32,
    packets: u32,
    bytes: u32,
    sdes: &Sdes,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(128);

    // SR: V=2, no padding, no report blocks
    packet.push(0x80);
    packet.push(RTCP_SR);
    packet.extend_from_slice(&6u16.to_be_bytes());
    push_u32(&mut packet, ssrc);
    push_u32(&mut packet, ntp.0);
    push_u32(&mut packet, ntp.1);
    push_u32(&mut packet, rtp_timestamp);
    push_u32(&mut packet, packets);
    push_u32(&mut packet, bytes);

    // SDES: one chunk, four items
    let sdes_start = packet.len();
    packet.push(0x81);
    packet.push(RTCP_SDES);
    packet.extend_from_slice(&0u16.to_be_bytes()); // patched below
    push_u32(&mut packet, ssrc);
    for (kind, text) in [
        (SDES_CNAME, &sdes.cname),
        (SDES_NAME, &sdes.name),
        (SDES_EMAIL, &sdes.email),
        (SDES_TOOL, &sdes.tool),
    ] {
        let text = &text.as_bytes()[..text.len().min(255)];
        packet.push(kind);
        packet.push(text.len() as u8);
        packet.extend_from_slice(text);
    }
    packet.push(0); // end of items
    while (packet.len() - sdes_start) % 4 != 0 {
        packet.push(0);
    }
    let words = ((packet.len() - sdes_start) / 4 - 1) as u16;
    packet[sdes_start + 2..sdes_start + 4].copy_from_slice(&words.to_be_bytes());

    packet
}

/// Starts the per-channel RTCP sender.
pub fn spawn(sys: &Arc<System>, channel: &Arc<Channel>) -> Result<()> {
    let sys = sys.clone();
    let channel = channel.clone();
    thread::Builder::new()
        .name(format!("rtcp {}", channel.ssrc()))
        .spawn(move || run(&sys, &channel))
        .context("spawning RTCP thread")?;
    Ok(())
}

/// One compound packet per second once the SSRC reads non-zero. Send
/// failures bump the channel's error counter; the loop never exits on
/// them.
fn run(sys: &System, channel: &Channel) {
    let Some(dest) = channel.rtcp_dest else {
        return;
    };
    let sdes = Sdes::for_host(
        &sys.hostname,
        channel.preset.as_deref().unwrap_or(&sys.instance),
    );

    while channel.is_running() && !supervisor::should_stop() {
        thread::sleep(Duration::from_secs(1));
        let ssrc = channel.ssrc();
        if ssrc == 0 {
            continue;
        }

        let rtp_timestamp = ((gps_time_ns() - sys.start_gps_ns) / 1_000_000_000) as u32;
        let (packets, bytes) = channel.rtp.sender_counts();
        let packet = build_compound(ssrc, ntp_now(), rtp_timestamp, packets, bytes, &sdes);
        if sys.output.routed().send_to(&packet, dest).is_err() {
            channel.bump_errors();
        }
    }
}
