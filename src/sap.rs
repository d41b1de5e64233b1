use {
    crate::{channel::Channel, supervisor, system::System},
    anyhow::{Context, Result},
    std::{
        fmt::Write,
        net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
        sync::Arc,
        thread,
        time::Duration,
    },
};

/// The well-known SAP group and port.
pub const SAP_ADDRESS: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 2, 127, 254), 9875);

const SAP_INTERVAL: Duration = Duration::from_secs(15);

/// The SDP body describing one channel's RTP session.
pub fn build_sdp(
    origin: Ipv4Addr,
    session: &str,
    group: SocketAddr,
    ttl: u8,
    channel: &Channel,
) -> String {
    let mut sdp = String::new();
    let ssrc = channel.ssrc();
    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- {ssrc} {ssrc} IN IP4 {origin}");
    let _ = writeln!(sdp, "s={session}");
    let _ = writeln!(sdp, "c=IN IP4 {}/{}", group.ip(), ttl.max(1));
    let _ = writeln!(sdp, "t=0 0");
    let _ = writeln!(
        sdp,
        "m=audio {} RTP/AVP {}",
        group.port(),
        channel.payload_type
    );
    if channel.payload_type >= 96 {
        let _ = writeln!(
            sdp,
            "a=rtpmap:{} {}/{}/{}",
            channel.payload_type,
            channel.encoding.rtpmap_name(),
            channel.samprate,
            channel.channels
        );
    }
    sdp
}

/// A SAP announcement: version 1, IPv4 origin, then the SDP payload.
pub fn build_announcement(origin: Ipv4Addr, msg_id: u16, sdp: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(sdp.len() + 24);
    packet.push(0x20); // V=1, announce, IPv4
    packet.push(0); // no authentication
    packet.extend_from_slice(&msg_id.to_be_bytes());
    packet.extend_from_slice(&origin.octets());
    packet.extend_from_slice(b"application/sdp\0");
    packet.extend_from_slice(sdp.as_bytes());
    packet
}

/// Starts the per-channel SAP announcer.
pub fn spawn(sys: &Arc<System>, channel: &Arc<Channel>) -> Result<()> {
    // SAP gets its own socket so its TTL never disturbs the media pair
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("binding SAP socket")?;
    socket
        .set_multicast_ttl_v4(u32::from(channel.ttl.max(1)))
        .context("SAP multicast TTL")?;
    socket
        .connect(SAP_ADDRESS)
        .context("connecting SAP socket")?;

    let sys = sys.clone();
    let channel = channel.clone();
    thread::Builder::new()
        .name(format!("sap {}", channel.ssrc()))
        .spawn(move || run(&sys, &channel, socket))
        .context("spawning SAP thread")?;
    Ok(())
}

fn run(sys: &System, channel: &Channel, socket: UdpSocket) {
    let origin = match socket.local_addr() {
        Ok(SocketAddr::V4(addr)) => *addr.ip(),
        _ => Ipv4Addr::UNSPECIFIED,
    };
    // low 16 bits of the SSRC identify this announcement stream
    let msg_id = channel.ssrc() as u16;
    let session = format!("{} {}", sys.instance, channel.ssrc());

    while channel.is_running() && !supervisor::should_stop() {
        let sdp = build_sdp(origin, &session, channel.data_dest, channel.ttl, channel);
        let packet = build_announcement(origin, msg_id, &sdp);
        if socket.send(&packet).is_err() {
            channel.bump_errors();
        }
        thread::sleep(SAP_INTERVAL);
    }
}
