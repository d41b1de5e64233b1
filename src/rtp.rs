use {
    std::sync::atomic::{AtomicU32, AtomicU64, Ordering},
    strum::{Display, EnumString},
};

/// Media sample encodings carried in RTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum Encoding {
    #[default]
    #[strum(serialize = "s16be")]
    S16be,
    #[strum(serialize = "s16le")]
    S16le,
    #[strum(serialize = "f32le")]
    F32le,
    #[strum(serialize = "f16le")]
    F16le,
    #[strum(serialize = "opus")]
    Opus,
    #[strum(serialize = "pcmu")]
    Pcmu,
    #[strum(serialize = "pcma")]
    Pcma,
}

impl Encoding {
    #[inline]
    pub fn is_opus(self) -> bool {
        self == Encoding::Opus
    }

    /// Codec label for SDP `a=rtpmap` attributes.
    pub fn rtpmap_name(self) -> &'static str {
        match self {
            Encoding::S16be | Encoding::S16le => "L16",
            Encoding::F32le => "F32LE",
            Encoding::F16le => "F16LE",
            Encoding::Opus => "opus",
            Encoding::Pcmu => "PCMU",
            Encoding::Pcma => "PCMA",
        }
    }
}

/// RTP payload type for a stream. Static IANA assignments where they
/// exist; everything else lands deterministically in the dynamic range
/// so every radiod instance derives the same type for the same stream.
pub fn payload_type(encoding: Encoding, samprate: u32, channels: u8) -> u8 {
    match (encoding, samprate, channels) {
        (Encoding::Pcmu, 8_000, 1) => 0,
        (Encoding::Pcma, 8_000, 1) => 8,
        (Encoding::S16be, 44_100, 2) => 10,
        (Encoding::S16be, 44_100, 1) => 11,
        (Encoding::Opus, _, _) => 111,
        _ => {
            let mut hash: u32 = 0x811c_9dc5;
            for byte in samprate
                .to_be_bytes()
                .into_iter()
                .chain([channels])
                .chain(encoding.rtpmap_name().bytes())
            {
                hash ^= u32::from(byte);
                hash = hash.wrapping_mul(0x0100_0193);
            }
            96 + (hash % 32) as u8
        }
    }
}

/// Per-stream RTP counters, shared between the demodulator and the
/// RTCP sender without a lock.
#[derive(Debug, Default)]
pub struct RtpState {
    pub seq: AtomicU32,
    pub timestamp: AtomicU32,
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

impl RtpState {
    /// Packet and byte counts as the 32-bit fields an RTCP Sender
    /// Report carries.
    pub fn sender_counts(&self) -> (u32, u32) {
        (
            self.packets.load(Ordering::Relaxed) as u32,
            self.bytes.load(Ordering::Relaxed) as u32,
        )
    }
}
