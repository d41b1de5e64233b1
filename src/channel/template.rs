use {
    crate::{
        config::{parse_bool, ConfigTree, Section},
        presets::PresetTable,
        rtp::Encoding,
    },
    std::str::FromStr,
};

/// Demodulation parameters handed through to the DSP layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemodParams {
    /// Passband edges relative to the tuned frequency, Hz.
    pub low: f32,
    pub high: f32,
    pub shift: f64,
    pub squelch_open: f32,
    pub squelch_close: f32,
    pub headroom: f32,
    pub recovery_rate: f32,
    pub hang_time: f32,
    pub gain: f32,
    pub agc: bool,
    pub pll: bool,
    pub square: bool,
    pub envelope: bool,
    pub deemph_tc: f32,
    pub deemph_gain: f32,
}

impl Default for DemodParams {
    fn default() -> DemodParams {
        DemodParams {
            low: -5_000.0,
            high: 5_000.0,
            shift: 0.0,
            squelch_open: 8.0,
            squelch_close: 7.0,
            headroom: -15.0,
            recovery_rate: 20.0,
            hang_time: 1.1,
            gain: 0.0,
            agc: true,
            pll: false,
            square: false,
            envelope: false,
            deemph_tc: 0.0,
            deemph_gain: 0.0,
        }
    }
}

/// Per-section channel template. Layered lowest to highest: built-in
/// defaults, `[global]`, the named preset, the channel section; each
/// layer overlays only the keys it defines. A template is a pure value
/// type: copying one into a channel shares no heap state, and the
/// channel's dynamic buffers belong to its own start path.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTemplate {
    pub data_group: Option<String>,
    pub ttl: u8,
    pub tos: u8,
    pub samprate: u32,
    pub channels: u8,
    pub encoding: Encoding,
    pub preset: Option<String>,
    /// Idle budget, in blocks, for dynamically created channels.
    pub lifetime_blocks: u32,
    pub use_dns: bool,
    pub sap: bool,
    pub rtcp: bool,
    pub demod: DemodParams,
}

impl Default for ChannelTemplate {
    fn default() -> ChannelTemplate {
        ChannelTemplate {
            data_group: None,
            ttl: 0,
            tos: 48,
            samprate: 12_000,
            channels: 1,
            encoding: Encoding::default(),
            preset: None,
            lifetime_blocks: 1_000,
            use_dns: false,
            sap: false,
            rtcp: false,
            demod: DemodParams::default(),
        }
    }
}

impl ChannelTemplate {
    /// Builds the template for one channel section, or the global
    /// template when `section` is `None`. The preset name comes from
    /// the section, falling back to `[global]`; an unknown name warns
    /// and skips that layer. When both `[global]` and the section set a
    /// non-zero TTL the section is coerced to the global value, since
    /// the process keeps exactly one non-zero-TTL send socket.
    pub fn build(
        config: &ConfigTree,
        presets: &PresetTable,
        section: Option<&str>,
        lifetime_blocks: u32,
    ) -> ChannelTemplate {
        let mut template = ChannelTemplate {
            lifetime_blocks,
            ..ChannelTemplate::default()
        };

        if let Some(global) = config.section("global") {
            template.overlay(global);
        }

        let preset_name = section
            .and_then(|s| config.get(s, "preset").or_else(|| config.get(s, "mode")))
            .or_else(|| {
                config
                    .get("global", "preset")
                    .or_else(|| config.get("global", "mode"))
            })
            .map(str::to_string);
        if let Some(name) = &preset_name {
            match presets.get(name) {
                Some(recipe) => template.overlay(recipe),
                None => log::warn!("unknown preset {name}, layer skipped"),
            }
            template.preset = Some(name.clone());
        }

        if let Some(name) = section {
            if let Some(sec) = config.section(name) {
                template.overlay(sec);

                let global_ttl = ttl_of(config.section("global"));
                let section_ttl = ttl_of(Some(sec));
                if global_ttl != 0 && section_ttl != 0 && template.ttl != global_ttl {
                    log::warn!(
                        "[{name}] ttl={section_ttl} coerced to global ttl={global_ttl}"
                    );
                    template.ttl = global_ttl;
                }
            }
        }
        template
    }

    /// Overlays the keys one layer defines.
    fn overlay(&mut self, layer: &Section) {
        if let Some(v) = layer.get("data") {
            self.data_group = Some(v.to_string());
        }
        set_num(&mut self.ttl, layer, "ttl");
        set_num(&mut self.tos, layer, "tos");
        set_num(&mut self.samprate, layer, "samprate");
        set_num(&mut self.channels, layer, "channels");
        if let Some(v) = layer.get("stereo").and_then(parse_bool) {
            self.channels = if v { 2 } else { 1 };
        }
        if let Some(v) = layer.get("mono").and_then(parse_bool) {
            if v {
                self.channels = 1;
            }
        }
        if let Some(raw) = layer.get("encoding") {
            match Encoding::from_str(raw) {
                Ok(encoding) => self.encoding = encoding,
                Err(_) => log::warn!("[{}] unknown encoding {raw}", layer.name()),
            }
        }
        set_flag(&mut self.use_dns, layer, "dns");
        set_flag(&mut self.sap, layer, "sap");
        set_flag(&mut self.rtcp, layer, "rtcp");

        set_num(&mut self.demod.low, layer, "low");
        set_num(&mut self.demod.high, layer, "high");
        set_num(&mut self.demod.shift, layer, "shift");
        set_num(&mut self.demod.squelch_open, layer, "squelch-open");
        set_num(&mut self.demod.squelch_close, layer, "squelch-close");
        set_num(&mut self.demod.headroom, layer, "headroom");
        set_num(&mut self.demod.recovery_rate, layer, "recovery-rate");
        set_num(&mut self.demod.hang_time, layer, "hang-time");
        set_num(&mut self.demod.gain, layer, "gain");
        set_flag(&mut self.demod.agc, layer, "agc");
        set_flag(&mut self.demod.pll, layer, "pll");
        set_flag(&mut self.demod.square, layer, "square");
        set_flag(&mut self.demod.envelope, layer, "envelope");
        set_num(&mut self.demod.deemph_tc, layer, "deemph-tc");
        set_num(&mut self.demod.deemph_gain, layer, "deemph-gain");
    }
}

fn set_num<T: FromStr + Copy>(field: &mut T, layer: &Section, key: &str) {
    if let Some(raw) = layer.get(key) {
        match raw.parse() {
            Ok(v) => *field = v,
            Err(_) => log::warn!("[{}] {key} = {raw}: cannot parse", layer.name()),
        }
    }
}

fn set_flag(field: &mut bool, layer: &Section, key: &str) {
    if let Some(raw) = layer.get(key) {
        match parse_bool(raw) {
            Some(v) => *field = v,
            None => log::warn!("[{}] {key} = {raw}: not a boolean", layer.name()),
        }
    }
}

fn ttl_of(section: Option<&Section>) -> u8 {
    section
        .and_then(|s| s.get("ttl"))
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn presets() -> PresetTable {
        PresetTable::from_tree(
            ConfigTree::from_ini_str(
                "[am]\nlow = -5000\nhigh = 5000\nenvelope = yes\nsamprate = 12000\n\
                 [usb]\nlow = 50\nhigh = 3000\nsamprate = 12000\n",
            )
            .unwrap(),
        )
    }

    #[test]
    fn topmost_layer_wins() {
        let config = ConfigTree::from_ini_str(
            "[global]\nsamprate = 24000\nencoding = s16le\n\
             [hf]\npreset = usb\nsamprate = 8000\n",
        )
        .unwrap();
        let t = ChannelTemplate::build(&config, &presets(), Some("hf"), 1_000);
        // section beats preset beats global beats default
        assert_eq!(t.samprate, 8_000);
        assert_eq!(t.demod.low, 50.0);
        assert_eq!(t.encoding, Encoding::S16le);
        assert_eq!(t.channels, 1);
        assert_eq!(t.preset.as_deref(), Some("usb"));
    }

    #[test]
    fn preset_layer_overlays_only_its_keys() {
        let config =
            ConfigTree::from_ini_str("[global]\nmode = am\n[bcb]\nfreq = 1000k\n").unwrap();
        let t = ChannelTemplate::build(&config, &presets(), Some("bcb"), 1_000);
        assert!(t.demod.envelope);
        assert_eq!(t.samprate, 12_000);
        // untouched by any layer
        assert_eq!(t.tos, 48);
    }

    #[test]
    fn unknown_preset_warns_and_skips() {
        let config = ConfigTree::from_ini_str("[hf]\npreset = teletype\n").unwrap();
        let t = ChannelTemplate::build(&config, &presets(), Some("hf"), 1_000);
        assert_eq!(t.preset.as_deref(), Some("teletype"));
        // the layer contributed nothing
        assert_eq!(t.demod, DemodParams::default());
    }

    #[test]
    fn ttl_coerced_to_global_when_both_nonzero() {
        let config =
            ConfigTree::from_ini_str("[global]\nttl = 2\n[hf]\nttl = 4\n").unwrap();
        let t = ChannelTemplate::build(&config, &presets(), Some("hf"), 1_000);
        assert_eq!(t.ttl, 2);
    }

    #[test]
    fn section_ttl_survives_when_global_is_zero() {
        let config = ConfigTree::from_ini_str("[hf]\nttl = 4\n").unwrap();
        let t = ChannelTemplate::build(&config, &presets(), Some("hf"), 1_000);
        assert_eq!(t.ttl, 4);
    }

    #[test]
    fn stereo_flag_sets_channel_count() {
        let config = ConfigTree::from_ini_str("[fm]\nstereo = yes\n").unwrap();
        let t = ChannelTemplate::build(&config, &presets(), Some("fm"), 1_000);
        assert_eq!(t.channels, 2);
    }

    #[test]
    fn global_template_ignores_sections() {
        let config = ConfigTree::from_ini_str(
            "[global]\nsamprate = 24000\n[hf]\nsamprate = 8000\n",
        )
        .unwrap();
        let t = ChannelTemplate::build(&config, &presets(), None, 1_000);
        assert_eq!(t.samprate, 24_000);
    }
}
