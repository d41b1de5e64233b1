use {
    anyhow::{Context, Result},
    ini::Ini,
    itertools::Itertools,
    std::{
        fs, io,
        path::{Path, PathBuf},
    },
};

/// Upper bound on `.conf` fragments merged from a config directory.
pub const MAX_FRAGMENTS: usize = 100;

/// Keys accepted in `[global]`.
pub const GLOBAL_KEYS: &[&str] = &[
    "affinity",
    "blocktime",
    "data",
    "description",
    "dns",
    "fft-plan-level",
    "fft-threads",
    "fft-time-limit",
    "hardware",
    "iface",
    "mode-file",
    "mode",
    "overlap",
    "preset",
    "presets-file",
    "prio",
    "rtcp",
    "sap",
    "static",
    "status",
    "tos",
    "ttl",
    "update",
    "verbose",
    "wisdom-file",
];

/// Keys accepted in channel sections, including the per-demodulator
/// tuning keys a preset may also carry.
pub const CHANNEL_KEYS: &[&str] = &[
    "agc",
    "channels",
    "data",
    "deemph-gain",
    "deemph-tc",
    "device",
    "disable",
    "dns",
    "encoding",
    "envelope",
    "freq",
    "freq0",
    "freq1",
    "freq2",
    "freq3",
    "freq4",
    "freq5",
    "freq6",
    "freq7",
    "freq8",
    "freq9",
    "gain",
    "hang-time",
    "headroom",
    "high",
    "iface",
    "low",
    "mode",
    "mono",
    "pacing",
    "pll",
    "preset",
    "recovery-rate",
    "rtcp",
    "samprate",
    "sap",
    "shift",
    "squelch-close",
    "squelch-open",
    "square",
    "ssrc",
    "static",
    "status",
    "stereo",
    "tos",
    "ttl",
    "update",
];

#[inline]
fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// One configuration section: an ordered key/value map with
/// case-insensitive keys. Later assignments replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    name: String,
    keys: Vec<(String, String)>,
}

impl Section {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = fold(key);
        self.keys
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(k, _)| k.as_str())
    }

    fn set(&mut self, key: String, value: String) {
        match self.keys.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.keys.push((key, value)),
        }
    }
}

/// The merged configuration: sections in file order, names folded to
/// lowercase at load time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    sections: Vec<Section>,
}

impl ConfigTree {
    /// Loads a configuration from a file, a directory of `*.conf`
    /// fragments, or a file's `<path>.d` fragment directory.
    pub fn load(path: &Path) -> Result<ConfigTree> {
        if path.is_file() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return Self::from_ini_str(&text)
                .with_context(|| format!("parsing {}", path.display()));
        }

        if path.is_dir() {
            return Self::from_ini_str(&concat_fragments(path)?)
                .with_context(|| format!("parsing fragments under {}", path.display()));
        }

        let dotd = PathBuf::from(format!("{}.d", path.display()));
        if dotd.is_dir() {
            return Self::from_ini_str(&concat_fragments(&dotd)?)
                .with_context(|| format!("parsing fragments under {}", dotd.display()));
        }

        match fs::metadata(path) {
            Err(err) => {
                Err(err).with_context(|| format!("opening config {}", path.display()))
            }
            Ok(_) => bail!(
                "config path {} is neither a file nor a fragment directory",
                path.display()
            ),
        }
    }

    /// Parses one logical INI source into the folded tree. Sections
    /// repeated across fragments merge; repeated keys take the last value.
    pub fn from_ini_str(source: &str) -> Result<ConfigTree> {
        let ini = Ini::load_from_str(source).map_err(|e| anyhow!("INI syntax: {e}"))?;

        let mut tree = ConfigTree::default();
        for (name, props) in ini.iter() {
            let Some(name) = name else {
                if props.iter().next().is_some() {
                    log::warn!("ignoring keys outside any [section]");
                }
                continue;
            };
            let section = tree.section_mut_or_insert(&fold(name));
            for (key, value) in props.iter() {
                section.set(fold(key), value.trim().to_string());
            }
        }
        Ok(tree)
    }

    fn section_mut_or_insert(&mut self, name: &str) -> &mut Section {
        if let Some(i) = self.sections.iter().position(|s| s.name == name) {
            return &mut self.sections[i];
        }
        self.sections.push(Section {
            name: name.to_string(),
            keys: Vec::new(),
        });
        let last = self.sections.len() - 1;
        &mut self.sections[last]
    }

    /// Sections in merged-file order.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        let name = fold(name);
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.get(key)
    }

    /// Channel-section lookup with fallback to the same key in `[global]`.
    pub fn get_or_global(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section, key).or_else(|| self.get("global", key))
    }

    pub fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        parse_or_warn(section, key, self.get(section, key)?)
    }

    pub fn get_float(&self, section: &str, key: &str) -> Option<f64> {
        parse_or_warn(section, key, self.get(section, key)?)
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        let raw = self.get(section, key)?;
        let parsed = parse_bool(raw);
        if parsed.is_none() {
            log::warn!("[{section}] {key} = {raw}: not a boolean");
        }
        parsed
    }

    /// The front-end section named by `global.hardware`.
    pub fn hardware_section(&self) -> Option<&str> {
        self.get("global", "hardware")
    }

    /// True for the hardware section and any other section declaring a
    /// `device=` key; the channel pass skips these.
    pub fn is_frontend_section(&self, name: &str) -> bool {
        if let Some(hw) = self.hardware_section() {
            if fold(hw) == fold(name) {
                return true;
            }
        }
        self.get(name, "device").is_some()
    }

    /// Warns about keys outside the allow-lists. Never fails: unknown
    /// keys are ignored by everything downstream anyway.
    pub fn validate(&self) {
        for section in &self.sections {
            if self.is_frontend_section(&section.name) {
                continue;
            }
            let allowed: &[&str] = if section.name == "global" {
                GLOBAL_KEYS
            } else {
                CHANNEL_KEYS
            };
            for key in section.keys() {
                if !allowed.contains(&key) {
                    log::warn!("[{}] unknown key {key}", section.name);
                }
            }
        }
    }
}

fn parse_or_warn<T: std::str::FromStr>(section: &str, key: &str, raw: &str) -> Option<T> {
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("[{section}] {key} = {raw}: cannot parse");
            None
        }
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Concatenates a directory's `*.conf` fragments in byte-lexicographic
/// name order, so the merge is stable across filesystems.
fn concat_fragments(dir: &Path) -> Result<String> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;

    let mut fragments: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .map(|n| n.to_string_lossy().ends_with(".conf"))
                    .unwrap_or(false)
        })
        .sorted_by(|a, b| a.file_name().cmp(&b.file_name()))
        .collect();

    if fragments.len() > MAX_FRAGMENTS {
        log::warn!(
            "{}: {} fragments, only the first {MAX_FRAGMENTS} are read",
            dir.display(),
            fragments.len()
        );
        fragments.truncate(MAX_FRAGMENTS);
    }
    ensure!(!fragments.is_empty(), "{}: no .conf fragments", dir.display());

    let mut merged = String::new();
    for path in &fragments {
        merged.push_str(
            &fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
        );
        merged.push('\n');
    }
    Ok(merged)
}

/// True when the error chain bottoms out in the filesystem, which maps to
/// "no input" rather than "bad configuration" at the exit-code level.
pub fn is_io_error(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<io::Error>().is_some())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    const SAMPLE: &str = "
[global]
hardware = rig
ttl = 2
blocktime = 20

[RIG]
device = sig_gen
samprate = 16000

[hf]
freq = 7200000
";

    #[test]
    fn sections_fold_case() {
        let tree = ConfigTree::from_ini_str(SAMPLE).unwrap();
        assert_eq!(tree.get("Global", "Hardware"), Some("rig"));
        assert_eq!(tree.get("rig", "SAMPRATE"), Some("16000"));
        assert!(tree.is_frontend_section("Rig"));
        assert!(!tree.is_frontend_section("hf"));
    }

    #[test]
    fn section_order_is_file_order() {
        let tree = ConfigTree::from_ini_str(SAMPLE).unwrap();
        let names: Vec<&str> = tree.sections().map(|s| s.name()).collect();
        assert_eq!(names, ["global", "rig", "hf"]);
    }

    #[test]
    fn global_fallback() {
        let tree = ConfigTree::from_ini_str(SAMPLE).unwrap();
        assert_eq!(tree.get_or_global("hf", "ttl"), Some("2"));
        assert_eq!(tree.get_or_global("hf", "freq"), Some("7200000"));
        assert_eq!(tree.get_or_global("hf", "nonesuch"), None);
    }

    #[test]
    fn later_keys_replace_earlier() {
        let tree = ConfigTree::from_ini_str("[a]\nx = 1\n[b]\ny = 2\n[a]\nx = 3\n").unwrap();
        assert_eq!(tree.get("a", "x"), Some("3"));
        assert_eq!(tree.sections().count(), 2);
    }

    #[test]
    fn booleans() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn directory_merges_sorted_fragments() {
        let dir = tempfile::tempdir().unwrap();
        // written out of order on purpose; the merge sorts by name
        fs::write(dir.path().join("10-section.conf"), "[hf]\nfreq = 7200000\n").unwrap();
        fs::write(
            dir.path().join("00-global.conf"),
            "[global]\nhardware = rig\n[rig]\ndevice = sig_gen\n",
        )
        .unwrap();
        fs::write(dir.path().join("README"), "not a fragment").unwrap();

        let tree = ConfigTree::load(dir.path()).unwrap();
        let concatenated = ConfigTree::from_ini_str(
            "[global]\nhardware = rig\n[rig]\ndevice = sig_gen\n[hf]\nfreq = 7200000\n",
        )
        .unwrap();
        assert_eq!(tree, concatenated);
    }

    #[test]
    fn dot_d_directory_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("radiod@x.conf");
        let dotd = dir.path().join("radiod@x.conf.d");
        fs::create_dir(&dotd).unwrap();
        fs::write(dotd.join("00-all.conf"), "[global]\nhardware = rig\n").unwrap();

        let tree = ConfigTree::load(&base).unwrap();
        assert_eq!(tree.get("global", "hardware"), Some("rig"));
    }

    #[test]
    fn missing_path_is_io_error() {
        let err = ConfigTree::load(Path::new("/nonexistent/radiod.conf")).unwrap_err();
        assert!(is_io_error(&err));
        let err = ConfigTree::from_ini_str("[unterminated\n").unwrap_err();
        assert!(!is_io_error(&err));
    }
}
