use {
    crate::config::{ConfigTree, Section},
    anyhow::{Context, Result},
    std::path::{Path, PathBuf},
};

/// Distribution data directory searched for the default preset file.
pub const DATADIR: &str = "/usr/local/share/radiod";

const DEFAULT_PRESETS: &str = "presets.conf";

/// Named demodulation recipes, loaded once and kept for the process
/// lifetime. Same tree shape as the main configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresetTable {
    tree: ConfigTree,
}

impl PresetTable {
    /// Resolves the preset file location from `global.presets-file`
    /// (legacy alias `mode-file`), defaulting to `presets.conf` under
    /// the distribution data directory.
    pub fn locate(config: &ConfigTree) -> PathBuf {
        let name = config
            .get("global", "presets-file")
            .or_else(|| config.get("global", "mode-file"))
            .unwrap_or(DEFAULT_PRESETS);

        let path = Path::new(name);
        if path.is_absolute() || path.exists() {
            path.to_path_buf()
        } else {
            Path::new(DATADIR).join(path)
        }
    }

    pub fn load(config: &ConfigTree) -> Result<PresetTable> {
        let path = Self::locate(config);
        let tree = ConfigTree::load(&path)
            .with_context(|| format!("loading presets from {}", path.display()))?;
        Ok(PresetTable { tree })
    }

    #[inline]
    pub fn from_tree(tree: ConfigTree) -> PresetTable {
        PresetTable { tree }
    }

    /// Looks up a recipe by name, case-insensitively.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&Section> {
        self.tree.section(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tree.sections().map(|s| s.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let tree = ConfigTree::from_ini_str("[AM]\nlow = -5000\nhigh = 5000\n").unwrap();
        let presets = PresetTable::from_tree(tree);
        assert!(presets.get("am").is_some());
        assert_eq!(presets.get("am").unwrap().get("low"), Some("-5000"));
        assert!(presets.get("fm").is_none());
        assert_eq!(presets.names().collect::<Vec<_>>(), ["am"]);
    }

    #[test]
    fn alias_key_selects_file() {
        let tree = ConfigTree::from_ini_str("[global]\nmode-file = /etc/radio/x.conf\n").unwrap();
        assert_eq!(PresetTable::locate(&tree), PathBuf::from("/etc/radio/x.conf"));
        let tree = ConfigTree::from_ini_str("[global]\n").unwrap();
        assert_eq!(
            PresetTable::locate(&tree),
            Path::new(DATADIR).join("presets.conf")
        );
    }
}
