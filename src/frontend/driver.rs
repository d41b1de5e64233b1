use {
    super::{sig_gen::SigGen, Frontend},
    crate::config::ConfigTree,
    anyhow::{Context, Result},
    bitflags::bitflags,
    libloading::Library,
    nix::libc::{c_char, c_int},
    std::{
        ffi::CString,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Directory searched for dynamically loaded driver objects.
pub const SODIR: &str = "/usr/local/lib/radiod";

bitflags! {
    /// Optional capabilities a front-end driver implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverCaps: u32 {
        const TUNE = 1;
        const GAIN = 1 << 1;
        const ATTEN = 1 << 2;
    }
}

/// The capability set every front end satisfies, statically linked or
/// dynamically loaded. `setup` and `start` are mandatory; the rest are
/// surfaced through `caps`.
pub trait FrontendDriver: Send + Sync {
    fn name(&self) -> &str;

    fn caps(&self) -> DriverCaps;

    /// Populates the sample rate, real/complex flag and description on
    /// the frontend, and prepares whatever sample source `start` will
    /// pump.
    fn setup(&self, fe: &mut Frontend, config: &ConfigTree, section: &str) -> Result<()>;

    /// Spawns the capture thread feeding the master filter. The
    /// frontend is frozen by the time this runs.
    fn start(&self, fe: &Arc<Frontend>) -> Result<()>;

    /// Retunes the hardware; returns the frequency actually set.
    fn tune(&self, _fe: &Frontend, _hz: f64) -> Result<f64> {
        bail!("{}: tuning not supported", self.name())
    }

    fn rf_gain(&self, _fe: &Frontend, _db: f32) -> Result<f32> {
        bail!("{}: gain control not supported", self.name())
    }

    fn rf_atten(&self, _fe: &Frontend, _db: f32) -> Result<f32> {
        bail!("{}: attenuator control not supported", self.name())
    }
}

/// Statically linked drivers. Real hardware lives in shared objects;
/// the synthetic source is always available.
pub fn lookup_builtin(device: &str) -> Option<Arc<dyn FrontendDriver>> {
    match device {
        "sig_gen" => Some(Arc::new(SigGen)),
        _ => None,
    }
}

// Entry points resolved from a driver shared object. The object is
// built against this crate, so crate types cross as opaque pointers;
// the frontend pointer stays valid for the life of the process.
type SetupSym = unsafe extern "C" fn(*mut Frontend, *const ConfigTree, *const c_char) -> c_int;
type StartSym = unsafe extern "C" fn(*const Frontend) -> c_int;
type TuneSym = unsafe extern "C" fn(*const Frontend, f64) -> f64;
type LevelSym = unsafe extern "C" fn(*const Frontend, f32) -> f32;

/// A driver resolved from `<sodir>/<device>.so`.
#[derive(Debug)]
pub struct DynamicDriver {
    name: String,
    setup: SetupSym,
    start: StartSym,
    tune: Option<TuneSym>,
    gain: Option<LevelSym>,
    atten: Option<LevelSym>,
    // keeps every resolved symbol alive
    _library: Library,
}

impl DynamicDriver {
    /// Loads `<device>.so` and resolves the `<device>_setup` symbol
    /// family. Missing setup/startup is fatal; a missing tune warns;
    /// gain and atten are silently optional.
    pub fn load(device: &str, library: Option<&str>) -> Result<DynamicDriver> {
        let path = match library {
            Some(library) => PathBuf::from(library),
            None => Path::new(SODIR).join(format!("{device}.so")),
        };
        let lib = unsafe { Library::new(&path) }
            .with_context(|| format!("loading driver library {}", path.display()))?;

        let mandatory = |symbol: &str| format!("{device}_{symbol}\0");
        let setup = *unsafe { lib.get::<SetupSym>(mandatory("setup").as_bytes()) }
            .with_context(|| format!("driver {device}: no {device}_setup"))?;
        let start = *unsafe { lib.get::<StartSym>(mandatory("startup").as_bytes()) }
            .with_context(|| format!("driver {device}: no {device}_startup"))?;

        let tune = unsafe { lib.get::<TuneSym>(mandatory("tune").as_bytes()) }
            .ok()
            .map(|s| *s);
        if tune.is_none() {
            log::warn!("driver {device}: no {device}_tune, front end is fixed-tuned");
        }
        let gain = unsafe { lib.get::<LevelSym>(mandatory("gain").as_bytes()) }
            .ok()
            .map(|s| *s);
        let atten = unsafe { lib.get::<LevelSym>(mandatory("atten").as_bytes()) }
            .ok()
            .map(|s| *s);

        Ok(DynamicDriver {
            name: device.to_string(),
            setup,
            start,
            tune,
            gain,
            atten,
            _library: lib,
        })
    }
}

impl FrontendDriver for DynamicDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> DriverCaps {
        let mut caps = DriverCaps::empty();
        caps.set(DriverCaps::TUNE, self.tune.is_some());
        caps.set(DriverCaps::GAIN, self.gain.is_some());
        caps.set(DriverCaps::ATTEN, self.atten.is_some());
        caps
    }

    fn setup(&self, fe: &mut Frontend, config: &ConfigTree, section: &str) -> Result<()> {
        let section = CString::new(section).context("section name")?;
        let rc = unsafe { (self.setup)(fe as *mut _, config as *const _, section.as_ptr()) };
        ensure!(rc == 0, "driver {}: setup failed ({rc})", self.name);
        Ok(())
    }

    fn start(&self, fe: &Arc<Frontend>) -> Result<()> {
        let rc = unsafe { (self.start)(Arc::as_ptr(fe)) };
        ensure!(rc == 0, "driver {}: startup failed ({rc})", self.name);
        Ok(())
    }

    fn tune(&self, fe: &Frontend, hz: f64) -> Result<f64> {
        match self.tune {
            Some(tune) => Ok(unsafe { tune(fe as *const _, hz) }),
            None => bail!("{}: tuning not supported", self.name),
        }
    }

    fn rf_gain(&self, fe: &Frontend, db: f32) -> Result<f32> {
        match self.gain {
            Some(gain) => Ok(unsafe { gain(fe as *const _, db) }),
            None => bail!("{}: gain control not supported", self.name),
        }
    }

    fn rf_atten(&self, fe: &Frontend, db: f32) -> Result<f32> {
        match self.atten {
            Some(atten) => Ok(unsafe { atten(fe as *const _, db) }),
            None => bail!("{}: attenuator control not supported", self.name),
        }
    }
}
