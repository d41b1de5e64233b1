mod driver;
mod sig_gen;

pub use driver::{lookup_builtin, DriverCaps, DynamicDriver, FrontendDriver, SODIR};
pub use sig_gen::SigGen;

use {
    crate::{
        config::ConfigTree,
        filter::{FftParams, MasterFilter, Timing},
        frequency::parse_frequency,
    },
    anyhow::{Context, Result},
    std::{
        fmt,
        net::SocketAddr,
        sync::{Arc, Condvar, Mutex, OnceLock},
        time::Duration,
    },
};

/// Fields the capture thread updates; readers wait on the condition
/// variable paired with this state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeStatus {
    pub frequency: f64,
    pub rf_gain: f32,
    pub rf_atten: f32,
    pub samples: u64,
}

/// The one-per-process front end. Mutable while its driver's `setup`
/// runs; frozen into an `Arc` before `start`, after which only the
/// status area changes, under its mutex.
pub struct Frontend {
    pub samprate: u32,
    pub isreal: bool,
    pub description: String,

    driver: Arc<dyn FrontendDriver>,
    filter: OnceLock<MasterFilter>,

    /// Where front-end metadata broadcasts go; set once the status
    /// group is advertised.
    pub metadata_dest: OnceLock<SocketAddr>,

    status: Mutex<FeStatus>,
    status_cond: Condvar,
}

impl fmt::Display for Frontend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Front end: {}", self.description)?;
        writeln!(
            f,
            "Sample rate: {} Hz ({})",
            self.samprate,
            if self.isreal { "real" } else { "complex" }
        )?;
        if let Some(filter) = self.filter.get() {
            let dims = filter.dims();
            writeln!(f, "Filter: L={} M={} N={}", dims.l, dims.m, dims.n)?;
        }
        write!(
            f,
            "Driver: {} (caps 0x{:02x})",
            self.driver.name(),
            self.driver.caps().bits()
        )?;
        Ok(())
    }
}

impl Frontend {
    pub fn new(driver: Arc<dyn FrontendDriver>) -> Frontend {
        Frontend {
            samprate: 0,
            isreal: true,
            description: String::new(),
            driver,
            filter: OnceLock::new(),
            metadata_dest: OnceLock::new(),
            status: Mutex::new(FeStatus::default()),
            status_cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn FrontendDriver> {
        &self.driver
    }

    /// The shared input filter; `None` only before binding completes.
    #[inline]
    pub fn filter(&self) -> Option<&MasterFilter> {
        self.filter.get()
    }

    pub fn status(&self) -> FeStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Updates the status area and wakes every status waiter.
    pub fn update_status(&self, update: impl FnOnce(&mut FeStatus)) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        update(&mut status);
        self.status_cond.notify_all();
    }

    /// Blocks until the capture thread signals a status change, or the
    /// timeout elapses.
    pub fn wait_status(&self, timeout: Duration) -> FeStatus {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let (status, _) = self
            .status_cond
            .wait_timeout(status, timeout)
            .unwrap_or_else(|e| e.into_inner());
        *status
    }

    /// Retunes the hardware and records the frequency actually set.
    pub fn tune(&self, hz: f64) -> Result<f64> {
        ensure!(
            self.driver.caps().contains(DriverCaps::TUNE),
            "front end {} cannot tune",
            self.description
        );
        let actual = self.driver.tune(self, hz)?;
        self.update_status(|status| status.frequency = actual);
        Ok(actual)
    }

    pub fn set_rf_gain(&self, db: f32) -> Result<f32> {
        let actual = self.driver.rf_gain(self, db)?;
        self.update_status(|status| status.rf_gain = actual);
        Ok(actual)
    }

    pub fn set_rf_atten(&self, db: f32) -> Result<f32> {
        let actual = self.driver.rf_atten(self, db)?;
        self.update_status(|status| status.rf_atten = actual);
        Ok(actual)
    }
}

/// Resolves and binds the hardware section's driver, runs its setup,
/// dimensions the shared input filter from the reported sample rate,
/// builds the spur-notch list, and starts the capture thread. Every
/// error here is fatal to startup.
pub fn bind(config: &ConfigTree, timing: Timing, fft: FftParams) -> Result<Arc<Frontend>> {
    let section = config
        .hardware_section()
        .context("[global] has no hardware= key")?
        .to_string();
    ensure!(
        config.section(&section).is_some(),
        "hardware section [{section}] is missing"
    );

    let device = config
        .get(&section, "device")
        .unwrap_or(&section)
        .to_string();
    let driver: Arc<dyn FrontendDriver> = match lookup_builtin(&device) {
        Some(driver) => driver,
        None => Arc::new(DynamicDriver::load(
            &device,
            config.get(&section, "library"),
        )?),
    };

    let mut fe = Frontend::new(driver);
    let setup = fe.driver.clone();
    setup
        .setup(&mut fe, config, &section)
        .with_context(|| format!("front end [{section}]: setup"))?;
    ensure!(
        fe.samprate > 0,
        "driver {} reported no sample rate",
        device
    );

    let dims = timing
        .dimension(fe.samprate)
        .with_context(|| format!("front end [{section}]"))?;

    let spurs: Vec<f64> = config
        .get(&section, "spurs")
        .map(|list| {
            list.split_whitespace()
                .filter_map(|token| {
                    let hz = parse_frequency(token);
                    if hz.is_none() {
                        log::warn!("[{section}] cannot parse spur frequency {token}");
                    }
                    hz
                })
                .collect()
        })
        .unwrap_or_default();

    let filter = MasterFilter::new(dims, fe.isreal, fft, fe.samprate, &spurs);
    if fe.filter.set(filter).is_err() {
        bail!("front end [{section}] already bound");
    }

    let fe = Arc::new(fe);
    let start = fe.driver.clone();
    start
        .start(&fe)
        .with_context(|| format!("front end [{section}]: startup"))?;
    log::debug!("{fe}");
    Ok(fe)
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> ConfigTree {
        ConfigTree::from_ini_str(
            "[global]\nhardware = rig\n[rig]\ndevice = sig_gen\nsamprate = 16000\n",
        )
        .unwrap()
    }

    #[test]
    fn bind_dimensions_filter_from_reported_rate() {
        let fe = bind(&test_config(), Timing::default(), FftParams::default()).unwrap();
        let dims = fe.filter().unwrap().dims();
        assert_eq!((dims.l, dims.m, dims.n), (320, 81, 400));
        assert!(fe.driver().caps().contains(DriverCaps::TUNE));
    }

    #[test]
    fn device_defaults_to_section_name() {
        let tree = ConfigTree::from_ini_str(
            "[global]\nhardware = sig_gen\n[sig_gen]\nsamprate = 8000\n",
        )
        .unwrap();
        let fe = bind(&tree, Timing::default(), FftParams::default()).unwrap();
        assert_eq!(fe.samprate, 8_000);
    }

    #[test]
    fn missing_hardware_section_is_fatal() {
        let tree = ConfigTree::from_ini_str("[global]\nhardware = ghost\n").unwrap();
        assert!(bind(&tree, Timing::default(), FftParams::default()).is_err());
    }

    #[test]
    fn spur_list_is_parsed_into_notches() {
        let tree = ConfigTree::from_ini_str(
            "[global]\nhardware = rig\n[rig]\ndevice = sig_gen\nsamprate = 16000\nspurs = 1k 2k junk\n",
        )
        .unwrap();
        let fe = bind(&tree, Timing::default(), FftParams::default()).unwrap();
        // two parsed spurs plus the DC sentinel
        assert_eq!(fe.filter().unwrap().spurs().len(), 3);
    }

    #[test]
    fn tune_updates_status() {
        let fe = bind(&test_config(), Timing::default(), FftParams::default()).unwrap();
        assert_eq!(fe.tune(7_200_000.0).unwrap(), 7_200_000.0);
        assert_eq!(fe.status().frequency, 7_200_000.0);
    }
}
