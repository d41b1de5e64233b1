use {
    super::{DriverCaps, Frontend, FrontendDriver},
    crate::{config::ConfigTree, frequency::parse_frequency, supervisor},
    anyhow::{Context, Result},
    std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
};

const DEFAULT_SAMPRATE: u32 = 30_000_000;

/// Built-in synthetic front end. Produces empty blocks at the exact
/// block cadence so every downstream stage runs without hardware; also
/// what the test suite binds against.
pub struct SigGen;

impl FrontendDriver for SigGen {
    fn name(&self) -> &str {
        "sig_gen"
    }

    fn caps(&self) -> DriverCaps {
        DriverCaps::TUNE | DriverCaps::GAIN
    }

    fn setup(&self, fe: &mut Frontend, config: &ConfigTree, section: &str) -> Result<()> {
        let samprate = config
            .get_int(section, "samprate")
            .unwrap_or(i64::from(DEFAULT_SAMPRATE));
        ensure!(samprate > 0, "sig_gen: samprate must be positive");
        fe.samprate = samprate as u32;
        fe.isreal = !config.get_bool(section, "complex").unwrap_or(false);
        fe.description = config
            .get(section, "description")
            .unwrap_or("sig_gen")
            .to_string();

        let frequency = config
            .get(section, "frequency")
            .and_then(parse_frequency)
            .unwrap_or(0.0);
        let gain = config.get_float(section, "gain").unwrap_or(0.0) as f32;
        fe.update_status(|status| {
            status.frequency = frequency;
            status.rf_gain = gain;
        });
        Ok(())
    }

    fn start(&self, fe: &Arc<Frontend>) -> Result<()> {
        let fe = fe.clone();
        thread::Builder::new()
            .name("sig_gen".into())
            .spawn(move || pump(&fe))
            .context("spawning sig_gen capture thread")?;
        Ok(())
    }

    fn tune(&self, _fe: &Frontend, hz: f64) -> Result<f64> {
        Ok(hz)
    }

    fn rf_gain(&self, _fe: &Frontend, db: f32) -> Result<f32> {
        Ok(db)
    }
}

/// Capture loop: one block per block interval, paced against a
/// monotonic deadline so cadence does not drift with sleep jitter.
fn pump(fe: &Frontend) {
    let Some(filter) = fe.filter() else {
        log::error!("sig_gen started on an unbound front end");
        return;
    };
    let samples = filter.dims().l as u64;
    let block = Duration::from_secs_f64(filter.dims().l as f64 / f64::from(fe.samprate));
    let mut deadline = Instant::now() + block;

    while !supervisor::should_stop() {
        let now = Instant::now();
        if now < deadline {
            thread::sleep(deadline - now);
        }
        deadline += block;

        fe.update_status(|status| status.samples += samples);
        filter.advance_block();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn setup_reports_sample_source() {
        let tree = ConfigTree::from_ini_str(
            "[rig]\ndevice = sig_gen\nsamprate = 16000\ndescription = test rig\nfrequency = 10M\n",
        )
        .unwrap();
        let mut fe = Frontend::new(Arc::new(SigGen));
        SigGen.setup(&mut fe, &tree, "rig").unwrap();
        assert_eq!(fe.samprate, 16_000);
        assert!(fe.isreal);
        assert_eq!(fe.description, "test rig");
    }

    #[test]
    fn complex_flag() {
        let tree = ConfigTree::from_ini_str("[rig]\ncomplex = yes\n").unwrap();
        let mut fe = Frontend::new(Arc::new(SigGen));
        SigGen.setup(&mut fe, &tree, "rig").unwrap();
        assert!(!fe.isreal);
        assert_eq!(fe.samprate, DEFAULT_SAMPRATE);
    }
}
