use {
    anyhow::Result,
    crate::config::ConfigTree,
    std::{
        path::PathBuf,
        str::FromStr,
        sync::{Condvar, Mutex},
        time::Duration,
    },
    strum::{Display, EnumString},
};

/// Upper bound on spur-notch entries, the DC sentinel included.
pub const NSPURS: usize = 64;

/// Block timing shared by the front end and every channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub blocktime_ms: f64,
    pub overlap: u32,
}

impl Default for Timing {
    fn default() -> Timing {
        Timing {
            blocktime_ms: 20.0,
            overlap: 5,
        }
    }
}

impl Timing {
    pub fn from_config(config: &ConfigTree) -> Result<Timing> {
        let defaults = Timing::default();
        let blocktime_ms = config
            .get_float("global", "blocktime")
            .unwrap_or(defaults.blocktime_ms);
        let overlap = config
            .get_int("global", "overlap")
            .unwrap_or(i64::from(defaults.overlap));

        ensure!(blocktime_ms > 0.0, "blocktime must be positive");
        ensure!(overlap >= 2, "overlap must be at least 2");
        Ok(Timing {
            blocktime_ms,
            overlap: overlap as u32,
        })
    }

    #[inline]
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.blocktime_ms / 1e3)
    }

    /// Idle budget for dynamic channels, in blocks.
    #[inline]
    pub fn idle_timeout_blocks(&self) -> u32 {
        (20_000.0 / self.blocktime_ms) as u32
    }

    /// Derives the overlap-save dimensions for a sample rate:
    /// input block `L`, impulse response `M`, FFT length `N = L + M - 1`.
    pub fn dimension(&self, samprate: u32) -> Result<FilterDims> {
        let l = (f64::from(samprate) * self.blocktime_ms / 1e3).round() as usize;
        ensure!(
            l > 0,
            "block of {} ms at {} Hz holds no samples",
            self.blocktime_ms,
            samprate
        );
        let m = l / (self.overlap as usize - 1) + 1;
        let n = l + m - 1;
        Ok(FilterDims { l, m, n })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDims {
    pub l: usize,
    pub m: usize,
    pub n: usize,
}

/// FFTW planning rigor. `N` is not forced to an FFT-friendly size; a
/// poor choice shows up as DSP cost, not as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum FftPlanLevel {
    Estimate,
    #[default]
    Measure,
    Patient,
    Exhaustive,
    WisdomOnly,
}

/// Planning parameters handed to the FFT layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FftParams {
    pub plan_level: FftPlanLevel,
    pub threads: u32,
    pub time_limit: Option<f64>,
    pub wisdom_file: Option<PathBuf>,
}

impl Default for FftParams {
    fn default() -> FftParams {
        FftParams {
            plan_level: FftPlanLevel::default(),
            threads: 1,
            time_limit: None,
            wisdom_file: None,
        }
    }
}

impl FftParams {
    /// Reads the `fft-*` keys; `time_limit_override` comes from the
    /// command line and wins over the config.
    pub fn from_config(config: &ConfigTree, time_limit_override: Option<f64>) -> Result<FftParams> {
        let plan_level = match config.get("global", "fft-plan-level") {
            Some(raw) => FftPlanLevel::from_str(raw)
                .map_err(|_| anyhow!("fft-plan-level = {raw}: unknown planning level"))?,
            None => FftPlanLevel::default(),
        };
        Ok(FftParams {
            plan_level,
            threads: config.get_int("global", "fft-threads").unwrap_or(1).max(1) as u32,
            time_limit: time_limit_override
                .or_else(|| config.get_float("global", "fft-time-limit")),
            wisdom_file: config.get("global", "wisdom-file").map(PathBuf::from),
        })
    }
}

/// Maps a frequency onto the FFT grid. The shift is rounded to a
/// multiple of the block advance in bins so a bin slice keeps phase
/// continuity from one overlap-save block to the next; the remainder is
/// removed downstream by a fine-tuning phasor.
pub fn compute_tuning(n: usize, m: usize, samprate: u32, freq: f64) -> (i32, f64) {
    let hz_per_bin = f64::from(samprate) / n as f64;
    let advance = if m > 1 { (n / (m - 1)).max(1) } else { 1 } as f64;
    let shift = advance * (freq / (advance * hz_per_bin)).round();
    (shift as i32, freq - shift * hz_per_bin)
}

/// One adaptively suppressed frontend spur, placed on the FFT grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpurNotch {
    pub shift: i32,
    pub remainder: f64,
}

/// The shared forward-FFT input filter. Owned by the Frontend; the
/// capture thread advances the block counter, demodulator threads wait
/// on it. The DSP inner loops live behind this handle.
#[derive(Debug)]
pub struct MasterFilter {
    dims: FilterDims,
    isreal: bool,
    fft: FftParams,
    spurs: Vec<SpurNotch>,
    blocks: Mutex<u64>,
    block_ready: Condvar,
}

impl MasterFilter {
    pub fn new(
        dims: FilterDims,
        isreal: bool,
        fft: FftParams,
        samprate: u32,
        spur_hz: &[f64],
    ) -> MasterFilter {
        if spur_hz.len() > NSPURS - 1 {
            log::warn!("{} spur notches requested, keeping {}", spur_hz.len(), NSPURS - 1);
        }
        let mut spurs: Vec<SpurNotch> = spur_hz
            .iter()
            .take(NSPURS - 1)
            .map(|&hz| {
                let (shift, remainder) = compute_tuning(dims.n, dims.m, samprate, hz);
                SpurNotch { shift, remainder }
            })
            .collect();
        // the DC sentinel is always notched
        let (shift, remainder) = compute_tuning(dims.n, dims.m, samprate, 0.0);
        spurs.push(SpurNotch { shift, remainder });

        MasterFilter {
            dims,
            isreal,
            fft,
            spurs,
            blocks: Mutex::new(0),
            block_ready: Condvar::new(),
        }
    }

    #[inline]
    pub fn dims(&self) -> FilterDims {
        self.dims
    }

    #[inline]
    pub fn is_real(&self) -> bool {
        self.isreal
    }

    #[inline]
    pub fn fft_params(&self) -> &FftParams {
        &self.fft
    }

    #[inline]
    pub fn spurs(&self) -> &[SpurNotch] {
        &self.spurs
    }

    /// Called by the capture thread after each forward FFT.
    pub fn advance_block(&self) {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        *blocks += 1;
        self.block_ready.notify_all();
    }

    pub fn blocks(&self) -> u64 {
        *self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits until the block counter passes `seen` or the timeout
    /// elapses; returns the counter either way.
    pub fn wait_block(&self, seen: u64, timeout: Duration) -> u64 {
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        let (blocks, _) = self
            .block_ready
            .wait_timeout_while(blocks, timeout, |b| *b <= seen)
            .unwrap_or_else(|e| e.into_inner());
        *blocks
    }

    /// Wakes every thread parked on the block counter.
    pub fn wake_all(&self) {
        self.block_ready.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn reference_dimensions() {
        // 16 kHz at 20 ms with overlap 5
        let timing = Timing::default();
        let dims = timing.dimension(16_000).unwrap();
        assert_eq!(dims, FilterDims { l: 320, m: 81, n: 400 });
    }

    #[test]
    fn idle_timeout_follows_blocktime() {
        assert_eq!(Timing::default().idle_timeout_blocks(), 1000);
        let timing = Timing { blocktime_ms: 40.0, overlap: 5 };
        assert_eq!(timing.idle_timeout_blocks(), 500);
    }

    #[quickcheck]
    fn dimensions_are_positive(samprate: u32, blocktime_frac: u16, overlap: u8) -> bool {
        let samprate = samprate % 100_000_000 + 1_000;
        let timing = Timing {
            blocktime_ms: f64::from(blocktime_frac % 1000) / 10.0 + 1.0,
            overlap: u32::from(overlap % 16) + 2,
        };
        match timing.dimension(samprate) {
            Ok(FilterDims { l, m, n }) => l > 0 && m > 0 && n == l + m - 1,
            Err(_) => false,
        }
    }

    #[test]
    fn tuning_shift_is_block_aligned() {
        // L=320 M=81 N=400: shifts land on multiples of N/(M-1) = 5 bins
        let (shift, remainder) = compute_tuning(400, 81, 16_000, 7_200.0);
        assert_eq!(shift % 5, 0);
        assert!(remainder.abs() <= 16_000.0 / 400.0 * 2.5);
        let (shift, remainder) = compute_tuning(400, 81, 16_000, 0.0);
        assert_eq!(shift, 0);
        assert_eq!(remainder, 0.0);
    }

    #[test]
    fn dc_sentinel_is_always_present() {
        let dims = Timing::default().dimension(16_000).unwrap();
        let filter = MasterFilter::new(dims, true, FftParams::default(), 16_000, &[1_000.0]);
        assert_eq!(filter.spurs().len(), 2);
        assert_eq!(filter.spurs().last().unwrap().shift, 0);
    }

    #[test]
    fn spur_list_is_bounded() {
        let dims = Timing::default().dimension(16_000).unwrap();
        let many: Vec<f64> = (0..200).map(|i| f64::from(i) * 50.0).collect();
        let filter = MasterFilter::new(dims, true, FftParams::default(), 16_000, &many);
        assert_eq!(filter.spurs().len(), NSPURS);
    }

    #[test]
    fn plan_levels_parse() {
        assert_eq!(
            "wisdom-only".parse::<FftPlanLevel>().unwrap(),
            FftPlanLevel::WisdomOnly
        );
        assert_eq!(
            "MEASURE".parse::<FftPlanLevel>().unwrap(),
            FftPlanLevel::Measure
        );
        assert_eq!(FftPlanLevel::WisdomOnly.to_string(), "wisdom-only");
        assert!("fastest".parse::<FftPlanLevel>().is_err());
    }

    #[test]
    fn filter_carries_planning_parameters() {
        let dims = Timing::default().dimension(16_000).unwrap();
        let fft = FftParams {
            plan_level: FftPlanLevel::Patient,
            threads: 2,
            time_limit: Some(30.0),
            wisdom_file: None,
        };
        let filter = MasterFilter::new(dims, false, fft.clone(), 16_000, &[]);
        assert!(!filter.is_real());
        assert_eq!(*filter.fft_params(), fft);
        assert_eq!(filter.blocks(), 0);
        filter.advance_block();
        assert_eq!(filter.blocks(), 1);
    }
}
