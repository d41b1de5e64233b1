use {
    anyhow::{Context, Result},
    nix::sys::{
        resource::{getrusage, UsageWho},
        signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    },
    std::{
        sync::atomic::{AtomicBool, AtomicI32, Ordering},
        thread,
        time::{Duration, Instant},
    },
};

pub const EX_OK: i32 = 0;
/// Bad command line or bad configuration.
pub const EX_USAGE: i32 = 64;
/// Config or sample source could not be opened.
pub const EX_NOINPUT: i32 = 66;
/// Socket setup failed.
pub const EX_NOHOST: i32 = 68;
/// Preset library unavailable.
pub const EX_UNAVAILABLE: i32 = 69;
/// Terminated by a signal other than SIGTERM.
pub const EX_SOFTWARE: i32 = 70;

static STOP: AtomicBool = AtomicBool::new(false);
static STOP_SIGNAL: AtomicI32 = AtomicI32::new(0);
static VERBOSITY: AtomicI32 = AtomicI32::new(0);

/// Single-writer, many-reader stop flag; every long-running thread
/// polls it between blocking operations.
#[inline]
pub fn should_stop() -> bool {
    STOP.load(Ordering::Relaxed)
}

#[inline]
pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

pub fn set_verbosity(level: i32) {
    VERBOSITY.store(level.max(0), Ordering::Relaxed);
}

/// Logger level for a verbosity counter.
pub fn level_for(verbosity: i32) -> log::LevelFilter {
    match verbosity {
        i32::MIN..=0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

extern "C" fn handle_stop(signal: nix::libc::c_int) {
    STOP_SIGNAL.store(signal, Ordering::Relaxed);
    STOP.store(true, Ordering::Relaxed);
}

extern "C" fn handle_verbosity(signal: nix::libc::c_int) {
    if signal == nix::libc::SIGUSR1 {
        VERBOSITY.fetch_add(1, Ordering::Relaxed);
    } else {
        // clamp at zero
        let _ = VERBOSITY.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            (v > 0).then_some(v - 1)
        });
    }
}

/// INT/QUIT/TERM raise the stop flag, USR1/USR2 adjust verbosity,
/// PIPE is ignored so a dead subscriber cannot kill the daemon.
pub fn install_signal_handlers() -> Result<()> {
    let stop = SigAction::new(
        SigHandler::Handler(handle_stop),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        unsafe { signal::sigaction(sig, &stop) }
            .with_context(|| format!("installing {sig} handler"))?;
    }

    let verbosity = SigAction::new(
        SigHandler::Handler(handle_verbosity),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGUSR1, Signal::SIGUSR2] {
        unsafe { signal::sigaction(sig, &verbosity) }
            .with_context(|| format!("installing {sig} handler"))?;
    }

    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::SA_RESTART, SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGPIPE, &ignore) }.context("ignoring SIGPIPE")?;
    Ok(())
}

/// Cumulative and interval CPU-percent figures from process rusage
/// against monotonic wall time.
pub struct CpuAccounting {
    start: Instant,
    start_cpu: Duration,
    last: Instant,
    last_cpu: Duration,
}

fn process_cpu() -> Duration {
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let user = usage.user_time();
            let system = usage.system_time();
            Duration::from_secs((user.tv_sec() + system.tv_sec()).max(0) as u64)
                + Duration::from_micros((user.tv_usec() + system.tv_usec()).max(0) as u64)
        }
        Err(_) => Duration::ZERO,
    }
}

impl CpuAccounting {
    pub fn new() -> CpuAccounting {
        let now = Instant::now();
        let cpu = process_cpu();
        CpuAccounting {
            start: now,
            start_cpu: cpu,
            last: now,
            last_cpu: cpu,
        }
    }

    /// Returns (cumulative %, interval %) and starts a new interval.
    pub fn sample(&mut self) -> (f64, f64) {
        let now = Instant::now();
        let cpu = process_cpu();
        let pct = |cpu_spent: Duration, wall: Duration| {
            if wall.is_zero() {
                0.0
            } else {
                100.0 * cpu_spent.as_secs_f64() / wall.as_secs_f64()
            }
        };
        let cumulative = pct(cpu - self.start_cpu, now - self.start);
        let interval = pct(cpu - self.last_cpu, now - self.last);
        self.last = now;
        self.last_cpu = cpu;
        (cumulative, interval)
    }
}

impl Default for CpuAccounting {
    fn default() -> CpuAccounting {
        CpuAccounting::new()
    }
}

/// Top-level loop: applies signal-driven verbosity changes, reports CPU
/// figures once a minute when verbose, and converts the stop flag into
/// an exit code after a one-second drain window.
pub fn run() -> i32 {
    let mut cpu = CpuAccounting::new();
    let mut last_report = Instant::now();
    let mut level = level_for(verbosity());

    while !should_stop() {
        thread::sleep(Duration::from_secs(1));

        let wanted = level_for(verbosity());
        if wanted != level {
            level = wanted;
            log::set_max_level(level);
        }

        if verbosity() > 0 && last_report.elapsed() >= Duration::from_secs(60) {
            last_report = Instant::now();
            let (cumulative, interval) = cpu.sample();
            log::info!("CPU {cumulative:.1}% cumulative, {interval:.1}% last minute");
        }
    }

    // give the worker threads a chance to notice the flag
    thread::sleep(Duration::from_secs(1));

    match Signal::try_from(STOP_SIGNAL.load(Ordering::Relaxed)) {
        Ok(Signal::SIGTERM) => EX_OK,
        _ => EX_SOFTWARE,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verbosity_clamps_at_zero() {
        set_verbosity(1);
        handle_verbosity(nix::libc::SIGUSR2);
        assert_eq!(verbosity(), 0);
        handle_verbosity(nix::libc::SIGUSR2);
        assert_eq!(verbosity(), 0);
        handle_verbosity(nix::libc::SIGUSR1);
        assert_eq!(verbosity(), 1);
        set_verbosity(0);
    }

    #[test]
    fn levels_track_verbosity() {
        assert_eq!(level_for(0), log::LevelFilter::Info);
        assert_eq!(level_for(1), log::LevelFilter::Debug);
        assert_eq!(level_for(5), log::LevelFilter::Trace);
        assert_eq!(level_for(-1), log::LevelFilter::Info);
    }
}
