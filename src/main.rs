use {
    clap::Parser,
    radiod::{
        channel::{self, ChannelRegistry, ChannelTemplate},
        config::{self, ConfigTree},
        filter::{FftParams, Timing},
        frontend,
        multicast::{
            self,
            avahi::{self, RecordRegistry},
            GroupAddr, OutputSockets, DEFAULT_RTP_PORT, DEFAULT_STAT_PORT,
        },
        presets::PresetTable,
        rtcp, status,
        supervisor::{self, EX_NOHOST, EX_NOINPUT, EX_OK, EX_SOFTWARE, EX_UNAVAILABLE, EX_USAGE},
        system::System,
    },
    std::{ffi::CString, net::SocketAddr, path::PathBuf, process::exit, sync::Arc, thread},
};

#[derive(Parser, Debug)]
#[command(name = "radiod", disable_version_flag = true)]
struct Args {
    /// Instance name used in service announcements
    #[arg(short = 'N', value_name = "NAME")]
    name: Option<String>,

    /// FFT planning time limit, seconds
    #[arg(short = 'p', value_name = "SECONDS")]
    fft_time_limit: Option<f64>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the version banner and exit
    #[arg(short = 'V')]
    version: bool,

    /// Configuration file, directory, or file with a .d fragment directory
    config: Option<PathBuf>,
}

fn main() {
    exit(run());
}

fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.kind() == clap::error::ErrorKind::DisplayHelp => {
            let _ = err.print();
            return EX_OK;
        }
        Err(err) => {
            let _ = err.print();
            return EX_USAGE;
        }
    };
    if args.version {
        println!("radiod {}", env!("CARGO_PKG_VERSION"));
        return EX_OK;
    }

    set_locale();
    supervisor::set_verbosity(i32::from(args.verbose));
    // the backend passes everything; the facade max level is the knob
    // USR1/USR2 turn at run time
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .init();
    log::set_max_level(supervisor::level_for(supervisor::verbosity()));

    let Some(config_path) = args.config else {
        eprintln!("usage: radiod [-N name] [-p seconds] [-v]... [-V] <config>");
        return EX_NOINPUT;
    };

    // configuration
    let config = match ConfigTree::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            log::error!("cannot load {}: {err:#}", config_path.display());
            return if config::is_io_error(&err) {
                EX_NOINPUT
            } else {
                EX_USAGE
            };
        }
    };
    if config.hardware_section().is_none() {
        log::error!("{}: [global] must name a hardware= section", config_path.display());
        return EX_USAGE;
    }
    config.validate();

    // the config can only raise verbosity, never hide what -v asked for
    if let Some(verbose) = config.get_int("global", "verbose") {
        if verbose > i64::from(supervisor::verbosity()) {
            supervisor::set_verbosity(verbose as i32);
            log::set_max_level(supervisor::level_for(supervisor::verbosity()));
        }
    }

    let timing = match Timing::from_config(&config) {
        Ok(timing) => timing,
        Err(err) => {
            log::error!("{err:#}");
            return EX_USAGE;
        }
    };
    let fft = match FftParams::from_config(&config, args.fft_time_limit) {
        Ok(fft) => fft,
        Err(err) => {
            log::error!("{err:#}");
            return EX_USAGE;
        }
    };

    // presets
    let presets = match PresetTable::load(&config) {
        Ok(presets) => presets,
        Err(err) => {
            log::error!("{err:#}");
            return EX_UNAVAILABLE;
        }
    };

    // front end: binds the driver and dimensions the shared filter
    let frontend = match frontend::bind(&config, timing, fft) {
        Ok(frontend) => frontend,
        Err(err) => {
            log::error!("{err:#}");
            return EX_NOINPUT;
        }
    };

    if let Err(err) = supervisor::install_signal_handlers() {
        log::error!("{err:#}");
        return EX_SOFTWARE;
    }

    // networking
    let instance = args.name.unwrap_or_else(|| {
        config
            .get("global", "description")
            .unwrap_or("radio")
            .to_string()
    });
    let global_ttl = config.get_int("global", "ttl").unwrap_or(0) as u8;
    let tos = config.get_int("global", "tos").unwrap_or(48) as u8;
    let use_dns = config.get_bool("global", "dns").unwrap_or(false);
    let iface = config.get("global", "iface").map(str::to_string);

    let output = match OutputSockets::open(iface.as_deref(), global_ttl, tos) {
        Ok(output) => output,
        Err(err) => {
            log::error!("{err:#}");
            return EX_NOHOST;
        }
    };

    let announcer = Arc::new(RecordRegistry::new());
    let data_name = config
        .get("global", "data")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{instance}-pcm"));
    let data_group = multicast::resolve_group(&data_name, DEFAULT_RTP_PORT, use_dns);
    if let Err(err) = avahi::advertise(
        announcer.as_ref(),
        avahi::SERVICE_RTP,
        &instance,
        &data_group,
        global_ttl,
    ) {
        log::warn!("{err:#}");
    }
    if let SocketAddr::V4(addr) = data_group.addr {
        if let Err(err) = output.join(*addr.ip()) {
            log::warn!("{err:#}");
        }
    }

    let status_group = match config.get("global", "status") {
        Some(name) => multicast::resolve_group(name, DEFAULT_STAT_PORT, use_dns),
        None => GroupAddr {
            name: data_group.name.clone(),
            addr: SocketAddr::new(data_group.addr.ip(), DEFAULT_STAT_PORT),
            synthesized: data_group.synthesized,
        },
    };
    if let Err(err) = avahi::advertise(
        announcer.as_ref(),
        avahi::SERVICE_CONTROL,
        &instance,
        &status_group,
        global_ttl,
    ) {
        log::warn!("{err:#}");
    }
    let _ = frontend.metadata_dest.set(status_group.addr);

    let global_template =
        ChannelTemplate::build(&config, &presets, None, timing.idle_timeout_blocks());

    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    let system = Arc::new(System {
        presets,
        frontend,
        output,
        announcer,
        registry: ChannelRegistry::new(),
        timing,
        global_template,
        data_group,
        status_group,
        instance,
        hostname,
        iface,
        start_gps_ns: rtcp::gps_time_ns(),
    });

    // channel factory fan-out: one transient thread per channel
    // section, all joined before the config tree goes away
    let sections: Vec<String> = config
        .sections()
        .map(|s| s.name().to_string())
        .filter(|name| name.as_str() != "global" && !config.is_frontend_section(name))
        .collect();

    thread::scope(|scope| {
        let (sys, cfg) = (&system, &config);
        let handles: Vec<_> = sections
            .iter()
            .map(|section| {
                (
                    section,
                    scope.spawn(move || channel::channel_factory(sys, cfg, section)),
                )
            })
            .collect();
        for (section, handle) in handles {
            match handle.join() {
                Ok(Ok(count)) => log::debug!("[{section}] {count} channels"),
                Ok(Err(err)) => log::warn!("[{section}] {err:#}"),
                Err(_) => log::warn!("[{section}] factory panicked"),
            }
        }
    });
    drop(config);

    log::info!(
        "radiod {}: {} channels started on {}",
        system.instance,
        system.registry.started(),
        system.data_group.name
    );

    // status/command endpoint
    if let Err(err) = status::spawn(&system) {
        log::error!("{err:#}");
        return EX_NOHOST;
    }

    supervisor::run()
}

/// Honors LANG so grouped-digit formatting renders correctly in the
/// terminal front ends.
fn set_locale() {
    let lang = std::env::var("LANG").unwrap_or_else(|_| "en_US.UTF-8".to_string());
    if let Ok(lang) = CString::new(lang) {
        unsafe {
            nix::libc::setlocale(nix::libc::LC_ALL, lang.as_ptr());
        }
    }
}
