// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, registry, EnvFilter};

use cedar_goto::config::{build_solver, parse_dec, parse_ra, SolverConfig};
use cedar_goto::correction_loop::{CancelToken, LoopParams, SessionParams};
use cedar_goto::image_file_camera::ImageFileCamera;
use cedar_goto::lx200_mount::Lx200Mount;
use cedar_goto::nova::NOVA_BASE_URL;
use cedar_goto::session::run_session;
use cedar_goto::simulator::{SimulatedCamera, SimulatedMount, SimulatedSky};
use cedar_goto_elements::astro_util::to_horizontal;
use cedar_goto_elements::camera_trait::{ExposureRequest, ImagingDevice};
use cedar_goto_elements::coords::{Epoch, EquatorialPosition, ObserverFrame};
use cedar_goto_elements::mount_trait::PointingDevice;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SolverKind {
    /// Simulated solver; requires the simulated camera and mount.
    Sim,
    /// Locally installed astrometry.net solve-field.
    Local,
    /// nova.astrometry.net or another astrometry.net web service.
    Nova,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Target right ascension, decimal degrees or hours (e.g. 5h35m17.3s).
    #[arg(long)]
    ra: String,

    /// Target declination, decimal degrees or d:m:s (e.g. -05:23:28).
    #[arg(long, allow_hyphen_values = true)]
    dec: String,

    /// Julian epoch of the target coordinates. J2000 if omitted.
    #[arg(long)]
    equinox: Option<f64>,

    /// Observer latitude, degrees north.
    #[arg(long, allow_hyphen_values = true)]
    latitude: f64,

    /// Observer longitude, degrees east.
    #[arg(long, allow_hyphen_values = true)]
    longitude: f64,

    /// Observer elevation, meters.
    #[arg(long, default_value = "0")]
    elevation: f64,

    /// Exposure duration, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "2.0")]
    exposure: Duration,

    #[arg(long)]
    gain: Option<i32>,

    /// Convergence tolerance, degrees.
    #[arg(long, default_value = "0.1")]
    tolerance: f64,

    #[arg(long, default_value = "10")]
    max_iterations: u32,

    /// Consecutive solve failures before giving up.
    #[arg(long, default_value = "3")]
    max_solve_failures: u32,

    /// Retries after a capture or slew timeout.
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Solutions with lower confidence count as failures.
    #[arg(long, default_value = "0.0")]
    min_confidence: f64,

    /// Seconds.
    #[arg(long, value_parser = parse_duration, default_value = "60")]
    solve_timeout: Duration,

    /// Seconds.
    #[arg(long, value_parser = parse_duration, default_value = "120")]
    slew_timeout: Duration,

    /// Pause after each slew, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "1.0")]
    settle_time: Duration,

    /// Slew to the target before the first exposure.
    #[arg(long)]
    initial_goto: bool,

    /// "sim", or a directory of recorded images to replay.
    #[arg(long, default_value = "sim")]
    camera: String,

    /// "sim", or host:port of an LX200 protocol mount.
    #[arg(long, default_value = "sim")]
    mount: String,

    #[arg(long, value_enum, default_value = "sim")]
    solver: SolverKind,

    /// solve-field executable, for the local solver.
    #[arg(long, default_value = "solve-field")]
    solve_field: PathBuf,

    /// Scratch directory for the local solver.
    #[arg(long, default_value = "./solve_field_work")]
    work_dir: PathBuf,

    /// Lower bound of the field width, degrees (local solver hint).
    #[arg(long, requires = "scale_high")]
    scale_low: Option<f64>,

    /// Upper bound of the field width, degrees (local solver hint).
    #[arg(long, requires = "scale_low")]
    scale_high: Option<f64>,

    #[arg(long, default_value = NOVA_BASE_URL)]
    nova_url: String,

    #[arg(long, default_value = "")]
    nova_api_key: String,

    /// Seconds between job status checks.
    #[arg(long, value_parser = parse_duration, default_value = "5")]
    nova_poll_interval: Duration,

    /// Simulated mount's altitude pointing error, degrees.
    #[arg(long, allow_hyphen_values = true, default_value = "1.0")]
    sim_alt_error: f64,

    /// Simulated mount's azimuth pointing error, degrees.
    #[arg(long, allow_hyphen_values = true, default_value = "-2.0")]
    sim_az_error: f64,

    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "cedar_goto_log.txt")]
    log_file: String,
}

fn parse_duration(arg: &str)
                  -> Result<std::time::Duration, std::num::ParseFloatError> {
    let seconds = arg.parse()?;
    Ok(std::time::Duration::from_secs_f64(seconds))
}

fn main() {
    let args = Args::parse();

    // Set up logging.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir) {
            Ok(appender) => appender,
            Err(e) => {
                eprintln!("Cannot log to {}: {:?}", args.log_dir, e);
                std::process::exit(2);
            }
        };
    let (non_blocking_file, file_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, stdout_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let cancel = CancelToken::new();
    let cancel2 = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c; stopping after the current operation");
        cancel2.cancel();
    }) {
        warn!("Cannot install control-c handler: {:?}", e);
    }

    let exit_code = async_main(args, cancel);
    // Flush logs before exiting.
    drop(file_guard);
    drop(stdout_guard);
    std::process::exit(exit_code);
}

#[tokio::main]
async fn async_main(args: Args, cancel: CancelToken) -> i32 {
    let (ra, dec) = match (parse_ra(&args.ra), parse_dec(&args.dec)) {
        (Ok(ra), Ok(dec)) => (ra, dec),
        (Err(e), _) | (_, Err(e)) => {
            error!("{}", e.message);
            return 2;
        }
    };
    let epoch = match args.equinox {
        None => Epoch::J2000,
        Some(year) => Epoch::Julian(year),
    };
    let target = EquatorialPosition::new(ra, dec, epoch);
    let observer = ObserverFrame::new(args.latitude, args.longitude,
                                      args.elevation, SystemTime::now());

    let simulated = args.camera == "sim";
    if simulated != (args.mount == "sim") {
        error!("The simulated camera and mount must be used together");
        return 2;
    }
    let sky = if simulated {
        // The simulated mount starts out nominally on target.
        let start = match to_horizontal(&target, &observer) {
            Ok(start) => start,
            Err(e) => {
                error!("Bad target or site: {}", e);
                return 2;
            }
        };
        let sky = SimulatedSky::new(observer, start);
        sky.set_pointing_error(args.sim_alt_error, args.sim_az_error);
        Some(sky)
    } else {
        None
    };

    let (mut camera, mut mount): (Box<dyn ImagingDevice>, Box<dyn PointingDevice>) =
        match &sky {
            Some(sky) => (Box::new(SimulatedCamera::new(sky.clone())),
                          Box::new(SimulatedMount::new(sky.clone())
                                   .with_slew_jitter(0.01))),
            None => (Box::new(ImageFileCamera::new(&args.camera)),
                     Box::new(Lx200Mount::new(&args.mount))),
        };

    let solver_config = match args.solver {
        SolverKind::Sim => SolverConfig::Simulated,
        SolverKind::Local => SolverConfig::Local {
            solve_field: args.solve_field.clone(),
            work_dir: args.work_dir.clone(),
            scale_hint: args.scale_low.zip(args.scale_high),
        },
        SolverKind::Nova => SolverConfig::Remote {
            base_url: args.nova_url.clone(),
            api_key: args.nova_api_key.clone(),
            poll_interval: args.nova_poll_interval,
        },
    };
    let solver = match build_solver(&solver_config, sky.clone()) {
        Ok(solver) => solver,
        Err(e) => {
            error!("Cannot set up solver: {}", e.message);
            return 2;
        }
    };

    let params = SessionParams {
        target,
        observer,
        exposure: ExposureRequest{exposure_duration: args.exposure, gain: args.gain},
        loop_params: LoopParams {
            tolerance_deg: args.tolerance,
            max_iterations: args.max_iterations,
            max_solve_failures: args.max_solve_failures,
            max_capture_retries: args.max_retries,
            max_slew_retries: args.max_retries,
            min_confidence: args.min_confidence,
            solve_timeout: args.solve_timeout,
            slew_timeout: args.slew_timeout,
            settle_time: args.settle_time,
            initial_goto: args.initial_goto,
            ..Default::default()
        },
    };
    info!("Target {}, site lat {:.4} long {:.4}", target, args.latitude, args.longitude);

    let report = run_session(camera.as_mut(), mount.as_mut(), solver.as_ref(),
                             &params, cancel).await;
    for (device, fault) in &report.cleanup_faults {
        warn!("Cleanup fault on {}: {}", device, fault);
    }
    if report.outcome.is_converged() {
        info!("{}", report.outcome);
        0
    } else {
        error!("{}", report.outcome);
        1
    }
}
