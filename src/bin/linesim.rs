use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use linesim::clock::SimClock;
use linesim::config::Config;
use linesim::events::EventEmitter;
use linesim::line::LineSimulator;
use linesim::registers::RegisterBank;
use linesim::schedule;
use linesim::server;

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_SCHEDULE_ERROR: u8 = 2;
const EXIT_BIND_ERROR: u8 = 3;

/// How long in-flight Modbus sessions get to finish after the simulation
/// stops before the listener task is torn down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "linesim", version, about = "Bottling line Modbus digital twin")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the configured speed factor.
    #[arg(long)]
    speed: Option<f64>,

    /// Override the configured Modbus TCP port.
    #[arg(long)]
    port: Option<u16>,

    /// Log level filter (error/warn/info/debug/trace).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let explicit_config = args.config != PathBuf::from("config.yaml");

    let mut cfg = match Config::load(&args.config, explicit_config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    if let Some(speed) = args.speed {
        cfg.simulator.speed_factor = speed;
    }
    if let Some(port) = args.port {
        cfg.modbus.port = port;
    }
    if let Some(level) = args.log_level {
        cfg.logging.level = level;
    }
    if let Err(e) = cfg.validate() {
        eprintln!("configuration error: {e}");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cfg.logging.level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let week = schedule::built_in_week();
    if let Err(e) = schedule::validate(&week) {
        error!("schedule error: {e}");
        return ExitCode::from(EXIT_SCHEDULE_ERROR);
    }

    info!("bottling line simulator v{}", env!("CARGO_PKG_VERSION"));
    info!(speed = cfg.simulator.speed_factor, port = cfg.modbus.port, "starting");

    let bank = Arc::new(RegisterBank::new());
    let (listener, bound_port) = match server::bind(&cfg.modbus.host, cfg.modbus.port).await {
        Ok(bound) => bound,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_BIND_ERROR);
        }
    };
    info!(port = bound_port, "Modbus TCP ready");

    let server_task = tokio::spawn(server::serve(
        listener,
        Arc::clone(&bank),
        Duration::from_secs(cfg.modbus.request_timeout_s),
    ));

    let emitter = match EventEmitter::new(
        cfg.logging.transactions_file.as_ref(),
        cfg.hierarchy(),
        cfg.logging.console,
    ) {
        Ok(emitter) => emitter,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let clock = Arc::new(SimClock::new(cfg.simulator.speed_factor));
    let settings = cfg.sim_settings();
    let shutdown = Arc::new(AtomicBool::new(false));

    let sim_shutdown = Arc::clone(&shutdown);
    let mut sim_task = tokio::task::spawn_blocking(move || {
        let mut sim = LineSimulator::new(settings, week, clock, bank, emitter);
        let result = sim.run(&sim_shutdown);
        (result, sim.into_emitter())
    });

    let run_outcome = tokio::select! {
        joined = &mut sim_task => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, finishing current tick");
            shutdown.store(true, Ordering::SeqCst);
            (&mut sim_task).await
        }
    };

    // Let pollers read the final idle image before the listener goes away.
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    server_task.abort();

    match run_outcome {
        Ok((Ok(()), emitter)) => {
            if let Err(e) = emitter.close() {
                error!("{e}");
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
            info!("simulator stopped");
            ExitCode::SUCCESS
        }
        Ok((Err(e), emitter)) => {
            // The tick loop halts when the event log stops being durable.
            error!("fatal: {e}");
            let _ = emitter.close();
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
        Err(e) => {
            error!("simulation thread panicked: {e}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}
