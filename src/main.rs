//! Hub entry point: CLI, worker lifecycle, safe shutdown.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use docopt::Docopt;

use catbox_hub::comm;
use catbox_hub::comm::protocol::CommandRecord;
use catbox_hub::config::Config;
use catbox_hub::logic;
use catbox_hub::state::AppState;
use catbox_hub::vision;
use catbox_hub::vision::detector::{ScriptedDetector, SyntheticCamera};

const USAGE: &str = "
Catbox hub: host controller for the Schrodinger's Cat dispenser. Watches for
a visitor through the enclosure camera, runs the interaction session, and
drives the MCU (servos, valve, LEDs) over a serial line.

Usage:
  catbox-hub [--config=<path>] [--mock] [--port=<dev>] [--reset-safe-ms=<ms>]
  catbox-hub (--version | -v)
  catbox-hub (--help | -h)

Options:
    --config=<path>         Config overlay file [default: catbox.toml]
    --mock                  Force mock camera and serial (no hardware attached)
    --port=<dev>            Serial device, overriding autodetection
    --reset-safe-ms=<ms>    How long the safe-state flush gets to reach the
                            wire on shutdown [default: 150]
    --version, -v           Show version
    --help, -h              Show help
";

#[derive(Debug, Clone, Deserialize)]
struct Args {
    flag_config: String,
    flag_mock: bool,
    flag_port: Option<String>,
    flag_reset_safe_ms: u64,
}

fn main() -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_NAME").to_string() + ", version: " + env!("CARGO_PKG_VERSION");
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .map(|d| d.version(Some(version)))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let mut config = Config::load(&args.flag_config)?;
    if args.flag_mock {
        config.serial.mock = true;
        config.camera.mock = true;
    }
    if let Some(port) = args.flag_port {
        config.serial.port = Some(port);
        config.serial.mock = false;
    }

    info!("Catbox hub starting");
    info!(
        "Serial: {} (mock: {})",
        config.serial.port.as_deref().unwrap_or("autodetect"),
        config.serial.mock
    );
    info!(
        "Camera: index {} {}x{} @ {} fps (mock: {})",
        config.camera.index,
        config.camera.width,
        config.camera.height,
        config.camera.fps,
        config.camera.mock
    );

    let state = Arc::new(AppState::new());
    let config = Arc::new(config);
    // Two flags: the signal handler asks for shutdown; the workers only stop
    // once the safe-state command has had a chance to reach the MCU.
    let shutdown = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let vision_handle = if config.camera.mock {
        let source = Box::new(SyntheticCamera::new(&config.camera));
        let detector = Box::new(ScriptedDetector::new());
        Some(vision::tracker::spawn(
            state.clone(),
            config.clone(),
            stop.clone(),
            source,
            detector,
        ))
    } else {
        // Real capture comes from an external frame source; without one the
        // hub reports a camera fault and keeps running so the operator side
        // can surface it.
        error!("No camera backend built in; set [camera] mock = true or inject a frame source");
        state.add_error("Camera unavailable at startup");
        None
    };

    let (machine_handle, operator) =
        logic::state_machine::spawn(state.clone(), config.clone(), stop.clone());
    let (uart_handle, flush) = comm::uart::spawn(state.clone(), config.clone(), stop.clone());

    info!("All components started");

    // The dashboard (external) would own `operator`; keep the channel alive
    // for the lifetime of the process.
    let _operator = operator;

    let mut beat: u32 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
        beat += 1;
        if beat % 200 == 0 {
            let stats = state.get_stats();
            debug!(
                "uptime {:.0}s fps {:.1} tx {} rx {} errors {}",
                stats.uptime.as_secs_f32(),
                stats.fps,
                stats.uart_tx_count,
                stats.uart_rx_count,
                stats.errors.len()
            );
        }
    }

    // Park the hardware before the workers go away: publish the safe record,
    // force a full resend of every message kind, and give the serial worker
    // a couple of transmit cycles to drain it. The default 150 ms pause
    // covers two cycles at the 30 Hz transmit rate.
    info!("Shutting down: flushing safe state to the MCU");
    state.put_command(CommandRecord::safe());
    flush.force_send_all();
    thread::sleep(Duration::from_millis(args.flag_reset_safe_ms));
    stop.store(true, Ordering::SeqCst);

    if let Some(handle) = vision_handle {
        if handle.join().is_err() {
            warn!("Vision thread panicked during shutdown");
        }
    }
    if machine_handle.join().is_err() {
        warn!("State machine thread panicked during shutdown");
    }
    if uart_handle.join().is_err() {
        warn!("UART thread panicked during shutdown");
    }

    info!("Shutdown complete");
    Ok(())
}
