//! Bidirectional serial worker.
//!
//! Owns the serial device. Drains inbound bytes through the framer into the
//! snapshot store, transmits the command record on a fixed cadence (servo
//! heartbeat every period, everything else only when it changed), and
//! reconnects after I/O faults.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serialport::{SerialPort, SerialPortType};

use crate::comm::mock::MockLink;
use crate::comm::protocol::{CommandRecord, Framer};
use crate::config::Config;
use crate::state::AppState;

/// Description keywords of the USB-UART bridges the MCU boards show up as.
const USB_UART_KEYWORDS: &[&str] = &[
    "CP210", "CH340", "CH341", "FTDI", "USB SERIAL", "USB-SERIAL", "ESP32", "USB JTAG",
];

/// Byte-level transport, real port or simulator.
pub trait SerialLink: Send {
    fn bytes_to_read(&mut self) -> anyhow::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

struct HardwareLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for HardwareLink {
    fn bytes_to_read(&mut self) -> anyhow::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> anyhow::Result<()> {
        use std::io::Write;
        self.port.write_all(data)?;
        Ok(())
    }
}

/// Pick a likely MCU port: first match on the USB-UART keyword list, then
/// any COM / ttyUSB / ttyACM device.
fn autodetect_port() -> Option<String> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Serial port enumeration failed: {e}");
            return None;
        }
    };

    for port in &ports {
        let usb_text = match &port.port_type {
            SerialPortType::UsbPort(info) => format!(
                "{} {}",
                info.product.as_deref().unwrap_or(""),
                info.manufacturer.as_deref().unwrap_or("")
            ),
            _ => String::new(),
        };
        let haystack = format!("{} {}", port.port_name, usb_text).to_uppercase();
        if USB_UART_KEYWORDS.iter().any(|k| haystack.contains(k)) {
            info!("Auto-detected serial port: {} ({usb_text})", port.port_name);
            return Some(port.port_name.clone());
        }
    }

    for port in &ports {
        let name = &port.port_name;
        if name.starts_with("COM") || name.contains("ttyUSB") || name.contains("ttyACM") {
            info!("Using first available serial port: {name}");
            return Some(name.clone());
        }
    }

    warn!("No serial ports detected");
    None
}

fn open_hardware(config: &Config) -> anyhow::Result<Box<dyn SerialLink>> {
    let port_name = match &config.serial.port {
        Some(name) => name.clone(),
        None => autodetect_port()
            .ok_or_else(|| anyhow::anyhow!("no serial port configured or detected"))?,
    };

    info!("Opening serial port {port_name} at {} baud", config.serial.baud);
    let mut port = serialport::new(&port_name, config.serial.baud)
        .timeout(config.serial.io_timeout())
        .open()?;
    // Keep DTR/RTS low so opening the port doesn't reset the MCU.
    port.write_data_terminal_ready(false)?;
    port.write_request_to_send(false)?;
    Ok(Box::new(HardwareLink { port }))
}

fn log_open_hints() {
    if cfg!(windows) {
        info!("Tip: check Device Manager for the right COM port");
    } else {
        info!("Tip: the user needs serial access, e.g. usermod -a -G dialout $USER");
    }
}

/// Initial connect: up to `max_connect_attempts` tries with exponential
/// backoff (1.0 s, x1.5, capped at 5.0 s).
fn connect_with_retry(
    config: &Config,
    state: &AppState,
    stop: &AtomicBool,
) -> Option<Box<dyn SerialLink>> {
    if config.serial.mock {
        info!("Using mock UART (no hardware)");
        return Some(Box::new(MockLink::new()));
    }

    let mut delay = Duration::from_secs_f32(1.0);
    for attempt in 1..=config.serial.max_connect_attempts {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        match open_hardware(config) {
            Ok(link) => return Some(link),
            Err(e) => {
                error!(
                    "Serial connect attempt {attempt}/{} failed: {e}",
                    config.serial.max_connect_attempts
                );
                state.add_error(&format!("UART open failed: {e}"));
                log_open_hints();
                sleep_while_running(stop, delay);
                delay = Duration::from_secs_f32((delay.as_secs_f32() * 1.5).min(5.0));
            }
        }
    }
    None
}

fn sleep_while_running(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
}

/// Last line sent per change-triggered message kind. `None` forces a send.
#[derive(Default)]
struct TxCache {
    lgt: Option<String>,
    rgb: Option<String>,
    mtx: Option<String>,
    npm: Option<String>,
    npr: Option<String>,
    flg: Option<String>,
    vlv: Option<String>,
    est: Option<String>,
}

impl TxCache {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

fn send_line(
    link: &mut dyn SerialLink,
    state: &AppState,
    line: &str,
) -> anyhow::Result<()> {
    link.write_all(line.as_bytes())?;
    state.bump_tx(line);
    Ok(())
}

fn send_if_changed(
    link: &mut dyn SerialLink,
    state: &AppState,
    slot: &mut Option<String>,
    line: String,
) -> anyhow::Result<()> {
    if slot.as_deref() != Some(line.as_str()) {
        send_line(link, state, &line)?;
        *slot = Some(line);
    }
    Ok(())
}

/// One transmit pass over a single snapshot of the command record.
fn transmit(
    link: &mut dyn SerialLink,
    state: &AppState,
    cache: &mut TxCache,
) -> anyhow::Result<()> {
    let cmd: CommandRecord = state.get_command();

    // Heartbeat: the MCU treats the servo line as the liveness signal.
    send_line(link, state, &cmd.encode_srv())?;

    send_if_changed(link, state, &mut cache.lgt, cmd.encode_lgt())?;
    send_if_changed(link, state, &mut cache.rgb, cmd.encode_rgb())?;
    send_if_changed(link, state, &mut cache.mtx, cmd.encode_mtx())?;
    send_if_changed(link, state, &mut cache.npm, cmd.encode_npm())?;
    send_if_changed(link, state, &mut cache.npr, cmd.encode_npr())?;
    send_if_changed(link, state, &mut cache.vlv, cmd.encode_vlv())?;
    send_if_changed(link, state, &mut cache.est, cmd.encode_est())?;
    send_if_changed(link, state, &mut cache.flg, cmd.encode_flg())?;
    Ok(())
}

/// Handle for the shutdown flush: invalidates the change-detection cache so
/// the next transmit pass resends every message kind.
#[derive(Clone)]
pub struct UartFlush {
    force: Arc<AtomicBool>,
}

impl UartFlush {
    pub fn force_send_all(&self) {
        self.force.store(true, Ordering::SeqCst);
    }
}

pub fn spawn(
    state: Arc<AppState>,
    config: Arc<Config>,
    stop: Arc<AtomicBool>,
) -> (thread::JoinHandle<()>, UartFlush) {
    let force = Arc::new(AtomicBool::new(false));
    let flush = UartFlush {
        force: force.clone(),
    };
    let handle = thread::spawn(move || run(state, config, stop, force));
    (handle, flush)
}

fn run(state: Arc<AppState>, config: Arc<Config>, stop: Arc<AtomicBool>, force: Arc<AtomicBool>) {
    let mode = if config.serial.mock { "MOCK" } else { "HARDWARE" };
    info!("UART thread starting ({mode} mode)");

    let Some(mut link) = connect_with_retry(&config, &state, &stop) else {
        error!("Failed to connect to UART, thread exiting");
        state.add_error("UART connection failed - check port settings");
        return;
    };
    info!("UART connected");

    let mut framer = Framer::new();
    let mut cache = TxCache::default();
    let tx_interval = config.serial.tx_interval();
    let mut last_tx = Instant::now() - tx_interval;
    let mut buf = [0u8; 256];

    while !stop.load(Ordering::Relaxed) {
        if force.swap(false, Ordering::SeqCst) {
            cache.clear();
        }

        let result: anyhow::Result<()> = (|| {
            if link.bytes_to_read()? > 0 {
                let n = link.read(&mut buf)?;
                if n > 0 {
                    for record in framer.feed(&buf[..n]) {
                        state.put_telemetry(&record);
                    }
                }
            }
            if last_tx.elapsed() >= tx_interval {
                last_tx = Instant::now();
                transmit(link.as_mut(), &state, &mut cache)?;
            }
            Ok(())
        })();

        state.check_connection(config.serial.connection_timeout());

        if let Err(e) = result {
            error!("UART error: {e}");
            state.add_error(&format!("UART error: {e}"));
            if !config.serial.mock {
                // Drop the handle, pause, then keep trying to come back.
                link = loop {
                    sleep_while_running(&stop, Duration::from_secs(1));
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    match open_hardware(&config) {
                        Ok(new_link) => break new_link,
                        Err(e) => {
                            error!("UART reconnection failed: {e}");
                            sleep_while_running(&stop, Duration::from_secs(4));
                        }
                    }
                };
                framer.reset();
                cache.clear();
                info!("UART reconnected");
            }
        }

        thread::sleep(Duration::from_millis(1));
    }

    info!("UART thread stopped");
}
