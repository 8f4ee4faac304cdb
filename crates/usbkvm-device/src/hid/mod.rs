//! The CH9329 serial engine.
//!
//! One controller owns one serial port.  On [`HidController::connect`] it
//! spawns two worker threads:
//!
//! - the **writer** drains a bounded queue (capacity 32) and writes each
//!   packet atomically to the port;
//! - the **reader** polls the port and pushes whatever chunks arrive into
//!   a bounded ingress queue (capacity 1024).
//!
//! Serial I/O through the `serialport` crate is blocking, so the workers
//! are plain OS threads bridged to the async world with `tokio::sync::mpsc`
//! channels — the classic producer/consumer pair, with the queue bounds
//! doubling as back-pressure against a wedged chip.
//!
//! The protocol is request/reply with a single outstanding command.
//! [`HidController::send_and_expect`] holds the controller lock for the
//! full round trip, which is what gives HID commands their FIFO ordering
//! guarantee within an instance.

pub mod translate;

use std::io::{Read as _, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use usbkvm_core::protocol::codec::{self, CMD_GET_PARA_CFG, CMD_SET_PARA_CFG, OP_QUEUE_RESET};
use usbkvm_core::state::{wire_mask_for_button, HidState};
use usbkvm_core::ReplyAccumulator;

use crate::error::DeviceError;

/// How long `send` waits for space in the write queue.
const SEND_TIMEOUT: Duration = Duration::from_millis(30);
/// How long `wait_for_reply` waits for a complete, valid frame.
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
/// Reader poll interval; also bounds how quickly workers notice `close`.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Write queue depth.  Observed adequate at HID data rates; bounds memory
/// if the chip stops draining.
const WRITE_QUEUE_DEPTH: usize = 32;
/// Ingress queue depth in read chunks.
const INGRESS_QUEUE_DEPTH: usize = 1024;

/// Serial and input tuning for one HID bridge chip.
#[derive(Debug, Clone)]
pub struct HidConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port_name: String,
    /// UART baud rate; the chip ships at 115200-8-N-1.
    pub baud_rate: u32,
    /// Wheel step per scroll event, range 0x00..=0x7E.
    pub scroll_sensitivity: u8,
}

impl HidConfig {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: 115_200,
            scroll_sensitivity: 0x01,
        }
    }
}

/// Channel ends owned by a connected controller.
#[derive(Debug)]
struct LinkIo {
    write_tx: mpsc::Sender<Vec<u8>>,
    ingress_rx: mpsc::Receiver<Vec<u8>>,
    acc: ReplyAccumulator,
}

/// Everything that mutates together under the controller lock.
#[derive(Debug)]
struct Link {
    state: HidState,
    last_cursor_event_ms: u64,
    io: Option<LinkIo>,
}

/// Controller for one CH9329 HID bridge chip.
#[derive(Debug)]
pub struct HidController {
    config: HidConfig,
    running: Arc<AtomicBool>,
    link: Mutex<Link>,
}

impl HidController {
    pub fn new(config: HidConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            link: Mutex::new(Link {
                state: HidState::new(),
                last_cursor_event_ms: 0,
                io: None,
            }),
        }
    }

    /// Whether both workers are believed alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Snapshot of the current HID state, for diagnostics and tests.
    pub async fn state(&self) -> HidState {
        self.link.lock().await.state.clone()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Opens the serial port, starts the worker pair, and transmits the
    /// one-byte operation-queue reset to the chip.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let mut link = self.link.lock().await;
        if link.io.is_some() && self.is_running() {
            return Err(DeviceError::AlreadyRunning);
        }

        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_POLL_TIMEOUT)
            .open()?;
        let write_port = port.try_clone()?;

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let (ingress_tx, ingress_rx) = mpsc::channel::<Vec<u8>>(INGRESS_QUEUE_DEPTH);

        self.running.store(true, Ordering::Relaxed);
        spawn_reader(port, ingress_tx, Arc::clone(&self.running), &self.config.port_name);
        spawn_writer(write_port, write_rx, Arc::clone(&self.running), &self.config.port_name);

        let io = LinkIo {
            write_tx,
            ingress_rx,
            acc: ReplyAccumulator::new(),
        };

        // Clear the chip's operation queue so leftover state from a
        // previous host session cannot replay.
        if let Err(e) = enqueue(&io, &self.running, vec![OP_QUEUE_RESET]).await {
            self.running.store(false, Ordering::Relaxed);
            return Err(e);
        }
        link.io = Some(io);

        info!(port = %self.config.port_name, "HID bridge connected");
        Ok(())
    }

    /// Stops the workers and releases the port.
    ///
    /// The writer exits as soon as its queue closes; the reader notices
    /// the cleared running flag at its next poll tick.
    pub async fn close(&self) {
        self.running.store(false, Ordering::Relaxed);
        let mut link = self.link.lock().await;
        link.io = None;
        link.state = HidState::new();
        debug!(port = %self.config.port_name, "HID bridge closed");
    }

    // ── Raw protocol plumbing ─────────────────────────────────────────────────

    /// Non-blocking enqueue of a raw packet onto the write queue.
    pub async fn send(&self, packet: Vec<u8>) -> Result<(), DeviceError> {
        let link = self.link.lock().await;
        let io = link.io.as_ref().ok_or(DeviceError::NotRunning)?;
        enqueue(io, &self.running, packet).await
    }

    /// Sends `packet` and waits for the reply to command `cmd`.
    ///
    /// Holds the controller lock for the full exchange: the wire protocol
    /// is single-outstanding, so concurrent submitters queue here and
    /// their commands hit the chip strictly in acquisition order.
    pub async fn send_and_expect(&self, packet: Vec<u8>, cmd: u8) -> Result<Vec<u8>, DeviceError> {
        let mut link = self.link.lock().await;
        let io = link.io.as_mut().ok_or(DeviceError::NotRunning)?;
        // Drop any straggler bytes from a previous timed-out exchange so
        // they cannot be matched against this command.
        io.acc.clear();
        enqueue(io, &self.running, packet).await?;
        wait_for_reply(io, cmd).await
    }

    // ── Keyboard operations ───────────────────────────────────────────────────

    /// Handles a key-down for a browser keycode.
    ///
    /// Modifier keys (Shift/Ctrl/Alt/Meta) set their side-specific bit;
    /// Enter with the right-modifier flag becomes Numpad-Enter; everything
    /// else is translated to a HID usage and placed in a free slot.
    /// Returns the bytes put on the wire (empty for a silent no-op).
    pub async fn key_press(&self, keycode: u8, is_right: bool) -> Result<Vec<u8>, DeviceError> {
        let mut link = self.link.lock().await;
        if let Some(bit) = usbkvm_core::keymap::modifier_bit(keycode, is_right) {
            link.state.set_modifier(bit);
            return self.flush_keyboard(&mut link).await;
        }
        let keycode = remap_numpad_enter(keycode, is_right);
        let usage = usbkvm_core::keymap::usage_for_browser_keycode(keycode);
        if usage == 0x00 {
            return Err(DeviceError::UnsupportedKey(keycode));
        }
        if !link.state.press_usage(usage)? {
            // Key already held: auto-repeat from the browser, not an error.
            return Ok(Vec::new());
        }
        self.flush_keyboard(&mut link).await
    }

    /// Handles a key-up; the mirror of [`Self::key_press`].
    pub async fn key_release(&self, keycode: u8, is_right: bool) -> Result<Vec<u8>, DeviceError> {
        let mut link = self.link.lock().await;
        if let Some(bit) = usbkvm_core::keymap::modifier_bit(keycode, is_right) {
            link.state.clear_modifier(bit);
            return self.flush_keyboard(&mut link).await;
        }
        let keycode = remap_numpad_enter(keycode, is_right);
        let usage = usbkvm_core::keymap::usage_for_browser_keycode(keycode);
        if usage == 0x00 {
            return Err(DeviceError::UnsupportedKey(keycode));
        }
        if !link.state.release_usage(usage) {
            return Ok(Vec::new());
        }
        self.flush_keyboard(&mut link).await
    }

    /// Emits the keyboard report for the current state.
    async fn flush_keyboard(&self, link: &mut Link) -> Result<Vec<u8>, DeviceError> {
        let packet =
            codec::keyboard_report(link.state.modkey, &link.state.keyboard_buttons).to_vec();
        let io = link.io.as_mut().ok_or(DeviceError::NotRunning)?;
        io.acc.clear();
        enqueue(io, &self.running, packet.clone()).await?;
        wait_for_reply(io, codec::CMD_KEYBOARD).await?;
        Ok(packet)
    }

    // ── Mouse operations ──────────────────────────────────────────────────────

    /// Absolute move to 16-bit device coordinates.
    pub async fn move_absolute(&self, x: u16, y: u16) -> Result<Vec<u8>, DeviceError> {
        let mut link = self.link.lock().await;
        let packet = codec::mouse_absolute(link.state.mouse_buttons, x, y).to_vec();
        let io = link.io.as_mut().ok_or(DeviceError::NotRunning)?;
        io.acc.clear();
        enqueue(io, &self.running, packet.clone()).await?;
        wait_for_reply(io, codec::CMD_MOUSE_ABS).await?;
        Ok(packet)
    }

    /// Relative move; also carries button state and the wheel byte.
    pub async fn move_relative(&self, dx: u8, dy: u8, wheel: u8) -> Result<Vec<u8>, DeviceError> {
        let mut link = self.link.lock().await;
        self.emit_relative(&mut link, dx, dy, wheel).await
    }

    async fn emit_relative(
        &self,
        link: &mut Link,
        dx: u8,
        dy: u8,
        wheel: u8,
    ) -> Result<Vec<u8>, DeviceError> {
        let packet = codec::mouse_relative(link.state.mouse_buttons, dx, dy, wheel).to_vec();
        let io = link.io.as_mut().ok_or(DeviceError::NotRunning)?;
        io.acc.clear();
        enqueue(io, &self.running, packet.clone()).await?;
        wait_for_reply(io, codec::CMD_MOUSE_REL).await?;
        Ok(packet)
    }

    /// Presses mouse button 1/2/3 and flushes the state with a zero-delta
    /// relative move.
    pub async fn button_press(&self, button: u8) -> Result<Vec<u8>, DeviceError> {
        let mask =
            wire_mask_for_button(button).ok_or(DeviceError::InvalidButton(button as i64))?;
        let mut link = self.link.lock().await;
        link.state.press_mouse_button(mask);
        self.emit_relative(&mut link, 0, 0, 0).await
    }

    /// Releases mouse button 1/2/3, or all buttons for 0.
    pub async fn button_release(&self, button: u8) -> Result<Vec<u8>, DeviceError> {
        let mask = if button == 0 {
            0
        } else {
            wire_mask_for_button(button).ok_or(DeviceError::InvalidButton(button as i64))?
        };
        let mut link = self.link.lock().await;
        link.state.release_mouse_button(mask);
        self.emit_relative(&mut link, 0, 0, 0).await
    }

    /// Scrolls by `tilt`.  Zero tilt is a no-op; otherwise the wheel byte
    /// encodes direction and the configured sensitivity.
    pub async fn scroll(&self, tilt: i32) -> Result<Vec<u8>, DeviceError> {
        let Some(wheel) = codec::scroll_byte(tilt, self.config.scroll_sensitivity) else {
            return Ok(Vec::new());
        };
        let mut link = self.link.lock().await;
        self.emit_relative(&mut link, 0, 0, wheel).await
    }

    // ── Chip configuration (boot-time tooling) ────────────────────────────────

    /// Reads the chip's 50-byte parameter block (GET_PARA_CFG).
    pub async fn current_config(&self) -> Result<[u8; 50], DeviceError> {
        let reply = self
            .send_and_expect(codec::get_config_request().to_vec(), CMD_GET_PARA_CFG)
            .await?;
        if reply.len() < 50 {
            return Err(DeviceError::Framing(format!(
                "parameter block reply too short: {} bytes",
                reply.len()
            )));
        }
        let mut cfg = [0u8; 50];
        cfg.copy_from_slice(&reply[..50]);
        Ok(cfg)
    }

    /// Rewrites the chip's stored baud rate.
    ///
    /// Reads the parameter block, substitutes the four big-endian baud
    /// bytes, and writes it back with SET_PARA_CFG.  The chip applies the
    /// change on its next power cycle — a device property, so the caller
    /// is told to replug rather than this function pretending otherwise.
    pub async fn configure_baudrate(&self, new_baud: u32) -> Result<(), DeviceError> {
        let cfg = self.current_config().await?;
        let packet = codec::set_config_with_baud(&cfg, new_baud);
        // SET_PARA_CFG and its reply share code 0x09 on the CH9329; the
        // success reply therefore arrives as 0x89 like any other command.
        self.send_and_expect(packet, CMD_SET_PARA_CFG).await?;
        info!(baud = new_baud, "chip baud rate updated; replug to apply");
        Ok(())
    }

    // ── Cursor-event bookkeeping (used by the event dispatcher) ───────────────

    async fn cursor_interval_elapsed(&self, min_interval_ms: u64) -> bool {
        let mut link = self.link.lock().await;
        let now = now_ms();
        if now.saturating_sub(link.last_cursor_event_ms) < min_interval_ms {
            return false;
        }
        link.last_cursor_event_ms = now;
        true
    }

    async fn touch_cursor_timestamp(&self) {
        let mut link = self.link.lock().await;
        link.last_cursor_event_ms = now_ms();
    }

    async fn sync_buttons_from_move(&self, move_bits: u8) {
        let mut link = self.link.lock().await;
        link.state.sync_buttons_from_move(move_bits);
    }
}

/// Enter + right-modifier is the numpad variant, which the browser cannot
/// express with a distinct keycode of its own.
fn remap_numpad_enter(keycode: u8, is_right: bool) -> u8 {
    if keycode == usbkvm_core::keymap::BROWSER_ENTER && is_right {
        usbkvm_core::keymap::BROWSER_NUMPAD_ENTER
    } else {
        keycode
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Queue plumbing ────────────────────────────────────────────────────────────

async fn enqueue(
    io: &LinkIo,
    running: &AtomicBool,
    packet: Vec<u8>,
) -> Result<(), DeviceError> {
    if !running.load(Ordering::Relaxed) {
        return Err(DeviceError::NotRunning);
    }
    io.write_tx
        .send_timeout(packet, SEND_TIMEOUT)
        .await
        .map_err(|err| match err {
            mpsc::error::SendTimeoutError::Timeout(_) => DeviceError::WriteTimeout,
            mpsc::error::SendTimeoutError::Closed(_) => DeviceError::NotRunning,
        })
}

async fn wait_for_reply(io: &mut LinkIo, cmd: u8) -> Result<Vec<u8>, DeviceError> {
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    loop {
        if let Some(payload) = io.acc.try_decode(cmd)? {
            return Ok(payload);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(DeviceError::ReplyTimeout);
        }
        match tokio::time::timeout(remaining, io.ingress_rx.recv()).await {
            Ok(Some(chunk)) => io.acc.extend(&chunk),
            Ok(None) => return Err(DeviceError::NotRunning),
            Err(_) => return Err(DeviceError::ReplyTimeout),
        }
    }
}

// ── Worker threads ────────────────────────────────────────────────────────────

fn spawn_reader(
    mut port: Box<dyn serialport::SerialPort>,
    ingress_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    port_name: &str,
) {
    let port_name = port_name.to_owned();
    std::thread::Builder::new()
        .name(format!("hid-read {port_name}"))
        .spawn(move || {
            let mut buf = [0u8; 1024];
            while running.load(Ordering::Relaxed) {
                match port.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        if ingress_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            // Controller closed; nothing left to feed.
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Poll tick; re-check the running flag.
                    }
                    Err(e) => {
                        warn!(port = %port_name, error = %e, "serial read failed; reader exiting");
                        running.store(false, Ordering::Relaxed);
                        break;
                    }
                }
            }
        })
        .ok();
}

fn spawn_writer(
    mut port: Box<dyn serialport::SerialPort>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
    port_name: &str,
) {
    let port_name = port_name.to_owned();
    std::thread::Builder::new()
        .name(format!("hid-write {port_name}"))
        .spawn(move || {
            while let Some(packet) = write_rx.blocking_recv() {
                if let Err(e) = port.write_all(&packet).and_then(|_| port.flush()) {
                    warn!(port = %port_name, error = %e, "serial write failed; writer exiting");
                    running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        })
        .ok();
}

// ── Tests ─────────────────────────────────────────────────────────────────────
