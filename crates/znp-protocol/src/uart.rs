//! Serial transport for the MT protocol
//!
//! A blocking reader thread feeds the streaming frame decoder and forwards
//! parsed frames into the tokio runtime over a channel; a writer task owns
//! the outbound direction. There is exactly one writer.

use std::sync::Arc;
use std::time::Duration;

use serial2::SerialPort;
use tokio::sync::mpsc;

use crate::dispatcher::Znp;
use crate::frame::{FrameDecoder, GeneralFrame};
use crate::types::ProtocolError;

/// Default ZNP baud rate
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Delay between RTS toggle steps
const RTS_TOGGLE_DELAY: Duration = Duration::from_millis(150);

/// Byte written to force the serial bootloader to hand over to the
/// application image
const BOOTLOADER_SKIP_BYTE: u8 = 0xEF;

/// Number of skip bytes; the bootloader needs at least 167
const BOOTLOADER_SKIP_LEN: usize = 167;

/// Serial flow control selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial port configuration
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baudrate: u32,
    pub flow_control: FlowControl,
    /// Toggle RTS/DTR on connect; keeps the bootloader from taking over on
    /// some USB sticks
    pub rts_toggle: bool,
    /// Write the bootloader skip sequence before the first MT frame
    pub skip_bootloader: bool,
}

impl SerialConfig {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baudrate: DEFAULT_BAUDRATE,
            flow_control: FlowControl::None,
            rts_toggle: true,
            skip_bootloader: false,
        }
    }
}

/// Open the port and wire it to the dispatcher
pub(crate) async fn attach(
    config: &SerialConfig,
    znp: Arc<Znp>,
    write_rx: mpsc::Receiver<GeneralFrame>,
) -> Result<(), ProtocolError> {
    tracing::info!(path = %config.path, baudrate = config.baudrate, "opening serial port");

    let mut port = SerialPort::open(&config.path, move |mut settings: serial2::Settings| {
        settings.set_raw();
        settings.set_baud_rate(config.baudrate)?;
        settings.set_char_size(serial2::CharSize::Bits8);
        settings.set_stop_bits(serial2::StopBits::One);
        settings.set_parity(serial2::Parity::None);
        settings.set_flow_control(match config.flow_control {
            FlowControl::None => serial2::FlowControl::None,
            FlowControl::Software => serial2::FlowControl::XonXoff,
            FlowControl::Hardware => serial2::FlowControl::RtsCts,
        });
        Ok(settings)
    })?;

    // Short read timeout so the reader thread can notice shutdown
    port.set_read_timeout(Duration::from_millis(100))?;

    if config.rts_toggle {
        tracing::debug!("toggling RTS/DTR to keep the bootloader out of the way");
        port.set_dtr(false)?;
        port.set_rts(false)?;
        tokio::time::sleep(RTS_TOGGLE_DELAY).await;

        port.set_dtr(false)?;
        port.set_rts(true)?;
        tokio::time::sleep(RTS_TOGGLE_DELAY).await;

        port.set_dtr(false)?;
        port.set_rts(false)?;
        tokio::time::sleep(RTS_TOGGLE_DELAY).await;
    }

    if config.skip_bootloader {
        tracing::debug!("writing bootloader skip sequence");
        port.write_all(&[BOOTLOADER_SKIP_BYTE; BOOTLOADER_SKIP_LEN])?;
        port.flush()?;
    }

    let reader_port = port.try_clone()?;
    let (frame_tx, frame_rx) = mpsc::channel::<GeneralFrame>(64);

    tokio::spawn(writer_task(port, write_rx));
    std::thread::spawn(move || reader_thread(&reader_port, &frame_tx));
    tokio::spawn(frame_pump(frame_rx, znp));

    tracing::info!(path = %config.path, "serial transport attached");
    Ok(())
}

/// Serializes outbound frames onto the wire
async fn writer_task(port: SerialPort, mut write_rx: mpsc::Receiver<GeneralFrame>) {
    while let Some(frame) = write_rx.recv().await {
        let data = frame.encode_transport();
        tracing::trace!(bytes = ?data, "writing frame");

        if let Err(error) = port.write_all(&data).and_then(|()| port.flush()) {
            tracing::error!(%error, "serial write failed");
        }
    }
    tracing::debug!("writer task shutting down");
}

/// Blocking read loop; runs on a plain thread and reframes the byte stream
fn reader_thread(port: &SerialPort, frame_tx: &mpsc::Sender<GeneralFrame>) {
    let mut buffer = [0u8; 1024];
    let mut decoder = FrameDecoder::new();

    loop {
        match port.read(&mut buffer) {
            Ok(0) => {
                tracing::warn!("serial port closed");
                break;
            }
            Ok(n) => {
                tracing::trace!(bytes = ?&buffer[..n], "read");
                for frame in decoder.feed(&buffer[..n]) {
                    if frame_tx.blocking_send(frame).is_err() {
                        tracing::debug!("frame channel closed");
                        return;
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(error) => {
                tracing::error!(%error, "serial read failed");
                break;
            }
        }
    }
    tracing::debug!("reader thread shutting down");
}

/// Forwards parsed frames to the dispatcher, in arrival order
async fn frame_pump(mut frame_rx: mpsc::Receiver<GeneralFrame>, znp: Arc<Znp>) {
    while let Some(frame) = frame_rx.recv().await {
        znp.frame_received(&frame);
    }
    znp.connection_lost();
}
