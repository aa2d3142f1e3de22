//! ODrive ASCII protocol over a serial device.
//!
//! The device is opened as a serial port at the configured baud rate, 8N1
//! with no flow control.  Each request is a single newline-terminated
//! line.  Only `r` requests produce a reply line, which is awaited for at
//! most `reply_timeout`.

use std::time::Duration;

use async_trait::async_trait;
use shoppy_types::DriverError;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::motor::{AXES, MotorDriver, MotorSession};

/// `AXIS_STATE_CLOSED_LOOP_CONTROL` in the ODrive firmware.
const CLOSED_LOOP_STATE: u8 = 8;

/// Baud rate the ODrive UART ships with.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Opens [`OdriveSession`]s on a serial device.
#[derive(Debug, Clone)]
pub struct OdriveAsciiDriver {
    device: String,
    baud_rate: u32,
    reply_timeout: Duration,
}

impl OdriveAsciiDriver {
    pub fn new(device: impl Into<String>, baud_rate: u32, reply_timeout: Duration) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            reply_timeout,
        }
    }
}

#[async_trait]
impl MotorDriver for OdriveAsciiDriver {
    fn name(&self) -> String {
        format!("odrive:{}", self.device)
    }

    async fn connect(&self) -> Result<Box<dyn MotorSession>, DriverError> {
        let port = tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(self.reply_timeout)
            .open_native_async()
            .map_err(|e| DriverError::Connect(format!("{}: {e}", self.device)))?;
        info!(device = %self.device, baud = self.baud_rate, "serial link opened");
        Ok(Box::new(OdriveSession::new(port, self.reply_timeout)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

/// One ASCII-protocol link over any byte stream.
pub struct OdriveSession<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: WriteHalf<T>,
    reply_timeout: Duration,
}

impl<T: AsyncRead + AsyncWrite> OdriveSession<T> {
    pub fn new(stream: T, reply_timeout: Duration) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer,
            reply_timeout,
        }
    }

    async fn send(&mut self, line: &str) -> Result<(), DriverError> {
        debug!(line, "odrive >");
        self.writer.write_all(line.as_bytes()).await.map_err(io_err)?;
        self.writer.write_all(b"\n").await.map_err(io_err)?;
        self.writer.flush().await.map_err(io_err)
    }

    async fn query(&mut self, line: &str) -> Result<String, DriverError> {
        self.send(line).await?;
        let mut reply = String::new();
        match tokio::time::timeout(self.reply_timeout, self.reader.read_line(&mut reply)).await {
            Err(_) => Err(DriverError::Timeout(self.reply_timeout)),
            Ok(Err(e)) => Err(io_err(e)),
            Ok(Ok(0)) => Err(DriverError::Disconnected),
            Ok(Ok(_)) => {
                let reply = reply.trim().to_string();
                debug!(reply = %reply, "odrive <");
                Ok(reply)
            }
        }
    }
}

fn io_err(e: std::io::Error) -> DriverError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => DriverError::Disconnected,
        _ => DriverError::Io(e.to_string()),
    }
}

fn parse_error_code(reply: &str) -> Result<u32, DriverError> {
    reply
        .parse::<u32>()
        .map_err(|_| DriverError::Protocol(format!("expected an error code, got {reply:?}")))
}

#[async_trait]
impl<T> MotorSession for OdriveSession<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn set_watchdog_timeout(&mut self, axis: u8, timeout: Duration) -> Result<(), DriverError> {
        self.send(&format!("w axis{axis}.config.watchdog_timeout {:.3}", timeout.as_secs_f32()))
            .await?;
        self.send(&format!("w axis{axis}.config.enable_watchdog 1")).await
    }

    async fn feed_watchdog(&mut self, axis: u8) -> Result<(), DriverError> {
        self.send(&format!("u {axis}")).await
    }

    async fn set_closed_loop(&mut self, axis: u8) -> Result<(), DriverError> {
        self.send(&format!("w axis{axis}.requested_state {CLOSED_LOOP_STATE}")).await
    }

    async fn set_velocity(&mut self, axis: u8, velocity: f32) -> Result<(), DriverError> {
        self.send(&format!("v {axis} {velocity:.4} 0")).await
    }

    async fn read_fault_code(&mut self) -> Result<u32, DriverError> {
        let mut code = 0;
        for axis in AXES {
            let reply = self.query(&format!("r axis{axis}.error")).await?;
            code |= parse_error_code(&reply)?;
        }
        Ok(code)
    }

    async fn clear_errors(&mut self) -> Result<(), DriverError> {
        self.send("sc").await
    }

    async fn reboot(&mut self) -> Result<(), DriverError> {
        self.send("sr").await
    }
}
