//! RS-232 link used by the relay board.
//!
//! Wraps the `serialport` crate; blocking port I/O runs on Tokio's blocking
//! pool. The relay board takes bare command tokens with no terminator, so
//! writes are raw by default.

use anyhow::{anyhow, Result};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use anyhow::Context;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Serial adapter for RS-232 communication
#[derive(Clone)]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM7")
    port_name: String,

    baud_rate: u32,

    /// Internal port timeout
    timeout: Duration,

    /// Appended to every write (empty for the relay board)
    line_terminator: String,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM7")
    /// * `baud_rate` - Communication speed (e.g., 9600)
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_millis(100),
            line_terminator: String::new(),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// Read/write timeout applied when the port is opened.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn line_terminator(&self) -> &str {
        &self.line_terminator
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    pub async fn open(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(self.timeout)
                .open()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        self.port_name, self.baud_rate
                    )
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }

    /// Write `command` (plus the configured terminator) and flush.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| anyhow!("Serial port '{}' not open", self.port_name))?
                .clone();
            let bytes = format!("{}{}", command, self.line_terminator).into_bytes();
            let command_for_log = command.to_string();

            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard
                    .write_all(&bytes)
                    .context("Failed to write to serial port")?;
                port_guard.flush().context("Failed to flush serial port")?;

                debug!("Sent serial command: {:?}", command_for_log);
                Ok(())
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("COM7".to_string(), 9600);
        assert_eq!(adapter.port_name(), "COM7");
        assert_eq!(adapter.baud_rate(), 9600);
        assert!(!adapter.is_open());
        assert!(adapter.line_terminator().is_empty());
        assert_eq!(adapter.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_builder_overrides() {
        let adapter = SerialAdapter::new("COM7".to_string(), 9600)
            .with_timeout(Duration::from_millis(250))
            .with_line_terminator("\r".to_string());
        assert_eq!(adapter.timeout(), Duration::from_millis(250));
        assert_eq!(adapter.line_terminator(), "\r");
    }

    #[tokio::test]
    async fn test_send_requires_open_port() {
        let mut adapter = SerialAdapter::new("/dev/ttyUSB0".to_string(), 9600);
        assert!(adapter.send("r").await.is_err());
        assert!(adapter.close().await.is_ok());
    }
}
