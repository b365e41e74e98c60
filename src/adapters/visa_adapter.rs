//! VISA transport for the source-measure unit (USB/GPIB/Ethernet).
//!
//! Implements [`ScpiTransport`] over the `visa-rs` crate. Blocking VISA I/O
//! runs on Tokio's blocking pool so the orchestrator's runtime is never
//! stalled by a slow instrument.
//!
//! Supports resource strings like:
//! - "USB0::0x05E6::0x2450::04387860::INSTR" (Keithley 2450 over USB)
//! - "GPIB0::18::INSTR" (GPIB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use crate::instrument::capabilities::ScpiTransport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// VISA transport for SCPI instruments.
pub struct VisaAdapter {
    /// VISA resource string (e.g., "USB0::0x05E6::0x2450::04387860::INSTR")
    pub(crate) resource_string: String,

    /// Open/read timeout
    pub(crate) timeout: Duration,

    /// Line terminator for commands (typically "\n" for SCPI)
    pub(crate) line_terminator: String,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<visa_rs::Instrument>>>,
}

impl VisaAdapter {
    pub fn new(resource_string: String) -> Self {
        Self {
            resource_string,
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Set the open/read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    pub fn line_terminator(&self) -> &str {
        &self.line_terminator
    }

    #[cfg(feature = "instrument_visa")]
    fn session(&self) -> Result<Arc<Mutex<visa_rs::Instrument>>> {
        self.instrument
            .clone()
            .ok_or_else(|| anyhow!("VISA instrument not connected"))
    }
}

#[cfg(feature = "instrument_visa")]
fn visa_error(err: visa_rs::Error) -> anyhow::Error {
    anyhow!("VISA error: {:?}", err)
}

#[async_trait]
impl ScpiTransport for VisaAdapter {
    async fn connect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource = self.resource_string.clone();
            let timeout = self.timeout;

            let instrument = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new().map_err(visa_error)?;
                let c_string = std::ffi::CString::new(resource.clone())
                    .context("Resource string contains a NUL byte")?;
                let visa_string = visa_rs::VisaString::from(c_string);
                let instr = rm
                    .open(&visa_string, AccessMode::NO_LOCK, timeout)
                    .map_err(visa_error)
                    .with_context(|| format!("Failed to open VISA resource: {}", resource))?;
                Ok::<visa_rs::Instrument, anyhow::Error>(instr)
            })
            .await
            .context("VISA open task panicked")??;

            self.instrument = Some(Arc::new(Mutex::new(instrument)));
            debug!(
                "VISA resource '{}' opened with {}ms timeout",
                self.resource_string,
                self.timeout.as_millis()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(anyhow!(
                "VISA support not enabled. Rebuild with --features instrument_visa"
            ))
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            // dropping the session closes it
            if self.instrument.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource_string);
            }
        }
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            use std::io::Write;

            let instrument = self.session()?;
            let command_str = format!("{}{}", command, self.line_terminator);
            let command_for_log = command.to_string();

            tokio::task::spawn_blocking(move || {
                let mut instr = instrument.blocking_lock();
                instr
                    .write_all(command_str.as_bytes())
                    .with_context(|| format!("VISA write failed for: {}", command_for_log))?;
                debug!("VISA write sent: {}", command_for_log);
                Ok(())
            })
            .await
            .context("VISA write task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(anyhow!(
                "VISA support not enabled. Rebuild with --features instrument_visa"
            ))
        }
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        #[cfg(feature = "instrument_visa")]
        {
            use std::io::{BufRead, BufReader, Write};

            let instrument = self.session()?;
            let command_str = format!("{}{}", command, self.line_terminator);
            let command_for_log = command.to_string();

            tokio::task::spawn_blocking(move || {
                let mut instr = instrument.blocking_lock();
                instr
                    .write_all(command_str.as_bytes())
                    .with_context(|| format!("VISA write failed for: {}", command_for_log))?;

                let mut response = String::new();
                BufReader::new(&*instr)
                    .read_line(&mut response)
                    .with_context(|| format!("VISA read failed for: {}", command_for_log))?;

                let response = response.trim().to_string();
                debug!("VISA query '{}' -> {} bytes", command_for_log, response.len());
                Ok(response)
            })
            .await
            .context("VISA query task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(anyhow!(
                "VISA support not enabled. Rebuild with --features instrument_visa"
            ))
        }
    }

    fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.instrument.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("USB0::0x05E6::0x2450::04387860::INSTR".to_string());
        assert!(!adapter.is_connected());
        assert_eq!(adapter.timeout, Duration::from_secs(5));
        assert_eq!(adapter.line_terminator(), "\n");
    }

    #[test]
    fn test_visa_adapter_builder() {
        let adapter = VisaAdapter::new("GPIB0::18::INSTR".to_string())
            .with_timeout(Duration::from_millis(2000))
            .with_line_terminator("\r\n".to_string());

        assert_eq!(adapter.timeout, Duration::from_millis(2000));
        assert_eq!(adapter.line_terminator(), "\r\n");
        let info = adapter.info();
        assert!(info.contains("GPIB0::18::INSTR"));
        assert!(info.contains("2000ms"));
    }

    #[tokio::test]
    async fn test_commands_fail_before_connect() {
        let mut adapter = VisaAdapter::new("TCPIP0::192.168.1.100::INSTR".to_string());
        assert!(adapter.write("*CLS").await.is_err());
        assert!(adapter.query("*IDN?").await.is_err());
        // closing a never-opened session is fine
        assert!(adapter.disconnect().await.is_ok());
    }
}
