//! Sweep session on a Keithley 2450-class source-measure unit.
//!
//! [`InstrumentSession`] owns the SCPI transport and knows the command
//! sequence for a linear voltage sweep with current readback. Transport
//! errors (`anyhow`) are mapped into [`DaqError`] here so callers only see the
//! application error vocabulary.

use crate::error::{AppResult, DaqError};
use crate::measurement::{RawTrace, SweepConfig};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::capabilities::ScpiTransport;

/// Bit 0 of the standard event status register.
const OPERATION_COMPLETE: u32 = 1;

pub struct InstrumentSession {
    transport: Box<dyn ScpiTransport>,
    sweep_timeout: Duration,
    poll_interval: Duration,
}

impl InstrumentSession {
    pub fn new(transport: Box<dyn ScpiTransport>) -> Self {
        Self {
            transport,
            sweep_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_sweep_timeout(mut self, timeout: Duration) -> Self {
        self.sweep_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn sweep_timeout(&self) -> Duration {
        self.sweep_timeout
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn info(&self) -> String {
        self.transport.info()
    }

    pub async fn open(&mut self) -> AppResult<()> {
        self.transport
            .connect()
            .await
            .map_err(|e| DaqError::Connection(format!("{}: {:#}", self.transport.info(), e)))?;
        info!(resource = %self.transport.info(), "Instrument session opened");
        Ok(())
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.transport
            .disconnect()
            .await
            .map_err(|e| DaqError::Connection(format!("{:#}", e)))?;
        debug!(resource = %self.transport.info(), "Instrument session closed");
        Ok(())
    }

    /// Program the device for `config`. Nothing is sourced until
    /// [`run_and_fetch`](Self::run_and_fetch).
    pub async fn configure(&mut self, config: &SweepConfig) -> AppResult<()> {
        self.ensure_open()?;
        let commands = [
            "*RST".to_string(),
            "*CLS".to_string(),
            "SENS:FUNC \"CURR\"".to_string(),
            "SENS:CURR:RANG:AUTO ON".to_string(),
            "SENS:CURR:RSEN OFF".to_string(),
            "SOUR:FUNC VOLT".to_string(),
            format!("SOUR:VOLT:RANG {}", config.voltage_range_volts),
            format!("SOUR:VOLT:ILIM {}", config.current_limit_amps),
            format!(
                "SOUR:SWE:VOLT:LIN {}, {}, {}, {}",
                config.start_voltage,
                config.stop_voltage,
                config.step_count,
                config.step_delay_secs
            ),
        ];
        for command in &commands {
            self.write(command).await?;
        }
        self.check_error_queue().await?;
        debug!(
            start = config.start_voltage,
            stop = config.stop_voltage,
            steps = config.step_count,
            "Sweep configured"
        );
        Ok(())
    }

    /// Trigger the programmed sweep, wait for completion and read the trace.
    pub async fn run_and_fetch(&mut self, config: &SweepConfig) -> AppResult<RawTrace> {
        self.ensure_open()?;
        self.write(":INIT").await?;
        self.write("*OPC").await?;
        self.wait_for_completion().await?;

        let raw = self
            .query(&format!(
                "TRAC:DATA? 1, {}, \"defbuffer1\", SOUR, READ",
                config.step_count
            ))
            .await?;
        let values = parse_readings(&raw)?;
        if values.len() != config.expected_readings() {
            return Err(DaqError::Instrument(format!(
                "expected {} readings for {} steps, got {}",
                config.expected_readings(),
                config.step_count,
                values.len()
            )));
        }
        RawTrace::from_interleaved(&values)
    }

    /// Return the device to a known state after a failed command.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        self.write("*RST").await?;
        self.write("*CLS").await?;
        warn!(resource = %self.transport.info(), "Instrument reset");
        Ok(())
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(DaqError::Instrument("session is not open".to_string()))
        }
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.transport
            .write(command)
            .await
            .map_err(|e| DaqError::Instrument(format!("'{}' failed: {:#}", command, e)))
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.transport
            .query(command)
            .await
            .map_err(|e| DaqError::Instrument(format!("'{}' failed: {:#}", command, e)))
    }

    async fn check_error_queue(&mut self) -> AppResult<()> {
        let response = self.query("SYST:ERR?").await?;
        let code = response
            .split(',')
            .next()
            .map(str::trim)
            .and_then(|c| c.parse::<i32>().ok())
            .ok_or_else(|| {
                DaqError::Instrument(format!("unreadable error queue entry: {}", response))
            })?;
        if code == 0 {
            Ok(())
        } else {
            Err(DaqError::Instrument(format!(
                "device rejected the sweep configuration: {}",
                response
            )))
        }
    }

    async fn wait_for_completion(&mut self) -> AppResult<()> {
        let deadline = Instant::now() + self.sweep_timeout;
        loop {
            let response = self.query("*ESR?").await?;
            let register = response.trim().parse::<u32>().map_err(|_| {
                DaqError::Instrument(format!("unreadable event status register: {}", response))
            })?;
            if register & OPERATION_COMPLETE != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaqError::InstrumentTimeout(self.sweep_timeout));
            }
            sleep(self.poll_interval).await;
        }
    }
}

/// Parse a comma-separated numeric readout. Unparsable or non-finite values
/// mean the transfer was garbled.
fn parse_readings(raw: &str) -> AppResult<Vec<f64>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .enumerate()
        .map(|(index, field)| {
            field
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    DaqError::Instrument(format!(
                        "reading {} is not a finite number: '{}'",
                        index,
                        field.trim()
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSmu;

    fn sweep(steps: u32) -> SweepConfig {
        SweepConfig {
            step_count: steps,
            step_delay_secs: 0.0,
            ..SweepConfig::default()
        }
    }

    async fn open_session(smu: &MockSmu) -> InstrumentSession {
        let mut session = InstrumentSession::new(Box::new(smu.clone()))
            .with_sweep_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(5));
        session.open().await.unwrap();
        session
    }

    #[tokio::test]
    async fn configure_sends_the_sweep_program() {
        let smu = MockSmu::new().with_time_scale(0.0);
        let mut session = open_session(&smu).await;
        let config = SweepConfig {
            start_voltage: -0.2,
            stop_voltage: 0.8,
            step_count: 11,
            step_delay_secs: 0.05,
            current_limit_amps: 0.1,
            voltage_range_volts: 2.0,
        };
        session.configure(&config).await.unwrap();

        let log = smu.call_log();
        assert_eq!(log[1], "*RST");
        assert_eq!(log[2], "*CLS");
        assert!(log.contains(&"SENS:FUNC \"CURR\"".to_string()));
        assert!(log.contains(&"SOUR:VOLT:RANG 2".to_string()));
        assert!(log.contains(&"SOUR:VOLT:ILIM 0.1".to_string()));
        assert!(log.contains(&"SOUR:SWE:VOLT:LIN -0.2, 0.8, 11, 0.05".to_string()));
        assert_eq!(log.last().unwrap(), "SYST:ERR?");
    }

    #[tokio::test]
    async fn run_and_fetch_returns_one_point_per_step() {
        let smu = MockSmu::new().with_time_scale(0.0);
        let mut session = open_session(&smu).await;
        let config = sweep(5);
        session.configure(&config).await.unwrap();

        let trace = session.run_and_fetch(&config).await.unwrap();
        assert_eq!(trace.len(), 5);
        assert_eq!(trace.points()[0].voltage, 0.0);
        assert_eq!(trace.points()[4].voltage, 1.0);
        assert!(smu
            .call_log()
            .contains(&"TRAC:DATA? 1, 5, \"defbuffer1\", SOUR, READ".to_string()));
    }

    #[tokio::test]
    async fn truncated_readout_is_an_instrument_error() {
        let smu = MockSmu::new().with_time_scale(0.0);
        smu.drop_trace_points(1);
        let mut session = open_session(&smu).await;
        let config = sweep(5);
        session.configure(&config).await.unwrap();

        let err = session.run_and_fetch(&config).await.unwrap_err();
        assert!(matches!(err, DaqError::Instrument(ref msg) if msg.contains("expected 10")));
    }

    #[tokio::test]
    async fn rejected_configuration_surfaces_the_error_queue() {
        let smu = MockSmu::new();
        smu.reject_next_sweep();
        let mut session = open_session(&smu).await;

        let err = session.configure(&sweep(5)).await.unwrap_err();
        assert!(matches!(err, DaqError::Instrument(ref msg) if msg.contains("-222")));
    }

    #[tokio::test]
    async fn hung_sweep_times_out() {
        let smu = MockSmu::new().with_time_scale(0.0);
        smu.hang_sweeps(true);
        let mut session = open_session(&smu).await;
        let config = sweep(5);
        session.configure(&config).await.unwrap();

        let err = session.run_and_fetch(&config).await.unwrap_err();
        assert!(matches!(err, DaqError::InstrumentTimeout(t) if t == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn commands_fail_before_open() {
        let smu = MockSmu::new();
        let mut session = InstrumentSession::new(Box::new(smu));
        let err = session.configure(&sweep(5)).await.unwrap_err();
        assert!(matches!(err, DaqError::Instrument(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let smu = MockSmu::new();
        smu.refuse_connections(true);
        let mut session = InstrumentSession::new(Box::new(smu));
        assert!(matches!(
            session.open().await.unwrap_err(),
            DaqError::Connection(_)
        ));
    }

    #[test]
    fn garbled_readout_is_rejected() {
        assert!(parse_readings("1.0,abc").is_err());
        assert!(parse_readings("1.0,NaN").is_err());
        assert_eq!(parse_readings("").unwrap(), Vec::<f64>::new());
        assert_eq!(
            parse_readings("1.000000E+00, -2.5E-03").unwrap(),
            vec![1.0, -0.0025]
        );
    }
}
