//! The set of hardware a measurement runs against.
//!
//! A [`Station`] bundles the positioner, relay board, SMU session and result
//! sink. It is opened once, shared by every pixel of a run, and released on
//! abort or shutdown.

use crate::adapters::VisaAdapter;
use crate::config::{InstrumentBackend, PositionerBackend, RelayBackend, Settings};
use crate::data::storage::CsvReportSink;
use crate::error::{AppResult, DaqError};
use crate::hardware::mock::{MockPositioner, MockRelay, MockSmu};
use crate::instrument::{
    FixedProbe, InstrumentSession, PixelSelector, Positioner, RelayBoard, ResultSink,
    ScpiTransport,
};
use tracing::{info, warn};

pub struct Station {
    pub(crate) positioner: Box<dyn Positioner>,
    pub(crate) selector: Box<dyn PixelSelector>,
    pub(crate) instrument: InstrumentSession,
    pub(crate) sink: Box<dyn ResultSink>,
    open: bool,
}

impl Station {
    pub fn new(
        positioner: Box<dyn Positioner>,
        selector: Box<dyn PixelSelector>,
        instrument: InstrumentSession,
        sink: Box<dyn ResultSink>,
    ) -> Self {
        Self {
            positioner,
            selector,
            instrument,
            sink,
            open: false,
        }
    }

    /// Build the station described by `settings`. With `force_mock` every
    /// backend is replaced by its simulated counterpart.
    pub fn from_settings(settings: &Settings, force_mock: bool) -> Self {
        let transport: Box<dyn ScpiTransport> = match settings.instrument.backend {
            InstrumentBackend::Visa if !force_mock => Box::new(
                VisaAdapter::new(settings.instrument.resource.clone())
                    .with_timeout(settings.instrument.io_timeout)
                    .with_line_terminator(settings.instrument.line_terminator.clone()),
            ),
            _ => Box::new(MockSmu::new()),
        };
        let instrument = InstrumentSession::new(transport)
            .with_sweep_timeout(settings.instrument.sweep_timeout)
            .with_poll_interval(settings.instrument.poll_interval);

        let selector: Box<dyn PixelSelector> = match settings.relay.backend {
            RelayBackend::Serial if !force_mock => {
                Box::new(RelayBoard::from_config(&settings.relay))
            }
            _ => Box::new(MockRelay::new()),
        };

        let positioner: Box<dyn Positioner> = match settings.positioner.backend {
            PositionerBackend::Fixed => Box::new(FixedProbe::new()),
            PositionerBackend::Mock => Box::new(MockPositioner::new().with_motion(
                settings.positioner.speed_mm_per_sec,
                settings.positioner.move_settle,
                settings.positioner.home_settle,
            )),
        };

        Self::new(positioner, selector, instrument, Box::new(CsvReportSink::new()))
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Connect every device. On failure whatever was already opened is
    /// released again and `Connection` is returned.
    pub async fn open(&mut self) -> AppResult<()> {
        if self.open {
            return Ok(());
        }

        match self.positioner.connect().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(DaqError::Connection(
                    "positioner did not respond".to_string(),
                ))
            }
            Err(e) => return Err(DaqError::Connection(format!("positioner: {:#}", e))),
        }

        if let Err(e) = self.selector.open().await {
            self.disconnect_positioner().await;
            return Err(DaqError::Connection(format!("relay board: {:#}", e)));
        }

        if let Err(e) = self.instrument.open().await {
            if let Err(close_err) = self.selector.close().await {
                warn!("Relay board close failed during rollback: {:#}", close_err);
            }
            self.disconnect_positioner().await;
            return Err(e);
        }

        self.open = true;
        info!(instrument = %self.instrument.info(), "Station opened");
        Ok(())
    }

    /// Close every device, collecting failures instead of stopping at the
    /// first one.
    pub async fn release(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.instrument.close().await {
            errors.push(e);
        }
        if let Err(e) = self.selector.close().await {
            errors.push(DaqError::Connection(format!("relay board: {:#}", e)));
        }
        if let Err(e) = self.positioner.disconnect().await {
            errors.push(DaqError::Connection(format!("positioner: {:#}", e)));
        }
        self.open = false;

        if errors.is_empty() {
            info!("Station released");
            Ok(())
        } else {
            for error in &errors {
                warn!("Release error: {}", error);
            }
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    async fn disconnect_positioner(&mut self) {
        if let Err(e) = self.positioner.disconnect().await {
            warn!("Positioner disconnect failed during rollback: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_station(smu: &MockSmu, stage: &MockPositioner, relay: &MockRelay) -> Station {
        Station::new(
            Box::new(stage.clone()),
            Box::new(relay.clone()),
            InstrumentSession::new(Box::new(smu.clone())),
            Box::new(CsvReportSink::new()),
        )
    }

    #[tokio::test]
    async fn open_and_release_round_trip() {
        let (smu, stage, relay) = (MockSmu::new(), MockPositioner::new(), MockRelay::new());
        let mut station = mock_station(&smu, &stage, &relay);

        station.open().await.unwrap();
        assert!(station.is_open());
        assert!(smu.is_open() && stage.is_connected() && relay.is_open());

        station.release().await.unwrap();
        assert!(!station.is_open());
        assert!(!smu.is_open() && !stage.is_connected() && !relay.is_open());
    }

    #[tokio::test]
    async fn silent_positioner_is_a_connection_error() {
        let (smu, stage, relay) = (MockSmu::new(), MockPositioner::new(), MockRelay::new());
        stage.refuse_connections();
        let mut station = mock_station(&smu, &stage, &relay);

        let err = station.open().await.unwrap_err();
        assert!(matches!(err, DaqError::Connection(ref m) if m.contains("positioner")));
        assert!(!relay.is_open());
        assert!(!smu.is_open());
    }

    #[tokio::test]
    async fn failed_instrument_rolls_back_other_devices() {
        let (smu, stage, relay) = (MockSmu::new(), MockPositioner::new(), MockRelay::new());
        smu.refuse_connections(true);
        let mut station = mock_station(&smu, &stage, &relay);

        assert!(matches!(
            station.open().await.unwrap_err(),
            DaqError::Connection(_)
        ));
        assert!(!stage.is_connected());
        assert!(!relay.is_open());
        assert!(!station.is_open());
    }

    #[test]
    fn mock_flag_overrides_hardware_backends() {
        let mut settings = Settings::default();
        settings.instrument.backend = InstrumentBackend::Visa;
        settings.relay.backend = RelayBackend::Serial;
        let station = Station::from_settings(&settings, true);
        assert_eq!(station.instrument.info(), "MockSmu(diode model)");
    }
}
