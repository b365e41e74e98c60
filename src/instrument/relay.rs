//! Serial relay board routing the SMU to one pixel.
//!
//! Protocol: each pixel owns an opaque ASCII token (e.g. `"r"`) written to the
//! board with no terminator. The board answers nothing, so a fixed settle
//! delay follows every selection.

use crate::adapters::SerialAdapter;
use crate::config::{PixelDefinition, RelayConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::capabilities::PixelSelector;

pub struct RelayBoard {
    adapter: SerialAdapter,
    settle: Duration,
}

impl RelayBoard {
    pub fn new(adapter: SerialAdapter, settle: Duration) -> Self {
        Self { adapter, settle }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            SerialAdapter::new(config.port.clone(), config.baud_rate),
            config.settle,
        )
    }
}

#[async_trait]
impl PixelSelector for RelayBoard {
    async fn open(&mut self) -> Result<()> {
        self.adapter.open().await
    }

    async fn select(&mut self, pixel: &PixelDefinition) -> Result<()> {
        self.adapter
            .send(&pixel.relay_command)
            .await
            .with_context(|| format!("Failed to select pixel {}", pixel.id))?;
        debug!(pixel = pixel.id, port = self.adapter.port_name(), "Relay switched");
        sleep(self.settle).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.adapter.close().await
    }
}

#[cfg(all(test, not(feature = "instrument_serial")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_without_serial_support_refuses_to_open() {
        let mut board = RelayBoard::from_config(&crate::config::Settings::default().relay);
        let err = board.open().await.unwrap_err();
        assert!(err.to_string().contains("instrument_serial"));
    }
}
