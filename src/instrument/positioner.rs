//! Positioner for stations without an XY stage.

use anyhow::Result;
use async_trait::async_trait;

use super::capabilities::Positioner;

/// A probe that never moves; pixels are addressed by the relay board alone.
#[derive(Debug, Default, Clone)]
pub struct FixedProbe {
    connected: bool,
}

impl FixedProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Positioner for FixedProbe {
    async fn connect(&mut self) -> Result<bool> {
        self.connected = true;
        Ok(true)
    }

    async fn move_to(&mut self, _x_mm: f64, _y_mm: f64) -> Result<()> {
        Ok(())
    }

    async fn return_home(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn position(&self) -> (f64, f64) {
        (0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_probe_stays_home() {
        let mut probe = FixedProbe::new();
        assert!(probe.connect().await.unwrap());
        probe.move_to(15.0, 20.0).await.unwrap();
        assert_eq!(probe.position(), (0.0, 0.0));
    }
}
