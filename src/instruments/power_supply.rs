//! Generic SCPI power supply driver.

use super::scpi::{on_off, ScpiInstrument, ScpiTransport};
use super::{Identification, InstrumentHandle, InstrumentType, PowerSupplyControl};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Power supply speaking the common `VOLT`/`CURR`/`OUTP` command set.
pub struct ScpiPowerSupply {
    scpi: ScpiInstrument,
}

impl ScpiPowerSupply {
    /// Power supply speaking SCPI over `transport`.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        transport: Arc<dyn ScpiTransport>,
    ) -> Self {
        Self {
            scpi: ScpiInstrument::new(name, address, transport),
        }
    }
}

#[async_trait]
impl InstrumentHandle for ScpiPowerSupply {
    fn name(&self) -> &str {
        self.scpi.name()
    }

    fn address(&self) -> &str {
        self.scpi.address()
    }

    fn instrument_type(&self) -> InstrumentType {
        InstrumentType::PowerSupply
    }

    fn is_connected(&self) -> bool {
        self.scpi.is_connected()
    }

    fn identification(&self) -> Option<Identification> {
        self.scpi.identification()
    }

    async fn connect(&self) -> Result<()> {
        self.scpi.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.scpi.disconnect().await
    }

    async fn enable_output(&self) -> Result<()> {
        self.scpi.write(&format!("OUTP {}", on_off(true))).await
    }

    async fn disable_output(&self) -> Result<()> {
        self.scpi.write(&format!("OUTP {}", on_off(false))).await
    }

    async fn output_enabled(&self) -> Result<bool> {
        self.scpi.query_bool("OUTP?").await
    }
}

#[async_trait]
impl PowerSupplyControl for ScpiPowerSupply {
    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.scpi.write(&format!("VOLT {:.3}", volts)).await
    }

    async fn set_current(&self, amps: f64) -> Result<()> {
        self.scpi.write(&format!("CURR {:.3}", amps)).await
    }

    async fn get_voltage(&self) -> Result<f64> {
        self.scpi.query_f64("VOLT?").await
    }

    async fn get_current(&self) -> Result<f64> {
        self.scpi.query_f64("CURR?").await
    }

    async fn measure_voltage(&self) -> Result<f64> {
        self.scpi.query_f64("MEAS:VOLT?").await
    }

    async fn measure_current(&self) -> Result<f64> {
        self.scpi.query_f64("MEAS:CURR?").await
    }
}
