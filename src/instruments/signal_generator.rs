//! Generic SCPI signal generator driver.
//!
//! Model-specific behaviour (frequency range, resolution, display name) is
//! captured by a [`SignalGeneratorProfile`] rather than a separate driver.

use super::scpi::{on_off, ScpiInstrument, ScpiTransport};
use super::{Identification, InstrumentHandle, InstrumentType, SignalGeneratorControl};
use crate::model::test_plan::ModulationConfig;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::debug;

/// Per-model differences of an otherwise standard SCPI generator.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalGeneratorProfile {
    /// Accepted carrier range in Hz. `None` leaves range checks to the instrument.
    pub frequency_range: Option<RangeInclusive<f64>>,
    /// Decimal places used when writing `FREQ`
    pub frequency_decimals: usize,
}

impl Default for SignalGeneratorProfile {
    fn default() -> Self {
        Self {
            frequency_range: None,
            frequency_decimals: 1,
        }
    }
}

/// Signal generator speaking the common `FREQ`/`POW`/`AM`/`FM` command set.
pub struct ScpiSignalGenerator {
    scpi: ScpiInstrument,
    profile: SignalGeneratorProfile,
}

impl ScpiSignalGenerator {
    /// Generator with no carrier range check.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        transport: Arc<dyn ScpiTransport>,
    ) -> Self {
        Self::with_profile(name, address, transport, SignalGeneratorProfile::default())
    }

    /// Generator constrained by `profile`.
    pub fn with_profile(
        name: impl Into<String>,
        address: impl Into<String>,
        transport: Arc<dyn ScpiTransport>,
        profile: SignalGeneratorProfile,
    ) -> Self {
        Self {
            scpi: ScpiInstrument::new(name, address, transport),
            profile,
        }
    }

    /// Range and formatting limits in effect.
    pub fn profile(&self) -> &SignalGeneratorProfile {
        &self.profile
    }
}

#[async_trait]
impl InstrumentHandle for ScpiSignalGenerator {
    fn name(&self) -> &str {
        self.scpi.name()
    }

    fn address(&self) -> &str {
        self.scpi.address()
    }

    fn instrument_type(&self) -> InstrumentType {
        InstrumentType::SignalGenerator
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
impl SignalGeneratorControl for ScpiSignalGenerator {
    async fn set_frequency(&self, hz: f64) -> Result<()> {
        if let Some(range) = &self.profile.frequency_range {
            if !range.contains(&hz) {
                bail!(
                    "{}: frequency {} Hz outside supported range {} Hz to {} Hz",
                    self.scpi.name(),
                    hz,
                    range.start(),
                    range.end()
                );
            }
        }
        let decimals = self.profile.frequency_decimals;
        self.scpi.write(&format!("FREQ {:.*}", decimals, hz)).await
    }

    async fn set_power(&self, dbm: f64) -> Result<()> {
        self.scpi.write(&format!("POW {:.2}", dbm)).await
    }

    async fn get_frequency(&self) -> Result<f64> {
        self.scpi.query_f64("FREQ?").await
    }

    async fn get_power(&self) -> Result<f64> {
        self.scpi.query_f64("POW?").await
    }

    async fn configure_modulation(&self, config: &ModulationConfig) -> Result<()> {
        debug!(name = %self.scpi.name(), ?config, "Configuring modulation");
        match config {
            ModulationConfig::Am {
                modulation_frequency,
                depth,
            } => {
                self.scpi.write("AM:SOUR INT").await?;
                self.scpi
                    .write(&format!("AM:INT:FREQ {:.1}", modulation_frequency))
                    .await?;
                self.scpi.write(&format!("AM:DEPT {:.1}", depth)).await
            }
            ModulationConfig::Fm {
                modulation_frequency,
                deviation,
            } => {
                self.scpi.write("FM:SOUR INT").await?;
                self.scpi
                    .write(&format!("FM:INT:FREQ {:.1}", modulation_frequency))
                    .await?;
                self.scpi.write(&format!("FM:DEV {:.1}", deviation)).await
            }
        }
    }

    async fn set_modulation_enabled(&self, config: &ModulationConfig, enabled: bool) -> Result<()> {
        let subsystem = match config {
            ModulationConfig::Am { .. } => "AM",
            ModulationConfig::Fm { .. } => "FM",
        };
        self.scpi
            .write(&format!("{}:STAT {}", subsystem, on_off(enabled)))
            .await
    }

    async fn disable_all_modulation(&self) -> Result<()> {
        self.scpi.write("AM:STAT OFF").await?;
        self.scpi.write("FM:STAT OFF").await
    }
}
