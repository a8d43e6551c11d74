//! Instrument capability traits and SCPI drivers.
//!
//! The execution engine only talks to instruments through the traits in this
//! module, so drivers, simulated devices and test doubles are interchangeable.
//!
//! # Thread Safety
//! - All methods take `&self`; drivers use interior mutability for state.
//! - Every trait requires `Send + Sync` so handles can be shared as `Arc<dyn ...>`
//!   between the run task and the presentation layer.

use crate::error::VultureError;
use crate::model::test_plan::{ModulationConfig, PlanType};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub mod psg_e8257d;
pub mod power_supply;
pub mod registry;
pub mod resource_manager;
pub mod scpi;
pub mod signal_generator;
pub mod simulated;
pub mod transport;

pub use power_supply::ScpiPowerSupply;
pub use registry::InstrumentRegistry;
pub use resource_manager::{ResourceManager, SimulatedResourceManager, VisaResourceManager};
pub use scpi::{ScpiInstrument, ScpiTransport};
pub use signal_generator::ScpiSignalGenerator;
pub use simulated::{SimulatedDevice, SimulatedTransport};
pub use transport::TcpTransport;

/// Base instrument family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentType {
    /// Programmable DC supply
    PowerSupply,
    /// RF/analog signal source
    SignalGenerator,
}

impl InstrumentType {
    /// Canonical string form (`power_supply` / `signal_generator`).
    pub fn as_str(&self) -> &'static str {
        self.plan_type().as_str()
    }

    /// Human readable label ("signal generator").
    pub fn label(&self) -> &'static str {
        self.plan_type().label()
    }

    /// Plan type this instrument family executes.
    pub fn plan_type(&self) -> PlanType {
        match self {
            InstrumentType::PowerSupply => PlanType::PowerSupply,
            InstrumentType::SignalGenerator => PlanType::SignalGenerator,
        }
    }
}

impl From<PlanType> for InstrumentType {
    fn from(plan_type: PlanType) -> Self {
        match plan_type {
            PlanType::PowerSupply => InstrumentType::PowerSupply,
            PlanType::SignalGenerator => InstrumentType::SignalGenerator,
        }
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentType {
    type Err = VultureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<PlanType>().map(InstrumentType::from)
    }
}

/// Parsed `*IDN?` response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identification {
    /// First `*IDN?` field
    pub manufacturer: String,
    /// Second `*IDN?` field
    pub model: String,
    /// Third `*IDN?` field
    pub serial: String,
    /// Fourth `*IDN?` field
    pub firmware: String,
}

impl Identification {
    /// Parse the comma separated `*IDN?` answer. Missing fields stay empty.
    pub fn parse(response: &str) -> Self {
        let mut fields = response.trim().splitn(4, ',').map(|f| f.trim().to_string());
        Self {
            manufacturer: fields.next().unwrap_or_default(),
            model: fields.next().unwrap_or_default(),
            serial: fields.next().unwrap_or_default(),
            firmware: fields.next().unwrap_or_default(),
        }
    }

    /// Multi-line rendering for display.
    pub fn formatted(&self) -> String {
        format!(
            "Manufacturer: {}\nModel: {}\nSerial: {}\nFirmware: {}",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}

/// Capability: connection lifecycle and output switching
///
/// Shared by every instrument family.
///
/// # Contract
/// - `connect` establishes the session and reads the identification
/// - `is_connected` is cheap and never performs I/O
/// - Commands on a disconnected handle return `Err`
#[async_trait]
pub trait InstrumentHandle: Send + Sync {
    /// Display name of the instrument
    fn name(&self) -> &str;

    /// Resource address the instrument was opened on
    fn address(&self) -> &str;

    /// Base instrument family
    fn instrument_type(&self) -> InstrumentType;

    /// Whether the session is live
    fn is_connected(&self) -> bool;

    /// Identification captured at connect time
    fn identification(&self) -> Option<Identification>;

    /// Open the session and read `*IDN?`
    async fn connect(&self) -> Result<()>;

    /// Close the session
    async fn disconnect(&self) -> Result<()>;

    /// Switch the output on
    async fn enable_output(&self) -> Result<()>;

    /// Switch the output off
    async fn disable_output(&self) -> Result<()>;

    /// Query the output relay state
    async fn output_enabled(&self) -> Result<bool>;
}

/// Capability: DC power supply setpoints
#[async_trait]
pub trait PowerSupplyControl: InstrumentHandle {
    /// Set output voltage in volts
    async fn set_voltage(&self, volts: f64) -> Result<()>;

    /// Set current limit in amperes
    async fn set_current(&self, amps: f64) -> Result<()>;

    /// Programmed voltage setpoint
    async fn get_voltage(&self) -> Result<f64>;

    /// Programmed current limit
    async fn get_current(&self) -> Result<f64>;

    /// Measured output voltage
    async fn measure_voltage(&self) -> Result<f64>;

    /// Measured output current
    async fn measure_current(&self) -> Result<f64>;
}

/// Capability: signal generator carrier and modulation
///
/// # Contract
/// - `configure_modulation` writes source and parameters but leaves the
///   modulation state unchanged
/// - `set_modulation_enabled` toggles only the modulation named by `config`
/// - `disable_all_modulation` turns every modulation type off
#[async_trait]
pub trait SignalGeneratorControl: InstrumentHandle {
    /// Set carrier frequency in Hz
    async fn set_frequency(&self, hz: f64) -> Result<()>;

    /// Set output power in dBm
    async fn set_power(&self, dbm: f64) -> Result<()>;

    /// Programmed carrier frequency
    async fn get_frequency(&self) -> Result<f64>;

    /// Programmed output power
    async fn get_power(&self) -> Result<f64>;

    /// Write modulation source and parameters
    async fn configure_modulation(&self, config: &ModulationConfig) -> Result<()>;

    /// Switch the modulation named by `config` on or off
    async fn set_modulation_enabled(&self, config: &ModulationConfig, enabled: bool) -> Result<()>;

    /// Switch AM and FM off
    async fn disable_all_modulation(&self) -> Result<()>;
}

/// A live instrument handle, discriminated by family.
#[derive(Clone)]
pub enum Instrument {
    /// Power supply handle
    PowerSupply(Arc<dyn PowerSupplyControl>),
    /// Signal generator handle
    SignalGenerator(Arc<dyn SignalGeneratorControl>),
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("type", &self.instrument_type())
            .field("name", &self.name())
            .field("address", &self.address())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Instrument {
    /// Base type of the handle.
    pub fn instrument_type(&self) -> InstrumentType {
        match self {
            Instrument::PowerSupply(_) => InstrumentType::PowerSupply,
            Instrument::SignalGenerator(_) => InstrumentType::SignalGenerator,
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        match self {
            Instrument::PowerSupply(ps) => ps.name(),
            Instrument::SignalGenerator(sg) => sg.name(),
        }
    }

    /// Resource string.
    pub fn address(&self) -> &str {
        match self {
            Instrument::PowerSupply(ps) => ps.address(),
            Instrument::SignalGenerator(sg) => sg.address(),
        }
    }

    /// Whether the session is live.
    pub fn is_connected(&self) -> bool {
        match self {
            Instrument::PowerSupply(ps) => ps.is_connected(),
            Instrument::SignalGenerator(sg) => sg.is_connected(),
        }
    }

    /// `*IDN?` fields, once connected.
    pub fn identification(&self) -> Option<Identification> {
        match self {
            Instrument::PowerSupply(ps) => ps.identification(),
            Instrument::SignalGenerator(sg) => sg.identification(),
        }
    }

    /// Open the session.
    pub async fn connect(&self) -> Result<()> {
        match self {
            Instrument::PowerSupply(ps) => ps.connect().await,
            Instrument::SignalGenerator(sg) => sg.connect().await,
        }
    }

    /// Close the session.
    pub async fn disconnect(&self) -> Result<()> {
        match self {
            Instrument::PowerSupply(ps) => ps.disconnect().await,
            Instrument::SignalGenerator(sg) => sg.disconnect().await,
        }
    }

    /// Switch the output off.
    pub async fn disable_output(&self) -> Result<()> {
        match self {
            Instrument::PowerSupply(ps) => ps.disable_output().await,
            Instrument::SignalGenerator(sg) => sg.disable_output().await,
        }
    }

    /// Power supply view, if this is one.
    pub fn as_power_supply(&self) -> Option<&Arc<dyn PowerSupplyControl>> {
        match self {
            Instrument::PowerSupply(ps) => Some(ps),
            Instrument::SignalGenerator(_) => None,
        }
    }

    /// Signal generator view, if this is one.
    pub fn as_signal_generator(&self) -> Option<&Arc<dyn SignalGeneratorControl>> {
        match self {
            Instrument::SignalGenerator(sg) => Some(sg),
            Instrument::PowerSupply(_) => None,
        }
    }
}
