//! Instrument type registry.
//!
//! Maps display names to driver constructors. The built-in generic drivers
//! are always present; model-specific drivers are registered explicitly at
//! startup.

use super::power_supply::ScpiPowerSupply;
use super::scpi::ScpiTransport;
use super::signal_generator::ScpiSignalGenerator;
use super::{psg_e8257d, Instrument, InstrumentType};
use crate::error::{VultureError, VultureResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Display name of the generic power supply driver
pub const POWER_SUPPLY: &str = "Power Supply";

/// Display name of the generic signal generator driver
pub const SIGNAL_GENERATOR: &str = "Signal Generator";

/// Builds an instrument handle for an address over an opened transport.
pub type InstrumentConstructor =
    Arc<dyn Fn(&str, Arc<dyn ScpiTransport>) -> Instrument + Send + Sync>;

/// One registered instrument type.
#[derive(Clone)]
pub struct InstrumentEntry {
    /// Name shown to the operator
    pub display_name: String,
    /// Family the driver belongs to
    pub base_type: InstrumentType,
    constructor: InstrumentConstructor,
}

impl std::fmt::Debug for InstrumentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentEntry")
            .field("display_name", &self.display_name)
            .field("base_type", &self.base_type)
            .finish()
    }
}

impl InstrumentEntry {
    /// Build the driver for `address`.
    pub fn create(&self, address: &str, transport: Arc<dyn ScpiTransport>) -> Instrument {
        (self.constructor)(address, transport)
    }
}

/// Name -> constructor table.
#[derive(Debug, Clone)]
pub struct InstrumentRegistry {
    entries: Vec<InstrumentEntry>,
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl InstrumentRegistry {
    /// Generic drivers only.
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
        };
        registry.entries.push(InstrumentEntry {
            display_name: POWER_SUPPLY.to_string(),
            base_type: InstrumentType::PowerSupply,
            constructor: Arc::new(|address: &str, transport: Arc<dyn ScpiTransport>| {
                Instrument::PowerSupply(Arc::new(ScpiPowerSupply::new(
                    POWER_SUPPLY,
                    address,
                    transport,
                )))
            }),
        });
        registry.entries.push(InstrumentEntry {
            display_name: SIGNAL_GENERATOR.to_string(),
            base_type: InstrumentType::SignalGenerator,
            constructor: Arc::new(|address: &str, transport: Arc<dyn ScpiTransport>| {
                Instrument::SignalGenerator(Arc::new(ScpiSignalGenerator::new(
                    SIGNAL_GENERATOR,
                    address,
                    transport,
                )))
            }),
        });
        registry
    }

    /// Generic drivers plus every model-specific driver shipped with the crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        if let Err(e) = psg_e8257d::register(&mut registry) {
            warn!("Skipping built-in instrument: {}", e);
        }
        registry
    }

    /// Register a driver under `display_name`. Names are unique (case-insensitive).
    pub fn register<F>(
        &mut self,
        display_name: &str,
        base_type: InstrumentType,
        constructor: F,
    ) -> VultureResult<()>
    where
        F: Fn(&str, Arc<dyn ScpiTransport>) -> Instrument + Send + Sync + 'static,
    {
        if self.find(display_name).is_some() {
            return Err(VultureError::Configuration(format!(
                "Instrument display name '{}' is already registered",
                display_name
            )));
        }
        info!(display_name, base_type = %base_type, "Registered instrument type");
        self.entries.push(InstrumentEntry {
            display_name: display_name.to_string(),
            base_type,
            constructor: Arc::new(constructor),
        });
        Ok(())
    }

    /// Resolve a display name or a base type string (`power_supply`).
    pub fn resolve(&self, type_name: &str) -> VultureResult<&InstrumentEntry> {
        if let Some(entry) = self.find(type_name) {
            return Ok(entry);
        }
        let base_type: InstrumentType = type_name
            .parse()
            .map_err(|_| VultureError::UnknownInstrumentType(type_name.to_string()))?;
        let generic = match base_type {
            InstrumentType::PowerSupply => POWER_SUPPLY,
            InstrumentType::SignalGenerator => SIGNAL_GENERATOR,
        };
        debug!(type_name, generic, "Resolved base instrument type");
        self.find(generic)
            .ok_or_else(|| VultureError::UnknownInstrumentType(type_name.to_string()))
    }

    /// Build an instrument of the named type.
    pub fn create(
        &self,
        type_name: &str,
        address: &str,
        transport: Arc<dyn ScpiTransport>,
    ) -> VultureResult<Instrument> {
        Ok(self.resolve(type_name)?.create(address, transport))
    }

    /// Registered display names, in registration order.
    pub fn display_names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|entry| entry.display_name.as_str())
            .collect()
    }

    /// Registered types in registration order.
    pub fn entries(&self) -> &[InstrumentEntry] {
        &self.entries
    }

    fn find(&self, display_name: &str) -> Option<&InstrumentEntry> {
        let wanted = display_name.trim();
        self.entries
            .iter()
            .find(|entry| entry.display_name.eq_ignore_ascii_case(wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::simulated::{SimulatedDevice, SimulatedTransport};

    fn transport(kind: InstrumentType) -> Arc<dyn ScpiTransport> {
        Arc::new(SimulatedTransport::new(Arc::new(SimulatedDevice::new(kind))))
    }

    #[test]
    fn builtins_are_listed_in_order() {
        let registry = InstrumentRegistry::with_builtins();
        assert_eq!(
            registry.display_names(),
            vec![POWER_SUPPLY, SIGNAL_GENERATOR, psg_e8257d::DISPLAY_NAME]
        );
    }

    #[test]
    fn resolves_base_types_and_display_names() {
        let registry = InstrumentRegistry::with_builtins();
        assert_eq!(registry.resolve("power_supply").unwrap().display_name, POWER_SUPPLY);
        assert_eq!(
            registry.resolve("signal_generator").unwrap().display_name,
            SIGNAL_GENERATOR
        );
        let psg = registry.resolve("psg e8257d").unwrap();
        assert_eq!(psg.base_type, InstrumentType::SignalGenerator);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = InstrumentRegistry::new();
        assert!(matches!(
            registry.resolve("oscilloscope"),
            Err(VultureError::UnknownInstrumentType(name)) if name == "oscilloscope"
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = InstrumentRegistry::new();
        let result = registry.register("power supply", InstrumentType::PowerSupply, |a, t| {
            Instrument::PowerSupply(Arc::new(ScpiPowerSupply::new("dup", a, t)))
        });
        assert!(result.is_err());
        assert_eq!(registry.entries().len(), 2);
    }

    #[test]
    fn created_instrument_matches_entry_type() {
        let registry = InstrumentRegistry::with_builtins();
        let instrument = registry
            .create(
                psg_e8257d::DISPLAY_NAME,
                "SIM::PSG",
                transport(InstrumentType::SignalGenerator),
            )
            .unwrap();
        assert_eq!(instrument.instrument_type(), InstrumentType::SignalGenerator);
        assert_eq!(instrument.name(), psg_e8257d::DISPLAY_NAME);
        assert_eq!(instrument.address(), "SIM::PSG");
    }
}
