//! Keysight PSG E8257D signal generator.
//!
//! A standard SCPI generator with a 250 kHz to 67 GHz carrier range
//! (option 567) and micro-hertz frequency resolution.

use super::registry::InstrumentRegistry;
use super::scpi::ScpiTransport;
use super::signal_generator::{ScpiSignalGenerator, SignalGeneratorProfile};
use super::{Instrument, InstrumentType};
use crate::error::VultureResult;
use std::sync::Arc;

/// Registry display name
pub const DISPLAY_NAME: &str = "PSG E8257D";

/// Lowest carrier frequency in Hz
pub const MIN_FREQUENCY_HZ: f64 = 250e3;

/// Highest carrier frequency in Hz
pub const MAX_FREQUENCY_HZ: f64 = 67e9;

/// Carrier range and resolution of the E8257D.
pub fn profile() -> SignalGeneratorProfile {
    SignalGeneratorProfile {
        frequency_range: Some(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ),
        frequency_decimals: 6,
    }
}

/// Driver for an E8257D at `address`.
pub fn create(address: &str, transport: Arc<dyn ScpiTransport>) -> ScpiSignalGenerator {
    ScpiSignalGenerator::with_profile(DISPLAY_NAME, address, transport, profile())
}

/// Add the E8257D to a registry.
pub fn register(registry: &mut InstrumentRegistry) -> VultureResult<()> {
    registry.register(DISPLAY_NAME, InstrumentType::SignalGenerator, |address, transport| {
        Instrument::SignalGenerator(Arc::new(create(address, transport)))
    })
}
