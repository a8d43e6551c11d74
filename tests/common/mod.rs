//! Shared test doubles for integration tests.
//!
//! `RecordingInstrument` implements both instrument families and logs every
//! call by method name, so tests can assert on exact call sequences.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use visa_vulture::instruments::{
    Identification, Instrument, InstrumentHandle, InstrumentType, PowerSupplyControl,
    SignalGeneratorControl,
};
use visa_vulture::model::{EquipmentModel, EquipmentState, ModulationConfig, TestPlan};
use visa_vulture::instruments::SimulatedResourceManager;

/// Call log entry: method name plus formatted arguments.
pub type Call = (String, String);

pub struct RecordingInstrument {
    kind: InstrumentType,
    connected: AtomicBool,
    calls: Mutex<Vec<Call>>,
    /// method -> occurrence (1-based) that fails
    failures: Mutex<HashMap<String, usize>>,
}

impl RecordingInstrument {
    pub fn new(kind: InstrumentType) -> Arc<Self> {
        Arc::new(Self {
            kind,
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Make the `occurrence`-th call of `method` fail.
    pub fn fail_on(&self, method: &str, occurrence: usize) {
        self.failures.lock().insert(method.to_string(), occurrence);
    }

    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn method_names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(name, _)| name == method).count()
    }

    fn record(&self, method: &str, args: String) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) && method != "connect" {
            bail!("Recording {} is not connected", self.kind);
        }
        let occurrence = {
            let mut calls = self.calls.lock();
            calls.push((method.to_string(), args));
            calls.iter().filter(|(name, _)| name == method).count()
        };
        if self.failures.lock().get(method) == Some(&occurrence) {
            bail!("injected {} failure", method);
        }
        Ok(())
    }
}

#[async_trait]
impl InstrumentHandle for RecordingInstrument {
    fn name(&self) -> &str {
        "Recording"
    }

    fn address(&self) -> &str {
        "TEST::RECORDING"
    }

    fn instrument_type(&self) -> InstrumentType {
        self.kind
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn identification(&self) -> Option<Identification> {
        Some(Identification::parse("Test,Recording,0,0"))
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn enable_output(&self) -> Result<()> {
        self.record("enable_output", String::new())
    }

    async fn disable_output(&self) -> Result<()> {
        self.record("disable_output", String::new())
    }

    async fn output_enabled(&self) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl PowerSupplyControl for RecordingInstrument {
    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.record("set_voltage", volts.to_string())
    }

    async fn set_current(&self, amps: f64) -> Result<()> {
        self.record("set_current", amps.to_string())
    }

    async fn get_voltage(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn get_current(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn measure_voltage(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn measure_current(&self) -> Result<f64> {
        Ok(0.0)
    }
}

#[async_trait]
impl SignalGeneratorControl for RecordingInstrument {
    async fn set_frequency(&self, hz: f64) -> Result<()> {
        self.record("set_frequency", hz.to_string())
    }

    async fn set_power(&self, dbm: f64) -> Result<()> {
        self.record("set_power", dbm.to_string())
    }

    async fn get_frequency(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn get_power(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn configure_modulation(&self, config: &ModulationConfig) -> Result<()> {
        self.record("configure_modulation", config.modulation_type().to_string())
    }

    async fn set_modulation_enabled(&self, _config: &ModulationConfig, enabled: bool) -> Result<()> {
        self.record("set_modulation_enabled", enabled.to_string())
    }

    async fn disable_all_modulation(&self) -> Result<()> {
        self.record("disable_all_modulation", String::new())
    }
}

/// Model with a fast poll interval and `instrument` attached (state IDLE).
pub async fn model_with(instrument: &Arc<RecordingInstrument>) -> Arc<EquipmentModel> {
    let model = EquipmentModel::new(Arc::new(SimulatedResourceManager::empty()))
        .with_poll_interval(Duration::from_millis(10));
    let handle = match instrument.instrument_type() {
        InstrumentType::PowerSupply => {
            Instrument::PowerSupply(Arc::clone(instrument) as Arc<dyn PowerSupplyControl>)
        }
        InstrumentType::SignalGenerator => {
            Instrument::SignalGenerator(Arc::clone(instrument) as Arc<dyn SignalGeneratorControl>)
        }
    };
    model.attach_instrument(handle).await.unwrap();
    assert_eq!(model.state(), EquipmentState::Idle);
    Arc::new(model)
}

/// Load `plan` and start `run_test(start_step)` on a spawned task.
pub fn spawn_run(
    model: &Arc<EquipmentModel>,
    plan: TestPlan,
    start_step: u32,
) -> tokio::task::JoinHandle<visa_vulture::VultureResult<()>> {
    model.load_test_plan(plan).unwrap();
    let worker = Arc::clone(model);
    tokio::spawn(async move { worker.run_test(start_step).await })
}

/// Poll until the model reaches `state`, panicking after a few seconds.
pub async fn wait_for_state(model: &EquipmentModel, state: EquipmentState) {
    for _ in 0..500 {
        if model.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {state}, still {}", model.state());
}

/// Poll until `instrument` has seen at least `n` calls of `method`.
pub async fn wait_for_calls(instrument: &RecordingInstrument, method: &str, n: usize) {
    for _ in 0..500 {
        if instrument.count(method) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {n} {method} calls");
}

/// Collects completion notifications.
pub fn record_completions(model: &EquipmentModel) -> Arc<Mutex<Vec<(bool, String)>>> {
    let completions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&completions);
    model.register_complete_callback(move |ok, message| sink.lock().push((ok, message.to_string())));
    completions
}
