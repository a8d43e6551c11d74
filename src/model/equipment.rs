//! EquipmentModel - owner of the connected instrument, the loaded plan and the
//! lifecycle state machine.
//!
//! The model is shared as `Arc<EquipmentModel>`. `run_test` is awaited on a
//! worker task while the presentation layer calls `stop_test`, `pause_test`
//! and `resume_test` from elsewhere.
//!
//! # Usage
//!
//! ```rust,ignore
//! let model = Arc::new(EquipmentModel::from_config(&config));
//! model.connect_instrument("TCPIP::192.168.1.100::INSTR", "power_supply").await?;
//! model.load_test_plan(plan)?;
//!
//! let worker = Arc::clone(&model);
//! let run = tokio::spawn(async move { worker.run_test(1).await });
//! // ...
//! model.stop_test();
//! run.await??;
//! ```

use super::execution::{
    execute_plan, PowerSupplyDriver, RunControl, SignalGeneratorDriver, StepDriver,
    DEFAULT_POLL_INTERVAL,
};
use super::state_machine::{panic_message, CallbackId, EquipmentState, StateMachine};
use super::test_plan::{PlanType, TestPlan, TestStep};
use crate::config::{AppConfig, ConnectionSettings};
use crate::error::{VultureError, VultureResult};
use crate::instruments::{
    Identification, Instrument, InstrumentRegistry, InstrumentType, ResourceManager,
    SimulatedResourceManager, VisaResourceManager,
};
use anyhow::bail;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::Instrument as _;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Observer invoked with `(step_number, step_count, step)` after each applied step.
pub type ProgressCallback = Arc<dyn Fn(u32, usize, &TestStep) + Send + Sync>;

/// Observer invoked once per run with `(success, message)`.
pub type CompleteCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// Completion message for a run that reached its last step.
pub const MESSAGE_COMPLETED: &str = "Test completed";

/// Completion message for a run ended by `stop_test`.
pub const MESSAGE_STOPPED: &str = "Test stopped by user";

/// Completion message for a run whose future was dropped before it finished.
pub const MESSAGE_CANCELLED: &str = "Test cancelled";

/// Connected instrument, loaded plan and lifecycle state behind one handle.
pub struct EquipmentModel {
    state_machine: StateMachine,
    resource_manager: Arc<dyn ResourceManager>,
    registry: InstrumentRegistry,
    connection: ConnectionSettings,
    control: RunControl,
    instrument: RwLock<Option<Instrument>>,
    test_plan: RwLock<Option<Arc<TestPlan>>>,
    progress_callbacks: RwLock<Vec<ProgressCallback>>,
    complete_callbacks: RwLock<Vec<CompleteCallback>>,
}

impl std::fmt::Debug for EquipmentModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquipmentModel")
            .field("state", &self.state())
            .field("instrument", &*self.instrument.read())
            .field("test_plan", &self.test_plan.read().as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl EquipmentModel {
    /// Model in UNKNOWN with the built-in registry and default poll interval.
    pub fn new(resource_manager: Arc<dyn ResourceManager>) -> Self {
        Self {
            state_machine: StateMachine::new(),
            resource_manager,
            registry: InstrumentRegistry::with_builtins(),
            connection: ConnectionSettings::default(),
            control: RunControl::new(DEFAULT_POLL_INTERVAL),
            instrument: RwLock::new(None),
            test_plan: RwLock::new(None),
            progress_callbacks: RwLock::new(Vec::new()),
            complete_callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Simulated or real resources per `simulation_mode`, with the configured
    /// poll interval and connection settings.
    pub fn from_config(config: &AppConfig) -> Self {
        let resource_manager: Arc<dyn ResourceManager> = if config.simulation_mode {
            info!("Simulation mode: using simulated resources");
            Arc::new(SimulatedResourceManager::new())
        } else {
            Arc::new(VisaResourceManager::new(config.resources.clone()))
        };
        Self::new(resource_manager)
            .with_poll_interval(config.poll_interval())
            .with_connection_settings(config.connection.clone())
    }

    /// Replace the instrument registry.
    pub fn with_registry(mut self, registry: InstrumentRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Granularity of step sleeps and pause polling.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.control = RunControl::new(poll_interval);
        self
    }

    /// Timeouts and terminators used when opening resources.
    pub fn with_connection_settings(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current lifecycle state.
    pub fn state(&self) -> EquipmentState {
        self.state_machine.state()
    }

    /// Loaded plan, if any.
    pub fn test_plan(&self) -> Option<Arc<TestPlan>> {
        self.test_plan.read().clone()
    }

    /// Handle of the connected instrument.
    pub fn instrument(&self) -> Option<Instrument> {
        self.instrument.read().clone()
    }

    /// Base type of the connected instrument.
    pub fn instrument_type(&self) -> Option<InstrumentType> {
        self.instrument.read().as_ref().map(Instrument::instrument_type)
    }

    /// `*IDN?` fields of the connected instrument.
    pub fn instrument_identification(&self) -> Option<Identification> {
        self.instrument
            .read()
            .as_ref()
            .and_then(Instrument::identification)
    }

    /// Instrument types this model can connect.
    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    /// Dwell left in the current step while paused.
    pub fn time_remaining_in_step(&self) -> Option<Duration> {
        self.control.time_remaining_in_step()
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Addresses the resource manager can open.
    pub async fn scan_resources(&self) -> VultureResult<Vec<String>> {
        let resources = self.resource_manager.list_resources().await?;
        info!(count = resources.len(), "Resource scan complete");
        Ok(resources)
    }

    /// Open `address` and connect as `type_name` (display name or base type).
    ///
    /// Legal from UNKNOWN or ERROR. A failed connect moves to ERROR.
    pub async fn connect_instrument(&self, address: &str, type_name: &str) -> VultureResult<()> {
        self.check_can_connect()?;
        let entry = self.registry.resolve(type_name)?;

        info!(address, instrument = %entry.display_name, "Connecting instrument");
        let opened = async {
            let transport = self
                .resource_manager
                .open_resource(address, &self.connection)
                .await?;
            let instrument = entry.create(address, transport);
            instrument.connect().await?;
            Ok::<Instrument, anyhow::Error>(instrument)
        }
        .await;

        match opened {
            Ok(instrument) => self.install(instrument),
            Err(e) => {
                let message = format!("Failed to connect to {}: {:#}", address, e);
                self.state_machine.to_error(Some(&message))?;
                Err(VultureError::Instrument(e.context(format!(
                    "Failed to connect to {}",
                    address
                ))))
            }
        }
    }

    /// Adopt an already-built handle, connecting it if needed.
    pub async fn attach_instrument(&self, instrument: Instrument) -> VultureResult<()> {
        self.check_can_connect()?;
        if !instrument.is_connected() {
            if let Err(e) = instrument.connect().await {
                self.state_machine
                    .to_error(Some(&format!("Failed to connect: {:#}", e)))?;
                return Err(VultureError::Instrument(e));
            }
        }
        self.install(instrument)
    }

    /// Stop any run, close the handle and return to UNKNOWN.
    pub async fn disconnect(&self) -> VultureResult<()> {
        if self.state().is_active() {
            info!("Disconnect requested during a run, stopping first");
            self.control.request_stop();
            while self.state().is_active() {
                sleep(self.control.poll_interval()).await;
            }
        }

        let instrument = self.instrument.write().take();
        if let Some(instrument) = instrument {
            if instrument.is_connected() {
                if let Err(e) = instrument.disconnect().await {
                    warn!(address = instrument.address(), "Error while disconnecting: {:#}", e);
                }
            }
            info!(address = instrument.address(), "Instrument disconnected");
        }

        self.state_machine.reset()
    }

    fn check_can_connect(&self) -> VultureResult<()> {
        if self
            .instrument
            .read()
            .as_ref()
            .is_some_and(Instrument::is_connected)
        {
            return Err(VultureError::AlreadyConnected);
        }
        let state = self.state();
        if !matches!(state, EquipmentState::Unknown | EquipmentState::Error) {
            return Err(VultureError::InvalidState {
                action: "connect",
                state,
            });
        }
        Ok(())
    }

    fn install(&self, instrument: Instrument) -> VultureResult<()> {
        info!(
            address = instrument.address(),
            instrument_type = %instrument.instrument_type(),
            "Instrument connected"
        );
        *self.instrument.write() = Some(instrument);
        self.state_machine.to_idle()
    }

    // =========================================================================
    // Test plan
    // =========================================================================

    /// Replace the loaded plan. Fails if the plan does not validate.
    pub fn load_test_plan(&self, plan: TestPlan) -> VultureResult<()> {
        let errors = plan.validate();
        if !errors.is_empty() {
            return Err(VultureError::InvalidTestPlan(errors.join("; ")));
        }
        info!(plan = %plan, "Test plan loaded");
        *self.test_plan.write() = Some(Arc::new(plan));
        Ok(())
    }

    /// Exact match against the connected instrument. No instrument is compatible.
    pub fn is_plan_type_compatible(&self, plan_type: PlanType) -> bool {
        self.instrument_type()
            .map_or(true, |instrument_type| instrument_type.plan_type() == plan_type)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute the loaded plan from `start_step` until it completes, is
    /// stopped, or fails.
    ///
    /// The machine ends in IDLE unless the run failed, in which case it is
    /// left in ERROR and the error is returned after the completion callbacks
    /// have fired.
    pub async fn run_test(&self, start_step: u32) -> VultureResult<()> {
        let plan = self.test_plan().ok_or(VultureError::NoTestPlan)?;

        let state = self.state();
        if state != EquipmentState::Idle {
            return Err(VultureError::InvalidState {
                action: "run test",
                state,
            });
        }
        if plan.get_step(start_step).is_none() {
            return Err(VultureError::StepNotFound(start_step));
        }
        if !self.is_plan_type_compatible(plan.plan_type()) {
            return Err(VultureError::IncompatiblePlan {
                plan_type: plan.plan_type().to_string(),
                instrument_type: self
                    .instrument_type()
                    .map_or_else(|| "instrument".to_string(), |t| t.label().to_string()),
            });
        }

        self.control.clear();
        self.state_machine
            .transition_from(EquipmentState::Idle, EquipmentState::Running)
            .map_err(|e| match e {
                VultureError::InvalidTransition { from, .. } => VultureError::InvalidState {
                    action: "run test",
                    state: from,
                },
                other => other,
            })?;

        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, plan = plan.name());
        let guard = RunGuard::new(self, span.clone());
        let outcome = async {
            info!(start_step, steps = plan.step_count(), "Test started");
            self.dispatch(&plan, start_step).await
        }
        .instrument(span.clone())
        .await;
        guard.disarm();

        span.in_scope(|| self.complete_run(outcome))
    }

    /// Cleanup for a run future dropped mid-await. No further instrument I/O
    /// is possible here, so output is left as it was and the machine goes to
    /// ERROR.
    fn abandon_run(&self) {
        warn!("Run cancelled before completion, output shutdown skipped");
        self.control.clear();
        if self.state().is_active() {
            if let Err(e) = self.state_machine.to_error(Some(MESSAGE_CANCELLED)) {
                error!("Could not enter error state: {}", e);
            }
        }
        self.notify_complete(false, MESSAGE_CANCELLED);
    }

    fn complete_run(&self, outcome: anyhow::Result<()>) -> VultureResult<()> {
        self.control.clear_time_remaining();
        match outcome {
            Ok(()) => {
                self.finish();
                let stopped = self.control.stop_requested();
                let message = if stopped { MESSAGE_STOPPED } else { MESSAGE_COMPLETED };
                info!("{}", message);
                self.notify_complete(!stopped, message);
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                if let Err(transition) = self.state_machine.to_error(Some(&message)) {
                    error!("Could not enter error state: {}", transition);
                }
                self.finish();
                self.notify_complete(false, &message);
                Err(e.downcast::<VultureError>().unwrap_or_else(VultureError::Instrument))
            }
        }
    }

    async fn dispatch(&self, plan: &TestPlan, start_step: u32) -> anyhow::Result<()> {
        let instrument = self.instrument();
        let mut driver: Box<dyn StepDriver> = match plan.plan_type() {
            PlanType::PowerSupply => {
                let Some(ps) = instrument.as_ref().and_then(Instrument::as_power_supply) else {
                    bail!("No power supply connected");
                };
                Box::new(PowerSupplyDriver::new(Arc::clone(ps)))
            }
            PlanType::SignalGenerator => {
                let Some(sg) = instrument.as_ref().and_then(Instrument::as_signal_generator)
                else {
                    bail!("No signal generator connected");
                };
                Box::new(SignalGeneratorDriver::new(
                    Arc::clone(sg),
                    plan.modulation_config().copied(),
                ))
            }
        };

        execute_plan(
            driver.as_mut(),
            plan,
            start_step,
            &self.control,
            &self.state_machine,
            |step_number, total, step| self.notify_progress(step_number, total, step),
        )
        .await
    }

    /// Terminal cleanup: an active run always lands in IDLE.
    fn finish(&self) {
        if self.state().is_active() {
            if let Err(e) = self.state_machine.to_idle() {
                error!("Could not return to idle: {}", e);
            }
        }
    }

    /// Request a stop. No-op unless RUNNING or PAUSED.
    pub fn stop_test(&self) {
        let state = self.state();
        if state.is_active() {
            info!(%state, "Stop requested");
            self.control.request_stop();
        } else {
            debug!(%state, "Stop ignored, no test running");
        }
    }

    /// Request a pause at the next poll. No-op unless RUNNING.
    pub fn pause_test(&self) {
        let state = self.state();
        if state == EquipmentState::Running {
            info!("Pause requested");
            self.control.request_pause();
        } else {
            debug!(%state, "Pause ignored, test not running");
        }
    }

    /// Resume a paused run. No-op unless PAUSED.
    pub fn resume_test(&self) {
        let state = self.state();
        if state == EquipmentState::Paused {
            info!("Resume requested");
            self.control.request_resume();
        } else {
            debug!(%state, "Resume ignored, test not paused");
        }
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Observe `(old, new)` state changes.
    pub fn register_state_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(EquipmentState, EquipmentState) + Send + Sync + 'static,
    {
        self.state_machine.register_callback(callback)
    }

    /// Remove a state observer. Unknown ids are ignored.
    pub fn unregister_state_callback(&self, id: CallbackId) {
        self.state_machine.unregister_callback(id);
    }

    /// Observe each applied step.
    pub fn register_progress_callback<F>(&self, callback: F)
    where
        F: Fn(u32, usize, &TestStep) + Send + Sync + 'static,
    {
        self.progress_callbacks.write().push(Arc::new(callback));
    }

    /// Observe the end of each run.
    pub fn register_complete_callback<F>(&self, callback: F)
    where
        F: Fn(bool, &str) + Send + Sync + 'static,
    {
        self.complete_callbacks.write().push(Arc::new(callback));
    }

    fn notify_progress(&self, step_number: u32, total: usize, step: &TestStep) {
        let callbacks = self.progress_callbacks.read().clone();
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(step_number, total, step))) {
                error!(step = step_number, "Error in progress callback: {}", panic_message(panic.as_ref()));
            }
        }
    }

    fn notify_complete(&self, success: bool, message: &str) {
        let callbacks = self.complete_callbacks.read().clone();
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(success, message))) {
                error!("Error in complete callback: {}", panic_message(panic.as_ref()));
            }
        }
    }
}

/// Armed for the lifetime of an in-flight `run_test`.
struct RunGuard<'a> {
    model: &'a EquipmentModel,
    span: tracing::Span,
    armed: bool,
}

impl<'a> RunGuard<'a> {
    fn new(model: &'a EquipmentModel, span: tracing::Span) -> Self {
        Self {
            model,
            span,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.span.in_scope(|| self.model.abandon_run());
        }
    }
}
