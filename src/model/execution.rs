//! Test plan execution loop.
//!
//! The loop walks a plan's steps in `step_number` order, applies each step
//! through a [`StepDriver`], holds for the step duration and honours
//! cooperative pause/stop requests from [`RunControl`].
//!
//! # Output Safety
//!
//! Whatever way the loop ends (completion, stop, or an error from the
//! instrument), [`execute_plan`] shuts the output down afterwards, provided
//! the instrument still reports itself connected. A handle that dropped
//! mid-run is never sent further commands.

use super::state_machine::StateMachine;
use super::test_plan::{ModulationConfig, StepSettings, TestPlan, TestStep};
use crate::error::VultureResult;
use crate::instruments::{PowerSupplyControl, SignalGeneratorControl};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Default poll interval of the interruptible sleep.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Run control
// =============================================================================

/// Cooperative stop/pause flags shared between the run task and its callers.
#[derive(Debug)]
pub struct RunControl {
    stop_requested: AtomicBool,
    pause_requested: AtomicBool,
    time_remaining_in_step: Mutex<Option<Duration>>,
    poll_interval: Duration,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl RunControl {
    /// Cleared flags, sleeping in `poll_interval` chunks.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            time_remaining_in_step: Mutex::new(None),
            poll_interval,
        }
    }

    /// Longest stretch between two flag checks.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether a stop is pending.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Whether a pause is pending or in effect.
    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop. Also clears a pending pause so a paused loop can exit.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Ask the loop to pause at its next poll.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Release a pause.
    pub fn request_resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Reset both flags before a new run.
    pub fn clear(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
        *self.time_remaining_in_step.lock() = None;
    }

    /// Dwell time left in the current step, captured when the run paused.
    pub fn time_remaining_in_step(&self) -> Option<Duration> {
        *self.time_remaining_in_step.lock()
    }

    pub(crate) fn clear_time_remaining(&self) {
        *self.time_remaining_in_step.lock() = None;
    }

    /// Sleep for `duration` in poll-sized chunks.
    ///
    /// Returns early on stop. On pause the remaining time is captured, the
    /// machine moves RUNNING -> PAUSED and the call blocks until resume
    /// (PAUSED -> RUNNING, sleep continues) or stop (state left PAUSED).
    pub async fn interruptible_sleep(
        &self,
        duration: Duration,
        state_machine: &StateMachine,
    ) -> VultureResult<()> {
        let mut remaining = duration;

        while !remaining.is_zero() && !self.stop_requested() {
            if self.pause_requested() {
                *self.time_remaining_in_step.lock() = Some(remaining);
                state_machine.to_paused()?;
                info!(remaining_s = remaining.as_secs_f64(), "Test paused");

                while self.pause_requested() && !self.stop_requested() {
                    sleep(self.poll_interval).await;
                }

                if !self.stop_requested() {
                    let restored = self.time_remaining_in_step.lock().take();
                    remaining = restored.unwrap_or(remaining);
                    state_machine.to_running()?;
                    info!(remaining_s = remaining.as_secs_f64(), "Test resumed");
                }
            } else {
                let chunk = remaining.min(self.poll_interval);
                sleep(chunk).await;
                remaining = remaining.saturating_sub(chunk);
            }
        }

        Ok(())
    }
}

// =============================================================================
// Step drivers
// =============================================================================

/// Per-instrument half of the loop: how a step is applied and how output is
/// switched on and safely off.
#[async_trait]
pub trait StepDriver: Send {
    /// One-off setup before the first step.
    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Send one step's setpoints.
    async fn apply_step(&mut self, step: &TestStep) -> Result<()>;

    /// Switch the output on. Called once, after the first executed step.
    async fn enable_output(&mut self) -> Result<()>;

    /// Leave the instrument in a safe state. Only called while connected.
    async fn shutdown(&mut self) -> Result<()>;

    /// Whether the session is still usable.
    fn is_connected(&self) -> bool;
}

/// Applies voltage then current.
pub struct PowerSupplyDriver {
    power_supply: Arc<dyn PowerSupplyControl>,
}

impl PowerSupplyDriver {
    /// Driver over a connected power supply.
    pub fn new(power_supply: Arc<dyn PowerSupplyControl>) -> Self {
        Self { power_supply }
    }
}

#[async_trait]
impl StepDriver for PowerSupplyDriver {
    async fn apply_step(&mut self, step: &TestStep) -> Result<()> {
        let &StepSettings::PowerSupply { voltage, current } = step.settings() else {
            bail!("Step {} is not a power supply step", step.step_number());
        };
        debug!(step = step.step_number(), voltage, current, "Applying power supply step");
        self.power_supply.set_voltage(voltage).await?;
        self.power_supply.set_current(current).await
    }

    async fn enable_output(&mut self) -> Result<()> {
        self.power_supply.enable_output().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.power_supply.disable_output().await
    }

    fn is_connected(&self) -> bool {
        self.power_supply.is_connected()
    }
}

/// Applies frequency then power, and toggles modulation only when a step's
/// flag differs from the previous executed step.
pub struct SignalGeneratorDriver {
    signal_generator: Arc<dyn SignalGeneratorControl>,
    modulation: Option<ModulationConfig>,
    last_modulation_enabled: Option<bool>,
}

impl SignalGeneratorDriver {
    /// Driver over a connected signal generator. `modulation` is configured
    /// in [`StepDriver::prepare`].
    pub fn new(
        signal_generator: Arc<dyn SignalGeneratorControl>,
        modulation: Option<ModulationConfig>,
    ) -> Self {
        Self {
            signal_generator,
            modulation,
            last_modulation_enabled: None,
        }
    }
}

#[async_trait]
impl StepDriver for SignalGeneratorDriver {
    async fn prepare(&mut self) -> Result<()> {
        if let Some(config) = &self.modulation {
            info!(modulation = %config.modulation_type(), "Configuring modulation");
            self.signal_generator.configure_modulation(config).await?;
            // Known starting state: configured but off.
            self.signal_generator
                .set_modulation_enabled(config, false)
                .await?;
        }
        Ok(())
    }

    async fn apply_step(&mut self, step: &TestStep) -> Result<()> {
        let &StepSettings::SignalGenerator {
            frequency,
            power,
            modulation_enabled,
        } = step.settings()
        else {
            bail!("Step {} is not a signal generator step", step.step_number());
        };
        debug!(step = step.step_number(), frequency, power, "Applying signal generator step");
        self.signal_generator.set_frequency(frequency).await?;
        self.signal_generator.set_power(power).await?;

        if let Some(config) = &self.modulation {
            if self.last_modulation_enabled != Some(modulation_enabled) {
                self.signal_generator
                    .set_modulation_enabled(config, modulation_enabled)
                    .await?;
                self.last_modulation_enabled = Some(modulation_enabled);
            }
        }
        Ok(())
    }

    async fn enable_output(&mut self) -> Result<()> {
        self.signal_generator.enable_output().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        let output = self.signal_generator.disable_output().await;
        if self.modulation.is_some() {
            self.signal_generator.disable_all_modulation().await?;
        }
        output
    }

    fn is_connected(&self) -> bool {
        self.signal_generator.is_connected()
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Run `plan` from `start_step`, then shut the output down.
///
/// `on_progress` receives `(step_number, step_count, step)` after each step
/// has been applied. Errors from the loop take precedence over shutdown
/// errors; the latter are logged.
pub async fn execute_plan<F>(
    driver: &mut dyn StepDriver,
    plan: &TestPlan,
    start_step: u32,
    control: &RunControl,
    state_machine: &StateMachine,
    on_progress: F,
) -> Result<()>
where
    F: Fn(u32, usize, &TestStep) + Send + Sync,
{
    let outcome = run_steps(driver, plan, start_step, control, state_machine, &on_progress).await;

    let shutdown = if driver.is_connected() {
        info!("Disabling output");
        driver.shutdown().await
    } else {
        warn!("Instrument disconnected, skipping output shutdown");
        Ok(())
    };

    match (outcome, shutdown) {
        (Err(e), Err(shutdown_err)) => {
            error!("Failed to disable output after run error: {:#}", shutdown_err);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), shutdown) => shutdown,
    }
}

async fn run_steps<F>(
    driver: &mut dyn StepDriver,
    plan: &TestPlan,
    start_step: u32,
    control: &RunControl,
    state_machine: &StateMachine,
    on_progress: &F,
) -> Result<()>
where
    F: Fn(u32, usize, &TestStep) + Send + Sync,
{
    driver.prepare().await?;

    let total = plan.step_count();
    let mut steps: Vec<&TestStep> = plan.steps().iter().collect();
    steps.sort_by_key(|step| step.step_number());

    for step in steps {
        let number = step.step_number();
        if number < start_step {
            continue;
        }
        if control.stop_requested() {
            info!(step = number, "Test stopped");
            break;
        }

        info!(step = number, total, duration_s = step.duration_seconds(), "Executing step");
        driver.apply_step(step).await?;
        if number == start_step {
            driver.enable_output().await?;
        }

        on_progress(number, total, step);

        if step.duration_seconds() > 0.0 {
            let duration = Duration::try_from_secs_f64(step.duration_seconds()).with_context(|| {
                format!("Step {} duration {:?} s is out of range", number, step.duration_seconds())
            })?;
            control.interruptible_sleep(duration, state_machine).await?;
        }
    }

    Ok(())
}
