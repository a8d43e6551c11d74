//! Test plan data model.
//!
//! A [`TestPlan`] is an ordered list of [`TestStep`]s, each holding instrument
//! setpoints and a dwell duration. Step variants are a sum type discriminated
//! by [`PlanType`], so a power-supply step can only carry voltage/current and
//! a signal-generator step can only carry frequency/power/modulation.
//!
//! Absolute step times are derived, never authored: they are computed once when
//! the plan is built, as the running sum of the preceding durations in
//! `step_number` order.

use crate::error::{VultureError, VultureResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Plan type string for power supply plans.
pub const PLAN_TYPE_POWER_SUPPLY: &str = "power_supply";
/// Plan type string for signal generator plans.
pub const PLAN_TYPE_SIGNAL_GENERATOR: &str = "signal_generator";

/// Which step schema and execution path a plan uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// Voltage/current setpoints
    PowerSupply,
    /// Frequency/power setpoints with optional modulation
    SignalGenerator,
}

impl PlanType {
    /// Canonical string form used in CSV metadata and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::PowerSupply => PLAN_TYPE_POWER_SUPPLY,
            PlanType::SignalGenerator => PLAN_TYPE_SIGNAL_GENERATOR,
        }
    }

    /// Human readable label ("power supply").
    pub fn label(&self) -> &'static str {
        match self {
            PlanType::PowerSupply => "power supply",
            PlanType::SignalGenerator => "signal generator",
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = VultureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            PLAN_TYPE_POWER_SUPPLY => Ok(PlanType::PowerSupply),
            PLAN_TYPE_SIGNAL_GENERATOR => Ok(PlanType::SignalGenerator),
            other => Err(VultureError::UnknownInstrumentType(other.to_string())),
        }
    }
}

// =============================================================================
// Modulation
// =============================================================================

/// Modulation discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModulationType {
    /// No modulation configured
    None,
    /// Amplitude modulation
    Am,
    /// Frequency modulation
    Fm,
}

impl fmt::Display for ModulationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModulationType::None => write!(f, "NONE"),
            ModulationType::Am => write!(f, "AM"),
            ModulationType::Fm => write!(f, "FM"),
        }
    }
}

/// Modulation settings applied once at the start of a signal generator run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ModulationConfig {
    /// Amplitude modulation
    Am {
        /// Internal modulating frequency in Hz
        modulation_frequency: f64,
        /// Modulation depth in percent (0-100)
        depth: f64,
    },
    /// Frequency modulation
    Fm {
        /// Internal modulating frequency in Hz
        modulation_frequency: f64,
        /// Peak frequency deviation in Hz
        deviation: f64,
    },
}

impl ModulationConfig {
    /// AM configuration. Frequency must be > 0 and depth within 0-100 %.
    pub fn am(modulation_frequency: f64, depth: f64) -> VultureResult<Self> {
        check_modulation_frequency(modulation_frequency)?;
        if !(0.0..=100.0).contains(&depth) {
            return Err(VultureError::InvalidModulation(format!(
                "depth must be 0-100%, got {depth:?}"
            )));
        }
        Ok(ModulationConfig::Am {
            modulation_frequency,
            depth,
        })
    }

    /// FM configuration. Frequency and deviation must both be > 0.
    pub fn fm(modulation_frequency: f64, deviation: f64) -> VultureResult<Self> {
        check_modulation_frequency(modulation_frequency)?;
        if deviation <= 0.0 || !deviation.is_finite() {
            return Err(VultureError::InvalidModulation(format!(
                "deviation must be > 0, got {deviation:?}"
            )));
        }
        Ok(ModulationConfig::Fm {
            modulation_frequency,
            deviation,
        })
    }

    /// Discriminator of this configuration.
    pub fn modulation_type(&self) -> ModulationType {
        match self {
            ModulationConfig::Am { .. } => ModulationType::Am,
            ModulationConfig::Fm { .. } => ModulationType::Fm,
        }
    }

    /// Internal modulating frequency in Hz.
    pub fn modulation_frequency(&self) -> f64 {
        match self {
            ModulationConfig::Am {
                modulation_frequency,
                ..
            }
            | ModulationConfig::Fm {
                modulation_frequency,
                ..
            } => *modulation_frequency,
        }
    }
}

fn check_modulation_frequency(frequency: f64) -> VultureResult<()> {
    if frequency > 0.0 && frequency.is_finite() {
        Ok(())
    } else {
        Err(VultureError::InvalidModulation(format!(
            "modulation_frequency must be > 0, got {frequency:?}"
        )))
    }
}

// =============================================================================
// Steps
// =============================================================================

/// Instrument setpoints of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepSettings {
    /// Power supply setpoints
    PowerSupply {
        /// Output voltage in volts
        voltage: f64,
        /// Current limit in amperes
        current: f64,
    },
    /// Signal generator setpoints
    SignalGenerator {
        /// Carrier frequency in Hz
        frequency: f64,
        /// Output power in dBm (may be negative)
        power: f64,
        /// Whether the plan's modulation is on during this step
        modulation_enabled: bool,
    },
}

impl StepSettings {
    /// Plan type this step belongs to.
    pub fn plan_type(&self) -> PlanType {
        match self {
            StepSettings::PowerSupply { .. } => PlanType::PowerSupply,
            StepSettings::SignalGenerator { .. } => PlanType::SignalGenerator,
        }
    }
}

/// One entry of a test plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    step_number: u32,
    duration_seconds: f64,
    absolute_time_seconds: f64,
    description: String,
    settings: StepSettings,
}

impl TestStep {
    /// Power supply step. Duration, voltage and current must be >= 0.
    pub fn power_supply(
        step_number: u32,
        duration_seconds: f64,
        voltage: f64,
        current: f64,
    ) -> VultureResult<Self> {
        check_non_negative("voltage", voltage)?;
        check_non_negative("current", current)?;
        Self::build(
            step_number,
            duration_seconds,
            StepSettings::PowerSupply { voltage, current },
        )
    }

    /// Signal generator step. Duration and frequency must be >= 0; power is unbounded.
    pub fn signal_generator(
        step_number: u32,
        duration_seconds: f64,
        frequency: f64,
        power: f64,
    ) -> VultureResult<Self> {
        check_non_negative("frequency", frequency)?;
        if !power.is_finite() {
            return Err(VultureError::InvalidStep(format!(
                "power must be a finite number, got {power:?}"
            )));
        }
        Self::build(
            step_number,
            duration_seconds,
            StepSettings::SignalGenerator {
                frequency,
                power,
                modulation_enabled: false,
            },
        )
    }

    fn build(step_number: u32, duration_seconds: f64, settings: StepSettings) -> VultureResult<Self> {
        if step_number == 0 {
            return Err(VultureError::InvalidStep(
                "step_number must be >= 1".to_string(),
            ));
        }
        check_non_negative("duration_seconds", duration_seconds)?;
        Ok(Self {
            step_number,
            duration_seconds,
            absolute_time_seconds: 0.0,
            description: String::new(),
            settings,
        })
    }

    /// Attach a free-text description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the modulation flag. Ignored for power supply steps.
    pub fn with_modulation_enabled(mut self, enabled: bool) -> Self {
        if let StepSettings::SignalGenerator {
            modulation_enabled, ..
        } = &mut self.settings
        {
            *modulation_enabled = enabled;
        }
        self
    }

    /// 1-based step number, unique within a plan.
    pub fn step_number(&self) -> u32 {
        self.step_number
    }

    /// Time this step holds before the next one starts.
    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    /// Sum of all earlier steps' durations. Zero until the step joins a plan.
    pub fn absolute_time_seconds(&self) -> f64 {
        self.absolute_time_seconds
    }

    /// Free-text description (may be empty).
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Instrument setpoints.
    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    /// Plan type this step belongs to.
    pub fn plan_type(&self) -> PlanType {
        self.settings.plan_type()
    }
}

fn check_non_negative(field: &str, value: f64) -> VultureResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(VultureError::InvalidStep(format!(
            "{field} must be >= 0, got {value:?}"
        )))
    }
}

// =============================================================================
// Plan
// =============================================================================

/// A complete, immutable test plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    name: String,
    plan_type: PlanType,
    steps: Vec<TestStep>,
    description: String,
    modulation_config: Option<ModulationConfig>,
}

impl TestPlan {
    /// Build a plan. Steps are ordered by `step_number` and their absolute
    /// times derived; the caller's ordering is not trusted.
    pub fn new(name: impl Into<String>, plan_type: PlanType, mut steps: Vec<TestStep>) -> Self {
        steps.sort_by_key(TestStep::step_number);

        let mut elapsed = 0.0;
        for step in &mut steps {
            step.absolute_time_seconds = elapsed;
            elapsed += step.duration_seconds;
        }

        Self {
            name: name.into(),
            plan_type,
            steps,
            description: String::new(),
            modulation_config: None,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attach a modulation configuration (signal generator plans).
    pub fn with_modulation(mut self, config: ModulationConfig) -> Self {
        self.modulation_config = Some(config);
        self
    }

    /// Plan name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plan type.
    pub fn plan_type(&self) -> PlanType {
        self.plan_type
    }

    /// Steps in ascending `step_number` order.
    pub fn steps(&self) -> &[TestStep] {
        &self.steps
    }

    /// Description (may be empty).
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Modulation configuration, if any.
    pub fn modulation_config(&self) -> Option<&ModulationConfig> {
        self.modulation_config.as_ref()
    }

    /// Modulation type of the plan (`None` without a configuration).
    pub fn modulation_type(&self) -> ModulationType {
        self.modulation_config
            .map_or(ModulationType::None, |config| config.modulation_type())
    }

    /// Number of steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Sum of every step's duration.
    pub fn total_duration(&self) -> f64 {
        self.steps.iter().map(TestStep::duration_seconds).sum()
    }

    /// Step with the given number.
    pub fn get_step(&self, step_number: u32) -> Option<&TestStep> {
        self.steps.iter().find(|step| step.step_number == step_number)
    }

    /// Remaining time when starting at `step_number`: the duration of that
    /// step plus every later one. Zero if the step does not exist.
    pub fn duration_from_step(&self, step_number: u32) -> f64 {
        if self.get_step(step_number).is_none() {
            return 0.0;
        }
        self.steps
            .iter()
            .filter(|step| step.step_number >= step_number)
            .map(TestStep::duration_seconds)
            .sum()
    }

    /// Check plan-level invariants. Returns every problem found (empty if valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Test plan name is required".to_string());
        }

        if self.steps.is_empty() {
            errors.push("Test plan must have at least one step".to_string());
            return errors;
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_number) {
                errors.push(format!("Duplicate step number {}", step.step_number));
            }
            if step.plan_type() != self.plan_type {
                errors.push(format!(
                    "Step {} is a {} step but the plan type is {}",
                    step.step_number,
                    step.plan_type().label(),
                    self.plan_type.label()
                ));
            }
        }

        if self.modulation_config.is_some() && self.plan_type != PlanType::SignalGenerator {
            errors.push("Modulation is only supported for signal generator plans".to_string());
        }

        errors
    }
}

impl fmt::Display for TestPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TestPlan('{}', {} steps, {}s)",
            self.name,
            self.step_count(),
            self.total_duration()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ps(step: u32, duration: f64) -> TestStep {
        TestStep::power_supply(step, duration, 5.0, 1.0).unwrap()
    }

    #[test]
    fn absolute_times_follow_step_number_order() {
        let plan = TestPlan::new(
            "ramp",
            PlanType::PowerSupply,
            vec![ps(3, 4.0), ps(1, 1.0), ps(2, 2.0)],
        );

        let times: Vec<f64> = plan.steps().iter().map(TestStep::absolute_time_seconds).collect();
        assert_eq!(times, vec![0.0, 1.0, 3.0]);
        let numbers: Vec<u32> = plan.steps().iter().map(TestStep::step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn total_duration_sums_all_steps() {
        let plan = TestPlan::new("p", PlanType::PowerSupply, vec![ps(1, 1.5), ps(2, 2.5)]);
        assert_eq!(plan.total_duration(), 4.0);
        assert_eq!(plan.step_count(), 2);
    }

    #[test]
    fn duration_from_step_counts_that_step_and_later() {
        let plan = TestPlan::new(
            "p",
            PlanType::PowerSupply,
            vec![ps(1, 1.0), ps(2, 2.0), ps(3, 3.0)],
        );
        assert_eq!(plan.duration_from_step(1), 6.0);
        assert_eq!(plan.duration_from_step(2), 5.0);
        assert_eq!(plan.duration_from_step(3), 3.0);
        assert_eq!(plan.duration_from_step(9), 0.0);
    }

    #[test]
    fn duration_from_step_tolerates_gaps() {
        let plan = TestPlan::new("p", PlanType::PowerSupply, vec![ps(1, 1.0), ps(5, 2.0)]);
        assert_eq!(plan.duration_from_step(5), 2.0);
        assert_eq!(plan.duration_from_step(3), 0.0);
    }

    #[test]
    fn negative_duration_rejected_at_construction() {
        assert!(TestStep::power_supply(1, -1.0, 1.0, 1.0).is_err());
        assert!(TestStep::signal_generator(1, -0.1, 1.0, 0.0).is_err());
    }

    #[test]
    fn negative_setpoints_rejected_except_power() {
        assert!(TestStep::power_supply(1, 1.0, -1.0, 1.0).is_err());
        assert!(TestStep::power_supply(1, 1.0, 1.0, -1.0).is_err());
        assert!(TestStep::signal_generator(1, 1.0, -1.0, 0.0).is_err());
        assert!(TestStep::signal_generator(1, 1.0, 1e6, -30.0).is_ok());
    }

    #[test]
    fn step_number_zero_rejected() {
        assert!(TestStep::power_supply(0, 1.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn modulation_flag_only_applies_to_signal_generator_steps() {
        let sg = TestStep::signal_generator(1, 1.0, 1e6, 0.0)
            .unwrap()
            .with_modulation_enabled(true);
        assert!(matches!(
            sg.settings(),
            StepSettings::SignalGenerator {
                modulation_enabled: true,
                ..
            }
        ));

        let power = ps(1, 1.0).with_modulation_enabled(true);
        assert_eq!(power.settings(), ps(1, 1.0).settings());
    }

    #[test]
    fn validate_requires_name_and_steps() {
        let plan = TestPlan::new("", PlanType::PowerSupply, Vec::new());
        let errors = plan.validate();
        assert!(errors.iter().any(|e| e.contains("name is required")));
        assert!(errors.iter().any(|e| e.contains("at least one step")));
    }

    #[test]
    fn validate_flags_duplicates_and_mismatched_steps() {
        let sg = TestStep::signal_generator(2, 1.0, 1e6, 0.0).unwrap();
        let plan = TestPlan::new("p", PlanType::PowerSupply, vec![ps(1, 1.0), ps(1, 1.0), sg]);
        let errors = plan.validate();
        assert!(errors.iter().any(|e| e.contains("Duplicate step number 1")));
        assert!(errors.iter().any(|e| e.contains("Step 2 is a signal generator step")));
    }

    #[test]
    fn validate_rejects_modulation_on_power_supply_plan() {
        let plan = TestPlan::new("p", PlanType::PowerSupply, vec![ps(1, 1.0)])
            .with_modulation(ModulationConfig::am(1000.0, 50.0).unwrap());
        assert_eq!(plan.validate().len(), 1);
    }

    #[test]
    fn valid_plan_has_no_errors() {
        let plan = TestPlan::new("p", PlanType::PowerSupply, vec![ps(1, 1.0), ps(2, 0.0)]);
        assert!(plan.validate().is_empty());
    }

    #[test]
    fn modulation_constructors_validate_ranges() {
        assert!(ModulationConfig::am(0.0, 50.0).is_err());
        assert!(ModulationConfig::am(1000.0, 100.5).is_err());
        assert!(ModulationConfig::am(1000.0, 0.0).is_ok());
        assert!(ModulationConfig::fm(1000.0, 0.0).is_err());
        assert!(ModulationConfig::fm(-5.0, 10.0).is_err());

        let fm = ModulationConfig::fm(1000.0, 5000.0).unwrap();
        assert_eq!(fm.modulation_type(), ModulationType::Fm);
        assert_eq!(fm.modulation_frequency(), 1000.0);
    }

    #[test]
    fn plan_modulation_type_defaults_to_none() {
        let plan = TestPlan::new("p", PlanType::PowerSupply, vec![ps(1, 1.0)]);
        assert_eq!(plan.modulation_type(), ModulationType::None);
    }

    #[test]
    fn plan_type_parses_case_insensitively() {
        assert_eq!("Power_Supply".parse::<PlanType>().unwrap(), PlanType::PowerSupply);
        assert_eq!(
            " signal_generator ".parse::<PlanType>().unwrap(),
            PlanType::SignalGenerator
        );
        assert!("oscilloscope".parse::<PlanType>().is_err());
    }

    #[test]
    fn display_summarises_plan() {
        let plan = TestPlan::new("ramp", PlanType::PowerSupply, vec![ps(1, 1.0), ps(2, 2.0)]);
        assert_eq!(plan.to_string(), "TestPlan('ramp', 2 steps, 3s)");
    }
}
