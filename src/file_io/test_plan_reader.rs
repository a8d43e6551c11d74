//! CSV test plan reader.
//!
//! A plan file starts with `# key: value` metadata lines, followed by a CSV
//! header and one data row per step:
//!
//! ```text
//! # instrument_type: power_supply
//! duration,voltage,current,description
//! 1.0,5.0,1.0,Initial
//! 2.0,10.0,2.0,Ramp up
//! ```
//!
//! Structural problems (missing file, metadata or columns) are reported alone
//! and stop parsing. Value problems are collected across every row so the
//! operator can fix the whole file in one pass. Nothing here returns `Err`:
//! all problems are plain strings meant for direct display.

use crate::config::SoftLimits;
use crate::model::test_plan::{ModulationConfig, PlanType, StepSettings, TestPlan, TestStep};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Required columns of a power supply plan
pub const POWER_SUPPLY_COLUMNS: [&str; 3] = ["duration", "voltage", "current"];

/// Required columns of a signal generator plan
pub const SIGNAL_GENERATOR_COLUMNS: [&str; 3] = ["duration", "frequency", "power"];

/// Largest voltage any row may request, in volts
pub const HARD_LIMIT_VOLTAGE_MAX_V: f64 = 10_000.0;

/// Largest current any row may request, in amps
pub const HARD_LIMIT_CURRENT_MAX_A: f64 = 1_000.0;

/// Largest carrier frequency any row may request, in hertz
pub const HARD_LIMIT_FREQUENCY_MAX_HZ: f64 = 100e12;

/// Largest RF power any row may request, in dBm
pub const HARD_LIMIT_POWER_MAX_DBM: f64 = 60.0;

/// Longest single step, in seconds (30 days)
pub const HARD_LIMIT_DURATION_MAX_S: f64 = 2_592_000.0;

const MODULATION_TYPE_KEY: &str = "modulation_type";
const MODULATION_FREQUENCY_KEY: &str = "modulation_frequency";
const AM_DEPTH_KEY: &str = "am_depth";
const FM_DEVIATION_KEY: &str = "fm_deviation";

/// Outcome of reading a plan file.
///
/// `plan` is `Some` exactly when `errors` is empty. Warnings (soft limit
/// violations) never prevent loading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestPlanResult {
    /// Parsed plan, when there were no errors
    pub plan: Option<TestPlan>,
    /// Blocking problems, in file order
    pub errors: Vec<String>,
    /// Soft limit violations
    pub warnings: Vec<String>,
}

impl TestPlanResult {
    fn failure(errors: Vec<String>) -> Self {
        Self {
            plan: None,
            errors,
            warnings: Vec::new(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::failure(vec![message.into()])
    }

    /// A plan was produced without errors.
    pub fn is_ok(&self) -> bool {
        self.plan.is_some() && self.errors.is_empty()
    }

    /// Split into the plan (with warnings) or the error list.
    pub fn into_result(self) -> Result<(TestPlan, Vec<String>), Vec<String>> {
        match self.plan {
            Some(plan) if self.errors.is_empty() => Ok((plan, self.warnings)),
            _ => Err(self.errors),
        }
    }
}

/// Read a test plan from a CSV file.
///
/// The plan is named after the file stem. When `soft_limits` is given,
/// values outside them produce warnings.
pub fn read_test_plan(path: impl AsRef<Path>, soft_limits: Option<&SoftLimits>) -> TestPlanResult {
    let path = path.as_ref();
    if !path.exists() {
        return TestPlanResult::error(format!("File not found: {}", path.display()));
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => return TestPlanResult::error(format!("Error reading file: {}", e)),
    };

    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    let result = parse_test_plan(&name, &content, soft_limits);
    if let Some(plan) = &result.plan {
        info!(
            plan_type = %plan.plan_type(),
            name = %plan.name(),
            path = %path.display(),
            steps = plan.step_count(),
            "Loaded test plan"
        );
    }
    result
}

/// Parse plan text already in memory. `name` becomes the plan name.
pub fn parse_test_plan(name: &str, content: &str, soft_limits: Option<&SoftLimits>) -> TestPlanResult {
    let (metadata, csv_content) = parse_metadata(content);

    if metadata.is_empty() {
        return TestPlanResult::error(
            "Missing required metadata. Add '# instrument_type: power_supply' \
             or '# instrument_type: signal_generator' at the top of the CSV file",
        );
    }

    let Some(instrument_type) = metadata.get("instrument_type") else {
        return TestPlanResult::error("Missing required metadata field 'instrument_type'");
    };

    let Ok(plan_type) = instrument_type.parse::<PlanType>() else {
        return TestPlanResult::error(format!(
            "Invalid instrument_type '{}'. Must be '{}' or '{}'",
            instrument_type,
            PlanType::PowerSupply,
            PlanType::SignalGenerator
        ));
    };

    match parse_csv_content(name, plan_type, &metadata, csv_content, soft_limits) {
        Ok(result) => result,
        Err(e) => TestPlanResult::error(format!("CSV parsing error: {}", e)),
    }
}

/// Split leading `#` comment lines into a metadata map and return the rest.
///
/// Keys and values are trimmed and lower-cased. Comments without a colon are
/// skipped but still count as metadata lines.
fn parse_metadata(content: &str) -> (HashMap<String, String>, &str) {
    let mut metadata = HashMap::new();
    let mut csv_start = 0;

    for line in content.split_inclusive('\n') {
        let stripped = line.trim();
        let Some(body) = stripped.strip_prefix('#') else {
            break;
        };
        if let Some((key, value)) = body.split_once(':') {
            metadata.insert(key.trim().to_lowercase(), value.trim().to_lowercase());
        }
        csv_start += line.len();
    }

    debug!(?metadata, "Loaded metadata from test plan file");
    (metadata, &content[csv_start..])
}

fn parse_csv_content(
    name: &str,
    plan_type: PlanType,
    metadata: &HashMap<String, String>,
    csv_content: &str,
    soft_limits: Option<&SoftLimits>,
) -> Result<TestPlanResult, csv::Error> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(csv_content.as_bytes());

    let headers = reader.headers()?.clone();
    if headers.iter().all(str::is_empty) {
        return Ok(TestPlanResult::error("CSV file is empty or has no header row"));
    }

    let columns = ColumnMap::new(&headers);

    let required: &[&str] = match plan_type {
        PlanType::PowerSupply => &POWER_SUPPLY_COLUMNS,
        PlanType::SignalGenerator => &SIGNAL_GENERATOR_COLUMNS,
    };
    let mut missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|column| !columns.contains(column))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Ok(TestPlanResult::error(format!(
            "Missing required columns for {}: {}",
            plan_type.label(),
            missing.join(", ")
        )));
    }

    let records = reader.records().collect::<Result<Vec<_>, _>>()?;
    if records.is_empty() {
        return Ok(TestPlanResult::error("CSV file has no data rows"));
    }

    let modulation = match plan_type {
        PlanType::SignalGenerator => match parse_modulation_config(metadata) {
            Ok(config) => config,
            Err(message) => return Ok(TestPlanResult::error(message)),
        },
        PlanType::PowerSupply => None,
    };

    let mut errors = Vec::new();
    let mut steps = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        // Row 1 is the header.
        let row = RowParser {
            record,
            columns: &columns,
            row_number: index + 2,
        };
        let step_number = (index + 1) as u32;
        match row.parse_step(plan_type, step_number) {
            Ok(step) => steps.push(step),
            Err(row_errors) => errors.extend(row_errors),
        }
    }

    if !errors.is_empty() {
        return Ok(TestPlanResult::failure(errors));
    }

    let mut plan = TestPlan::new(name, plan_type, steps);
    if let Some(config) = modulation {
        plan = plan.with_modulation(config);
    }

    let validation_errors = plan.validate();
    if !validation_errors.is_empty() {
        return Ok(TestPlanResult::failure(validation_errors));
    }

    let warnings = soft_limits
        .map(|limits| check_soft_limits(&plan, limits))
        .unwrap_or_default();

    Ok(TestPlanResult {
        plan: Some(plan),
        errors: Vec::new(),
        warnings,
    })
}

/// Normalized (lower-cased, trimmed) column name -> field index.
struct ColumnMap(HashMap<String, usize>);

impl ColumnMap {
    fn new(headers: &StringRecord) -> Self {
        let mut map = HashMap::new();
        for (index, name) in headers.iter().enumerate() {
            map.entry(name.trim().to_lowercase()).or_insert(index);
        }
        Self(map)
    }

    fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    fn index(&self, column: &str) -> Option<usize> {
        self.0.get(column).copied()
    }
}

/// Accepted range of a numeric column.
#[derive(Clone, Copy)]
struct Bounds {
    non_negative: bool,
    max: Option<(f64, &'static str)>,
}

impl Bounds {
    fn at_most(max: f64, unit: &'static str) -> Self {
        Self {
            non_negative: true,
            max: Some((max, unit)),
        }
    }
}

struct RowParser<'a> {
    record: &'a StringRecord,
    columns: &'a ColumnMap,
    row_number: usize,
}

impl RowParser<'_> {
    fn value(&self, column: &str) -> &str {
        self.columns
            .index(column)
            .and_then(|index| self.record.get(index))
            .map(str::trim)
            .unwrap_or("")
    }

    /// Parse a numeric column. Values outside `bounds` are reported and dropped.
    fn number(&self, field: &str, bounds: Bounds, errors: &mut Vec<String>) -> Option<f64> {
        let raw = self.value(field);
        let value = match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            _ => {
                errors.push(format!(
                    "Row {}: invalid {} value '{}'",
                    self.row_number, field, raw
                ));
                return None;
            }
        };
        if bounds.non_negative && value < 0.0 {
            errors.push(format!(
                "Row {}: {} must be >= 0, got {:?}",
                self.row_number, field, value
            ));
            return None;
        }
        if let Some((max, unit)) = bounds.max {
            if value > max {
                errors.push(format!(
                    "Row {}: {} {:?} {unit} exceeds maximum ({:?} {unit})",
                    self.row_number, field, value, max
                ));
                return None;
            }
        }
        Some(value)
    }

    fn modulation_enabled(&self, errors: &mut Vec<String>) -> bool {
        let raw = self.value("modulation_enabled");
        match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" | "" => false,
            _ => {
                errors.push(format!(
                    "Row {}: invalid modulation_enabled value '{}'. Use true/false, 1/0, or yes/no",
                    self.row_number, raw
                ));
                false
            }
        }
    }

    fn parse_step(&self, plan_type: PlanType, step_number: u32) -> Result<TestStep, Vec<String>> {
        let mut errors = Vec::new();
        let duration = self.number("duration", Bounds::at_most(HARD_LIMIT_DURATION_MAX_S, "s"), &mut errors);

        let settings = match plan_type {
            PlanType::PowerSupply => {
                let voltage = self.number("voltage", Bounds::at_most(HARD_LIMIT_VOLTAGE_MAX_V, "V"), &mut errors);
                let current = self.number("current", Bounds::at_most(HARD_LIMIT_CURRENT_MAX_A, "A"), &mut errors);
                voltage
                    .zip(current)
                    .map(|(voltage, current)| StepSettings::PowerSupply { voltage, current })
            }
            PlanType::SignalGenerator => {
                let frequency =
                    self.number("frequency", Bounds::at_most(HARD_LIMIT_FREQUENCY_MAX_HZ, "Hz"), &mut errors);
                let power = self.number(
                    "power",
                    Bounds {
                        non_negative: false,
                        max: Some((HARD_LIMIT_POWER_MAX_DBM, "dBm")),
                    },
                    &mut errors,
                );
                let modulation_enabled = self.modulation_enabled(&mut errors);
                frequency.zip(power).map(|(frequency, power)| StepSettings::SignalGenerator {
                    frequency,
                    power,
                    modulation_enabled,
                })
            }
        };

        let (Some(duration), Some(settings)) = (duration, settings) else {
            return Err(errors);
        };
        if !errors.is_empty() {
            return Err(errors);
        }

        let step = match settings {
            StepSettings::PowerSupply { voltage, current } => {
                TestStep::power_supply(step_number, duration, voltage, current)
            }
            StepSettings::SignalGenerator {
                frequency,
                power,
                modulation_enabled,
            } => TestStep::signal_generator(step_number, duration, frequency, power)
                .map(|step| step.with_modulation_enabled(modulation_enabled)),
        };

        step.map(|step| step.with_description(self.value("description")))
            .map_err(|e| vec![format!("Row {}: {}", self.row_number, e)])
    }
}

/// Resolve modulation metadata. `Ok(None)` when no modulation is configured.
fn parse_modulation_config(
    metadata: &HashMap<String, String>,
) -> Result<Option<ModulationConfig>, String> {
    let modulation_type = match metadata.get(MODULATION_TYPE_KEY) {
        Some(value) if !value.is_empty() => value.as_str(),
        _ => return Ok(None),
    };
    if !matches!(modulation_type, "am" | "fm") {
        return Err(format!(
            "Invalid modulation_type '{}'. Must be one of: am, fm",
            modulation_type
        ));
    }

    let frequency = metadata_number(metadata, MODULATION_FREQUENCY_KEY, || {
        format!(
            "Missing required metadata '{}' when modulation_type is '{}'",
            MODULATION_FREQUENCY_KEY, modulation_type
        )
    })?;
    if frequency <= 0.0 {
        return Err(format!("modulation_frequency must be > 0, got {:?}", frequency));
    }

    let config = if modulation_type == "am" {
        let depth = metadata_number(metadata, AM_DEPTH_KEY, || {
            format!("Missing required metadata '{}' for AM modulation", AM_DEPTH_KEY)
        })?;
        if !(0.0..=100.0).contains(&depth) {
            return Err(format!("am_depth must be 0-100%, got {:?}", depth));
        }
        ModulationConfig::am(frequency, depth)
    } else {
        let deviation = metadata_number(metadata, FM_DEVIATION_KEY, || {
            format!("Missing required metadata '{}' for FM modulation", FM_DEVIATION_KEY)
        })?;
        if deviation <= 0.0 {
            return Err(format!("fm_deviation must be > 0, got {:?}", deviation));
        }
        ModulationConfig::fm(frequency, deviation)
    };

    config.map(Some).map_err(|e| e.to_string())
}

fn metadata_number(
    metadata: &HashMap<String, String>,
    key: &str,
    missing: impl FnOnce() -> String,
) -> Result<f64, String> {
    let raw = match metadata.get(key) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(missing()),
    };
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(format!("Invalid {} value '{}'", key, raw)),
    }
}

/// Warnings for values outside the soft limits.
pub fn check_soft_limits(plan: &TestPlan, limits: &SoftLimits) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut check = |step: u32, field: &str, value: f64, limit: f64, unit: &str, note: &str| {
        warn!(step, field, value, limit, unit, "Soft limit exceeded");
        warnings.push(format!(
            "Step {}: {} {} {} {} ({} {})",
            step, field, value, unit, note, limit, unit
        ));
    };

    for step in plan.steps() {
        let number = step.step_number();
        let duration_max = limits.common.duration_max_s;
        if step.duration_seconds() > duration_max {
            check(number, "duration", step.duration_seconds(), duration_max, "s", "exceeds typical maximum");
        }

        match *step.settings() {
            StepSettings::PowerSupply { voltage, current } => {
                let ps = &limits.power_supply;
                if voltage > ps.voltage_max_v {
                    check(number, "voltage", voltage, ps.voltage_max_v, "V", "exceeds typical lab supply limits");
                }
                if current > ps.current_max_a {
                    check(number, "current", current, ps.current_max_a, "A", "exceeds typical lab supply limits");
                }
            }
            StepSettings::SignalGenerator {
                frequency, power, ..
            } => {
                let sg = &limits.signal_generator;
                if power < sg.power_min_dbm {
                    check(number, "power", power, sg.power_min_dbm, "dBm", "below typical noise floor");
                }
                if power > sg.power_max_dbm {
                    check(number, "power", power, sg.power_max_dbm, "dBm", "exceeds typical equipment limits");
                }
                if frequency < sg.frequency_min_hz {
                    check(number, "frequency", frequency, sg.frequency_min_hz, "Hz", "below typical minimum");
                }
                if frequency > sg.frequency_max_hz {
                    check(number, "frequency", frequency, sg.frequency_max_hz, "Hz", "exceeds typical equipment limits");
                }
            }
        }
    }

    warnings
}
