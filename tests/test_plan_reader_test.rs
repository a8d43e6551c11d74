//! Integration tests for CSV test plan loading from disk

use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use visa_vulture::config::{AppConfig, SoftLimits};
use visa_vulture::file_io::read_test_plan;
use visa_vulture::model::{ModulationType, PlanType};

fn write_plan(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

fn repo_file(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative)
}

#[test]
fn test_power_supply_csv_builds_timeline() {
    let dir = TempDir::new().unwrap();
    let path = write_plan(
        &dir,
        "two_steps.csv",
        "# instrument_type: power_supply\nduration,voltage,current\n1.0,5.0,1.0\n2.0,10.0,2.0\n",
    );

    let result = read_test_plan(&path, None);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    let plan = result.plan.unwrap();

    assert_eq!(plan.name(), "two_steps");
    assert_eq!(plan.plan_type(), PlanType::PowerSupply);
    assert_eq!(plan.step_count(), 2);
    assert_eq!(plan.total_duration(), 3.0);
    assert_eq!(plan.steps()[1].absolute_time_seconds(), 1.0);
}

#[test]
fn test_total_duration_matches_duration_column() {
    let dir = TempDir::new().unwrap();
    let durations = [0.5, 1.25, 0.0, 3.0, 0.25];
    let mut csv = String::from("# instrument_type: power_supply\nDuration , Voltage, CURRENT\n");
    for d in durations {
        csv.push_str(&format!("{},1,1\n", d));
    }
    let path = write_plan(&dir, "sum.csv", &csv);

    let plan = read_test_plan(&path, None).plan.unwrap();
    assert_eq!(plan.total_duration(), durations.iter().sum::<f64>());
}

#[test]
fn test_negative_duration_rejects_whole_plan() {
    let dir = TempDir::new().unwrap();
    let path = write_plan(
        &dir,
        "negative.csv",
        "# instrument_type: power_supply\nduration,voltage,current\n1.0,5.0,1.0\n-1.0,5.0,1.0\n",
    );

    let result = read_test_plan(&path, None);
    assert!(result.plan.is_none());
    assert!(result.errors.iter().any(|e| e.contains("must be >= 0")));
}

#[test]
fn test_every_row_error_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = write_plan(
        &dir,
        "bad_rows.csv",
        "# instrument_type: power_supply\nduration,voltage,current\nx,5,1\n1,-5,1\n1,5,abc\n",
    );

    let result = read_test_plan(&path, None);
    assert!(result.plan.is_none());
    assert_eq!(result.errors.len(), 3);
    assert!(result.errors[0].starts_with("Row 2:"));
    assert!(result.errors[1].starts_with("Row 3:"));
    assert!(result.errors[2].starts_with("Row 4:"));
}

#[test]
fn test_missing_instrument_type_metadata() {
    let dir = TempDir::new().unwrap();
    let path = write_plan(&dir, "untyped.csv", "duration,voltage,current\n1,5,1\n");

    let result = read_test_plan(&path, None);
    assert!(result.plan.is_none());
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("instrument_type"));
}

#[test]
fn test_shipped_sample_plans_load_cleanly() {
    let limits = SoftLimits::default();

    let ramp = read_test_plan(repo_file("plans/power_supply_ramp.csv"), Some(&limits));
    assert!(ramp.errors.is_empty(), "{:?}", ramp.errors);
    assert!(ramp.warnings.is_empty(), "{:?}", ramp.warnings);
    assert_eq!(ramp.plan.unwrap().total_duration(), 6.0);

    let sweep = read_test_plan(repo_file("plans/signal_generator_am_sweep.csv"), Some(&limits));
    assert!(sweep.errors.is_empty(), "{:?}", sweep.errors);
    let plan = sweep.plan.unwrap();
    assert_eq!(plan.plan_type(), PlanType::SignalGenerator);
    assert_eq!(plan.modulation_type(), ModulationType::Am);
    assert_eq!(plan.steps()[2].description(), "AM on at higher power");
}

#[test]
fn test_soft_limits_from_config_file_produce_warnings() {
    let dir = TempDir::new().unwrap();
    let config_path = write_plan(
        &dir,
        "strict.toml",
        "[validation_limits.power_supply]\nvoltage_max_v = 12.0\n",
    );
    let config = AppConfig::load_from(&config_path).unwrap();
    assert_eq!(config.validation_limits.power_supply.voltage_max_v, 12.0);
    assert_eq!(config.validation_limits.power_supply.current_max_a, 50.0);

    let plan_path = write_plan(
        &dir,
        "high.csv",
        "# instrument_type: power_supply\nduration,voltage,current\n1,24,1\n",
    );
    let result = read_test_plan(&plan_path, Some(&config.validation_limits));
    assert!(result.plan.is_some());
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].starts_with("Step 1: voltage 24 V"));
}

#[test]
fn test_shipped_config_is_valid() {
    let config = AppConfig::load_from(repo_file("config/visa_vulture.toml")).unwrap();
    config.validate().unwrap();
    assert!(config.simulation_mode);
    assert_eq!(config.validation_limits, SoftLimits::default());
}
