//! End-to-end runs against the simulated SCPI instruments
//!
//! Exercises the full path: resource manager -> registry -> SCPI driver ->
//! execution engine, asserting on the command stream the device received.

use std::sync::Arc;
use std::time::Duration;
use visa_vulture::config::AppConfig;
use visa_vulture::file_io::TestPlanResult;
use visa_vulture::instruments::resource_manager::{
    SIMULATED_POWER_SUPPLY, SIMULATED_SIGNAL_GENERATOR,
};
use visa_vulture::instruments::{InstrumentType, ResourceManager, SimulatedResourceManager};
use visa_vulture::model::{EquipmentModel, EquipmentState};

fn parse(content: &str) -> visa_vulture::model::TestPlan {
    let TestPlanResult { plan, errors, .. } =
        visa_vulture::file_io::test_plan_reader::parse_test_plan("sim", content, None);
    assert!(errors.is_empty(), "{:?}", errors);
    plan.unwrap()
}

fn simulated_model() -> (Arc<SimulatedResourceManager>, EquipmentModel) {
    let manager = Arc::new(SimulatedResourceManager::new());
    let resources: Arc<dyn ResourceManager> = manager.clone();
    let model = EquipmentModel::new(resources)
        .with_poll_interval(Duration::from_millis(10));
    (manager, model)
}

#[tokio::test]
async fn test_scan_lists_simulated_resources() {
    let config = AppConfig {
        simulation_mode: true,
        ..AppConfig::default()
    };
    let model = EquipmentModel::from_config(&config);

    let resources = model.scan_resources().await.unwrap();
    assert!(resources.contains(&SIMULATED_POWER_SUPPLY.to_string()));
    assert!(resources.contains(&SIMULATED_SIGNAL_GENERATOR.to_string()));
}

#[tokio::test]
async fn test_power_supply_plan_scpi_stream() {
    let (manager, model) = simulated_model();
    model
        .connect_instrument(SIMULATED_POWER_SUPPLY, "Power Supply")
        .await
        .unwrap();
    let device = manager.device(SIMULATED_POWER_SUPPLY).unwrap();
    assert_eq!(device.commands(), vec!["*IDN?"]);
    device.clear_commands();

    model
        .load_test_plan(parse(
            "# instrument_type: power_supply\nduration,voltage,current\n0,5,1\n0,12.5,0.25\n",
        ))
        .unwrap();
    model.run_test(1).await.unwrap();

    assert_eq!(
        device.commands(),
        vec![
            "VOLT 5.000",
            "CURR 1.000",
            "OUTP ON",
            "VOLT 12.500",
            "CURR 0.250",
            "OUTP OFF",
        ]
    );
    assert_eq!(device.value("OUTP").as_deref(), Some("0"));
    assert_eq!(model.state(), EquipmentState::Idle);
}

#[tokio::test]
async fn test_signal_generator_am_plan_scpi_stream() {
    let (manager, model) = simulated_model();
    model
        .connect_instrument(SIMULATED_SIGNAL_GENERATOR, "signal_generator")
        .await
        .unwrap();
    assert_eq!(model.instrument_type(), Some(InstrumentType::SignalGenerator));
    let device = manager.device(SIMULATED_SIGNAL_GENERATOR).unwrap();
    device.clear_commands();

    model
        .load_test_plan(parse(
            "# instrument_type: signal_generator\n\
             # modulation_type: am\n\
             # modulation_frequency: 1000\n\
             # am_depth: 30\n\
             duration,frequency,power,modulation_enabled\n\
             0,1e6,-10,true\n\
             0,2e6,-5,false\n",
        ))
        .unwrap();
    model.run_test(1).await.unwrap();

    assert_eq!(
        device.commands(),
        vec![
            "AM:SOUR INT",
            "AM:INT:FREQ 1000.0",
            "AM:DEPT 30.0",
            "AM:STAT OFF",
            "FREQ 1000000.0",
            "POW -10.00",
            "AM:STAT ON",
            "OUTP ON",
            "FREQ 2000000.0",
            "POW -5.00",
            "AM:STAT OFF",
            "OUTP OFF",
            "AM:STAT OFF",
            "FM:STAT OFF",
        ]
    );
}

#[tokio::test]
async fn test_psg_e8257d_rejects_out_of_range_carrier() {
    let (manager, model) = simulated_model();
    model
        .connect_instrument(SIMULATED_SIGNAL_GENERATOR, "PSG E8257D")
        .await
        .unwrap();
    let device = manager.device(SIMULATED_SIGNAL_GENERATOR).unwrap();
    device.clear_commands();

    model
        .load_test_plan(parse(
            "# instrument_type: signal_generator\nduration,frequency,power\n0,1e9,0\n0,100e3,0\n",
        ))
        .unwrap();
    let err = model.run_test(1).await.unwrap_err();

    assert!(err.to_string().contains("outside supported range"));
    assert_eq!(model.state(), EquipmentState::Error);
    assert_eq!(
        device.commands(),
        vec!["FREQ 1000000000.000000", "POW 0.00", "OUTP ON", "OUTP OFF"]
    );
}

#[tokio::test]
async fn test_device_failure_mid_run_recovers_through_disconnect() {
    let (manager, model) = simulated_model();
    model
        .connect_instrument(SIMULATED_POWER_SUPPLY, "power_supply")
        .await
        .unwrap();
    let device = manager.device(SIMULATED_POWER_SUPPLY).unwrap();

    model
        .load_test_plan(parse(
            "# instrument_type: power_supply\nduration,voltage,current\n0,5,1\n",
        ))
        .unwrap();
    device.trigger_failure();
    let err = model.run_test(1).await.unwrap_err();
    assert!(err.is_instrument_failure());
    assert_eq!(model.state(), EquipmentState::Error);
    // Output still switched off after the failed write.
    assert_eq!(device.commands().last().map(String::as_str), Some("OUTP OFF"));

    model.disconnect().await.unwrap();
    assert_eq!(model.state(), EquipmentState::Unknown);
    model
        .connect_instrument(SIMULATED_POWER_SUPPLY, "power_supply")
        .await
        .unwrap();
    model.run_test(1).await.unwrap();
    assert_eq!(model.state(), EquipmentState::Idle);
}

#[tokio::test]
async fn test_lost_link_skips_output_shutdown() {
    let (manager, model) = simulated_model();
    model
        .connect_instrument(SIMULATED_POWER_SUPPLY, "power_supply")
        .await
        .unwrap();
    let device = manager.device(SIMULATED_POWER_SUPPLY).unwrap();
    let link = Arc::clone(&device);
    model.register_progress_callback(move |_, _, _| link.drop_connection());

    model
        .load_test_plan(parse(
            "# instrument_type: power_supply\nduration,voltage,current\n0,5,1\n",
        ))
        .unwrap();
    device.clear_commands();
    model.run_test(1).await.unwrap();

    assert_eq!(device.commands(), vec!["VOLT 5.000", "CURR 1.000", "OUTP ON"]);
    assert!(!model.instrument().unwrap().is_connected());
}
