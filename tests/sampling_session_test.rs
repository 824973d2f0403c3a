//! End-to-end monitoring sessions against simulated instruments
//!
//! Run with: cargo test --test sampling_session_test

use async_trait::async_trait;
use nsim_daq::adapters::{line_responder, MockAdapter, MockHandle, ModbusBusSim, SharedPort};
use nsim_daq::data::{CsvLogger, DataLogger, PlotBuffer, Plotter};
use nsim_daq::error::{AppResult, DaqError};
use nsim_daq::instrument::{
    DeviceRole, DeviceState, FlowController, Hygrometer, Register, TemperatureProbe,
};
use nsim_daq::measurement::Reading;
use nsim_daq::orchestrator::{SessionState, SetpointOutcome};
use nsim_daq::SamplingOrchestrator;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const HYGROMETER_LINE: &str =
    "11/13/25  13:41:50   DP =    2.0 C  AT  =   24.1 C  RH  =   23.5    SERVOLOCK";

fn mfc_bus() -> ModbusBusSim {
    let bus = ModbusBusSim::new();
    bus.set_float(1, Register::Flow.address(), 100.0)
        .set_float(1, Register::Setpoint.address(), 100.0)
        .set_float(2, Register::Flow.address(), 40.0)
        .set_float(2, Register::Setpoint.address(), 50.0);
    bus
}

/// One port carrying both flow controllers
fn shared_bus(bus: &ModbusBusSim) -> (SharedPort, MockHandle) {
    let (adapter, mock) = MockAdapter::new("/dev/ttyUSB0");
    (SharedPort::new(Box::new(adapter.with_responder(bus.responder()))), mock)
}

fn hygrometer() -> (Hygrometer, MockHandle) {
    let (adapter, mock) = MockAdapter::new("/dev/ttyUSB2");
    let adapter = adapter.with_responder(line_responder(|cmd| {
        (cmd == "P").then(|| HYGROMETER_LINE.to_string())
    }));
    let dev = Hygrometer::new("hygrometer", SharedPort::new(Box::new(adapter)))
        .with_settle(Duration::ZERO);
    (dev, mock)
}

fn probe(latency: Duration) -> (TemperatureProbe, MockHandle) {
    let (adapter, mock) = MockAdapter::new("/dev/ttyUSB3");
    let adapter = adapter
        .with_latency(latency)
        .with_responder(line_responder(|cmd| (cmd == "T").then(|| "23.4".to_string())));
    let dev = TemperatureProbe::new("temperature_probe", SharedPort::new(Box::new(adapter)))
        .with_settle(Duration::ZERO);
    (dev, mock)
}

fn flow_controller(id: &str, port: SharedPort, station: u8) -> FlowController {
    FlowController::new(id, port, station).with_settle(Duration::ZERO)
}

/// Keeps every logged reading with the (tokio) time it arrived
#[derive(Default)]
struct RecordingLogger {
    started: Vec<Vec<String>>,
    rows: Vec<(Instant, Reading)>,
    closed: bool,
    fail_rows: bool,
}

#[async_trait]
impl DataLogger for RecordingLogger {
    async fn start_new_log(&mut self, field_names: &[&str]) -> AppResult<()> {
        self.started.push(field_names.iter().map(|f| f.to_string()).collect());
        Ok(())
    }

    async fn log_data(&mut self, reading: &Reading) -> AppResult<()> {
        if self.fail_rows {
            return Err(DaqError::Storage("disk full".to_string()));
        }
        self.rows.push((Instant::now(), reading.clone()));
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Default)]
struct CountingPlotter {
    points: usize,
}

impl Plotter for CountingPlotter {
    fn add_data_point(&mut self, _reading: &Reading) {
        self.points += 1;
    }
}

fn stop_after(delay: Duration) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(true);
    });
    rx
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_device_leaves_its_channels_blank() {
    let bus = mfc_bus();
    let (dry_port, _dry_mock) = shared_bus(&bus);
    let (wet_adapter, wet_mock) = MockAdapter::new("/dev/ttyUSB1");
    wet_mock.fail_open(true);
    let wet_port = SharedPort::new(Box::new(wet_adapter.with_responder(bus.responder())));
    let (hygro, _h) = hygrometer();
    let (probe, _p) = probe(Duration::ZERO);

    let mut orchestrator = SamplingOrchestrator::new()
        .with_device(DeviceRole::CellTemperature, Box::new(probe))
        .with_device(DeviceRole::Hygrometer, Box::new(hygro))
        .with_device(DeviceRole::WetFlow, Box::new(flow_controller("wet_mfc", wet_port, 2)))
        .with_device(DeviceRole::DryFlow, Box::new(flow_controller("dry_mfc", dry_port, 1)));

    let report = orchestrator.connect_devices().await;
    assert!(!report.all_connected);
    let failed: Vec<_> = report.failed().map(|d| d.role).collect();
    assert_eq!(failed, vec![DeviceRole::WetFlow]);
    assert_eq!(
        report.devices.iter().map(|d| d.role).collect::<Vec<_>>(),
        DeviceRole::ORDER.to_vec()
    );
    assert_eq!(orchestrator.state(), SessionState::Monitoring);

    let reading = orchestrator.read_all().await;
    assert_eq!(reading.dry_flow, Some(100.0));
    assert_eq!(reading.dry_setpoint, Some(100.0));
    assert_eq!(reading.wet_flow, None);
    assert_eq!(reading.wet_setpoint, None);
    assert_eq!(reading.dewpoint_temp, Some(2.0));
    assert_eq!(reading.ambient_temp, Some(24.1));
    assert_eq!(reading.relative_humidity, Some(23.5));
    assert_eq!(reading.cell_temp, Some(23.4));

    let text = reading.to_string();
    assert!(text.contains("Wet Air: --"));
    assert!(text.contains("Humidity: 23.5"));
}

#[tokio::test]
async fn test_two_controllers_share_one_bus() {
    let bus = mfc_bus();
    let (port, mock) = shared_bus(&bus);
    let mut orchestrator = SamplingOrchestrator::new()
        .with_device(DeviceRole::DryFlow, Box::new(flow_controller("dry_mfc", port.clone(), 1)))
        .with_device(DeviceRole::WetFlow, Box::new(flow_controller("wet_mfc", port.clone(), 2)));

    assert!(orchestrator.connect_devices().await.all_connected);
    assert_eq!(port.leases().await, 2);
    assert_eq!(mock.open_count(), 1);

    let reading = orchestrator.read_all().await;
    assert_eq!(reading.dry_flow, Some(100.0));
    assert_eq!(reading.wet_flow, Some(40.0));
    assert_eq!(reading.wet_setpoint, Some(50.0));

    // Requests are addressed to stations 1 then 2, never interleaved
    let stations: Vec<u8> = mock.writes().iter().map(|w| w[0]).collect();
    assert_eq!(stations, vec![1, 1, 2, 2]);

    orchestrator.shutdown().await;
    assert_eq!(port.leases().await, 0);
    assert!(!mock.is_open());
}

#[tokio::test]
async fn test_setpoints_are_applied_independently() {
    let bus = mfc_bus();
    bus.reject_writes(1, true);
    let (port, _mock) = shared_bus(&bus);
    let mut orchestrator = SamplingOrchestrator::new()
        .with_device(DeviceRole::DryFlow, Box::new(flow_controller("dry_mfc", port.clone(), 1)))
        .with_device(DeviceRole::WetFlow, Box::new(flow_controller("wet_mfc", port, 2)));
    orchestrator.connect_devices().await;

    let report = orchestrator.set_flow_rates(Some(80.0), Some(20.0)).await;
    assert!(matches!(report.dry, SetpointOutcome::Failed(_)));
    assert_eq!(report.wet, SetpointOutcome::Applied(20.0));
    assert_eq!(bus.float(1, Register::Setpoint.address()), Some(100.0));
    assert_eq!(bus.float(2, Register::Setpoint.address()), Some(20.0));

    // A device exception is not a transport failure
    assert_eq!(orchestrator.device_state(DeviceRole::DryFlow), Some(DeviceState::Connected));

    // Sampling carries on with both controllers after the rejected write
    let reading = orchestrator.read_all().await;
    assert_eq!(reading.dry_flow, Some(100.0));
    assert_eq!(reading.dry_setpoint, Some(100.0));
    assert_eq!(reading.wet_flow, Some(40.0));
    assert_eq!(reading.wet_setpoint, Some(20.0));
}

#[tokio::test(start_paused = true)]
async fn test_device_failing_mid_session_is_skipped_then_released() {
    let (adapter, hygro_mock) = MockAdapter::new("/dev/ttyUSB2");
    let hygro_port = SharedPort::new(Box::new(adapter.with_responder(line_responder(|cmd| {
        (cmd == "P").then(|| HYGROMETER_LINE.to_string())
    }))));
    let hygro = Hygrometer::new("hygrometer", hygro_port.clone()).with_settle(Duration::ZERO);
    let (probe, _p) = probe(Duration::ZERO);
    let mut orchestrator = SamplingOrchestrator::new()
        .with_device(DeviceRole::Hygrometer, Box::new(hygro))
        .with_device(DeviceRole::CellTemperature, Box::new(probe));
    assert!(orchestrator.connect_devices().await.all_connected);

    let first = orchestrator.read_all().await;
    assert_eq!(first.relative_humidity, Some(23.5));
    assert_eq!(first.cell_temp, Some(23.4));

    hygro_mock.fail_io(true);
    let second = orchestrator.read_all().await;
    assert_eq!(second.relative_humidity, None);
    assert_eq!(second.dewpoint_temp, None);
    assert_eq!(second.cell_temp, Some(23.4));
    assert_eq!(orchestrator.device_state(DeviceRole::Hygrometer), Some(DeviceState::Failed));

    // Failed devices are not polled again
    hygro_mock.fail_io(false);
    let polls = hygro_mock.writes().len();
    let third = orchestrator.read_all().await;
    assert_eq!(third.ambient_temp, None);
    assert_eq!(third.cell_temp, Some(23.4));
    assert_eq!(hygro_mock.writes().len(), polls);

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.device_state(DeviceRole::Hygrometer), Some(DeviceState::Disconnected));
    assert_eq!(hygro_port.leases().await, 0);
    assert!(!hygro_mock.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_cycles_keep_a_fixed_schedule_despite_slow_devices() {
    let (probe, _mock) = probe(Duration::from_millis(300));
    let mut orchestrator =
        SamplingOrchestrator::new().with_device(DeviceRole::CellTemperature, Box::new(probe));
    orchestrator.connect_devices().await;

    let mut logger = RecordingLogger::default();
    let mut plotter = CountingPlotter::default();
    let summary = orchestrator
        .run(
            Duration::from_secs(1),
            &mut logger,
            &mut plotter,
            stop_after(Duration::from_millis(3500)),
        )
        .await
        .unwrap();

    assert_eq!(summary.cycles, 4);
    assert_eq!(summary.log_failures, 0);
    assert_eq!(plotter.points, 4);
    assert_eq!(logger.rows.len(), 4);
    assert!(logger.rows.iter().all(|(_, r)| r.cell_temp == Some(23.4)));
    for pair in logger.rows.windows(2) {
        assert_eq!(pair[1].0 - pair[0].0, Duration::from_secs(1));
    }

    assert_eq!(logger.started.len(), 1);
    assert_eq!(logger.started[0][0], "timestamp");
    assert!(logger.closed);
    assert_eq!(orchestrator.state(), SessionState::Stopped);
    assert_eq!(
        orchestrator.device_state(DeviceRole::CellTemperature),
        Some(DeviceState::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_log_failures_do_not_end_the_session() {
    let (probe, _mock) = probe(Duration::ZERO);
    let mut orchestrator =
        SamplingOrchestrator::new().with_device(DeviceRole::CellTemperature, Box::new(probe));
    orchestrator.connect_devices().await;

    let mut logger = RecordingLogger {
        fail_rows: true,
        ..Default::default()
    };
    let mut plotter = CountingPlotter::default();
    let summary = orchestrator
        .run(
            Duration::from_secs(1),
            &mut logger,
            &mut plotter,
            stop_after(Duration::from_millis(2500)),
        )
        .await
        .unwrap();

    assert_eq!(summary.cycles, 3);
    assert_eq!(summary.log_failures, 3);
    assert_eq!(plotter.points, 3);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_stop_sender_ends_the_session() {
    let (probe, _mock) = probe(Duration::ZERO);
    let mut orchestrator =
        SamplingOrchestrator::new().with_device(DeviceRole::CellTemperature, Box::new(probe));
    orchestrator.connect_devices().await;

    let (tx, rx) = watch::channel(false);
    drop(tx);
    let summary = orchestrator
        .run(
            Duration::from_secs(1),
            &mut RecordingLogger::default(),
            &mut CountingPlotter::default(),
            rx,
        )
        .await
        .unwrap();
    assert_eq!(summary.cycles, 0);
    assert_eq!(orchestrator.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_run_requires_connected_session() {
    let (probe, _mock) = probe(Duration::ZERO);
    let mut orchestrator =
        SamplingOrchestrator::new().with_device(DeviceRole::CellTemperature, Box::new(probe));
    let (_tx, rx) = watch::channel(false);

    let err = orchestrator
        .run(
            Duration::from_secs(1),
            &mut RecordingLogger::default(),
            &mut CountingPlotter::default(),
            rx.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::InvalidState(_)));

    orchestrator.connect_devices().await;
    let err = orchestrator
        .run(
            Duration::ZERO,
            &mut RecordingLogger::default(),
            &mut CountingPlotter::default(),
            rx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::InvalidState(_)));
}

#[tokio::test(start_paused = true)]
async fn test_session_writes_csv_and_plot_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let bus = mfc_bus();
    let (port, _mock) = shared_bus(&bus);
    let (hygro, _h) = hygrometer();
    let mut orchestrator = SamplingOrchestrator::new()
        .with_device(DeviceRole::DryFlow, Box::new(flow_controller("dry_mfc", port, 1)))
        .with_device(DeviceRole::Hygrometer, Box::new(hygro));
    orchestrator.connect_devices().await;

    let mut logger = CsvLogger::new(dir.path(), "nsim_log");
    let mut plot = PlotBuffer::new(2);
    let snapshots = plot.subscribe();
    let summary = orchestrator
        .run(
            Duration::from_secs(1),
            &mut logger,
            &mut plot,
            stop_after(Duration::from_millis(2500)),
        )
        .await
        .unwrap();
    assert_eq!(summary.cycles, 3);

    let path = logger.current_path().unwrap().to_path_buf();
    let rows = CsvLogger::read_log(&path).unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row["dry_flow"], "100");
        assert_eq!(row["wet_flow"], "");
        assert_eq!(row["relative_humidity"], "23.5");
        assert!(row["timestamp"].ends_with('Z'));
    }

    let snapshot = snapshots.borrow().clone();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.latest().unwrap().dewpoint_temp, Some(2.0));
}
