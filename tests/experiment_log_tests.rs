use std::fs;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use ffteis::core::{FitResult, ImpedanceSpectrum};
use ffteis::error::EisError;
use ffteis::experiment::{
    Experiment, ExperimentLog, ExperimentMetadata, Observations, FITS_FILE, METADATA_FILE,
    TIMES_FILE,
};
use ffteis::observability::MonitorEvent;
use rustfft::num_complex::Complex64;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn spectrum(seconds: i64) -> ImpedanceSpectrum {
    ImpedanceSpectrum::new(
        at(seconds),
        vec![10.0, 100.0],
        vec![Complex64::new(1100.0, -40.0), Complex64::new(150.0, -300.0)],
    )
    .unwrap()
}

fn fitted(seconds: i64, params: &[(&str, f64)]) -> ImpedanceSpectrum {
    let mut s = spectrum(seconds);
    s.set_fit(Some(FitResult::new(
        params.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
    )));
    s
}

fn metadata() -> ExperimentMetadata {
    ExperimentMetadata {
        waveform: "10_100_2".to_string(),
        frequencies: vec![10.0, 100.0],
        vpp: 0.05,
        reference_correction: true,
        calibration: None,
        fitting: None,
    }
}

fn lines(path: &std::path::Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_append_writes_spectrum_times_and_metadata_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut experiment = Experiment::at(dir.path().join("run"), None).with_metadata(metadata());

    assert_eq!(experiment.append_spectrum(spectrum(0)).unwrap(), 1);
    let metadata_path = experiment.dir().join(METADATA_FILE);
    let first_metadata = fs::read_to_string(&metadata_path).unwrap();
    fs::write(&metadata_path, "overwritten by operator").unwrap();

    assert_eq!(
        experiment
            .append_spectrum(spectrum(1).with_name("A_000002"))
            .unwrap(),
        2
    );

    let run = experiment.dir();
    assert!(run.join("000001.txt").exists());
    assert!(run.join("A_000002.txt").exists());
    assert_eq!(
        fs::read_to_string(&metadata_path).unwrap(),
        "overwritten by operator"
    );
    let parsed: ExperimentMetadata = serde_json::from_str(&first_metadata).unwrap();
    assert_eq!(parsed, metadata());

    let times = lines(&run.join(TIMES_FILE));
    assert_eq!(times.len(), 2);
    assert_eq!(times[0], "2023-11-14T22:13:20.000000Z");
    assert!(!run.join(FITS_FILE).exists());

    let reread = ImpedanceSpectrum::from_file(run.join("000001.txt"), at(0)).unwrap();
    assert_eq!(reread.impedance(), spectrum(0).impedance());
}

#[test]
fn test_fit_header_locks_after_first_fit() {
    let dir = tempfile::tempdir().unwrap();
    let mut experiment = Experiment::at(dir.path(), None);

    experiment
        .append_spectrum(fitted(0, &[("R1", 1.0), ("R2", 2.0), ("C1", 3.0)]))
        .unwrap();
    let result = experiment.append_spectrum(fitted(1, &[("R1", 1.0), ("R2", 2.0)]));

    match result {
        Err(EisError::SchemaViolation { expected, found }) => {
            assert_eq!(expected, vec!["R1", "R2", "C1"]);
            assert_eq!(found, vec!["R1", "R2"]);
        }
        other => panic!("expected SchemaViolation, got {:?}", other),
    }
    assert_eq!(
        lines(&dir.path().join(FITS_FILE)),
        vec![
            "file,time,R1,R2,C1".to_string(),
            "000001.txt,2023-11-14T22:13:20.000000Z,1,2,3".to_string(),
        ]
    );
    assert_eq!(experiment.count(), 1);
    assert!(experiment.is_halted());

    let halted = experiment.append_spectrum(spectrum(2));
    assert!(matches!(halted, Err(EisError::AppendHalted)));
    assert!(!dir.path().join("000002.txt").exists());

    experiment.acknowledge_schema_violation();
    tokio_test::assert_ok!(experiment.append_spectrum(spectrum(3)));
}

#[test]
fn test_reordered_parameters_follow_header_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut experiment = Experiment::at(dir.path(), None);

    experiment
        .append_spectrum(fitted(0, &[("R1", 1.0), ("R2", 2.0), ("C1", 3.0)]))
        .unwrap();
    experiment
        .append_spectrum(fitted(1, &[("C1", 30.0), ("R1", 10.0), ("R2", 20.0)]))
        .unwrap();

    let rows = lines(&dir.path().join(FITS_FILE));
    assert_eq!(rows[2], "000002.txt,2023-11-14T22:13:21.000000Z,10,20,30");
}

#[test]
fn test_existing_fit_history_locks_header() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join(FITS_FILE),
        "file,time,Rs,Rct,Cdl,n_dl,Cads,n_ads\n",
    )
    .unwrap();
    let mut experiment = Experiment::at(dir.path(), None);

    let result = experiment.append_spectrum(fitted(0, &[("R1", 1.0), ("R2", 2.0), ("C1", 3.0)]));
    assert!(matches!(result, Err(EisError::SchemaViolation { .. })));
    assert_eq!(lines(&dir.path().join(FITS_FILE)).len(), 1);
    assert!(!dir.path().join("000001.txt").exists());
}

#[test]
fn test_out_of_order_and_empty_spectra_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut experiment = Experiment::at(dir.path(), None);
    experiment.append_spectrum(spectrum(10)).unwrap();

    assert!(matches!(
        experiment.append_spectrum(spectrum(10)),
        Err(EisError::OutOfOrder { .. })
    ));
    assert!(matches!(
        experiment.append_spectrum(spectrum(5)),
        Err(EisError::OutOfOrder { .. })
    ));

    let empty = ImpedanceSpectrum::new(at(20), vec![], vec![]).unwrap();
    assert!(matches!(
        experiment.append_spectrum(empty),
        Err(EisError::SpectrumEmpty(_))
    ));
    assert_eq!(experiment.count(), 1);
    assert!(!experiment.is_halted());
}

#[test]
fn test_save_as_copies_spectra_into_named_folder() {
    let dir = tempfile::tempdir().unwrap();
    let now = Local.with_ymd_and_hms(2024, 5, 2, 14, 3, 9).unwrap();
    let mut live = Experiment::autosave(dir.path(), now);
    assert!(live.dir().ends_with("2024-05-02/autosave/14-03-09"));

    live.append_spectrum(spectrum(0)).unwrap();
    live.append_spectrum(spectrum(1)).unwrap();

    let saved = live.save_as(dir.path(), "glucose", now).unwrap();
    assert_eq!(saved.name(), Some("glucose"));
    assert_eq!(saved.dir(), dir.path().join("2024-05-02").join("glucose"));
    assert_eq!(saved.count(), 2);
    assert!(saved.dir().join("000002.txt").exists());
    assert_eq!(lines(&saved.dir().join(TIMES_FILE)).len(), 2);
}

#[tokio::test]
async fn test_log_counts_every_observation() {
    let dir = tempfile::tempdir().unwrap();
    let log = ExperimentLog::new(Experiment::at(dir.path(), None));
    let events = log.events();

    log.append(spectrum(0)).unwrap();
    log.record_rejection("spectrum empty");
    assert_eq!(
        log.observations(),
        Observations {
            stored: 1,
            rejected: 1
        }
    );

    log.wait_for_observations(2, Duration::from_millis(50))
        .await
        .unwrap();
    let stalled = log.wait_for_observations(3, Duration::from_millis(30)).await;
    assert!(matches!(stalled, Err(EisError::ProcessingStalled(_))));

    let drained: Vec<MonitorEvent> = events.try_iter().collect();
    assert_eq!(drained.len(), 2);
    assert!(matches!(drained[0], MonitorEvent::SpectrumStored { index: 1, .. }));
    assert!(matches!(drained[1], MonitorEvent::SpectrumRejected { .. }));
}

#[tokio::test]
async fn test_waiter_wakes_when_observation_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let log = ExperimentLog::new(Experiment::at(dir.path(), None));

    let writer = log.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.append(spectrum(0)).unwrap();
    });

    log.wait_for_observations(1, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(log.count(), 1);
    assert_eq!(log.latest().unwrap().timestamp(), at(0));
}

#[test]
fn test_log_schema_violation_halts_and_emits_event() {
    let dir = tempfile::tempdir().unwrap();
    let log = ExperimentLog::new(Experiment::at(dir.path(), None));
    let events = log.events();

    log.append(fitted(0, &[("R1", 1.0)])).unwrap();
    assert!(log.append(fitted(1, &[("R2", 1.0)])).is_err());
    assert!(log.is_halted());
    assert!(events
        .try_iter()
        .any(|e| matches!(e, MonitorEvent::AppendHalted { .. })));

    log.acknowledge_schema_violation();
    assert!(!log.is_halted());
    assert_eq!(log.spectra_since(0).len(), 1);
}

#[test]
fn test_set_experiment_returns_previous() {
    let dir = tempfile::tempdir().unwrap();
    let log = ExperimentLog::new(Experiment::at(dir.path().join("first"), None));
    log.append(spectrum(0)).unwrap();

    let previous = log.set_experiment(Experiment::at(dir.path().join("second"), None));
    assert_eq!(previous.count(), 1);
    assert_eq!(log.count(), 0);
    assert!(matches!(
        log.events().try_iter().last(),
        Some(MonitorEvent::ExperimentStarted { .. })
    ));
}

#[test]
fn test_full_monitor_feed_keeps_newest_events() {
    let dir = tempfile::tempdir().unwrap();
    let log = ExperimentLog::new(Experiment::at(dir.path(), None));
    let events = log.events();

    for _ in 0..1100 {
        log.record_rejection("spectrum empty");
    }
    log.append(spectrum(0)).unwrap();

    let drained: Vec<MonitorEvent> = events.try_iter().collect();
    assert_eq!(drained.len(), 1024);
    assert!(matches!(
        drained.last(),
        Some(MonitorEvent::SpectrumStored { index: 1, .. })
    ));
}

#[test]
fn test_failed_time_append_leaves_no_spectrum_file() {
    let dir = tempfile::tempdir().unwrap();
    let run = dir.path().join("run");
    fs::create_dir_all(run.join(TIMES_FILE)).unwrap();
    let mut experiment = Experiment::at(&run, None).with_metadata(metadata());

    let result = experiment.append_spectrum(spectrum(0));
    assert!(matches!(result, Err(EisError::Io(_))));
    assert_eq!(experiment.count(), 0);
    assert!(!run.join("000001.txt").exists());
    assert!(!run.join(METADATA_FILE).exists());

    fs::remove_dir(run.join(TIMES_FILE)).unwrap();
    assert_eq!(experiment.append_spectrum(spectrum(1)).unwrap(), 1);
    assert!(run.join("000001.txt").exists());
    assert!(run.join(METADATA_FILE).exists());
    assert_eq!(lines(&run.join(TIMES_FILE)).len(), 1);
}

#[test]
fn test_failed_fit_append_rolls_back_time_entry() {
    let dir = tempfile::tempdir().unwrap();
    let log = ExperimentLog::new(Experiment::at(dir.path(), None));
    log.append(fitted(0, &[("R1", 1.0)])).unwrap();

    fs::remove_file(dir.path().join(FITS_FILE)).unwrap();
    fs::create_dir(dir.path().join(FITS_FILE)).unwrap();

    assert!(log.append(fitted(1, &[("R1", 2.0)])).is_err());
    assert_eq!(log.count(), 1);
    assert_eq!(log.observations().stored, 1);
    assert!(!dir.path().join("000002.txt").exists());
    assert_eq!(lines(&dir.path().join(TIMES_FILE)).len(), 1);
}
