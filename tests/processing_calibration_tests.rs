use std::fs::{self, File};
use std::time::{Duration, SystemTime};

use chrono::{NaiveDate, Utc};
use ffteis::core::{ImpedanceSpectrum, Waveform};
use ffteis::processing::{CalibrationFactors, CalibrationStore};
use rustfft::num_complex::Complex64;

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()
}

fn factors(freqs: &[f64], m: f64, p: f64) -> CalibrationFactors {
    CalibrationFactors::new(freqs.to_vec(), vec![m; freqs.len()], vec![p; freqs.len()]).unwrap()
}

#[test]
fn test_missing_directory_gives_neutral_factors() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path().join("does-not-exist"));
    let waveform = Waveform::from_frequencies(&[10.0, 100.0]).unwrap();

    let loaded = store.load(&waveform);
    assert!(loaded.is_neutral());
    assert_eq!(loaded.frequencies(), &[10.0, 100.0]);
    assert!(loaded.source().is_none());
}

#[test]
fn test_saved_file_is_loaded_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path());
    let waveform = Waveform::from_frequencies(&[10.0, 100.0, 1000.0]).unwrap();
    let saved = factors(&waveform.frequencies(), 1.25, -4.0);

    let path = store.save(&waveform, 10_000.0, &saved, date()).unwrap();
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        "2024-03-14-10_1000_3-10000Ohm.csv"
    );

    let loaded = store.load(&waveform);
    assert_eq!(loaded.factor_at(100.0), (1.25, -4.0));
    assert_eq!(loaded.source(), Some(path.as_path()));
}

#[test]
fn test_newest_calibration_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path());
    let waveform = Waveform::from_frequencies(&[10.0, 100.0]).unwrap();
    let freqs = waveform.frequencies();

    let old = store.save(&waveform, 1000.0, &factors(&freqs, 2.0, 0.0), date()).unwrap();
    File::options()
        .write(true)
        .open(&old)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();
    store.save(&waveform, 5000.0, &factors(&freqs, 3.0, 0.0), date()).unwrap();

    assert_eq!(store.load(&waveform).factor_at(10.0).0, 3.0);
}

#[test]
fn test_optimized_waveform_shares_base_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path());
    let base = Waveform::from_frequencies(&[10.0, 100.0]).unwrap();
    store
        .save(&base, 1000.0, &factors(&base.frequencies(), 1.5, 2.0), date())
        .unwrap();

    let measured = ImpedanceSpectrum::new(
        Utc::now(),
        vec![10.0, 100.0],
        vec![Complex64::new(400.0, 0.0), Complex64::new(100.0, 0.0)],
    )
    .unwrap();
    let optimized = base.optimized_from(&measured).unwrap();
    assert!(optimized.name().ends_with("_opt"));

    assert_eq!(store.load(&optimized).factor_at(100.0), (1.5, 2.0));
}

#[test]
fn test_misaligned_file_falls_back_to_neutral() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path());
    let stored = Waveform::from_frequencies(&[10.0, 20.0, 100.0]).unwrap();
    let applied = Waveform::from_frequencies(&[10.0, 30.0, 100.0]).unwrap();
    assert_eq!(stored.canonical_name(), applied.canonical_name());

    store
        .save(&stored, 1000.0, &factors(&stored.frequencies(), 2.0, 5.0), date())
        .unwrap();
    assert!(store.load(&applied).is_neutral());
}

#[test]
fn test_unreadable_file_falls_back_to_neutral() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path());
    let waveform = Waveform::from_frequencies(&[10.0, 100.0]).unwrap();
    fs::write(dir.path().join("2024-03-14-10_100_2-1000Ohm.csv"), "garbage\n1,2\n").unwrap();

    assert!(store.load(&waveform).is_neutral());
}

#[test]
fn test_reference_factors_from_averaged_resistor() {
    let average = ImpedanceSpectrum::new(
        Utc::now(),
        vec![10.0, 100.0],
        vec![
            Complex64::from_polar(1100.0, (-2.0f64).to_radians()),
            Complex64::from_polar(990.0, 3.0f64.to_radians()),
        ],
    )
    .unwrap();

    let factors = CalibrationFactors::from_reference(&average, 1000.0).unwrap();
    let (m, p) = factors.factor_at(10.0);
    assert!((m - 1.1).abs() < 1e-12);
    assert!((p + 2.0).abs() < 1e-9);

    let corrected = factors.correct(100.0, average.impedance()[1]);
    assert!((corrected - Complex64::new(1000.0, 0.0)).norm() < 1e-9);
}
