use std::f64::consts::PI;

use chrono::Utc;
use ffteis::core::{ChannelScaling, Frame, RecordingParams, Waveform};
use ffteis::error::EisError;
use ffteis::processing::{CalibrationFactors, SignalExtractor};

const FS: f64 = 100_000.0;

/// Frame sampled at `t_i = i / FS` for `duration` seconds; channel 2 holds
/// the monitor voltage of the current `i(t)` with a 1 A/V range.
fn synth_frame(duration: f64, v: impl Fn(f64) -> f64, i: impl Fn(f64) -> f64) -> Frame {
    let n = (duration * FS).round() as usize;
    let t: Vec<f64> = (0..n).map(|k| k as f64 / FS).collect();
    let params = RecordingParams {
        sample_rate: FS,
        frame_duration: n as f64 / FS,
        current_range: 1.0,
        channel1: ChannelScaling::default(),
        channel2: ChannelScaling::default(),
    };
    Frame::new(
        Utc::now(),
        params,
        t.iter().map(|&t| v(t)).collect(),
        t.iter().map(|&t| -i(t)).collect(),
    )
    .unwrap()
}

fn sine(freq: f64, amp: f64) -> impl Fn(f64) -> f64 {
    move |t| amp * (2.0 * PI * freq * t).sin()
}

#[test]
fn test_megaohm_scenario_drops_uninjected_tone() {
    let waveform = Waveform::from_frequencies(&[10.0, 31.6, 100.0]).unwrap();
    let frame = synth_frame(
        0.1001,
        |t| sine(10.0, 1.0)(t) + sine(100.0, 0.5)(t),
        sine(10.0, 1e-6),
    );

    let spectrum = SignalExtractor::new()
        .extract(&frame, &waveform, None)
        .unwrap();

    assert!(!spectrum.frequencies().contains(&31.6));
    let (f, z) = spectrum.at_frequency(10.0).unwrap();
    assert_eq!(f, 10.0);
    assert!((z.norm() - 1e6).abs() / 1e6 < 1e-6, "|Z| = {}", z.norm());
}

#[test]
fn test_result_frequencies_are_applied_frequencies() {
    let applied = [10.0, 20.0, 25.5, 30.0, 70.0];
    let waveform = Waveform::from_frequencies(&applied).unwrap();
    let frame = synth_frame(
        0.12,
        |t| applied.iter().map(|&f| sine(f, 0.1)(t)).sum(),
        |t| applied.iter().map(|&f| sine(f, 1e-4)(t)).sum(),
    );

    let spectrum = SignalExtractor::new()
        .extract(&frame, &waveform, None)
        .unwrap();

    for f in spectrum.frequencies() {
        assert!(applied.contains(f), "{} Hz was never applied", f);
    }
    assert!(!spectrum.frequencies().contains(&25.5));
    assert_eq!(spectrum.frequencies(), &[10.0, 20.0, 30.0, 70.0]);
    for z in spectrum.impedance() {
        assert!((z.norm() - 1000.0).abs() < 1e-6);
        assert!(z.arg().abs() < 1e-9);
    }
}

#[test]
fn test_frame_shorter_than_slowest_period_is_rejected() {
    let waveform = Waveform::from_frequencies(&[10.0, 100.0]).unwrap();
    let frame = synth_frame(0.05, sine(10.0, 1.0), sine(10.0, 1e-3));

    let result = SignalExtractor::new().extract(&frame, &waveform, None);
    assert!(matches!(result, Err(EisError::SpectrumEmpty(_))));
}

#[test]
fn test_frame_of_exactly_one_slow_period_is_enough() {
    let waveform = Waveform::from_frequencies(&[10.0, 100.0]).unwrap();
    let frame = synth_frame(
        0.1,
        |t| sine(10.0, 1.0)(t) + sine(100.0, 1.0)(t),
        |t| sine(10.0, 1e-3)(t) + sine(100.0, 1e-3)(t),
    );
    assert_eq!(frame.len(), 10_000);

    let spectrum = SignalExtractor::new()
        .extract(&frame, &waveform, None)
        .unwrap();
    assert_eq!(spectrum.frequencies(), &[10.0, 100.0]);
    for z in spectrum.impedance() {
        assert!((z.norm() - 1000.0).abs() < 1e-6, "|Z| = {}", z.norm());
    }
}

#[test]
fn test_no_current_means_empty_spectrum() {
    let waveform = Waveform::from_frequencies(&[10.0]).unwrap();
    let frame = synth_frame(0.11, sine(10.0, 1.0), |_| 0.0);

    let result = SignalExtractor::new().extract(&frame, &waveform, None);
    assert!(matches!(result, Err(EisError::SpectrumEmpty(_))));
}

#[test]
fn test_calibration_divides_magnitude_and_shifts_phase() {
    let waveform = Waveform::from_frequencies(&[10.0, 50.0]).unwrap();
    let frame = synth_frame(
        0.11,
        |t| sine(10.0, 1.0)(t) + sine(50.0, 1.0)(t),
        |t| sine(10.0, 1e-3)(t) + sine(50.0, 1e-3)(t),
    );
    let factors = CalibrationFactors::new(vec![10.0, 50.0], vec![2.0, 0.5], vec![10.0, -20.0]).unwrap();
    let extractor = SignalExtractor::new();

    let raw = extractor.extract(&frame, &waveform, None).unwrap();
    let corrected = extractor.extract(&frame, &waveform, Some(&factors)).unwrap();

    let raw_mag = raw.magnitude();
    let cor_mag = corrected.magnitude();
    assert!((cor_mag[0] - raw_mag[0] / 2.0).abs() < 1e-6);
    assert!((cor_mag[1] - raw_mag[1] / 0.5).abs() < 1e-6);
    assert!((corrected.phase_deg()[0] - (raw.phase_deg()[0] - 10.0)).abs() < 1e-9);
    assert!((corrected.phase_deg()[1] - (raw.phase_deg()[1] + 20.0)).abs() < 1e-9);
}

#[test]
fn test_label_becomes_spectrum_name() {
    let waveform = Waveform::from_frequencies(&[10.0]).unwrap();
    let frame = synth_frame(0.11, sine(10.0, 1.0), sine(10.0, 1e-3)).with_label("A_000003.txt");

    let spectrum = SignalExtractor::new()
        .extract(&frame, &waveform, None)
        .unwrap();
    assert_eq!(spectrum.name(), Some("A_000003.txt"));
}
