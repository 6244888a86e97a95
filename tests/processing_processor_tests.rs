use std::sync::Arc;
use std::time::Duration;

use ffteis::buffers::FrameBuffer;
use ffteis::core::{AbortSignal, Waveform};
use ffteis::experiment::{Experiment, ExperimentLog};
use ffteis::hal::mock::SimulatedBench;
use ffteis::hal::{Digitizer, WaveformDriver};
use ffteis::observability::StageMetrics;
use ffteis::processing::{AppliedWaveform, CalibrationFactors, ProcessingContext, SpectrumProcessor};

async fn captured_frames(bench: &SimulatedBench, waveform: &Waveform, n: usize) -> Vec<ffteis::core::Frame> {
    bench.apply(waveform, 0.02).await.unwrap();
    let mut frames = Vec::new();
    for _ in 0..n {
        frames.push(bench.arm_and_capture(Duration::from_secs(1)).await.unwrap());
    }
    frames
}

#[tokio::test]
async fn test_processor_drains_buffer_and_counts_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let bench = SimulatedBench::new();
    let waveform = Waveform::from_frequencies(&[100.0, 1000.0]).unwrap();
    let frames = captured_frames(&bench, &waveform, 3).await;

    let buffer = FrameBuffer::new();
    let context = ProcessingContext::new(true, false);
    let log = ExperimentLog::new(Experiment::at(dir.path(), None));
    let metrics = Arc::new(StageMetrics::new());
    let shutdown = AbortSignal::new();
    let handle = SpectrumProcessor::new(
        buffer.clone(),
        context.clone(),
        log.clone(),
        metrics.clone(),
        Duration::from_millis(5),
    )
    .spawn(shutdown.clone());

    let mut frames = frames.into_iter();
    buffer.push(frames.next().unwrap());
    log.wait_for_observations(1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(log.observations().rejected, 1);
    assert_eq!(metrics.spectra_rejected(), 1);

    context.apply(AppliedWaveform {
        calibration: CalibrationFactors::neutral(&waveform.frequencies()),
        waveform,
        vpp: 0.02,
    });
    for frame in frames {
        buffer.push(frame);
    }
    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(buffer.is_empty());
    assert_eq!(log.observations().stored, 2);
    assert_eq!(metrics.spectra_stored(), 2);
    assert_eq!(log.count(), 2);
}
