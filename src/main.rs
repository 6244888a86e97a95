use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ffteis::config::EisConfig;
use ffteis::core::Waveform;
use ffteis::engine::EisRuntime;
use ffteis::hal::mock::SimulatedBench;
use ffteis::hal::FileTrigger;
use ffteis::logging::init_tracing;
use ffteis::observability::{ExperimentMonitor, MonitorQuantity};
use ffteis::sequencer::ScriptedConcentrations;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => EisConfig::load(&path)?,
        None => EisConfig::default(),
    };
    init_tracing(config.logging.level);

    println!("FFT-EIS - Simulated Bench Demo");
    println!("==============================\n");

    let bench = SimulatedBench::new();
    bench.configure(serde_json::json!({
        "sample_rate": 100000.0,
        "noise": 1e-4,
        "latency_ms": 20,
        "topology": "RRC",
        "values": [100.0, 1000.0, 1e-6]
    }))?;
    let trigger_path = config.paths.trigger_file.clone();
    let trigger = Arc::new(FileTrigger::new(&trigger_path));

    // Stand-in for the external application that drops the trigger file.
    let toucher = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        loop {
            interval.tick().await;
            if let Err(e) = tokio::fs::write(&trigger_path, b"").await {
                tracing::warn!("Failed to write trigger file {:?}: {}", trigger_path, e);
            }
        }
    });

    let runtime = EisRuntime::new(
        config.clone(),
        Arc::new(bench.clone()),
        Arc::new(bench.clone()),
        trigger,
    );
    runtime.start().await?;

    let waveform = Waveform::generate(10.0, 5000.0, 12).context("Failed to generate waveform")?;
    println!("Applying waveform {} ({} tones)", waveform.name(), waveform.tones().len());
    runtime
        .apply_waveform(waveform, config.acquisition.amplitude_mv)
        .await?;

    let spectrum = runtime.record_single().await?;
    println!("\nSingle spectrum:");
    print!("{}", spectrum.to_text());

    let mut monitor = ExperimentMonitor::new(MonitorQuantity::Magnitude { frequency: 10.0 });
    let events = runtime.log().events();

    let summary = runtime
        .record_duration(Some("demo"), Duration::from_millis(500))
        .await?;
    monitor.drain(&events);
    println!(
        "\nTimed recording: {} frames, |Z(10 Hz)| series has {} points",
        summary.captured,
        monitor.series("all").len()
    );

    let sensors = vec!["A".to_string(), "B".to_string()];
    let mut concentrations = ScriptedConcentrations::new(["0uM", "10uM"]);
    let outcome = runtime
        .multiplex_titration(sensors, "demo-titration", &mut concentrations)
        .await?;
    println!("Titration ended: {:?}", outcome);

    println!("\n{}", runtime.metrics().generate_report());
    toucher.abort();
    runtime.shutdown().await?;
    Ok(())
}
