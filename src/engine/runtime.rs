use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::acquisition::{AcquisitionLoop, RecordingSummary};
use crate::buffers::FrameBuffer;
use crate::config::EisConfig;
use crate::core::{AbortSignal, FitResult, ImpedanceSpectrum, Waveform};
use crate::error::{EisError, EisResult};
use crate::experiment::{Experiment, ExperimentLog, ExperimentMetadata};
use crate::fitting::{fit_with_timeout, CommandFitter, FitSetup};
use crate::hal::{Digitizer, TriggerSource, WaveformDriver};
use crate::observability::StageMetrics;
use crate::processing::{
    parse_resistance, AppliedWaveform, CalibrationFactors, CalibrationStore, ProcessingContext,
    SpectrumProcessor,
};
use crate::sequencer::{
    ConcentrationSource, InVivoSequencer, MultiplexBackend, MultiplexState, SequenceOutcome,
    TitrationSequencer,
};

/// User-level operations; at most one runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeAction {
    ApplyWaveform,
    RecordSingle,
    RecordDuration,
    RecordReference,
    Titration,
    InVivo,
    SaveAs,
    OptimizeWaveform,
}

impl RuntimeAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplyWaveform => "apply waveform",
            Self::RecordSingle => "single recording",
            Self::RecordDuration => "timed recording",
            Self::RecordReference => "reference recording",
            Self::Titration => "titration",
            Self::InVivo => "in-vivo run",
            Self::SaveAs => "save",
            Self::OptimizeWaveform => "waveform optimization",
        }
    }
}

/// Runtime status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Stopped,
    Idle,
    Busy(RuntimeAction),
}

/// Returns the runtime to `Idle` when the action ends, however it ends.
struct ActionGuard<'a> {
    status: &'a Mutex<RuntimeStatus>,
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(*status, RuntimeStatus::Busy(_)) {
            *status = RuntimeStatus::Idle;
        }
    }
}

/// EisRuntime wires the instruments, the frame buffer, the processing task
/// and the experiment log, and exposes the operator's actions.
pub struct EisRuntime {
    config: EisConfig,
    driver: Arc<dyn WaveformDriver>,
    trigger: Arc<dyn TriggerSource>,
    buffer: FrameBuffer,
    context: ProcessingContext,
    log: ExperimentLog,
    acquisition: AcquisitionLoop,
    calibration: CalibrationStore,
    metrics: Arc<StageMetrics>,
    status: Mutex<RuntimeStatus>,
    abort: AbortSignal,
    shutdown: Mutex<AbortSignal>,
    processor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EisRuntime {
    pub fn new(
        config: EisConfig,
        digitizer: Arc<dyn Digitizer>,
        driver: Arc<dyn WaveformDriver>,
        trigger: Arc<dyn TriggerSource>,
    ) -> Self {
        let buffer = FrameBuffer::new();
        let metrics = Arc::new(StageMetrics::new());
        let acquisition = AcquisitionLoop::new(
            digitizer,
            buffer.clone(),
            metrics.clone(),
            config.capture_timeout(),
        );
        let context =
            ProcessingContext::new(config.processing.reference_correction, config.processing.fitting);
        if let Some(solver) = &config.processing.solver {
            context.set_fit_setup(Some(FitSetup::new(
                Arc::new(CommandFitter::new(solver)),
                config.processing.topology,
                config.fit_timeout(),
            )));
        }
        let log = ExperimentLog::new(Experiment::autosave(&config.paths.output_root, Local::now()));
        let calibration = CalibrationStore::new(&config.paths.calibration_dir);

        Self {
            config,
            driver,
            trigger,
            buffer,
            context,
            log,
            acquisition,
            calibration,
            metrics,
            status: Mutex::new(RuntimeStatus::Stopped),
            abort: AbortSignal::new(),
            shutdown: Mutex::new(AbortSignal::new()),
            processor_handle: Mutex::new(None),
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, RuntimeStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.lock_status()
    }

    pub fn config(&self) -> &EisConfig {
        &self.config
    }

    pub fn log(&self) -> &ExperimentLog {
        &self.log
    }

    pub fn metrics(&self) -> &Arc<StageMetrics> {
        &self.metrics
    }

    pub fn context(&self) -> &ProcessingContext {
        &self.context
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn acquisition(&self) -> &AcquisitionLoop {
        &self.acquisition
    }

    pub fn calibration_store(&self) -> &CalibrationStore {
        &self.calibration
    }

    /// Spawn the processing task.
    pub async fn start(&self) -> Result<()> {
        if self.status() != RuntimeStatus::Stopped {
            return Err(anyhow!("Runtime is already running"));
        }

        let shutdown = AbortSignal::new();
        *self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = shutdown.clone();

        let processor = SpectrumProcessor::new(
            self.buffer.clone(),
            self.context.clone(),
            self.log.clone(),
            self.metrics.clone(),
            Duration::from_millis(self.config.processing.idle_poll_ms.max(1)),
        );
        *self
            .processor_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(processor.spawn(shutdown));

        *self.lock_status() = RuntimeStatus::Idle;
        info!("Runtime started");
        Ok(())
    }

    /// Abort the running action, let the processing task drain, and stop it.
    pub async fn shutdown(&self) -> Result<()> {
        if self.status() == RuntimeStatus::Stopped {
            return Ok(());
        }

        self.abort.trigger();
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .trigger();

        let handle = self
            .processor_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| anyhow!("Processing task failed: {}", e))?;
        }

        *self.lock_status() = RuntimeStatus::Stopped;
        info!("Runtime stopped");
        Ok(())
    }

    /// Ask the running action to stop at its next checkpoint.
    pub fn abort(&self) {
        info!("Abort requested");
        self.abort.trigger();
    }

    fn begin(&self, action: RuntimeAction) -> EisResult<ActionGuard<'_>> {
        let mut status = self.lock_status();
        match *status {
            RuntimeStatus::Stopped => return Err(EisError::NotRunning),
            RuntimeStatus::Busy(current) => return Err(EisError::Busy(current.name())),
            RuntimeStatus::Idle => {}
        }
        *status = RuntimeStatus::Busy(action);
        self.abort.reset();
        Ok(ActionGuard {
            status: &self.status,
        })
    }

    fn applied(&self) -> EisResult<Arc<AppliedWaveform>> {
        self.context.applied().ok_or(EisError::NoWaveformApplied)
    }

    fn metadata(&self, applied: &AppliedWaveform) -> ExperimentMetadata {
        let correction = self.context.reference_correction();
        ExperimentMetadata {
            waveform: applied.waveform.name(),
            frequencies: applied.waveform.frequencies(),
            vpp: applied.vpp,
            reference_correction: correction,
            calibration: correction.then(|| applied.calibration.clone()),
            fitting: self.context.active_fit_setup().map(|s| s.describe()),
        }
    }

    /// Experiment bound to the applied waveform, named or autosaved.
    fn new_experiment(&self, applied: &AppliedWaveform, name: Option<&str>) -> Experiment {
        let root = &self.config.paths.output_root;
        let experiment = match name {
            Some(name) => Experiment::named(root, name, Local::now()),
            None => Experiment::autosave(root, Local::now()),
        };
        experiment
            .with_waveform(applied.waveform.clone())
            .with_metadata(self.metadata(applied))
    }

    async fn wait_for_processing(&self, target: u64) -> EisResult<()> {
        self.log
            .wait_for_observations(target, self.config.processing_wait())
            .await
    }

    pub fn set_reference_correction(&self, enabled: bool) {
        self.context.set_reference_correction(enabled);
    }

    /// Switch fitting on with `setup`, or off with `None`.
    pub fn set_fitting(&self, setup: Option<FitSetup>) {
        self.context.set_fitting(setup.is_some());
        self.context.set_fit_setup(setup);
    }

    /// Drive `waveform` at `amplitude_mv` and load its calibration.
    ///
    /// The generator gets `Vpp = 2 * mV / 1000`. Subsequent frames go to a
    /// fresh autosave experiment.
    pub async fn apply_waveform(&self, waveform: Waveform, amplitude_mv: f64) -> EisResult<()> {
        let _guard = self.begin(RuntimeAction::ApplyWaveform)?;

        let vpp = 2.0 * amplitude_mv / 1000.0;
        self.driver.apply(&waveform, vpp).await?;

        let calibration = self.calibration.load(&waveform);
        let applied = AppliedWaveform {
            waveform,
            calibration,
            vpp,
        };
        let experiment = self.new_experiment(&applied, None);
        info!("Applied waveform {} at {} Vpp", applied.waveform.name(), vpp);
        self.context.apply(applied);
        self.log.set_experiment(experiment);
        Ok(())
    }

    /// Capture one frame and return the spectrum stored for it.
    pub async fn record_single(&self) -> EisResult<ImpedanceSpectrum> {
        let _guard = self.begin(RuntimeAction::RecordSingle)?;
        self.applied()?;

        let before = self.log.observations();
        self.acquisition.record_frame(None).await?;
        self.wait_for_processing(before.total() + 1).await?;

        if self.log.observations().stored == before.stored {
            return Err(EisError::SpectrumEmpty(
                "the captured frame was rejected".to_string(),
            ));
        }
        self.log
            .latest()
            .ok_or_else(|| EisError::SpectrumEmpty("no spectrum stored".to_string()))
    }

    /// Record back-to-back frames into a new experiment until `duration`
    /// elapses or the action is aborted.
    pub async fn record_duration(
        &self,
        name: Option<&str>,
        duration: Duration,
    ) -> EisResult<RecordingSummary> {
        let _guard = self.begin(RuntimeAction::RecordDuration)?;
        let applied = self.applied()?;

        self.log.set_experiment(self.new_experiment(&applied, name));
        let before = self.log.observations().total();
        let summary = self
            .acquisition
            .record_for_duration(duration, None, &self.abort)
            .await?;
        self.wait_for_processing(before + summary.captured as u64)
            .await?;
        Ok(summary)
    }

    /// Measure a known resistor and store calibration factors for the
    /// applied waveform. `resistance` accepts `k` and `M` suffixes.
    pub async fn record_reference(&self, resistance: &str) -> EisResult<CalibrationFactors> {
        let ohms = parse_resistance(resistance)?;
        let _guard = self.begin(RuntimeAction::RecordReference)?;
        let applied = self.applied()?;

        let correction = self.context.reference_correction();
        let fitting = self.context.fitting();
        self.context.set_reference_correction(false);
        self.context.set_fitting(false);

        let result = self.measure_reference(&applied, ohms).await;

        self.context.set_reference_correction(correction);
        self.context.set_fitting(fitting);

        let factors = result?;
        let reloaded = AppliedWaveform {
            calibration: self.calibration.load(&applied.waveform),
            ..(*applied).clone()
        };
        self.log.set_experiment(self.new_experiment(&reloaded, None));
        self.context.apply(reloaded);
        Ok(factors)
    }

    async fn measure_reference(
        &self,
        applied: &AppliedWaveform,
        ohms: f64,
    ) -> EisResult<CalibrationFactors> {
        let name = format!("reference_{}Ohm", ohms);
        self.log
            .set_experiment(self.new_experiment(applied, Some(&name)));

        let before = self.log.observations().total();
        let summary = self
            .acquisition
            .record_n(self.config.processing.reference_frames, None, &self.abort)
            .await?;
        if summary.aborted {
            return Err(EisError::Aborted);
        }
        self.wait_for_processing(before + summary.captured as u64)
            .await?;

        let spectra = self.log.spectra_since(0);
        let average = ImpedanceSpectrum::average(&spectra)?;
        let factors = CalibrationFactors::from_reference(&average, ohms)?;
        self.calibration.save(
            &applied.waveform,
            ohms,
            &factors,
            Local::now().date_naive(),
        )?;
        Ok(factors)
    }

    /// Titration over `sensors`; averaged spectra go to the experiment `name`.
    pub async fn multiplex_titration(
        &self,
        sensors: Vec<String>,
        name: &str,
        concentrations: &mut dyn ConcentrationSource,
    ) -> EisResult<SequenceOutcome> {
        let _guard = self.begin(RuntimeAction::Titration)?;
        let applied = self.applied()?;
        let state = MultiplexState::new(sensors, self.config.multiplex.frames_per_sensor)?;

        self.log.set_experiment(self.new_experiment(&applied, None));
        let backend = RuntimeBackend {
            runtime: self,
            averages: Some(Mutex::new(self.new_experiment(&applied, Some(name)))),
        };

        let mut sequencer = TitrationSequencer::new(state, self.config.trigger_poll());
        sequencer
            .run(&backend, self.trigger.as_ref(), concentrations, &self.abort)
            .await
    }

    /// In-vivo run over `sensors` for `duration`, stored in the experiment `name`.
    pub async fn multiplex_invivo(
        &self,
        sensors: Vec<String>,
        name: &str,
        duration: Duration,
    ) -> EisResult<SequenceOutcome> {
        let _guard = self.begin(RuntimeAction::InVivo)?;
        let applied = self.applied()?;
        let state = MultiplexState::new(sensors, 1)?;

        self.log
            .set_experiment(self.new_experiment(&applied, Some(name)));
        let before = self.log.observations().total();
        let captures_before = self.metrics.frames_captured();

        let backend = RuntimeBackend {
            runtime: self,
            averages: None,
        };
        let mut sequencer = InVivoSequencer::new(state, duration, self.config.trigger_poll());
        let outcome = sequencer
            .run(&backend, self.trigger.as_ref(), &self.abort)
            .await?;

        let captured = self.metrics.frames_captured() - captures_before;
        self.wait_for_processing(before + captured).await?;
        Ok(outcome)
    }

    /// Copy the current experiment's spectra into a new named experiment.
    pub async fn save_last_as(&self, name: &str) -> EisResult<PathBuf> {
        let _guard = self.begin(RuntimeAction::SaveAs)?;
        let root = self.config.paths.output_root.clone();
        let copy = self.log.read(|e| e.save_as(&root, name, Local::now()))?;
        Ok(copy.dir().to_path_buf())
    }

    /// Derive an amplitude-optimized waveform from the latest spectrum and
    /// save it next to the other waveforms. It is not applied.
    pub async fn create_optimized_waveform(&self) -> EisResult<Waveform> {
        let _guard = self.begin(RuntimeAction::OptimizeWaveform)?;
        let applied = self.applied()?;
        let latest = self
            .log
            .latest()
            .ok_or_else(|| EisError::SpectrumEmpty("record a spectrum first".to_string()))?;

        let optimized = applied.waveform.optimized_from(&latest)?;
        let path = optimized.to_csv(&self.config.paths.waveform_dir)?;
        info!("Saved optimized waveform {:?}", path);
        Ok(optimized)
    }
}

impl Drop for EisRuntime {
    fn drop(&mut self) {
        // Can't await the task here; signal it so it drains and exits.
        self.abort.trigger();
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .trigger();
    }
}

/// Sequencer access to the runtime's acquisition and storage.
struct RuntimeBackend<'a> {
    runtime: &'a EisRuntime,
    /// Named experiment receiving titration averages.
    averages: Option<Mutex<Experiment>>,
}

#[async_trait]
impl MultiplexBackend for RuntimeBackend<'_> {
    async fn capture_frame(&self, label: &str) -> EisResult<()> {
        self.runtime.acquisition.record_frame(Some(label)).await
    }

    async fn record_and_collect(
        &self,
        n: usize,
        abort: &AbortSignal,
    ) -> EisResult<Vec<ImpedanceSpectrum>> {
        let log = &self.runtime.log;
        let stored_before = log.count();
        let before = log.observations().total();

        let summary = self.runtime.acquisition.record_n(n, None, abort).await?;
        self.runtime
            .wait_for_processing(before + summary.captured as u64)
            .await?;
        if summary.aborted {
            return Err(EisError::Aborted);
        }
        Ok(log.spectra_since(stored_before))
    }

    async fn fit(&self, spectrum: &ImpedanceSpectrum) -> Option<FitResult> {
        let setup = self.runtime.context.active_fit_setup()?;
        let request = setup.request(spectrum, None);
        fit_with_timeout(setup.fitter(), &request, setup.timeout()).await
    }

    async fn store_average(&self, spectrum: ImpedanceSpectrum) -> EisResult<()> {
        match &self.averages {
            Some(experiment) => {
                experiment
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .append_spectrum(spectrum)?;
            }
            None => {
                warn!("No averages experiment for this run; storing in the live experiment");
                self.runtime.log.append(spectrum)?;
            }
        }
        Ok(())
    }
}
