use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::{ImpedanceSpectrum, Waveform};
use crate::error::{EisError, EisResult};
use crate::fitting::FitDescription;
use crate::processing::CalibrationFactors;

pub const TIMES_FILE: &str = "!times.txt";
pub const FITS_FILE: &str = "!fits.csv";
pub const METADATA_FILE: &str = "!metadata.json";

/// Write `content` next to `path` and rename it into place.
pub fn atomic_write(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!("{}.tmp", file_name));

    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

/// Acquisition settings recorded once per experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub waveform: String,
    pub frequencies: Vec<f64>,
    pub vpp: f64,
    pub reference_correction: bool,
    pub calibration: Option<CalibrationFactors>,
    pub fitting: Option<FitDescription>,
}

/// Ordered spectra of one run and the directory they are persisted to.
#[derive(Debug)]
pub struct Experiment {
    name: Option<String>,
    dir: PathBuf,
    waveform: Option<Waveform>,
    metadata: Option<ExperimentMetadata>,
    metadata_written: bool,
    spectra: Vec<ImpedanceSpectrum>,
    fit_header: Option<Vec<String>>,
    halted: bool,
}

impl Experiment {
    /// Experiment persisted under `dir` exactly.
    pub fn at(dir: impl Into<PathBuf>, name: Option<String>) -> Self {
        Self {
            name,
            dir: dir.into(),
            waveform: None,
            metadata: None,
            metadata_written: false,
            spectra: Vec::new(),
            fit_header: None,
            halted: false,
        }
    }

    /// `{root}/{YYYY-MM-DD}/{name}`
    pub fn named(output_root: impl AsRef<Path>, name: &str, now: DateTime<Local>) -> Self {
        let dir = output_root
            .as_ref()
            .join(now.format("%Y-%m-%d").to_string())
            .join(name);
        Self::at(dir, Some(name.to_string()))
    }

    /// `{root}/{YYYY-MM-DD}/autosave/{HH-MM-SS}`, with a `_N` suffix when
    /// that folder is already taken.
    pub fn autosave(output_root: impl AsRef<Path>, now: DateTime<Local>) -> Self {
        let parent = output_root
            .as_ref()
            .join(now.format("%Y-%m-%d").to_string())
            .join("autosave");
        let stem = now.format("%H-%M-%S").to_string();

        let mut dir = parent.join(&stem);
        let mut n = 1;
        while dir.exists() {
            n += 1;
            dir = parent.join(format!("{}_{}", stem, n));
        }
        Self::at(dir, None)
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = Some(waveform);
        self
    }

    pub fn with_metadata(mut self, metadata: ExperimentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn waveform(&self) -> Option<&Waveform> {
        self.waveform.as_ref()
    }

    pub fn metadata(&self) -> Option<&ExperimentMetadata> {
        self.metadata.as_ref()
    }

    pub fn spectra(&self) -> &[ImpedanceSpectrum] {
        &self.spectra
    }

    pub fn count(&self) -> usize {
        self.spectra.len()
    }

    pub fn latest(&self) -> Option<&ImpedanceSpectrum> {
        self.spectra.last()
    }

    pub fn fit_header(&self) -> Option<&[String]> {
        self.fit_header.as_deref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Re-open the append path after a schema violation was handled.
    pub fn acknowledge_schema_violation(&mut self) {
        if self.halted {
            info!("Schema violation acknowledged for {:?}", self.dir);
        }
        self.halted = false;
    }

    /// Validate, persist and keep `spectrum`. Returns its 1-based index.
    ///
    /// No file is touched unless every check passes, and a failed write
    /// leaves the directory as it was.
    pub fn append_spectrum(&mut self, spectrum: ImpedanceSpectrum) -> EisResult<usize> {
        let pending = self.prepare_append(&spectrum)?;
        pending.write()?;
        Ok(self.commit_append(spectrum, pending))
    }

    /// Run every append check and render the files to write.
    ///
    /// A schema violation halts the experiment here.
    pub(crate) fn prepare_append(&mut self, spectrum: &ImpedanceSpectrum) -> EisResult<PendingAppend> {
        if self.halted {
            return Err(EisError::AppendHalted);
        }
        if spectrum.is_empty() {
            return Err(EisError::SpectrumEmpty(
                "refusing to store a spectrum without frequencies".to_string(),
            ));
        }
        if let Some(last) = self.spectra.last() {
            if spectrum.timestamp() <= last.timestamp() {
                return Err(EisError::OutOfOrder {
                    previous: format_time(last.timestamp()),
                    found: format_time(spectrum.timestamp()),
                });
            }
        }

        if self.fit_header.is_none() {
            self.fit_header = self.read_fit_header()?;
        }
        let (fit_values, new_fit_header) = match (spectrum.fit(), &self.fit_header) {
            (Some(fit), Some(header)) => {
                let found = fit.names();
                let expected_set: BTreeSet<&String> = header.iter().collect();
                let found_set: BTreeSet<&String> = found.iter().collect();
                if expected_set != found_set {
                    self.halted = true;
                    error!(
                        "Fit parameters {:?} do not match {:?} in {:?}; appends halted",
                        found, header, self.dir
                    );
                    return Err(EisError::SchemaViolation {
                        expected: header.clone(),
                        found,
                    });
                }
                let values = header
                    .iter()
                    .map(|name| fit.get(name).unwrap_or(f64::NAN))
                    .collect::<Vec<_>>();
                (Some(values), None)
            }
            (Some(fit), None) => (Some(fit.iter().map(|(_, v)| v).collect()), Some(fit.names())),
            (None, _) => (None, None),
        };

        let index = self.spectra.len() + 1;
        let file_name = spectrum_file_name(spectrum.name(), index);
        let time = format_time(spectrum.timestamp());

        let mut fit_lines = Vec::new();
        if let Some(values) = fit_values {
            if let Some(names) = &new_fit_header {
                fit_lines.push(format!("file,time,{}", names.join(",")));
            }
            let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            fit_lines.push(format!("{},{},{}", file_name, time, values.join(",")));
        }

        let metadata = match (&self.metadata, self.metadata_written) {
            (Some(metadata), false) => Some(
                serde_json::to_string_pretty(metadata)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            ),
            _ => None,
        };

        Ok(PendingAppend {
            dir: self.dir.clone(),
            index,
            file_name,
            text: spectrum.to_text(),
            time,
            fit_lines,
            new_fit_header,
            metadata,
        })
    }

    /// Keep `spectrum` after its files were written.
    pub(crate) fn commit_append(&mut self, spectrum: ImpedanceSpectrum, pending: PendingAppend) -> usize {
        if let Some(names) = pending.new_fit_header {
            self.fit_header = Some(names);
        }
        self.metadata_written = true;
        debug!("Stored {} as #{} in {:?}", pending.file_name, pending.index, self.dir);
        self.spectra.push(spectrum);
        pending.index
    }

    /// Copy every spectrum into a new named experiment under `output_root`.
    pub fn save_as(
        &self,
        output_root: impl AsRef<Path>,
        name: &str,
        now: DateTime<Local>,
    ) -> EisResult<Experiment> {
        let mut copy = Experiment::named(output_root, name, now);
        copy.waveform = self.waveform.clone();
        copy.metadata = self.metadata.clone();
        for spectrum in &self.spectra {
            copy.append_spectrum(spectrum.clone())?;
        }
        info!("Saved {} spectra to {:?}", copy.count(), copy.dir);
        Ok(copy)
    }

    /// Header columns after `file,time` of an existing fit history.
    fn read_fit_header(&self) -> EisResult<Option<Vec<String>>> {
        let path = self.dir.join(FITS_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(text.lines().next().map(|header| {
            header
                .split(',')
                .skip(2)
                .map(|s| s.trim().to_string())
                .collect()
        }))
    }
}

/// Files one append will write, rendered while the experiment was checked.
#[derive(Debug)]
pub(crate) struct PendingAppend {
    dir: PathBuf,
    index: usize,
    file_name: String,
    text: String,
    time: String,
    fit_lines: Vec<String>,
    new_fit_header: Option<Vec<String>>,
    metadata: Option<String>,
}

impl PendingAppend {
    /// Write the append; on failure every file is restored.
    ///
    /// The spectrum file goes last so a reader never sees it without its
    /// time entry.
    pub(crate) fn write(&self) -> io::Result<()> {
        let mut undo = Rollback::default();
        let result = self.write_tracked(&mut undo);
        if result.is_err() {
            undo.restore();
        }
        result
    }

    fn write_tracked(&self, undo: &mut Rollback) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        undo.append_line(&self.dir.join(TIMES_FILE), &self.time)?;
        let fits_path = self.dir.join(FITS_FILE);
        for line in &self.fit_lines {
            undo.append_line(&fits_path, line)?;
        }
        if let Some(json) = &self.metadata {
            undo.create(&self.dir.join(METADATA_FILE), json)?;
        }
        atomic_write(&self.dir.join(&self.file_name), &self.text)
    }
}

/// Previous state of the files an append touched.
#[derive(Default)]
struct Rollback {
    appended: Vec<(PathBuf, Option<u64>)>,
    created: Vec<PathBuf>,
}

impl Rollback {
    fn append_line(&mut self, path: &Path, line: &str) -> io::Result<()> {
        if !self.appended.iter().any(|(p, _)| p == path) {
            match fs::metadata(path) {
                Ok(meta) if !meta.is_file() => {}
                found => self
                    .appended
                    .push((path.to_path_buf(), found.ok().map(|m| m.len()))),
            }
        }
        append_line(path, line)
    }

    fn create(&mut self, path: &Path, content: &str) -> io::Result<()> {
        if !path.exists() {
            self.created.push(path.to_path_buf());
        }
        atomic_write(path, content)
    }

    fn restore(self) {
        for (path, len) in self.appended.into_iter().rev() {
            let restored = match len {
                Some(len) => OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .and_then(|file| file.set_len(len)),
                None => remove_if_present(&path),
            };
            if let Err(e) = restored {
                warn!("Could not restore {:?} after a failed append: {}", path, e);
            }
        }
        for path in self.created {
            if let Err(e) = remove_if_present(&path) {
                warn!("Could not remove {:?} after a failed append: {}", path, e);
            }
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn spectrum_file_name(label: Option<&str>, index: usize) -> String {
    match label {
        Some(label) if Path::new(label).extension().is_some() => label.to_string(),
        Some(label) => format!("{}.txt", label),
        None => format!("{:06}.txt", index),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spectrum_file_names() {
        assert_eq!(spectrum_file_name(None, 1), "000001.txt");
        assert_eq!(spectrum_file_name(Some("A_1"), 7), "A_1.txt");
        assert_eq!(spectrum_file_name(Some("A_000002.txt"), 7), "A_000002.txt");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("000001.txt");
        atomic_write(&path, "hello").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
