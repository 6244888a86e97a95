pub mod calibration;
pub mod extractor;
pub mod processor;

pub use calibration::{parse_resistance, CalibrationFactors, CalibrationStore};
pub use extractor::SignalExtractor;
pub use processor::{AppliedWaveform, ProcessingContext, SpectrumProcessor};
