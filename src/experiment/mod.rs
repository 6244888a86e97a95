pub mod log;
pub mod store;

pub use log::{ExperimentLog, Observations};
pub use store::{Experiment, ExperimentMetadata, FITS_FILE, METADATA_FILE, TIMES_FILE};
