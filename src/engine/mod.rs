pub mod acquisition;
pub mod runtime;
pub mod state;

pub use acquisition::{AcquisitionLoop, RecordingSummary};
pub use runtime::{EisRuntime, RuntimeAction, RuntimeStatus};
pub use state::AcquisitionState;
