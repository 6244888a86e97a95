pub mod mock;
pub mod traits;
pub mod trigger;

pub use traits::{Digitizer, TriggerSource, WaveformDriver};
pub use trigger::FileTrigger;
