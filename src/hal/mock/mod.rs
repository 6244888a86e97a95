pub mod bench;
pub mod trigger;

pub use bench::SimulatedBench;
pub use trigger::SimulatedTriggerSource;
