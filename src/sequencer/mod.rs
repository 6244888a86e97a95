pub mod backend;
pub mod invivo;
pub mod state;
pub mod titration;

pub use backend::{wait_for_trigger, ConcentrationSource, MultiplexBackend, ScriptedConcentrations};
pub use invivo::InVivoSequencer;
pub use state::{InVivoState, MultiplexState, SequenceOutcome, TitrationState};
pub use titration::TitrationSequencer;
