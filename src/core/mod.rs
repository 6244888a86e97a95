pub mod frame;
pub mod signal;
pub mod spectrum;
pub mod waveform;

pub use frame::{ChannelScaling, Frame, RecordingParams};
pub use signal::AbortSignal;
pub use spectrum::{FitResult, ImpedanceSpectrum};
pub use waveform::{frequency_key, round_frequency, Tone, Waveform};
