pub mod buffers;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod fitting;
pub mod hal;
pub mod logging;
pub mod observability;
pub mod processing;
pub mod sequencer;
