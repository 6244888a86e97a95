pub mod solver;
pub mod topology;

pub use solver::{
    fit_bounded, fit_with_timeout, CommandFitter, FitDescription, FitParameter, FitRequest,
    FitSetup, SpectrumFitter,
};
pub use topology::{predict, Topology};
