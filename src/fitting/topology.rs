use std::f64::consts::PI;
use std::fmt;

use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::solver::FitParameter;
use crate::error::{EisError, EisResult};

/// Equivalent-circuit models the solver can fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    /// R1 in series with (R2 || C1)
    #[serde(rename = "RRC")]
    Rrc,
    /// R1 in series with (R2 || CPE)
    #[serde(rename = "RRQ")]
    Rrq,
    /// Rs in series with (CPE_dl || (Rct + CPE_ads))
    Sensor,
}

impl Topology {
    pub const ALL: [Topology; 3] = [Topology::Rrc, Topology::Rrq, Topology::Sensor];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Rrc => "RRC",
            Self::Rrq => "RRQ",
            Self::Sensor => "Sensor",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Parameters in fit order, with the default guess and free flag.
    pub fn parameters(&self) -> Vec<FitParameter> {
        let defaults: &[(&str, f64, bool)] = match self {
            Self::Rrc => &[("R1", 100.0, true), ("R2", 1000.0, true), ("C1", 1e-6, true)],
            Self::Rrq => &[
                ("R1", 100.0, true),
                ("R2", 1000.0, true),
                ("Q1", 1e-6, true),
                ("n1", 0.9, false),
            ],
            Self::Sensor => &[
                ("Rs", 500.0, true),
                ("Rct", 30000.0, true),
                ("Cdl", 1e-7, true),
                ("n_dl", 1.0, false),
                ("Cads", 5e-7, true),
                ("n_ads", 0.84, false),
            ],
        };
        defaults.iter()
            .map(|&(name, value, free)| FitParameter::new(name, value, free))
            .collect()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters().into_iter().map(|p| p.name).collect()
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn cpe(q: f64, n: f64, omega: f64) -> Complex64 {
    1.0 / (q * Complex64::new(0.0, omega).powf(n))
}

fn parallel(a: Complex64, b: Complex64) -> Complex64 {
    1.0 / (1.0 / a + 1.0 / b)
}

/// Model impedance at `frequencies` for `values` given in topology order.
pub fn predict(topology: Topology, frequencies: &[f64], values: &[f64]) -> EisResult<Vec<Complex64>> {
    let expected = topology.parameters().len();
    if values.len() != expected {
        return Err(EisError::FitFailure(format!(
            "{} takes {} parameters, got {}",
            topology,
            expected,
            values.len()
        )));
    }

    Ok(frequencies
        .iter()
        .map(|&f| {
            let omega = 2.0 * PI * f;
            match topology {
                Topology::Rrc => {
                    let (r1, r2, c1) = (values[0], values[1], values[2]);
                    let zc = 1.0 / Complex64::new(0.0, omega * c1);
                    r1 + parallel(Complex64::new(r2, 0.0), zc)
                }
                Topology::Rrq => {
                    let (r1, r2, q1, n1) = (values[0], values[1], values[2], values[3]);
                    r1 + parallel(Complex64::new(r2, 0.0), cpe(q1, n1, omega))
                }
                Topology::Sensor => {
                    let (rs, rct, cdl, n_dl, cads, n_ads) =
                        (values[0], values[1], values[2], values[3], values[4], values[5]);
                    rs + parallel(cpe(cdl, n_dl, omega), rct + cpe(cads, n_ads, omega))
                }
            }
        })
        .collect())
}
