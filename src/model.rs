//! Cathode interpolation models.
//!
//! The control loop only relies on the [`InterpolationModel`] contract: a forward/inverse
//! lookup over a monotonic curve, the sample tables that define its domain, and whether the
//! dependent axis is log-transformed. How the curve was fitted is not this crate's concern;
//! [`PiecewiseLinearModel`] interpolates straight between the stored samples.
//!
//! # Log transform
//!
//! With `log_transform` set, `y_data()` still reports physical values but the model works
//! on `log10(y)`: a forward lookup returns `log10(y)` and an inverse lookup expects
//! `log10(y)` as input. The emission current model is stored this way because emission
//! grows exponentially with heater current.

use crate::config::{CurveConfig, ModelsConfig};
use crate::error::ModelError;

/// Forward/inverse lookup over a fitted monotonic curve.
pub trait InterpolationModel: Send + Sync {
    /// Forward (`x -> y`) or inverse (`y -> x`) lookup.
    ///
    /// Inputs outside the fitted range are rejected with [`ModelError::OutOfDomain`]
    /// rather than extrapolated.
    fn interpolate(&self, x: f64, inverse: bool) -> Result<f64, ModelError>;

    /// Independent samples.
    fn x_data(&self) -> &[f64];

    /// Dependent samples in physical units.
    fn y_data(&self) -> &[f64];

    /// Whether the dependent axis is handled in log10 space.
    fn log_transform(&self) -> bool;

    /// `(min, max)` of the independent samples.
    fn x_range(&self) -> (f64, f64) {
        min_max(self.x_data())
    }

    /// `(min, max)` of the dependent samples in physical units.
    fn y_range(&self) -> (f64, f64) {
        min_max(self.y_data())
    }
}

fn min_max(data: &[f64]) -> (f64, f64) {
    data.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Piecewise-linear interpolation between ordered samples.
#[derive(Debug, Clone)]
pub struct PiecewiseLinearModel {
    x: Vec<f64>,
    y: Vec<f64>,
    // Dependent axis as interpolated (log10 of y when log_transform)
    y_fit: Vec<f64>,
    log_transform: bool,
}

impl PiecewiseLinearModel {
    /// Build a model from sample tables.
    ///
    /// Samples are sorted by `x`. Both axes must be strictly monotonic so the inverse
    /// lookup is well defined, and log-transformed curves need strictly positive `y`.
    pub fn new(x: Vec<f64>, y: Vec<f64>, log_transform: bool) -> Result<Self, ModelError> {
        if x.len() != y.len() {
            return Err(ModelError::InvalidData(format!(
                "x has {} samples but y has {}",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(ModelError::InvalidData(
                "at least two samples are required".to_string(),
            ));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(ModelError::InvalidData("samples must be finite".to_string()));
        }
        if log_transform && y.iter().any(|&v| v <= 0.0) {
            return Err(ModelError::InvalidData(
                "log-transformed samples must be positive".to_string(),
            ));
        }

        let mut pairs: Vec<(f64, f64)> = x.into_iter().zip(y).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (x, y): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();

        let y_fit: Vec<f64> = if log_transform {
            y.iter().map(|v| v.log10()).collect()
        } else {
            y.clone()
        };

        if !strictly_monotonic(&x) {
            return Err(ModelError::InvalidData(
                "x samples must be distinct".to_string(),
            ));
        }
        if !strictly_monotonic(&y_fit) {
            return Err(ModelError::InvalidData(
                "y samples must be strictly monotonic".to_string(),
            ));
        }

        Ok(Self {
            x,
            y,
            y_fit,
            log_transform,
        })
    }

    /// Build a model from a configured curve table.
    pub fn from_curve(curve: &CurveConfig) -> Result<Self, ModelError> {
        Self::new(curve.x.clone(), curve.y.clone(), curve.log_transform)
    }
}

fn strictly_monotonic(data: &[f64]) -> bool {
    let rising = data.windows(2).all(|w| w[1] > w[0]);
    let falling = data.windows(2).all(|w| w[1] < w[0]);
    rising || falling
}

/// Linear lookup of `value` on `from`, mapped onto `to`. `from` must be monotonic.
fn lookup(from: &[f64], to: &[f64], value: f64) -> Result<f64, ModelError> {
    let (min, max) = min_max(from);
    if !value.is_finite() || value < min || value > max {
        return Err(ModelError::OutOfDomain { value, min, max });
    }

    for i in 0..from.len() - 1 {
        let (a, b) = (from[i], from[i + 1]);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if value >= lo && value <= hi {
            let t = if b == a { 0.0 } else { (value - a) / (b - a) };
            return Ok(to[i] + t * (to[i + 1] - to[i]));
        }
    }

    Err(ModelError::OutOfDomain { value, min, max })
}

impl InterpolationModel for PiecewiseLinearModel {
    fn interpolate(&self, x: f64, inverse: bool) -> Result<f64, ModelError> {
        if inverse {
            lookup(&self.y_fit, &self.x, x)
        } else {
            lookup(&self.x, &self.y_fit, x)
        }
    }

    fn x_data(&self) -> &[f64] {
        &self.x
    }

    fn y_data(&self) -> &[f64] {
        &self.y
    }

    fn log_transform(&self) -> bool {
        self.log_transform
    }
}

/// The three ES440 curves the control loop consults.
pub struct CathodeModels {
    /// Heater current (A) to heater voltage (V)
    pub heater_voltage: Box<dyn InterpolationModel>,
    /// Heater current (A) to emission current (A), log-transformed
    pub emission_current: Box<dyn InterpolationModel>,
    /// Heater current (A) to true temperature (K)
    pub true_temperature: Box<dyn InterpolationModel>,
}

impl CathodeModels {
    /// Assemble the models from explicit implementations.
    pub fn new(
        heater_voltage: Box<dyn InterpolationModel>,
        emission_current: Box<dyn InterpolationModel>,
        true_temperature: Box<dyn InterpolationModel>,
    ) -> Self {
        Self {
            heater_voltage,
            emission_current,
            true_temperature,
        }
    }

    /// Piecewise-linear models from configured tables.
    pub fn from_config(config: &ModelsConfig) -> Result<Self, ModelError> {
        Ok(Self::new(
            Box::new(PiecewiseLinearModel::from_curve(&config.heater_voltage)?),
            Box::new(PiecewiseLinearModel::from_curve(&config.emission_current)?),
            Box::new(PiecewiseLinearModel::from_curve(&config.true_temperature)?),
        ))
    }
}
