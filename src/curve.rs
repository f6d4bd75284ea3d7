//! # Target Characteristic Curves
//!
//! A droop characteristic maps one measured grid quantity (voltage or
//! frequency) to a target power response (reactive or active). This module
//! models those characteristics as ordered breakpoint sequences with flat
//! extrapolation outside the defined domain, which is how every UL 1741 SA
//! grid-support function expresses its target:
//!
//! - **Pointwise**: N explicit `(x, y)` breakpoints (volt-var, pointwise
//!   frequency-watt).
//! - **Parametric**: a two-breakpoint downward ramp between a slope start and
//!   stop, scaled by a power-level factor (frequency-watt, volt-watt).
//! - **Constant**: a single breakpoint, evaluating to the same value
//!   everywhere (fixed power factor).
//!
//! Evaluation is continuous within the domain and clamps flat beyond the
//! first and last breakpoints. Degenerate definitions (zero-width segments,
//! non-increasing x) are rejected at construction instead of surfacing as a
//! division by zero during a sweep.

use serde::{Deserialize, Serialize};

/// Errors raised while constructing a characteristic curve.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CurveError {
    /// The curve has no breakpoints.
    #[error("curve requires at least one breakpoint")]
    Empty,

    /// Two adjacent breakpoints share the same x value, which would make the
    /// interpolation slope undefined.
    #[error("zero-width slope segment at x = {x}")]
    ZeroWidthSegment {
        /// The x coordinate shared by the colliding breakpoints.
        x: f64,
    },

    /// Breakpoint x values decrease.
    #[error("breakpoint x values must be strictly increasing ({prev} then {next})")]
    NonIncreasing {
        /// The earlier breakpoint's x value.
        prev: f64,
        /// The offending next x value.
        next: f64,
    },

    /// A domain bound lies inside the breakpoint range instead of enclosing it.
    #[error("domain bound {bound} does not enclose the breakpoint range [{lo}, {hi}]")]
    BoundInsideDomain {
        /// The offending bound.
        bound: f64,
        /// First breakpoint x.
        lo: f64,
        /// Last breakpoint x.
        hi: f64,
    },

    /// A breakpoint coordinate is NaN or infinite.
    #[error("non-finite breakpoint coordinate ({x}, {y})")]
    NonFinite {
        /// Breakpoint x.
        x: f64,
        /// Breakpoint y.
        y: f64,
    },
}

/// One `(x, y)` point of a characteristic curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Independent-variable coordinate (volts or hertz).
    pub x: f64,
    /// Dependent-variable coordinate (vars, % rated power, or power factor).
    pub y: f64,
}

impl Breakpoint {
    /// Create a breakpoint.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A target characteristic: ordered breakpoints with strictly increasing x,
/// evaluated by linear interpolation and clamped flat outside the domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    points: Vec<Breakpoint>,
}

impl Curve {
    /// Build a pointwise curve from explicit breakpoints.
    ///
    /// Rejects empty input, non-finite coordinates, and x values that are not
    /// strictly increasing. Equal adjacent x values are reported as
    /// [`CurveError::ZeroWidthSegment`] so a degenerate configuration fails
    /// loudly before any instrument is touched.
    pub fn from_points(points: Vec<Breakpoint>) -> Result<Self, CurveError> {
        if points.is_empty() {
            return Err(CurveError::Empty);
        }
        for p in &points {
            if !p.x.is_finite() || !p.y.is_finite() {
                return Err(CurveError::NonFinite { x: p.x, y: p.y });
            }
        }
        for pair in points.windows(2) {
            if pair[1].x == pair[0].x {
                return Err(CurveError::ZeroWidthSegment { x: pair[0].x });
            }
            if pair[1].x < pair[0].x {
                return Err(CurveError::NonIncreasing {
                    prev: pair[0].x,
                    next: pair[1].x,
                });
            }
        }
        Ok(Self { points })
    }

    /// A constant curve: evaluates to `y` everywhere.
    ///
    /// Used for the fixed power factor function, where the target does not
    /// depend on the swept quantity.
    pub fn constant(y: f64) -> Self {
        Self {
            points: vec![Breakpoint::new(0.0, y)],
        }
    }

    /// Parametric downward ramp: full output below `slope_start`, zero above
    /// `slope_stop`, linear in between, with the plateau scaled by
    /// `power_level` (a fraction of rated power).
    ///
    /// This is the frequency-watt / volt-watt shape: the plateau is
    /// `100 * power_level` percent of rated power. A zero-width or inverted
    /// slope segment is a configuration error.
    pub fn ramp_down(slope_start: f64, slope_stop: f64, power_level: f64) -> Result<Self, CurveError> {
        if slope_stop == slope_start {
            return Err(CurveError::ZeroWidthSegment { x: slope_start });
        }
        Self::from_points(vec![
            Breakpoint::new(slope_start, 100.0 * power_level),
            Breakpoint::new(slope_stop, 0.0),
        ])
    }

    /// Extend the curve's domain with flat boundary breakpoints at `x_min`
    /// and `x_max`, replicating the edge y values.
    ///
    /// The sweep planner places setpoints on every segment, so widening the
    /// domain this way makes the flat regions outside the slope part of the
    /// sweep. Bounds equal to the current domain edges are accepted and
    /// ignored; bounds inside the domain are rejected.
    pub fn with_bounds(mut self, x_min: f64, x_max: f64) -> Result<Self, CurveError> {
        let (lo, hi) = (self.domain_min(), self.domain_max());
        if x_min > lo {
            return Err(CurveError::BoundInsideDomain { bound: x_min, lo, hi });
        }
        if x_max < hi {
            return Err(CurveError::BoundInsideDomain { bound: x_max, lo, hi });
        }
        if x_min < lo {
            let y = self.points[0].y;
            self.points.insert(0, Breakpoint::new(x_min, y));
        }
        if x_max > hi {
            let y = self.points[self.points.len() - 1].y;
            self.points.push(Breakpoint::new(x_max, y));
        }
        Ok(self)
    }

    /// The breakpoints, in ascending x order.
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.points
    }

    /// Smallest x in the domain.
    pub fn domain_min(&self) -> f64 {
        self.points[0].x
    }

    /// Largest x in the domain.
    pub fn domain_max(&self) -> f64 {
        self.points[self.points.len() - 1].x
    }

    /// Evaluate the target dependent value at `x`.
    ///
    /// Flat below `domain_min`, flat above `domain_max`, linear interpolation
    /// between adjacent breakpoints:
    /// `y = y_i - (y_i - y_{i+1}) * (x - x_i) / (x_{i+1} - x_i)`.
    pub fn evaluate(&self, x: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if x <= first.x {
            return first.y;
        }
        if x >= last.x {
            return last.y;
        }
        for pair in self.points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if x <= b.x {
                return a.y - (a.y - b.y) * (x - a.x) / (b.x - a.x);
            }
        }
        // x < last.x guarantees the loop returned.
        unreachable!("x inside domain must fall in a segment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volt_var_curve() -> Curve {
        // Deadband around 125 V with symmetric 50 var injection/absorption.
        let v = [100.0, 110.0, 120.0, 130.0, 140.0, 150.0];
        let q = [50.0, 50.0, 0.0, 0.0, -50.0, -50.0];
        let points = v
            .iter()
            .zip(q.iter())
            .map(|(&x, &y)| Breakpoint::new(x, y))
            .collect();
        Curve::from_points(points).unwrap()
    }

    #[test]
    fn test_flat_extrapolation_outside_domain() {
        let curve = volt_var_curve();
        assert_eq!(curve.evaluate(50.0), 50.0);
        assert_eq!(curve.evaluate(100.0), 50.0);
        assert_eq!(curve.evaluate(150.0), -50.0);
        assert_eq!(curve.evaluate(500.0), -50.0);
    }

    #[test]
    fn test_interpolation_within_segments() {
        let curve = volt_var_curve();
        // Descending slope segment 110 -> 120.
        assert!((curve.evaluate(115.0) - 25.0).abs() < 1e-9);
        // Deadband is flat at zero.
        assert_eq!(curve.evaluate(125.0), 0.0);
        // Midpoint of the descending 130 -> 140 segment.
        assert!((curve.evaluate(135.0) - -25.0).abs() < 1e-9);
    }

    #[test]
    fn test_continuity_at_breakpoints() {
        let curve = volt_var_curve();
        for bp in curve.breakpoints() {
            let eps = 1e-7;
            let below = curve.evaluate(bp.x - eps);
            let above = curve.evaluate(bp.x + eps);
            assert!((below - bp.y).abs() < 1e-4, "left of x = {}", bp.x);
            assert!((above - bp.y).abs() < 1e-4, "right of x = {}", bp.x);
            assert_eq!(curve.evaluate(bp.x), bp.y);
        }
    }

    #[test]
    fn test_parametric_freq_watt_interpolation() {
        // f_nom = 60 Hz, slope from 60.5 to 61.0 Hz, full power.
        let curve = Curve::ramp_down(60.5, 61.0, 1.0).unwrap();
        assert_eq!(curve.evaluate(60.0), 100.0);
        assert!((curve.evaluate(60.7) - 60.0).abs() < 1e-9);
        assert_eq!(curve.evaluate(61.5), 0.0);
    }

    #[test]
    fn test_parametric_scaled_by_power_level() {
        let curve = Curve::ramp_down(60.5, 61.0, 0.33).unwrap();
        assert!((curve.evaluate(60.0) - 33.0).abs() < 1e-9);
        assert!((curve.evaluate(60.75) - 16.5).abs() < 1e-9);
    }

    #[test]
    fn test_constant_curve() {
        let curve = Curve::constant(0.95);
        assert_eq!(curve.evaluate(-1000.0), 0.95);
        assert_eq!(curve.evaluate(0.0), 0.95);
        assert_eq!(curve.evaluate(1000.0), 0.95);
    }

    #[test]
    fn test_zero_width_segment_rejected() {
        let err = Curve::ramp_down(60.5, 60.5, 1.0).unwrap_err();
        assert_eq!(err, CurveError::ZeroWidthSegment { x: 60.5 });

        let err = Curve::from_points(vec![
            Breakpoint::new(120.0, 100.0),
            Breakpoint::new(120.0, 0.0),
        ])
        .unwrap_err();
        assert!(matches!(err, CurveError::ZeroWidthSegment { .. }));
    }

    #[test]
    fn test_non_increasing_rejected() {
        let err = Curve::from_points(vec![
            Breakpoint::new(121.0, 100.0),
            Breakpoint::new(120.0, 0.0),
        ])
        .unwrap_err();
        assert!(matches!(err, CurveError::NonIncreasing { .. }));
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(Curve::from_points(vec![]).unwrap_err(), CurveError::Empty);
    }

    #[test]
    fn test_with_bounds_extends_domain_flat() {
        let curve = Curve::ramp_down(123.6, 128.6, 1.0)
            .unwrap()
            .with_bounds(108.0, 132.0)
            .unwrap();
        assert_eq!(curve.breakpoints().len(), 4);
        assert_eq!(curve.domain_min(), 108.0);
        assert_eq!(curve.domain_max(), 132.0);
        assert_eq!(curve.evaluate(110.0), 100.0);
        assert_eq!(curve.evaluate(131.0), 0.0);
    }

    #[test]
    fn test_with_bounds_inside_domain_rejected() {
        let err = Curve::ramp_down(123.6, 128.6, 1.0)
            .unwrap()
            .with_bounds(125.0, 132.0)
            .unwrap_err();
        assert!(matches!(err, CurveError::BoundInsideDomain { .. }));
    }
}
