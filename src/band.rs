//! # Tolerance Band Calculation
//!
//! Pass/fail acceptance bands derived from the manufacturer's stated
//! accuracies (MSAs) of both measured quantities. The measured
//! independent-variable value is only known to within the independent MSA, so
//! the admissible band must cover the curve's value at both edges of that
//! uncertainty window, widened again by the dependent MSA. Which edge forms
//! the upper bound depends on the local slope sign:
//!
//! ```text
//!                          \ * (x - dx, upper)
//!                           \
//!                            . (x - dx, y1)
//!                             \
//!                              x (x, target)
//!                               \
//!                                . (x + dx, y2)
//!                                 \
//!               (x + dx, lower) * \
//! ```
//!
//! On a non-positive slope (`y1 >= target`) the left edge is the high side;
//! on a non-negative slope it is the low side. Both bounds are rounded to one
//! decimal place, matching the resolution the certification procedures
//! record.

use serde::{Deserialize, Serialize};

use crate::curve::Curve;

/// Manufacturer's stated accuracies for one sweep: one tolerance in the
/// independent variable's units, one in the dependent variable's units.
/// Fixed for the duration of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Msa {
    /// Tolerance on the swept quantity (volts or hertz).
    pub independent: f64,
    /// Tolerance on the measured response (vars, % rated power, power factor).
    pub dependent: f64,
}

impl Msa {
    /// Create an accuracy pair.
    pub fn new(independent: f64, dependent: f64) -> Self {
        Self {
            independent,
            dependent,
        }
    }
}

/// The target value and acceptance bounds for one measured point.
///
/// Invariant: `lower <= upper` for any well-formed curve and non-negative
/// MSAs. The target need not lie at the center of the band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Curve value at the measured independent-variable value.
    pub target: f64,
    /// Smallest passing dependent value.
    pub lower: f64,
    /// Largest passing dependent value.
    pub upper: f64,
}

impl Band {
    /// Whether a measured dependent value falls inside the band.
    pub fn contains(&self, actual: f64) -> bool {
        self.lower <= actual && actual <= self.upper
    }
}

/// Round to one decimal place, the resolution used for recorded bounds.
pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Compute the target and acceptance band at a measured independent value.
///
/// `target = curve(x)`, `y1 = curve(x - dx)`, `y2 = curve(x + dx)`. If
/// `y1 >= target` the curve is non-increasing here and the band is
/// `[y2 - dy, y1 + dy]`; otherwise it is `[y1 - dy, y2 + dy]`.
pub fn band_at(curve: &Curve, x_actual: f64, msa: Msa) -> Band {
    let target = curve.evaluate(x_actual);
    let y1 = curve.evaluate(x_actual - msa.independent);
    let y2 = curve.evaluate(x_actual + msa.independent);
    if y1 >= target {
        Band {
            target,
            lower: round1(y2 - msa.dependent),
            upper: round1(y1 + msa.dependent),
        }
    } else {
        Band {
            target,
            lower: round1(y1 - msa.dependent),
            upper: round1(y2 + msa.dependent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::Breakpoint;

    fn volt_var_curve() -> Curve {
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
    fn test_band_on_descending_segment() {
        // Midpoint of the 130 -> 140 descent: target -25, neighbors -20/-30.
        let band = band_at(&volt_var_curve(), 135.0, Msa::new(1.0, 2.0));
        assert!((band.target - -25.0).abs() < 1e-9);
        assert_eq!(band.upper, -18.0);
        assert_eq!(band.lower, -32.0);
        assert!(band.contains(band.target));
    }

    #[test]
    fn test_band_on_ascending_segment() {
        // An inverted characteristic exercises the non-negative slope branch.
        let curve = Curve::from_points(vec![
            Breakpoint::new(59.0, 0.0),
            Breakpoint::new(61.0, 100.0),
        ])
        .unwrap();
        let band = band_at(&curve, 60.0, Msa::new(0.1, 2.0));
        assert!((band.target - 50.0).abs() < 1e-9);
        // y1 = curve(59.9) = 45, y2 = curve(60.1) = 55.
        assert_eq!(band.lower, 43.0);
        assert_eq!(band.upper, 57.0);
    }

    #[test]
    fn test_band_in_flat_region_is_symmetric() {
        let band = band_at(&volt_var_curve(), 125.0, Msa::new(1.0, 2.0));
        assert_eq!(band.target, 0.0);
        assert_eq!(band.lower, -2.0);
        assert_eq!(band.upper, 2.0);
    }

    #[test]
    fn test_band_never_inverted() {
        let curve = volt_var_curve();
        let msa = Msa::new(1.5, 3.0);
        let mut x = 95.0;
        while x <= 155.0 {
            let band = band_at(&curve, x, msa);
            assert!(
                band.lower <= band.upper,
                "inverted band at x = {}: {:?}",
                x,
                band
            );
            x += 0.5;
        }
    }

    #[test]
    fn test_zero_msa_band_is_target() {
        let band = band_at(&volt_var_curve(), 135.0, Msa::new(0.0, 0.0));
        assert_eq!(band.lower, round1(band.target));
        assert_eq!(band.upper, round1(band.target));
    }

    #[test]
    fn test_pass_fail_against_band() {
        let band = Band {
            target: 60.0,
            lower: 59.9,
            upper: 60.2,
        };
        assert!(band.contains(60.05));
        assert!(!band.contains(59.5));
    }
}
