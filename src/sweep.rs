//! # Sweep Planning
//!
//! Generates the ordered setpoint sequences a certification sweep walks
//! through: evenly spaced points on every segment of the target curve, with
//! the shared endpoint between adjacent segments emitted once. Descending
//! sweeps reuse the ascending sequence reversed, so both directions cover
//! exactly the same stimulus values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::curve::Curve;

/// Direction of one sweep across the curve domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepDirection {
    /// Ascending stimulus values.
    Up,
    /// Descending stimulus values.
    Down,
}

impl SweepDirection {
    /// Lowercase label used in dataset filenames and summary rows.
    pub fn label(&self) -> &'static str {
        match self {
            SweepDirection::Up => "up",
            SweepDirection::Down => "down",
        }
    }
}

impl fmt::Display for SweepDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `count + 2` evenly spaced values from `start` to `end`, inclusive of both
/// endpoints, step `(end - start) / (count + 1)`.
pub fn segment_points(start: f64, end: f64, count: usize) -> Vec<f64> {
    let interval = (end - start) / (count as f64 + 1.0);
    let mut points = Vec::with_capacity(count + 2);
    points.push(start);
    let mut last = start;
    for _ in 0..count {
        last += interval;
        points.push(last);
    }
    points.push(end);
    points
}

/// Setpoints covering every segment of `curve` with `segment_count` interior
/// points per segment, as one continuous ascending sequence. Shared segment
/// endpoints appear once; the domain extrema appear exactly once each.
///
/// A single-breakpoint (constant) curve yields its lone x value.
pub fn sample_points(curve: &Curve, segment_count: usize) -> Vec<f64> {
    let bps = curve.breakpoints();
    let mut points = vec![bps[0].x];
    for pair in bps.windows(2) {
        let segment = segment_points(pair[0].x, pair[1].x, segment_count);
        points.extend_from_slice(&segment[1..]);
    }
    points
}

/// The sweep order for a direction: ascending as generated, or reversed.
pub fn ordered_for(points: &[f64], direction: SweepDirection) -> Vec<f64> {
    match direction {
        SweepDirection::Up => points.to_vec(),
        SweepDirection::Down => points.iter().rev().copied().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::Breakpoint;

    #[test]
    fn test_segment_points_count_and_endpoints() {
        let points = segment_points(100.0, 110.0, 3);
        assert_eq!(points.len(), 5);
        assert_eq!(points[0], 100.0);
        assert_eq!(points[4], 110.0);
    }

    #[test]
    fn test_segment_points_even_spacing() {
        let points = segment_points(60.0, 61.0, 4);
        let step = (61.0 - 60.0) / 5.0;
        for pair in points.windows(2) {
            assert!((pair[1] - pair[0] - step).abs() < 1e-9);
        }
    }

    #[test]
    fn test_sample_points_no_duplicated_boundaries() {
        let v = [100.0, 110.0, 120.0, 130.0, 140.0, 150.0];
        let q = [50.0, 50.0, 0.0, 0.0, -50.0, -50.0];
        let curve = Curve::from_points(
            v.iter()
                .zip(q.iter())
                .map(|(&x, &y)| Breakpoint::new(x, y))
                .collect(),
        )
        .unwrap();

        let points = sample_points(&curve, 3);
        // 5 segments of (3 interior + far endpoint) plus the leading extremum.
        assert_eq!(points.len(), 21);
        assert_eq!(points[0], 100.0);
        assert_eq!(points[20], 150.0);
        for pair in points.windows(2) {
            assert!(pair[1] > pair[0], "duplicate or out-of-order: {:?}", pair);
        }
    }

    #[test]
    fn test_sample_points_constant_curve() {
        let curve = Curve::constant(0.9);
        assert_eq!(sample_points(&curve, 3), vec![0.0]);
    }

    #[test]
    fn test_down_is_reversed_up() {
        let points = vec![1.0, 2.0, 3.0];
        assert_eq!(ordered_for(&points, SweepDirection::Up), points);
        assert_eq!(
            ordered_for(&points, SweepDirection::Down),
            vec![3.0, 2.0, 1.0]
        );
    }
}
