//! Monotone cubic Hermite interpolation (PCHIP, Fritsch–Carlson), used by
//! the continuous-average restoration pass (C5) to fill gaps between native
//! readings without overshoot.
//!
//! No crate in the dependency stack provides this (the reference system
//! leans on `scipy.interpolate.PchipInterpolator`); it is implemented here
//! as core domain algorithm, not a stand-in for an ambient concern.

/// A monotone cubic Hermite spline through a strictly increasing set of
/// `(x, y)` knots.
pub struct PchipInterpolator {
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// Derivative at each knot.
    ds: Vec<f64>,
}

impl PchipInterpolator {
    /// Build the spline. `xs` must be strictly increasing and the same
    /// length as `ys`.
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Self {
        assert_eq!(xs.len(), ys.len());
        assert!(xs.len() >= 2, "PCHIP needs at least 2 points");
        for w in xs.windows(2) {
            assert!(w[1] > w[0], "knots must be strictly increasing");
        }

        let n = xs.len();
        let h: Vec<f64> = (0..n - 1).map(|i| xs[i + 1] - xs[i]).collect();
        let delta: Vec<f64> = (0..n - 1).map(|i| (ys[i + 1] - ys[i]) / h[i]).collect();

        let mut ds = vec![0.0; n];

        if n == 2 {
            ds[0] = delta[0];
            ds[1] = delta[0];
        } else {
            for i in 1..n - 1 {
                if delta[i - 1] == 0.0 || delta[i] == 0.0 || delta[i - 1].signum() != delta[i].signum() {
                    ds[i] = 0.0;
                } else {
                    let w1 = 2.0 * h[i] + h[i - 1];
                    let w2 = h[i] + 2.0 * h[i - 1];
                    ds[i] = (w1 + w2) / (w1 / delta[i - 1] + w2 / delta[i]);
                }
            }
            ds[0] = Self::end_derivative(h[0], h[1], delta[0], delta[1]);
            ds[n - 1] = Self::end_derivative(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
        }

        Self { xs, ys, ds }
    }

    /// Non-centered, shape-preserving one-sided derivative estimate at a
    /// boundary knot (Fritsch–Carlson end condition).
    fn end_derivative(h0: f64, h1: f64, delta0: f64, delta1: f64) -> f64 {
        let mut d = ((2.0 * h0 + h1) * delta0 - h0 * delta1) / (h0 + h1);
        if d.signum() != delta0.signum() {
            d = 0.0;
        } else if delta0.signum() != delta1.signum() && d.abs() > 3.0 * delta0.abs() {
            d = 3.0 * delta0;
        }
        d
    }

    /// Evaluate the spline at `x` (must lie within `[xs[0], xs[last]]`).
    pub fn eval(&self, x: f64) -> f64 {
        let n = self.xs.len();
        let i = match self.xs.partition_point(|&k| k <= x) {
            0 => 0,
            p if p >= n => n - 2,
            p => p - 1,
        };

        let h = self.xs[i + 1] - self.xs[i];
        let t = (x - self.xs[i]) / h;
        let t2 = t * t;
        let t3 = t2 * t;

        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;

        h00 * self.ys[i] + h10 * h * self.ds[i] + h01 * self.ys[i + 1] + h11 * h * self.ds[i + 1]
    }

    /// Evaluate at each point of `grid`.
    pub fn eval_many(&self, grid: &[f64]) -> Vec<f64> {
        grid.iter().map(|&x| self.eval(x)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_through_knots_exactly() {
        let s = PchipInterpolator::new(vec![0.0, 1.0, 2.0, 3.0], vec![0.0, 1.0, 1.0, 0.0]);
        for (x, y) in [(0.0, 0.0), (1.0, 1.0), (2.0, 1.0), (3.0, 0.0)] {
            assert!((s.eval(x) - y).abs() < 1e-9);
        }
    }

    #[test]
    fn monotone_data_stays_monotone_between_knots() {
        let s = PchipInterpolator::new(vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 5.0]);
        let a = s.eval(0.25);
        let b = s.eval(0.75);
        assert!(a < b);
        assert!(b < s.eval(1.0));
    }

    #[test]
    fn two_point_spline_is_linear() {
        let s = PchipInterpolator::new(vec![0.0, 10.0], vec![0.0, 20.0]);
        assert!((s.eval(5.0) - 10.0).abs() < 1e-9);
    }
}
