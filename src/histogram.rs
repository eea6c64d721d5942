//! Gaussian fit to the histogram of a sample.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DVector, Dyn, OMatrix, Vector3, U3};

use crate::error::FgcmError;
use crate::ndarray_utils::{median, sorted_with_iqr};

/// Scale of the median absolute deviation to the standard deviation of a normal distribution.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Half width of the histogram in robust standard deviations.
const CLIP_SIGMA: f64 = 5.0;

/// Upper limit on the number of histogram bins.
const MAX_BINS: usize = 1000;

/// Result of [`histo_gauss`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussFit {
    /// Peak height in counts per bin.
    pub amplitude: f64,
    /// Center.
    pub mean: f64,
    /// Width, non-negative.
    pub sigma: f64,
    /// Whether the least-squares fit converged; otherwise the starting guess is returned.
    pub converged: bool,
    /// Number of values inside the histogram range.
    pub n_used: usize,
}

struct GaussProblem {
    centers: DVector<f64>,
    counts: DVector<f64>,
    p: Vector3<f64>,
}

impl LeastSquaresProblem<f64, Dyn, U3> for GaussProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, p: &Vector3<f64>) {
        self.p.copy_from(p);
    }

    fn params(&self) -> Vector3<f64> {
        self.p
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let [a, mu, sigma] = [self.p[0], self.p[1], self.p[2]];
        Some(DVector::from_iterator(
            self.centers.len(),
            self.centers
                .iter()
                .zip(self.counts.iter())
                .map(|(&x, &y)| a * (-0.5 * ((x - mu) / sigma).powi(2)).exp() - y),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U3>> {
        let [a, mu, sigma] = [self.p[0], self.p[1], self.p[2]];
        let mut jac = OMatrix::<f64, Dyn, U3>::zeros(self.centers.len());
        for (i, &x) in self.centers.iter().enumerate() {
            let z = (x - mu) / sigma;
            let g = (-0.5 * z * z).exp();
            jac[(i, 0)] = g;
            jac[(i, 1)] = a * g * z / sigma;
            jac[(i, 2)] = a * g * z * z / sigma;
        }
        Some(jac)
    }
}

/// Fit a Gaussian to the histogram of `values`.
///
/// The histogram spans five robust standard deviations around the median, with the
/// Freedman–Diaconis bin size `2 IQR n^(-1/3)` of the values in that range, widened to at most
/// a thousand bins.
/// If the fit does not converge the starting guess (peak count, median, standard deviation)
/// is returned with `converged` unset.
pub fn histo_gauss(values: &[f64]) -> Result<GaussFit, FgcmError> {
    let mut finite = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect::<Vec<_>>();
    let center = median(&mut finite).ok_or(FgcmError::DegenerateSample("empty sample"))?;
    let mut abs_dev = finite.iter().map(|v| (v - center).abs()).collect::<Vec<_>>();
    let mut width = MAD_TO_SIGMA * median(&mut abs_dev).unwrap_or(0.0);
    if width <= 0.0 {
        width = std_dev(&finite);
    }
    if width <= 0.0 {
        return Err(FgcmError::DegenerateSample("sample has zero width"));
    }

    let (lo, hi) = (center - CLIP_SIGMA * width, center + CLIP_SIGMA * width);
    let clipped = finite
        .into_iter()
        .filter(|v| (lo..=hi).contains(v))
        .collect::<Vec<_>>();
    let n = clipped.len();
    let (clipped, iqr) =
        sorted_with_iqr(clipped).ok_or(FgcmError::DegenerateSample("empty sample"))?;
    let bin_size = 2.0 * iqr * (n as f64).powf(-1.0 / 3.0);
    if bin_size <= 0.0 {
        return Err(FgcmError::DegenerateSample("zero interquartile range"));
    }
    // a narrow core in a wide range must not explode the bin count
    let bin_size = bin_size.max((hi - lo) / MAX_BINS as f64);

    let n_bins = (((hi - lo) / bin_size).ceil() as usize).max(1);
    let mut counts = vec![0.0; n_bins];
    for v in &clipped {
        let bin = (((v - lo) / bin_size) as usize).min(n_bins - 1);
        counts[bin] += 1.0;
    }
    let centers = (0..n_bins)
        .map(|i| lo + (i as f64 + 0.5) * bin_size)
        .collect::<Vec<_>>();

    let peak = counts.iter().copied().fold(0.0, f64::max);
    let guess = Vector3::new(peak, center, std_dev(&clipped).max(f64::EPSILON));
    let problem = GaussProblem {
        centers: DVector::from_vec(centers),
        counts: DVector::from_vec(counts),
        p: guess,
    };

    let (problem, converged) = if n_bins >= 3 {
        let (problem, report) = LevenbergMarquardt::new().minimize(problem);
        (problem, report.termination.was_successful())
    } else {
        (problem, false)
    };
    let p = if converged && problem.p.iter().all(|p| p.is_finite()) {
        problem.p
    } else {
        guess
    };

    Ok(GaussFit {
        amplitude: p[0],
        mean: p[1],
        sigma: p[2].abs(),
        converged,
        n_used: n,
    })
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::{Distribution, Normal};

    use super::*;

    #[test]
    fn normal_sample() {
        let mut rng = StdRng::seed_from_u64(42);
        let normal = Normal::new(0.1, 0.02).unwrap();
        let mut values = (0..20_000).map(|_| normal.sample(&mut rng)).collect::<Vec<_>>();
        // a few far outliers are excluded by the histogram range
        values.extend([5.0, -3.0, f64::NAN]);

        let fit = histo_gauss(&values).unwrap();
        assert!(fit.converged);
        assert!(fit.n_used >= 19_990 && fit.n_used <= 20_000);
        assert_abs_diff_eq!(fit.mean, 0.1, epsilon = 1e-3);
        assert_abs_diff_eq!(fit.sigma, 0.02, epsilon = 1e-3);
    }

    #[test]
    fn degenerate() {
        assert!(matches!(
            histo_gauss(&[]),
            Err(FgcmError::DegenerateSample(_))
        ));
        assert!(matches!(
            histo_gauss(&[1.0; 10]),
            Err(FgcmError::DegenerateSample(_))
        ));
    }

    #[test]
    fn narrow_core_in_wide_range() {
        // zero MAD falls back to the standard deviation while the IQR stays at 1e-9
        let mut values = vec![0.0; 60];
        values.extend([1e-9; 20]);
        values.extend((1..=10).flat_map(|k| [0.1 * k as f64, -0.1 * k as f64]));

        let fit = histo_gauss(&values).unwrap();
        assert_eq!(fit.n_used, 100);
        assert!(fit.sigma.is_finite());
    }
}
