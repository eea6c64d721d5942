//! Robust statistics of `y` in bins of `x`.

use crate::error::FgcmError;
use crate::ndarray_utils::median;

const MAD_TO_SIGMA: f64 = 1.4826;

/// Asymptotic ratio of the standard error of the median to that of the mean for normal data.
const MEDIAN_ERR_SCALE: f64 = 1.2533;

/// Statistics of one bin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bin {
    /// Lower edge.
    pub x_bin: f64,
    /// Median of `x`.
    pub x: f64,
    /// Robust width of `x`.
    pub x_err: f64,
    /// Median of `y`.
    pub y: f64,
    /// Robust width of `y`.
    pub y_width: f64,
    /// Error of the median of `y`.
    pub y_err: f64,
    /// Number of points.
    pub n: usize,
}

/// Bin `y` by `x` over `x_range` with bins of `bin_size`.
///
/// Only bins with at least `min_per_bin` points are returned, in increasing `x`.
/// Points outside `[x_range.0, x_range.1)` are ignored.
pub fn data_binner(
    x: &[f64],
    y: &[f64],
    bin_size: f64,
    x_range: (f64, f64),
    min_per_bin: usize,
) -> Result<Vec<Bin>, FgcmError> {
    FgcmError::check_len("y", x.len(), y.len())?;
    if !(bin_size > 0.0 && x_range.1 > x_range.0) {
        return Err(FgcmError::InvalidConfig(format!(
            "invalid binning: size {bin_size}, range {x_range:?}"
        )));
    }
    let n_bins = ((x_range.1 - x_range.0) / bin_size).ceil() as usize;
    let mut members = vec![Vec::new(); n_bins];
    for (i, &xi) in x.iter().enumerate() {
        if xi >= x_range.0 && xi < x_range.1 && y[i].is_finite() {
            let bin = (((xi - x_range.0) / bin_size) as usize).min(n_bins - 1);
            members[bin].push(i);
        }
    }

    let bins = members
        .into_iter()
        .enumerate()
        .filter(|(_, idx)| !idx.is_empty() && idx.len() >= min_per_bin)
        .filter_map(|(b, idx)| {
            let (x, x_err) = robust(idx.iter().map(|&i| x[i]).collect())?;
            let (y, y_width) = robust(idx.iter().map(|&i| y[i]).collect())?;
            Some(Bin {
                x_bin: x_range.0 + b as f64 * bin_size,
                x,
                x_err,
                y,
                y_width,
                y_err: MEDIAN_ERR_SCALE * y_width / (idx.len() as f64).sqrt(),
                n: idx.len(),
            })
        })
        .collect();
    Ok(bins)
}

/// Median and scaled median absolute deviation.
fn robust(mut values: Vec<f64>) -> Option<(f64, f64)> {
    let center = median(&mut values)?;
    let mut abs_dev = values.iter().map(|v| (v - center).abs()).collect::<Vec<_>>();
    Some((center, MAD_TO_SIGMA * median(&mut abs_dev)?))
}
