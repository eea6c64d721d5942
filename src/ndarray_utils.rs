//! A collection of various utilities needed in this library.
//! The two main groups are index bookkeeping on sorted index arrays
//! (matching and splitting), and order statistics on float slices.

use std::cmp::Ordering;
use std::ops::Range;

use ndarray::ArrayView1;

use crate::error::FgcmError;
use crate::Float;

/// Match the sorted unique values `a` against the sorted values `b`.
///
/// Returns the indices `(i_a, i_b)` of all pairs with `a[i_a] == b[i_b]`, ordered by `i_b`.
/// Both inputs are walked once; `b` may contain repeated values.
pub(crate) fn presorted_match(
    a: &[usize],
    b: ArrayView1<usize>,
) -> Result<(Vec<usize>, Vec<usize>), FgcmError> {
    if b.windows(2).into_iter().any(|w| w[1] < w[0]) {
        return Err(FgcmError::UnsortedObservations);
    }
    let mut sub_a = Vec::new();
    let mut sub_b = Vec::new();
    let mut i = 0;
    for (j, value) in b.iter().enumerate() {
        while i < a.len() && a[i] < *value {
            i += 1;
        }
        if i == a.len() {
            break;
        }
        if a[i] == *value {
            sub_a.push(i);
            sub_b.push(j);
        }
    }
    Ok((sub_a, sub_b))
}

/// Split `0..n` into `n_sections` contiguous ranges whose lengths differ by at most one.
/// The first `n % n_sections` ranges are the longer ones.
pub(crate) fn array_split(n: usize, n_sections: usize) -> Vec<Range<usize>> {
    let n_sections = n_sections.max(1);
    let base = n / n_sections;
    let extra = n % n_sections;
    let mut start = 0;
    (0..n_sections)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

fn sort_floats<F: Float>(values: &mut [F]) {
    values.sort_unstable_by(|f1, f2| f1.partial_cmp(f2).unwrap_or(Ordering::Equal));
}

/// Median, averaging the two central values for an even count.
pub(crate) fn median<F: Float>(values: &mut [F]) -> Option<F> {
    if values.is_empty() {
        return None;
    }
    sort_floats(values);
    let n = values.len();
    if n % 2 == 1 {
        Some(values[n / 2])
    } else {
        Some((values[n / 2 - 1] + values[n / 2]) / (F::one() + F::one()))
    }
}

/// Percentile `q` in `[0, 100]` of sorted values with linear interpolation between ranks.
pub(crate) fn percentile_sorted<F: Float>(sorted: &[F], q: f64) -> Option<F> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = q.clamp(0.0, 100.0) / 100.0 * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = F::from_f64(rank - lo as f64)?;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Sort `values` and return them with their interquartile range.
pub(crate) fn sorted_with_iqr<F: Float>(mut values: Vec<F>) -> Option<(Vec<F>, F)> {
    sort_floats(&mut values);
    let q25 = percentile_sorted(&values, 25.0)?;
    let q75 = percentile_sorted(&values, 75.0)?;
    Some((values, q75 - q25))
}

/// Color cut points splitting `colors` into the bluest quarter, the middle half and the reddest quarter.
///
/// Returns `[min, c25, c75, max]` where `c25` and `c75` are taken at the ranks
/// `floor(0.25 n)` and `floor(0.75 n)` of the sorted colors.
pub(crate) fn color_cuts(colors: &mut [f64]) -> Option<[f64; 4]> {
    let n = colors.len();
    if n == 0 {
        return None;
    }
    sort_floats(colors);
    Some([
        colors[0],
        colors[n / 4],
        colors[(3 * n) / 4],
        colors[n - 1],
    ])
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::seq::SliceRandom;
    use ndarray_rand::rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn match_presorted() {
        let a = [1, 3, 4, 7];
        let b = array![0, 1, 1, 2, 3, 5, 7, 7, 9];
        let (sub_a, sub_b) = presorted_match(&a, b.view()).unwrap();
        assert_eq!(sub_a, vec![0, 0, 1, 3, 3]);
        assert_eq!(sub_b, vec![1, 2, 4, 6, 7]);

        let (sub_a, sub_b) = presorted_match(&[], b.view()).unwrap();
        assert!(sub_a.is_empty() && sub_b.is_empty());
    }

    #[test]
    fn match_unsorted() {
        let b = array![0, 2, 1];
        assert_eq!(
            presorted_match(&[0, 1], b.view()),
            Err(FgcmError::UnsortedObservations)
        );
    }

    #[test]
    fn split() {
        assert_eq!(array_split(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(array_split(2, 3), vec![0..1, 1..2, 2..2]);
        assert_eq!(array_split(5, 1), vec![0..5]);
    }

    #[test]
    fn order_statistics() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median::<f64>(&mut []), None);

        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile_sorted(&sorted, 25.0), Some(2.0));
        assert_abs_diff_eq!(percentile_sorted(&sorted, 10.0).unwrap(), 1.4, epsilon = 1e-12);
        assert_eq!(sorted_with_iqr(vec![5.0, 1.0, 3.0, 2.0, 4.0]).unwrap().1, 2.0);
    }

    #[test]
    fn color_cut_percentiles() {
        let mut rng = StdRng::seed_from_u64(5);
        let n = 10_000;
        let mut colors = (0..n).map(|_| rng.gen_range(0.0..2.0)).collect::<Vec<f64>>();
        colors.shuffle(&mut rng);
        let cuts = color_cuts(&mut colors).unwrap();
        assert_abs_diff_eq!(cuts[0], 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(cuts[1], 0.5, epsilon = 0.05);
        assert_abs_diff_eq!(cuts[2], 1.5, epsilon = 0.05);
        assert_abs_diff_eq!(cuts[3], 2.0, epsilon = 0.01);

        let mut exact = (0..100).rev().map(f64::from).collect::<Vec<_>>();
        assert_eq!(color_cuts(&mut exact), Some([0.0, 25.0, 75.0, 99.0]));
    }
}
