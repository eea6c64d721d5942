//! The repeatability engine: intrinsic photometric scatter per band.

use std::time::Instant;

use itertools::Itertools;
use log::{info, warn};
use ndarray::Array2;

use crate::config::FgcmConfig;
use crate::error::FgcmError;
use crate::gray::{gray_observations, GrayObs};
use crate::histogram::histo_gauss;
use crate::ndarray_utils::{color_cuts, median};
use crate::parameters::FgcmParameters;
use crate::stars::{FgcmStars, ObjFlag};

/// Labels of the color cuts, in the column order of [`FgcmSigFgcm::compute_sig_fgcm`].
pub const COLOR_CUT_NAMES: [&str; 4] = ["All", "Blue25", "Middle50", "Red25"];

/// Scatter assumed when the Gaussian fit fails.
pub const SIG_FGCM_FIT_FAILED: f64 = 0.05;

/// Scatter assumed when the median measurement variance exceeds the fitted variance.
pub const SIG_FGCM_ERROR_DOMINATED: f64 = 0.001;

/// Repeatability engine.
#[derive(Clone, Debug)]
pub struct FgcmSigFgcm {
    config: FgcmConfig,
}

impl FgcmSigFgcm {
    /// Create an engine.
    pub fn new(config: FgcmConfig) -> Self {
        Self { config }
    }

    /// The configuration.
    pub fn config(&self) -> &FgcmConfig {
        &self.config
    }

    /// Intrinsic scatter of the gray residuals, per band and color cut.
    ///
    /// Uses the good observations on photometric exposures of the calibration stars, or of the
    /// reserved stars with `reserved`. For every band and every cut of [`COLOR_CUT_NAMES`] a Gaussian
    /// is fitted to the residuals with `|EGray| < sig_fgcm_max_egray` and a decorrelated variance in
    /// `(0, sig_fgcm_max_err^2)`; the intrinsic scatter is `sqrt(sigma^2 - median(variance))`,
    /// [`SIG_FGCM_FIT_FAILED`] if the fit fails and [`SIG_FGCM_ERROR_DOMINATED`] if the measurement
    /// variance dominates.
    ///
    /// Returns an `(n_bands, 4)` array; cuts without residuals hold the illegal value.
    /// With `save` the "All" column is written to the parameters.
    /// `crunch` only labels the log output as computed on gray-corrected magnitudes.
    pub fn compute_sig_fgcm(
        &self,
        pars: &mut FgcmParameters,
        stars: &FgcmStars,
        reserved: bool,
        save: bool,
        crunch: bool,
    ) -> Result<Array2<f64>, FgcmError> {
        if !stars.mag_std_computed {
            return Err(FgcmError::MagStdNotComputed("compute_sig_fgcm"));
        }
        FgcmError::check_len("sigFgcm bands", pars.n_bands(), stars.n_bands())?;
        self.config.check_color_split(stars.n_bands())?;
        let start = Instant::now();
        let label = match (reserved, crunch) {
            (true, false) => "reserved",
            (true, true) => "reserved_crunched",
            (false, false) => "all",
            (false, true) => "all_crunched",
        };
        info!("Computing sigFgcm ({})", label);

        let use_star = |o: usize| {
            stars.min_required_obs(o) >= stars.min_obs_per_band
                && if reserved {
                    stars.obj_flag[o] & ObjFlag::RESERVED > 0
                } else {
                    stars.obj_flag[o] == 0
                }
        };
        let gray_obs = gray_observations(stars, pars.n_exp(), use_star)?
            .into_iter()
            .filter(|g| pars.exposures.flag[g.exp] == 0)
            .map(|g| {
                let err2 = stars.obs.mag_adu_model_err[g.obs].powi(2)
                    - stars.obj_mag_std_mean_err[(g.obj, g.band)].powi(2);
                (g, err2)
            })
            .collect_vec();

        let [c0, c1] = self.config.color_split_indices;
        let color = |g: &GrayObs| stars.obj_mag_std_mean[(g.obj, c0)] - stars.obj_mag_std_mean[(g.obj, c1)];
        let mut sig_fgcm =
            Array2::from_elem((stars.n_bands(), COLOR_CUT_NAMES.len()), self.config.illegal_value);
        let mut colors = gray_obs.iter().map(|(g, _)| color(g)).collect_vec();
        let Some([lowest, q25, q75, highest]) = color_cuts(&mut colors) else {
            warn!("sigFgcm ({}): no good observations", label);
            return Ok(sig_fgcm);
        };
        let ranges = [(lowest, highest), (lowest, q25), (q25, q75), (q75, highest)];

        let max_err2 = self.config.sig_fgcm_max_err.powi(2);
        for band in 0..stars.n_bands() {
            for (c, &(lo, hi)) in ranges.iter().enumerate() {
                let (e_gray, err2): (Vec<f64>, Vec<f64>) = gray_obs
                    .iter()
                    .filter(|(g, err2)| {
                        g.band == band
                            && g.e_gray.abs() < self.config.sig_fgcm_max_egray
                            && g.e_gray != 0.0
                            && *err2 > 0.0
                            && *err2 < max_err2
                    })
                    .filter(|(g, _)| {
                        let c = color(g);
                        c > lo && c < hi
                    })
                    .map(|(g, err2)| (g.e_gray, *err2))
                    .unzip();
                if e_gray.is_empty() {
                    info!(
                        "sigFgcm: no good observations in {} band ({})",
                        pars.bands[band], COLOR_CUT_NAMES[c]
                    );
                    continue;
                }

                let sigma = histo_gauss(&e_gray).map_or(f64::INFINITY, |fit| fit.sigma);
                let mut err2 = err2;
                let median_err2 = median(&mut err2).unwrap_or(0.0);
                let value = if !sigma.is_finite() {
                    warn!(
                        "Failed to compute sigFgcm ({}) ({}), setting to {}",
                        pars.bands[band], COLOR_CUT_NAMES[c], SIG_FGCM_FIT_FAILED
                    );
                    SIG_FGCM_FIT_FAILED
                } else if median_err2 > sigma * sigma {
                    info!(
                        "Typical error is larger than width ({}) ({}), setting to {}",
                        pars.bands[band], COLOR_CUT_NAMES[c], SIG_FGCM_ERROR_DOMINATED
                    );
                    SIG_FGCM_ERROR_DOMINATED
                } else {
                    (sigma * sigma - median_err2).sqrt()
                };
                info!(
                    "Cycle {} sigFgcm ({}) ({}) ({}) = {:.4}",
                    self.config.cycle_number, label, pars.bands[band], COLOR_CUT_NAMES[c], value
                );
                sig_fgcm[(band, c)] = value;
                if save && c == 0 {
                    pars.comp_sig_fgcm[band] = value;
                }
            }
        }

        info!("Computed sigFgcm in {:.2?}", start.elapsed());
        Ok(sig_fgcm)
    }
}
