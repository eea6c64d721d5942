//! The gray-residual engine.

use std::time::Instant;

use itertools::Itertools;
use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::binner::{data_binner, Bin};
use crate::config::FgcmConfig;
use crate::error::FgcmError;
use crate::histogram::{histo_gauss, GaussFit};
use crate::ndarray_utils::{color_cuts, presorted_match};
use crate::parameters::FgcmParameters;
use crate::stars::{FgcmStars, MAG_VALID_MAX};

/// Number of color bins of the color split: blue 25 %, middle 50 % and red 25 %.
pub const N_COLOR_BINS: usize = 3;

/// Gray residual of one observation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct GrayObs {
    pub(crate) obs: usize,
    pub(crate) obj: usize,
    pub(crate) exp: usize,
    pub(crate) band: usize,
    /// Object mean minus standardized magnitude.
    pub(crate) e_gray: f64,
}

/// Good observations of the stars accepted by `use_star`, with their gray residuals.
///
/// Required bands are always used; other bands only for objects with enough good observations in them.
pub(crate) fn gray_observations(
    stars: &FgcmStars,
    n_exp: usize,
    use_star: impl Fn(usize) -> bool,
) -> Result<Vec<GrayObs>, FgcmError> {
    let good_stars = (0..stars.n_stars()).filter(|&o| use_star(o)).collect_vec();
    let (_, matched) = presorted_match(&good_stars, stars.obs.obj_index.view())?;
    let obs = &stars.obs;
    if let Some(&i) = matched.iter().find(|&&i| obs.exp_index[i] >= n_exp) {
        return Err(FgcmError::InvalidConfig(format!(
            "observation {i} has exposure {} out of range (< {n_exp})",
            obs.exp_index[i]
        )));
    }
    let mut required = vec![false; stars.n_bands()];
    for &b in stars.required_bands() {
        required[b] = true;
    }
    Ok(matched
        .into_iter()
        .filter(|&i| obs.flag[i] == 0)
        .filter_map(|i| {
            let obj = obs.obj_index[i];
            let band = obs.band_index[i];
            let used =
                required[band] || stars.obj_n_good_obs[(obj, band)] >= stars.min_obs_per_band;
            used.then(|| GrayObs {
                obs: i,
                obj,
                exp: obs.exp_index[i],
                band,
                e_gray: stars.obj_mag_std_mean[(obj, band)] - stars.obs_mag_std[i],
            })
        })
        .collect())
}

/// Calibration stars: clean flags and enough good observations in every required band.
pub(crate) fn is_calibration_star(stars: &FgcmStars, obj: usize) -> bool {
    stars.obj_flag[obj] == 0 && stars.min_required_obs(obj) >= stars.min_obs_per_band
}

/// Gray-residual engine.
///
/// Aggregates the residuals between object means and standardized magnitudes to per-CCD and
/// per-exposure "gray" terms. Cells without sufficient data hold the configured illegal value.
#[derive(Clone, Debug)]
pub struct FgcmGray {
    config: FgcmConfig,

    exp_gray_for_initial_selection: Array1<f64>,
    exp_gray_rms_for_initial_selection: Array1<f64>,
    exp_n_good_star_for_initial_selection: Array1<usize>,

    ccd_gray: Array2<f64>,
    ccd_gray_rms: Array2<f64>,
    ccd_gray_err: Array2<f64>,
    ccd_n_good_obs: Array2<usize>,
    ccd_n_good_stars: Array2<usize>,
    ccd_n_good_tilings: Array2<f64>,

    exp_gray: Array1<f64>,
    exp_gray_rms: Array1<f64>,
    exp_gray_err: Array1<f64>,
    exp_n_good_ccds: Array1<usize>,
    exp_n_good_stars: Array1<usize>,
    exp_n_good_tilings: Array1<f64>,

    exp_gray_color_split: Array2<f64>,
    exp_gray_rms_color_split: Array2<f64>,
    exp_n_good_stars_color_split: Array2<usize>,
}

impl FgcmGray {
    /// Create an engine with result arrays sized to the exposures and CCDs of `pars`.
    pub fn new(config: FgcmConfig, pars: &FgcmParameters) -> Self {
        let n_exp = pars.n_exp();
        let ccd_shape = (n_exp, pars.n_ccd());
        let color_shape = (n_exp, N_COLOR_BINS);
        Self {
            config,
            exp_gray_for_initial_selection: Array1::zeros(n_exp),
            exp_gray_rms_for_initial_selection: Array1::zeros(n_exp),
            exp_n_good_star_for_initial_selection: Array1::zeros(n_exp),
            ccd_gray: Array2::zeros(ccd_shape),
            ccd_gray_rms: Array2::zeros(ccd_shape),
            ccd_gray_err: Array2::zeros(ccd_shape),
            ccd_n_good_obs: Array2::zeros(ccd_shape),
            ccd_n_good_stars: Array2::zeros(ccd_shape),
            ccd_n_good_tilings: Array2::zeros(ccd_shape),
            exp_gray: Array1::zeros(n_exp),
            exp_gray_rms: Array1::zeros(n_exp),
            exp_gray_err: Array1::zeros(n_exp),
            exp_n_good_ccds: Array1::zeros(n_exp),
            exp_n_good_stars: Array1::zeros(n_exp),
            exp_n_good_tilings: Array1::zeros(n_exp),
            exp_gray_color_split: Array2::zeros(color_shape),
            exp_gray_rms_color_split: Array2::zeros(color_shape),
            exp_n_good_stars_color_split: Array2::zeros(color_shape),
        }
    }

    fn check_exposures(&self, pars: &FgcmParameters) -> Result<(), FgcmError> {
        FgcmError::check_len("gray exposures", self.exp_gray.len(), pars.n_exp())?;
        FgcmError::check_len("gray CCDs", self.ccd_gray.ncols(), pars.n_ccd())
    }

    /// Unweighted mean and RMS of the gray residuals per exposure, for a first photometricity cut.
    ///
    /// Exposures without any residual keep zeros.
    pub fn compute_exp_gray_for_initial_selection(
        &mut self,
        pars: &FgcmParameters,
        stars: &FgcmStars,
    ) -> Result<(), FgcmError> {
        if !stars.mag_std_computed {
            return Err(FgcmError::MagStdNotComputed(
                "compute_exp_gray_for_initial_selection",
            ));
        }
        self.check_exposures(pars)?;
        let start = Instant::now();
        info!("Computing ExpGray for initial selection");

        let gray_obs = gray_observations(stars, pars.n_exp(), |o| is_calibration_star(stars, o))?;
        info!(
            "Initial exp gray using {} observations",
            gray_obs.len()
        );

        self.exp_gray_for_initial_selection.fill(0.0);
        self.exp_gray_rms_for_initial_selection.fill(0.0);
        self.exp_n_good_star_for_initial_selection.fill(0);
        for g in &gray_obs {
            self.exp_gray_for_initial_selection[g.exp] += g.e_gray;
            self.exp_gray_rms_for_initial_selection[g.exp] += g.e_gray * g.e_gray;
            self.exp_n_good_star_for_initial_selection[g.exp] += 1;
        }

        let mut n_good = 0;
        for exp in 0..pars.n_exp() {
            let n = self.exp_n_good_star_for_initial_selection[exp];
            if n > 0 {
                let mean = self.exp_gray_for_initial_selection[exp] / n as f64;
                let rms2 = self.exp_gray_rms_for_initial_selection[exp] / n as f64 - mean * mean;
                self.exp_gray_for_initial_selection[exp] = mean;
                self.exp_gray_rms_for_initial_selection[exp] = rms2.max(0.0).sqrt();
                n_good += 1;
            }
        }
        info!(
            "ExpGray for initial selection computed for {} exposures in {:.2?}",
            n_good,
            start.elapsed()
        );

        if self.config.diagnostics {
            let use_exp = (0..pars.n_exp())
                .filter(|&e| {
                    pars.exposures.flag[e] == 0
                        && self.exp_n_good_star_for_initial_selection[e] > self.config.min_star_per_exp
                        && self.exp_gray_for_initial_selection[e] > self.config.exp_gray_initial_cut
                })
                .collect_vec();
            self.log_band_summaries(pars, &use_exp, self.exp_gray_for_initial_selection.view(), "initial exp gray");
        }
        Ok(())
    }

    /// Inverse-variance weighted gray per `(exposure, CCD)` and per exposure.
    ///
    /// With `only_obs_err` the residual variance is the observation variance alone, otherwise
    /// the variance of the object mean is subtracted. Residuals whose variance is not positive
    /// or not below `ccd_gray_max_star_err` are discarded. CCDs need more than two stars; exposures
    /// need more than two CCDs with at least `min_star_per_ccd` stars and an error below
    /// `max_ccd_gray_err`. The exposure gray, its variance and star counts are written to `pars`.
    pub fn compute_ccd_and_exp_gray(
        &mut self,
        pars: &mut FgcmParameters,
        stars: &FgcmStars,
        only_obs_err: bool,
    ) -> Result<(), FgcmError> {
        if !stars.all_mag_std_computed {
            return Err(FgcmError::MagStdNotComputed("compute_ccd_and_exp_gray"));
        }
        self.check_exposures(pars)?;
        let start = Instant::now();
        info!("Computing CCDGray and ExpGray");
        let illegal = self.config.illegal_value;
        let ccd_start = self.config.ccd_start_index;

        let gray_obs = gray_observations(stars, pars.n_exp(), |o| is_calibration_star(stars, o))?;
        let n_total = gray_obs.len();
        let gray_obs = gray_obs
            .into_iter()
            .filter_map(|g| {
                let obs_err2 = stars.obs.mag_adu_model_err[g.obs].powi(2);
                let err2 = if only_obs_err {
                    obs_err2
                } else {
                    obs_err2 - stars.obj_mag_std_mean_err[(g.obj, g.band)].powi(2)
                };
                (err2 > 0.0 && err2 < self.config.ccd_gray_max_star_err).then_some((g, err2))
            })
            .collect_vec();
        info!(
            "FgcmGray using {} of {} observations",
            gray_obs.len(),
            n_total
        );

        let mut ccd_wt = Array2::<f64>::zeros(self.ccd_gray.raw_dim());
        self.ccd_gray.fill(0.0);
        self.ccd_gray_rms.fill(0.0);
        self.ccd_gray_err.fill(0.0);
        self.ccd_n_good_obs.fill(0);
        self.ccd_n_good_stars.fill(0);
        self.ccd_n_good_tilings.fill(0.0);
        let n_ccd = pars.n_ccd();
        if let Some((g, _)) = gray_obs
            .iter()
            .find(|(g, _)| !(ccd_start..ccd_start + n_ccd).contains(&stars.obs.ccd_index[g.obs]))
        {
            return Err(FgcmError::InvalidConfig(format!(
                "observation {} has CCD {} out of range",
                g.obs, stars.obs.ccd_index[g.obs]
            )));
        }
        for (g, err2) in &gray_obs {
            let cell = (g.exp, stars.obs.ccd_index[g.obs] - ccd_start);
            ccd_wt[cell] += 1.0 / err2;
            self.ccd_gray[cell] += g.e_gray / err2;
            self.ccd_gray_rms[cell] += g.e_gray * g.e_gray / err2;
            self.ccd_n_good_stars[cell] += 1;
            self.ccd_n_good_obs[cell] += stars.obj_n_good_obs[(g.obj, g.band)];
        }

        let mut n_good_ccd = 0;
        for (cell, wt) in ccd_wt.indexed_iter() {
            let n_stars = self.ccd_n_good_stars[cell];
            let mut rms2 = 0.0;
            if n_stars > 2 && *wt > 0.0 && self.ccd_gray_rms[cell] > 0.0 {
                let mean = self.ccd_gray[cell] / wt;
                rms2 = self.ccd_gray_rms[cell] / wt - mean * mean;
                self.ccd_gray[cell] = mean;
                self.ccd_gray_err[cell] = (1.0 / wt).sqrt();
                self.ccd_n_good_tilings[cell] = self.ccd_n_good_obs[cell] as f64 / n_stars as f64;
            }
            if rms2 > 0.0 && rms2.is_finite() {
                self.ccd_gray_rms[cell] = rms2.sqrt();
                n_good_ccd += 1;
            } else {
                self.ccd_gray[cell] = illegal;
                self.ccd_gray_rms[cell] = illegal;
                self.ccd_gray_err[cell] = illegal;
            }
        }
        info!("Computed CCDGray for {} CCDs", n_good_ccd);

        let mut exp_wt = Array1::<f64>::zeros(self.exp_gray.len());
        self.exp_gray.fill(0.0);
        self.exp_gray_rms.fill(0.0);
        self.exp_gray_err.fill(0.0);
        self.exp_n_good_ccds.fill(0);
        self.exp_n_good_stars.fill(0);
        self.exp_n_good_tilings.fill(0.0);
        for ((exp, ccd), &err) in self.ccd_gray_err.indexed_iter() {
            let cell = (exp, ccd);
            if self.ccd_n_good_stars[cell] < self.config.min_star_per_ccd
                || err <= 0.0
                || err >= self.config.max_ccd_gray_err
            {
                continue;
            }
            let w = 1.0 / (err * err);
            exp_wt[exp] += w;
            self.exp_gray[exp] += self.ccd_gray[cell] * w;
            self.exp_gray_rms[exp] += self.ccd_gray[cell].powi(2) * w;
            self.exp_n_good_ccds[exp] += 1;
            self.exp_n_good_tilings[exp] += self.ccd_n_good_tilings[cell];
            self.exp_n_good_stars[exp] += self.ccd_n_good_stars[cell];
        }

        let mut n_good_exp = 0;
        for exp in 0..self.exp_gray.len() {
            let n_ccds = self.exp_n_good_ccds[exp];
            if n_ccds > 2 {
                let mean = self.exp_gray[exp] / exp_wt[exp];
                let rms2 = self.exp_gray_rms[exp] / exp_wt[exp] - mean * mean;
                self.exp_gray[exp] = mean;
                self.exp_gray_err[exp] = (1.0 / exp_wt[exp]).sqrt();
                self.exp_n_good_tilings[exp] /= n_ccds as f64;
                if rms2 > 0.0 {
                    self.exp_gray_rms[exp] = rms2.sqrt();
                    pars.comp_var_gray[exp] = rms2;
                } else {
                    self.exp_gray_rms[exp] = illegal;
                    pars.comp_var_gray[exp] = 0.0;
                }
                n_good_exp += 1;
            } else {
                self.exp_gray[exp] = illegal;
                self.exp_gray_rms[exp] = illegal;
                self.exp_gray_err[exp] = illegal;
                self.exp_n_good_tilings[exp] = illegal;
            }
        }
        pars.comp_exp_gray.assign(&self.exp_gray);
        pars.comp_n_good_star_per_exp.assign(&self.exp_n_good_stars);

        info!(
            "ExpGray computed for {} exposures in {:.2?}",
            n_good_exp,
            start.elapsed()
        );

        if self.config.diagnostics {
            for (band, fit) in self.exp_gray_band_summary(pars) {
                if let Some(fit) = fit {
                    info!(
                        "Cycle {} exp gray ({}): mean {:.5}, sigma {:.4}",
                        self.config.cycle_number, pars.bands[band], fit.mean, fit.sigma
                    );
                }
                if let Ok(trend) = self.exp_gray_airmass_trend(pars, band) {
                    for bin in trend {
                        info!(
                            "Exp gray ({}) at sec(zd) {:.3}: {:.5} +/- {:.5} ({} exposures)",
                            pars.bands[band], bin.x, bin.y, bin.y_err, bin.n
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Unweighted gray per exposure for the bluest 25 %, the middle 50 % and the reddest 25 % of the stars.
    ///
    /// The color is the difference of the mean magnitudes in the two `color_split_indices` bands.
    /// Bins with fewer than `min_star_per_exp` residuals hold the illegal value.
    pub fn compute_exp_gray_color_split(
        &mut self,
        pars: &FgcmParameters,
        stars: &FgcmStars,
    ) -> Result<(), FgcmError> {
        if !stars.mag_std_computed {
            return Err(FgcmError::MagStdNotComputed("compute_exp_gray_color_split"));
        }
        self.check_exposures(pars)?;
        self.config.check_color_split(stars.n_bands())?;
        let start = Instant::now();
        info!("Computing ExpGrayColorSplit");
        let [c0, c1] = self.config.color_split_indices;
        let illegal = self.config.illegal_value;

        let gray_obs = gray_observations(stars, pars.n_exp(), |o| {
            is_calibration_star(stars, o)
                && stars.obj_mag_std_mean[(o, c0)] < MAG_VALID_MAX
                && stars.obj_mag_std_mean[(o, c1)] < MAG_VALID_MAX
        })?;
        let color = |g: &GrayObs| stars.obj_mag_std_mean[(g.obj, c0)] - stars.obj_mag_std_mean[(g.obj, c1)];

        self.exp_gray_color_split.fill(0.0);
        self.exp_gray_rms_color_split.fill(0.0);
        self.exp_n_good_stars_color_split.fill(0);

        let mut colors = gray_obs.iter().map(color).collect_vec();
        let Some(cuts) = color_cuts(&mut colors) else {
            warn!("No good observations for the color split");
            self.exp_gray_color_split.fill(illegal);
            self.exp_gray_rms_color_split.fill(illegal);
            return Ok(());
        };

        for g in &gray_obs {
            let c = color(g);
            for bin in 0..N_COLOR_BINS {
                if c > cuts[bin] && c < cuts[bin + 1] {
                    self.exp_gray_color_split[(g.exp, bin)] += g.e_gray;
                    self.exp_gray_rms_color_split[(g.exp, bin)] += g.e_gray * g.e_gray;
                    self.exp_n_good_stars_color_split[(g.exp, bin)] += 1;
                }
            }
        }

        for ((exp, bin), &n) in self.exp_n_good_stars_color_split.indexed_iter() {
            let cell = (exp, bin);
            if n >= self.config.min_star_per_exp && n > 0 {
                let mean = self.exp_gray_color_split[cell] / n as f64;
                let rms2 = self.exp_gray_rms_color_split[cell] / n as f64 - mean * mean;
                self.exp_gray_color_split[cell] = mean;
                self.exp_gray_rms_color_split[cell] = rms2.max(0.0).sqrt();
            } else {
                self.exp_gray_color_split[cell] = illegal;
                self.exp_gray_rms_color_split[cell] = illegal;
            }
        }
        info!("Computed ExpGrayColorSplit in {:.2?}", start.elapsed());
        Ok(())
    }

    /// Photometric exposures with a legal gray and more than `min_star_per_exp` stars.
    fn photometric_exposures(&self, pars: &FgcmParameters) -> Vec<usize> {
        (0..self.exp_gray.len())
            .filter(|&e| {
                pars.exposures.flag[e] == 0
                    && self.exp_gray[e] > self.config.illegal_value
                    && self.exp_n_good_stars[e] > self.config.min_star_per_exp
            })
            .collect()
    }

    /// Gaussian fit to the exposure gray of the photometric exposures, per band.
    ///
    /// Bands without exposures or with a degenerate distribution have no fit.
    pub fn exp_gray_band_summary(&self, pars: &FgcmParameters) -> Vec<(usize, Option<GaussFit>)> {
        let use_exp = self.photometric_exposures(pars);
        (0..pars.n_bands())
            .map(|band| {
                let values = use_exp
                    .iter()
                    .filter(|&&e| pars.exposures.band_index[e] == band)
                    .map(|&e| self.exp_gray[e])
                    .collect_vec();
                (band, histo_gauss(&values).ok())
            })
            .collect()
    }

    /// Exposure gray of the photometric exposures of `band` binned by airmass.
    pub fn exp_gray_airmass_trend(
        &self,
        pars: &FgcmParameters,
        band: usize,
    ) -> Result<Vec<Bin>, FgcmError> {
        let (sec_zenith, gray): (Vec<f64>, Vec<f64>) = self
            .photometric_exposures(pars)
            .into_iter()
            .filter(|&e| pars.exposures.band_index[e] == band)
            .map(|e| (pars.exposures.sec_zenith[e], self.exp_gray[e]))
            .unzip();
        data_binner(&sec_zenith, &gray, 0.1, (1.0, 2.5), 3)
    }

    fn log_band_summaries(
        &self,
        pars: &FgcmParameters,
        use_exp: &[usize],
        values: ArrayView1<f64>,
        label: &str,
    ) {
        for band in 0..pars.n_bands() {
            let in_band = use_exp
                .iter()
                .filter(|&&e| pars.exposures.band_index[e] == band)
                .map(|&e| values[e])
                .collect_vec();
            if in_band.is_empty() {
                continue;
            }
            match histo_gauss(&in_band) {
                Ok(fit) => info!(
                    "Cycle {} {} ({}): mean {:.5}, sigma {:.4}",
                    self.config.cycle_number, label, pars.bands[band], fit.mean, fit.sigma
                ),
                Err(e) => warn!("No {} summary for {}: {}", label, pars.bands[band], e),
            }
        }
    }

    /// Unweighted exposure gray.
    pub fn exp_gray_for_initial_selection(&self) -> ArrayView1<'_, f64> {
        self.exp_gray_for_initial_selection.view()
    }

    /// RMS of the unweighted exposure gray.
    pub fn exp_gray_rms_for_initial_selection(&self) -> ArrayView1<'_, f64> {
        self.exp_gray_rms_for_initial_selection.view()
    }

    /// Number of residuals entering the unweighted exposure gray.
    pub fn exp_n_good_star_for_initial_selection(&self) -> ArrayView1<'_, usize> {
        self.exp_n_good_star_for_initial_selection.view()
    }

    /// Gray per `(exposure, CCD)`, to be applied in [`FgcmChisq::evaluate`](crate::FgcmChisq::evaluate).
    pub fn ccd_gray(&self) -> ArrayView2<'_, f64> {
        self.ccd_gray.view()
    }

    /// Weighted RMS of the residuals per `(exposure, CCD)`.
    pub fn ccd_gray_rms(&self) -> ArrayView2<'_, f64> {
        self.ccd_gray_rms.view()
    }

    /// Error of the CCD gray.
    pub fn ccd_gray_err(&self) -> ArrayView2<'_, f64> {
        self.ccd_gray_err.view()
    }

    /// Total good observations of the stars per `(exposure, CCD)`.
    pub fn ccd_n_good_obs(&self) -> ArrayView2<'_, usize> {
        self.ccd_n_good_obs.view()
    }

    /// Number of stars per `(exposure, CCD)`.
    pub fn ccd_n_good_stars(&self) -> ArrayView2<'_, usize> {
        self.ccd_n_good_stars.view()
    }

    /// Mean number of good observations per star of every `(exposure, CCD)`.
    pub fn ccd_n_good_tilings(&self) -> ArrayView2<'_, f64> {
        self.ccd_n_good_tilings.view()
    }

    /// Weighted gray per exposure.
    pub fn exp_gray(&self) -> ArrayView1<'_, f64> {
        self.exp_gray.view()
    }

    /// RMS of the CCD grays of every exposure.
    pub fn exp_gray_rms(&self) -> ArrayView1<'_, f64> {
        self.exp_gray_rms.view()
    }

    /// Error of the exposure gray.
    pub fn exp_gray_err(&self) -> ArrayView1<'_, f64> {
        self.exp_gray_err.view()
    }

    /// Number of CCDs entering the exposure gray.
    pub fn exp_n_good_ccds(&self) -> ArrayView1<'_, usize> {
        self.exp_n_good_ccds.view()
    }

    /// Number of stars on the CCDs entering the exposure gray.
    pub fn exp_n_good_stars(&self) -> ArrayView1<'_, usize> {
        self.exp_n_good_stars.view()
    }

    /// Mean tilings of the CCDs entering the exposure gray.
    pub fn exp_n_good_tilings(&self) -> ArrayView1<'_, f64> {
        self.exp_n_good_tilings.view()
    }

    /// Gray per `(exposure, color bin)`.
    pub fn exp_gray_color_split(&self) -> ArrayView2<'_, f64> {
        self.exp_gray_color_split.view()
    }

    /// RMS per `(exposure, color bin)`.
    pub fn exp_gray_rms_color_split(&self) -> ArrayView2<'_, f64> {
        self.exp_gray_rms_color_split.view()
    }

    /// Number of residuals per `(exposure, color bin)`.
    pub fn exp_n_good_stars_color_split(&self) -> ArrayView2<'_, usize> {
        self.exp_n_good_stars_color_split.view()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::chisq::{ChisqOptions, FgcmChisq};
    use crate::config::ParUnits;
    use crate::parameters::{AtmosphereModes, ExposureTable};
    use crate::stars::ObservationTable;
    use crate::synthetic::survey;

    /// Residuals and errors of the single observation of every star, per `(exposure, CCD)`.
    fn cells() -> Vec<((usize, usize), Vec<(f64, f64)>)> {
        let spread = |g: f64| vec![(g - 0.01, 0.01), (g, 0.01), (g + 0.01, 0.01)];
        vec![
            (
                (0, 0),
                vec![(0.01, 0.01), (0.02, 0.01), (0.03, 0.02), (0.04, 0.02)],
            ),
            ((0, 1), vec![(-0.01, 0.01), (0.0, 0.01), (0.02, 0.01)]),
            ((0, 2), vec![(0.05, 0.01), (0.07, 0.01)]),
            ((1, 0), spread(0.01)),
            ((1, 1), spread(0.02)),
            ((1, 2), spread(0.04)),
        ]
    }

    fn fixture() -> (FgcmParameters, FgcmStars) {
        let exposures = ExposureTable::new(vec![0, 0], vec![0, 0], vec![0, 0], vec![1.0, 1.1])
            .with_sec_zenith(vec![1.2, 1.3]);
        let pars = FgcmParameters::new(
            exposures,
            vec!["g".into()],
            vec![0],
            1,
            3,
            vec![0.0],
            AtmosphereModes::default(),
            ParUnits::default(),
        )
        .unwrap();

        let obs = cells()
            .into_iter()
            .flat_map(|(cell, values)| values.into_iter().map(move |v| (cell, v)))
            .collect_vec();
        let n = obs.len();
        let table = ObservationTable::new(
            (0..n).collect(),
            obs.iter().map(|((e, _), _)| *e).collect(),
            obs.iter().map(|((_, c), _)| *c).collect(),
            vec![0; n],
            vec![0.0; n],
            obs.iter().map(|(_, (_, err))| *err).collect(),
        );
        let mut stars = FgcmStars::new(table, n, vec![4800.0], vec![0], 1).unwrap();
        for (i, (_, (e_gray, _))) in obs.iter().enumerate() {
            stars.obj_mag_std_mean[(i, 0)] = 15.0;
            stars.obj_mag_std_mean_err[(i, 0)] = 0.005;
            stars.obs_mag_std[i] = 15.0 - e_gray;
            stars.obj_n_good_obs[(i, 0)] = 2;
        }
        stars.mag_std_computed = true;
        stars.all_mag_std_computed = true;
        (pars, stars)
    }

    /// Weighted mean, RMS and error.
    fn weighted(values: &[(f64, f64)]) -> (f64, f64, f64) {
        let wt = values.iter().map(|(_, e)| 1.0 / (e * e)).sum::<f64>();
        let mean = values.iter().map(|(v, e)| v / (e * e)).sum::<f64>() / wt;
        let mean2 = values.iter().map(|(v, e)| v * v / (e * e)).sum::<f64>() / wt;
        (mean, (mean2 - mean * mean).sqrt(), (1.0 / wt).sqrt())
    }

    #[test]
    fn ccd_and_exp_gray() {
        let (mut pars, stars) = fixture();
        let config = FgcmConfig::default().with_min_star_per_ccd(3).with_min_star_per_exp(5);
        let mut gray = FgcmGray::new(config, &pars);
        gray.compute_ccd_and_exp_gray(&mut pars, &stars, true).unwrap();

        for (cell, values) in cells() {
            if values.len() > 2 {
                let (mean, rms, err) = weighted(&values);
                assert_abs_diff_eq!(gray.ccd_gray()[cell], mean, epsilon = 1e-12);
                assert_abs_diff_eq!(gray.ccd_gray_rms()[cell], rms, epsilon = 1e-9);
                assert_abs_diff_eq!(gray.ccd_gray_err()[cell], err, epsilon = 1e-12);
                assert_abs_diff_eq!(gray.ccd_n_good_tilings()[cell], 2.0);
            } else {
                assert_eq!(gray.ccd_gray()[cell], -9999.0);
                assert_eq!(gray.ccd_gray_rms()[cell], -9999.0);
                assert_eq!(gray.ccd_gray_err()[cell], -9999.0);
            }
            assert_eq!(gray.ccd_n_good_stars()[cell], values.len());
        }
        assert_abs_diff_eq!(gray.ccd_gray()[(0, 0)], 0.019, epsilon = 1e-12);

        // exposure 0 has only two legal CCDs
        assert_eq!(gray.exp_n_good_ccds()[0], 2);
        assert_eq!(gray.exp_gray()[0], -9999.0);
        assert_eq!(pars.comp_exp_gray()[0], -9999.0);
        assert_eq!(pars.comp_var_gray()[0], 0.0);

        let ccd = [0.01, 0.02, 0.04].map(|g| (g, (1.0f64 / 30000.0).sqrt()));
        let (mean, rms, err) = weighted(&ccd);
        assert_eq!(gray.exp_n_good_ccds()[1], 3);
        assert_abs_diff_eq!(gray.exp_gray()[1], mean, epsilon = 1e-12);
        assert_abs_diff_eq!(gray.exp_gray_rms()[1], rms, epsilon = 1e-9);
        assert_abs_diff_eq!(gray.exp_gray_err()[1], err, epsilon = 1e-12);
        assert_abs_diff_eq!(gray.exp_n_good_tilings()[1], 2.0);
        assert_eq!(gray.exp_n_good_stars()[1], 9);
        assert_abs_diff_eq!(pars.comp_exp_gray()[1], 0.07 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pars.comp_var_gray()[1], rms * rms, epsilon = 1e-12);
        assert_eq!(pars.comp_n_good_star_per_exp()[1], 9);
    }

    #[test]
    fn decorrelated_errors() {
        let (mut pars, stars) = fixture();
        let config = FgcmConfig::default().with_min_star_per_ccd(3);
        let mut gray = FgcmGray::new(config, &pars);
        gray.compute_ccd_and_exp_gray(&mut pars, &stars, false).unwrap();

        let values = [(0.01, 0.01), (0.02, 0.01), (0.03, 0.02), (0.04, 0.02)]
            .map(|(g, e): (f64, f64)| (g, (e * e - 0.005 * 0.005).sqrt()));
        let (mean, _, err) = weighted(&values);
        assert_abs_diff_eq!(gray.ccd_gray()[(0, 0)], mean, epsilon = 1e-12);
        assert_abs_diff_eq!(gray.ccd_gray_err()[(0, 0)], err, epsilon = 1e-12);
    }

    #[test]
    fn variance_ceiling() {
        let (mut pars, stars) = fixture();
        // only the observations with an error of 0.01 pass
        let config = FgcmConfig::default().with_ccd_gray_max_star_err(2e-4);
        let mut gray = FgcmGray::new(config, &pars);
        gray.compute_ccd_and_exp_gray(&mut pars, &stars, true).unwrap();
        assert_eq!(gray.ccd_n_good_stars()[(0, 0)], 2);
        assert_eq!(gray.ccd_gray()[(0, 0)], -9999.0);
    }

    #[test]
    fn requires_all_magnitudes() {
        let (mut pars, mut stars) = fixture();
        stars.all_mag_std_computed = false;
        let mut gray = FgcmGray::new(FgcmConfig::default(), &pars);
        assert_eq!(
            gray.compute_ccd_and_exp_gray(&mut pars, &stars, true),
            Err(FgcmError::MagStdNotComputed("compute_ccd_and_exp_gray"))
        );
        assert!(gray.compute_exp_gray_for_initial_selection(&pars, &stars).is_ok());
    }

    #[test]
    fn initial_selection() {
        let (pars, stars) = fixture();
        let mut gray = FgcmGray::new(FgcmConfig::default().with_diagnostics(true), &pars);
        gray.compute_exp_gray_for_initial_selection(&pars, &stars).unwrap();

        let exp0 = [0.01, 0.02, 0.03, 0.04, -0.01, 0.0, 0.02, 0.05, 0.07];
        let mean = exp0.iter().sum::<f64>() / 9.0;
        let rms = (exp0.iter().map(|g| g * g).sum::<f64>() / 9.0 - mean * mean).sqrt();
        assert_eq!(gray.exp_n_good_star_for_initial_selection()[0], 9);
        assert_abs_diff_eq!(gray.exp_gray_for_initial_selection()[0], mean, epsilon = 1e-12);
        assert_abs_diff_eq!(gray.exp_gray_rms_for_initial_selection()[0], rms, epsilon = 1e-9);
    }

    #[test]
    fn extra_band_needs_min_obs() {
        let exposures = ExposureTable::new(vec![0, 0], vec![0, 0], vec![0, 1], vec![1.0, 1.1]);
        let mut pars = FgcmParameters::new(
            exposures,
            vec!["g".into(), "r".into()],
            vec![0, 1],
            1,
            1,
            vec![0.0],
            AtmosphereModes::default(),
            ParUnits::default(),
        )
        .unwrap();
        // object 0 has two r observations, object 1 only one
        let table = ObservationTable::new(
            vec![0, 0, 0, 0, 1, 1, 1],
            vec![0, 0, 1, 1, 0, 0, 1],
            vec![0; 7],
            vec![0, 0, 1, 1, 0, 0, 1],
            vec![0.0; 7],
            vec![0.01; 7],
        );
        let mut stars = FgcmStars::new(table, 2, vec![4800.0, 6400.0], vec![0], 2).unwrap();
        stars.count_good_observations(pars.exposures().flag.view()).unwrap();
        assert_eq!(stars.obj_n_good_obs().row(1).to_vec(), [2, 1]);
        stars.obj_mag_std_mean.fill(15.0);
        stars.obs_mag_std.fill(14.99);
        stars.mag_std_computed = true;
        stars.all_mag_std_computed = true;

        let mut gray = FgcmGray::new(FgcmConfig::default(), &pars);
        gray.compute_exp_gray_for_initial_selection(&pars, &stars).unwrap();
        assert_eq!(gray.exp_n_good_star_for_initial_selection().to_vec(), [4, 2]);

        gray.compute_ccd_and_exp_gray(&mut pars, &stars, true).unwrap();
        assert_eq!(gray.ccd_n_good_stars()[(0, 0)], 4);
        assert_eq!(gray.ccd_n_good_stars()[(1, 0)], 2);
    }

    #[test]
    fn invalid_input() {
        let (pars, mut stars) = fixture();
        // the default color split needs three bands
        let mut gray = FgcmGray::new(FgcmConfig::default(), &pars);
        assert!(matches!(
            gray.compute_exp_gray_color_split(&pars, &stars),
            Err(FgcmError::InvalidConfig(_))
        ));

        stars.obs.exp_index[0] = pars.n_exp();
        assert!(matches!(
            gray.compute_exp_gray_for_initial_selection(&pars, &stars),
            Err(FgcmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn synthetic_survey() {
        let _ = simplelog::TestLogger::init(log::LevelFilter::Info, simplelog::Config::default());
        let mut s = survey(600, 21).unwrap();
        let mut chisq = FgcmChisq::new(s.config.clone(), s.lut.clone()).unwrap();
        let truth = s.truth.clone();
        chisq
            .evaluate(&mut s.pars, &mut s.stars, truth.view(), &ChisqOptions::default(), None)
            .unwrap();
        let config = s.config.clone().with_diagnostics(true);
        let mut gray = FgcmGray::new(config, &s.pars);

        assert!(gray.compute_ccd_and_exp_gray(&mut s.pars, &s.stars, false).is_err());
        chisq
            .evaluate(
                &mut s.pars,
                &mut s.stars,
                truth.view(),
                &ChisqOptions::default().with_all_exposures(true),
                None,
            )
            .unwrap();
        gray.compute_ccd_and_exp_gray(&mut s.pars, &s.stars, false).unwrap();

        // at the true parameters every exposure is photometric
        for exp in 0..s.pars.n_exp() {
            assert_eq!(gray.exp_n_good_ccds()[exp], 4);
            assert!(gray.exp_gray()[exp].abs() < 0.005, "{}", gray.exp_gray()[exp]);
            assert!(gray.exp_gray_err()[exp] < 0.003);
        }

        let summary = gray.exp_gray_band_summary(&s.pars);
        assert_eq!(summary.len(), 3);

        gray.compute_exp_gray_color_split(&s.pars, &s.stars).unwrap();
        let counts = gray.exp_n_good_stars_color_split();
        let totals = (0..N_COLOR_BINS)
            .map(|c| counts.column(c).sum() as f64)
            .collect_vec();
        let all = totals.iter().sum::<f64>();
        assert_abs_diff_eq!(totals[0] / all, 0.25, epsilon = 0.03);
        assert_abs_diff_eq!(totals[1] / all, 0.5, epsilon = 0.03);
        assert_abs_diff_eq!(totals[2] / all, 0.25, epsilon = 0.03);
        for (cell, &n) in counts.indexed_iter() {
            let g = gray.exp_gray_color_split()[cell];
            if n >= s.config.min_star_per_exp {
                assert!(g.is_finite() && g != -9999.0);
            } else {
                assert_eq!(g, -9999.0);
            }
        }
    }
}
