//! Configuration shared by the calibration engines.

use serde::{Deserialize, Serialize};

use crate::error::FgcmError;
use crate::parameters::ParFamily;

/// Scale factors converting physical parameter values into optimizer ("fitter") units.
///
/// A fit parameter `p` in fitter units relates to its physical value by `p_fit = p * unit`,
/// so gradients in fitter units are divided by the same factor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParUnits {
    /// Ozone.
    pub o3: f64,
    /// Aerosol Angstrom exponent.
    pub alpha: f64,
    /// Log aerosol optical depth intercept.
    pub ln_tau: f64,
    /// Log aerosol optical depth slope.
    pub ln_tau_slope: f64,
    /// External aerosol offset and scale.
    pub tau: f64,
    /// Water vapor intercept.
    pub pwv: f64,
    /// Water vapor slope.
    pub pwv_per_slope: f64,
    /// External and retrieved water vapor offsets and scales.
    pub pwv_global: f64,
    /// Wash intercept.
    pub qe_sys: f64,
    /// Wash slope.
    pub qe_sys_slope: f64,
}

impl ParUnits {
    /// Units where every family is used as is.
    pub fn physical() -> Self {
        Self {
            o3: 1.0,
            alpha: 1.0,
            ln_tau: 1.0,
            ln_tau_slope: 1.0,
            tau: 1.0,
            pwv: 1.0,
            pwv_per_slope: 1.0,
            pwv_global: 1.0,
            qe_sys: 1.0,
            qe_sys_slope: 1.0,
        }
    }

    /// Unit of a parameter family.
    pub fn unit(&self, family: ParFamily) -> f64 {
        match family {
            ParFamily::O3 => self.o3,
            ParFamily::Alpha => self.alpha,
            ParFamily::LnTauIntercept => self.ln_tau,
            ParFamily::LnTauSlope => self.ln_tau_slope,
            ParFamily::ExternalTauOffset | ParFamily::ExternalTauScale => self.tau,
            ParFamily::PwvIntercept
            | ParFamily::ExternalPwvOffset
            | ParFamily::RetrievedPwvNightlyOffset => self.pwv,
            ParFamily::PwvPerSlope => self.pwv_per_slope,
            ParFamily::ExternalPwvScale
            | ParFamily::RetrievedPwvScale
            | ParFamily::RetrievedPwvOffset => self.pwv_global,
            ParFamily::QeSysIntercept => self.qe_sys,
            ParFamily::QeSysSlope => self.qe_sys_slope,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), FgcmError> {
        for family in ParFamily::ALL {
            let unit = self.unit(family);
            if !(unit.is_finite() && unit > 0.0) {
                return Err(FgcmError::InvalidConfig(format!(
                    "unit of {family:?} must be positive, got {unit}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ParUnits {
    fn default() -> Self {
        Self::physical()
    }
}

/// Configuration of the chi-squared, gray and repeatability engines.
///
/// Use the `with_*` functions to change single options, e.g.
/// ```rust
/// # use fgcmrs::FgcmConfig;
/// let config = FgcmConfig::default()
///     .with_n_core(8)
///     .with_min_star_per_ccd(10);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FgcmConfig {
    /// Number of worker threads.
    pub n_core: usize,
    /// Maximum number of stars handed to a single worker partition.
    pub n_star_per_run: usize,
    /// Disable the linearized chromatic correction (not recommended).
    pub no_chromatic_corrections: bool,
    /// Standard `I10 = I1 / I0` per band.
    pub i10_std_band: Vec<f64>,
    /// Sentinel marking statistics without sufficient data.
    pub illegal_value: f64,
    /// Value of the first CCD number in the observation table.
    pub ccd_start_index: usize,
    /// Minimum number of stars on a CCD to use it for the exposure gray.
    pub min_star_per_ccd: usize,
    /// Minimum number of stars per exposure for exposure-level statistics.
    pub min_star_per_exp: usize,
    /// Maximum CCD gray error to use a CCD for the exposure gray.
    pub max_ccd_gray_err: f64,
    /// Maximum residual variance of a single observation used for the CCD gray.
    pub ccd_gray_max_star_err: f64,
    /// Minimum initial exposure gray considered in the initial-selection diagnostics.
    pub exp_gray_initial_cut: f64,
    /// Bands `[a, b]` whose mean magnitude difference `a - b` splits stars by color.
    pub color_split_indices: [usize; 2],
    /// Maximum absolute gray residual used for the repeatability fit.
    pub sig_fgcm_max_egray: f64,
    /// Maximum residual error used for the repeatability fit.
    pub sig_fgcm_max_err: f64,
    /// Fit cycle, used in log output.
    pub cycle_number: usize,
    /// Log diagnostic summaries (per-band fits and binned trends).
    pub diagnostics: bool,
}

impl Default for FgcmConfig {
    fn default() -> Self {
        Self {
            n_core: 4,
            n_star_per_run: 200_000,
            no_chromatic_corrections: false,
            i10_std_band: Vec::new(),
            illegal_value: -9999.0,
            ccd_start_index: 0,
            min_star_per_ccd: 5,
            min_star_per_exp: 100,
            max_ccd_gray_err: 0.05,
            ccd_gray_max_star_err: 0.10,
            exp_gray_initial_cut: -0.25,
            color_split_indices: [0, 2],
            sig_fgcm_max_egray: 0.05,
            sig_fgcm_max_err: 0.01,
            cycle_number: 0,
            diagnostics: false,
        }
    }
}

impl FgcmConfig {
    /// Set the number of worker threads.
    pub fn with_n_core(mut self, n_core: usize) -> Self {
        self.n_core = n_core;
        self
    }

    /// Set the maximum number of stars per worker partition.
    pub fn with_n_star_per_run(mut self, n_star_per_run: usize) -> Self {
        self.n_star_per_run = n_star_per_run;
        self
    }

    /// Enable or disable chromatic corrections.
    pub fn with_no_chromatic_corrections(mut self, no_chromatic_corrections: bool) -> Self {
        self.no_chromatic_corrections = no_chromatic_corrections;
        self
    }

    /// Set the standard `I10` per band.
    pub fn with_i10_std_band(mut self, i10_std_band: Vec<f64>) -> Self {
        self.i10_std_band = i10_std_band;
        self
    }

    /// Set the illegal-value sentinel.
    pub fn with_illegal_value(mut self, illegal_value: f64) -> Self {
        self.illegal_value = illegal_value;
        self
    }

    /// Set the number of the first CCD.
    pub fn with_ccd_start_index(mut self, ccd_start_index: usize) -> Self {
        self.ccd_start_index = ccd_start_index;
        self
    }

    /// Set the minimum number of stars per CCD.
    pub fn with_min_star_per_ccd(mut self, min_star_per_ccd: usize) -> Self {
        self.min_star_per_ccd = min_star_per_ccd;
        self
    }

    /// Set the minimum number of stars per exposure.
    pub fn with_min_star_per_exp(mut self, min_star_per_exp: usize) -> Self {
        self.min_star_per_exp = min_star_per_exp;
        self
    }

    /// Set the maximum CCD gray error.
    pub fn with_max_ccd_gray_err(mut self, max_ccd_gray_err: f64) -> Self {
        self.max_ccd_gray_err = max_ccd_gray_err;
        self
    }

    /// Set the maximum residual variance per observation for the CCD gray.
    pub fn with_ccd_gray_max_star_err(mut self, ccd_gray_max_star_err: f64) -> Self {
        self.ccd_gray_max_star_err = ccd_gray_max_star_err;
        self
    }

    /// Set the initial exposure gray cut.
    pub fn with_exp_gray_initial_cut(mut self, exp_gray_initial_cut: f64) -> Self {
        self.exp_gray_initial_cut = exp_gray_initial_cut;
        self
    }

    /// Set the bands used for the color split.
    pub fn with_color_split_indices(mut self, color_split_indices: [usize; 2]) -> Self {
        self.color_split_indices = color_split_indices;
        self
    }

    /// Set the residual cuts of the repeatability fit.
    pub fn with_sig_fgcm_cuts(mut self, max_egray: f64, max_err: f64) -> Self {
        self.sig_fgcm_max_egray = max_egray;
        self.sig_fgcm_max_err = max_err;
        self
    }

    /// Set the fit cycle.
    pub fn with_cycle_number(mut self, cycle_number: usize) -> Self {
        self.cycle_number = cycle_number;
        self
    }

    /// Enable or disable diagnostic summaries.
    pub fn with_diagnostics(mut self, diagnostics: bool) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Check the configuration for a survey with `n_bands` bands.
    pub fn validate(&self, n_bands: usize) -> Result<(), FgcmError> {
        if self.n_core == 0 {
            return Err(FgcmError::InvalidConfig("n_core must be at least 1".into()));
        }
        if self.n_star_per_run == 0 {
            return Err(FgcmError::InvalidConfig(
                "n_star_per_run must be at least 1".into(),
            ));
        }
        FgcmError::check_len("i10_std_band", n_bands, self.i10_std_band.len())?;
        self.check_color_split(n_bands)
    }

    /// Check that both color split bands exist among `n_bands` bands.
    pub(crate) fn check_color_split(&self, n_bands: usize) -> Result<(), FgcmError> {
        if self.color_split_indices.iter().any(|&b| b >= n_bands) {
            return Err(FgcmError::InvalidConfig(format!(
                "color split bands {:?} out of range for {n_bands} bands",
                self.color_split_indices
            )));
        }
        Ok(())
    }
}
