//! Observation and object tables.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1};

use crate::error::FgcmError;

/// Sentinel of a mean magnitude without valid measurements.
pub const MAG_SENTINEL: f64 = 99.0;

/// Mean magnitudes above this value are treated as unset.
pub(crate) const MAG_VALID_MAX: f64 = 90.0;

/// Object flag bits.
pub struct ObjFlag;

impl ObjFlag {
    /// Too few good observations in a required band.
    pub const TOO_FEW_OBS: u8 = 1;
    /// Color outside the calibrated range.
    pub const BAD_COLOR: u8 = 2;
    /// Variable star.
    pub const VARIABLE: u8 = 4;
    /// Excluded in the current cycle.
    pub const TEMPORARY_BAD: u8 = 8;
    /// Held out from the fit for validation.
    pub const RESERVED: u8 = 16;
}

/// Raw per-observation columns.
///
/// Rows must be sorted by `obj_index`.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationTable {
    /// Object of every observation.
    pub obj_index: Array1<usize>,
    /// Exposure of every observation.
    pub exp_index: Array1<usize>,
    /// CCD number, starting at the configured `ccd_start_index`.
    pub ccd_index: Array1<usize>,
    /// Band of every observation.
    pub band_index: Array1<usize>,
    /// LUT filter of every observation.
    pub lut_filter_index: Array1<usize>,
    /// Instrumental magnitude.
    pub mag_adu: Array1<f64>,
    /// Model-based magnitude error.
    pub mag_adu_model_err: Array1<f64>,
    /// Airmass at the position of the observation.
    pub sec_zenith: Array1<f64>,
    /// Observation flag, zero for good observations.
    pub flag: Array1<u8>,
}

impl ObservationTable {
    /// Create a table of unflagged observations at zenith, with the LUT filter equal to the band.
    pub fn new(
        obj_index: Vec<usize>,
        exp_index: Vec<usize>,
        ccd_index: Vec<usize>,
        band_index: Vec<usize>,
        mag_adu: Vec<f64>,
        mag_adu_model_err: Vec<f64>,
    ) -> Self {
        let n = obj_index.len();
        Self {
            lut_filter_index: Array1::from(band_index.clone()),
            obj_index: Array1::from(obj_index),
            exp_index: Array1::from(exp_index),
            ccd_index: Array1::from(ccd_index),
            band_index: Array1::from(band_index),
            mag_adu: Array1::from(mag_adu),
            mag_adu_model_err: Array1::from(mag_adu_model_err),
            sec_zenith: Array1::ones(n),
            flag: Array1::zeros(n),
        }
    }

    /// Set the LUT filters.
    pub fn with_lut_filter_index(mut self, lut_filter_index: Vec<usize>) -> Self {
        self.lut_filter_index = Array1::from(lut_filter_index);
        self
    }

    /// Set the airmass.
    pub fn with_sec_zenith(mut self, sec_zenith: Vec<f64>) -> Self {
        self.sec_zenith = Array1::from(sec_zenith);
        self
    }

    /// Set the observation flags.
    pub fn with_flag(mut self, flag: Vec<u8>) -> Self {
        self.flag = Array1::from(flag);
        self
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.obj_index.len()
    }

    /// Whether there are no observations.
    pub fn is_empty(&self) -> bool {
        self.obj_index.is_empty()
    }
}

/// Observation and object store.
///
/// Holds the raw observations, the standardized magnitudes computed from them, and the
/// per-object, per-band statistics that the engines read and write.
#[derive(Clone, Debug)]
pub struct FgcmStars {
    pub(crate) obs: ObservationTable,
    pub(crate) obs_mag_std: Array1<f64>,

    pub(crate) obj_flag: Array1<u8>,
    pub(crate) obj_mag_std_mean: Array2<f64>,
    pub(crate) obj_mag_std_mean_no_chrom: Array2<f64>,
    pub(crate) obj_mag_std_mean_err: Array2<f64>,
    pub(crate) obj_sed_slope: Array2<f64>,
    pub(crate) obj_n_good_obs: Array2<usize>,

    pub(crate) band_lambda: Vec<f64>,
    pub(crate) required_bands: Vec<usize>,
    pub(crate) min_obs_per_band: usize,

    pub(crate) mag_std_computed: bool,
    pub(crate) all_mag_std_computed: bool,
}

impl FgcmStars {
    /// Create a store.
    ///
    /// # Arguments
    /// - `obs`: Observations, sorted by object index.
    /// - `n_stars`: Number of objects.
    /// - `band_lambda`: Effective wavelength of every band, increasing.
    /// - `required_bands`: Bands in which a calibration star needs `min_obs_per_band` good observations.
    pub fn new(
        obs: ObservationTable,
        n_stars: usize,
        band_lambda: Vec<f64>,
        required_bands: Vec<usize>,
        min_obs_per_band: usize,
    ) -> Result<Self, FgcmError> {
        let n = obs.len();
        FgcmError::check_len("exp_index", n, obs.exp_index.len())?;
        FgcmError::check_len("ccd_index", n, obs.ccd_index.len())?;
        FgcmError::check_len("band_index", n, obs.band_index.len())?;
        FgcmError::check_len("lut_filter_index", n, obs.lut_filter_index.len())?;
        FgcmError::check_len("mag_adu", n, obs.mag_adu.len())?;
        FgcmError::check_len("mag_adu_model_err", n, obs.mag_adu_model_err.len())?;
        FgcmError::check_len("sec_zenith", n, obs.sec_zenith.len())?;
        FgcmError::check_len("flag", n, obs.flag.len())?;

        let n_bands = band_lambda.len();
        if let Some(i) = obs.obj_index.iter().find(|&&i| i >= n_stars) {
            return Err(FgcmError::InvalidConfig(format!(
                "object index {i} out of range (< {n_stars})"
            )));
        }
        if let Some(b) = obs
            .band_index
            .iter()
            .chain(required_bands.iter())
            .find(|&&b| b >= n_bands)
        {
            return Err(FgcmError::InvalidConfig(format!(
                "band index {b} out of range (< {n_bands})"
            )));
        }

        if let Some((i, e)) = obs
            .mag_adu_model_err
            .iter()
            .enumerate()
            .find(|(_, e)| !(e.is_finite() && **e > 0.0))
        {
            return Err(FgcmError::InvalidConfig(format!(
                "observation {i} has magnitude error {e}, must be finite and positive"
            )));
        }

        let sentinel = Array2::from_elem((n_stars, n_bands), MAG_SENTINEL);
        Ok(Self {
            obs_mag_std: obs.mag_adu.clone(),
            obs,
            obj_flag: Array1::zeros(n_stars),
            obj_mag_std_mean: sentinel.clone(),
            obj_mag_std_mean_no_chrom: sentinel.clone(),
            obj_mag_std_mean_err: sentinel,
            obj_sed_slope: Array2::zeros((n_stars, n_bands)),
            obj_n_good_obs: Array2::zeros((n_stars, n_bands)),
            band_lambda,
            required_bands,
            min_obs_per_band,
            mag_std_computed: false,
            all_mag_std_computed: false,
        })
    }

    /// Number of objects.
    pub fn n_stars(&self) -> usize {
        self.obj_flag.len()
    }

    /// Number of observations.
    pub fn n_obs(&self) -> usize {
        self.obs.len()
    }

    /// Number of bands.
    pub fn n_bands(&self) -> usize {
        self.band_lambda.len()
    }

    /// Observation table.
    pub fn observations(&self) -> &ObservationTable {
        &self.obs
    }

    /// Mutable access to the observation flags.
    pub fn obs_flag_mut(&mut self) -> ArrayViewMut1<'_, u8> {
        self.obs.flag.view_mut()
    }

    /// Standardized magnitude of every observation.
    pub fn obs_mag_std(&self) -> ArrayView1<'_, f64> {
        self.obs_mag_std.view()
    }

    /// Object flags, see [`ObjFlag`].
    pub fn obj_flag(&self) -> ArrayView1<'_, u8> {
        self.obj_flag.view()
    }

    /// Mutable access to the object flags, e.g. to reserve objects.
    pub fn obj_flag_mut(&mut self) -> ArrayViewMut1<'_, u8> {
        self.obj_flag.view_mut()
    }

    /// Weighted mean standardized magnitude per `(object, band)`.
    pub fn obj_mag_std_mean(&self) -> ArrayView2<'_, f64> {
        self.obj_mag_std_mean.view()
    }

    /// Mean magnitude without the chromatic correction.
    pub fn obj_mag_std_mean_no_chrom(&self) -> ArrayView2<'_, f64> {
        self.obj_mag_std_mean_no_chrom.view()
    }

    /// Error of the mean magnitude.
    pub fn obj_mag_std_mean_err(&self) -> ArrayView2<'_, f64> {
        self.obj_mag_std_mean_err.view()
    }

    /// SED slope per `(object, band)`.
    pub fn obj_sed_slope(&self) -> ArrayView2<'_, f64> {
        self.obj_sed_slope.view()
    }

    /// Good observations per `(object, band)`.
    pub fn obj_n_good_obs(&self) -> ArrayView2<'_, usize> {
        self.obj_n_good_obs.view()
    }

    /// Bands a calibration star must be observed in.
    pub fn required_bands(&self) -> &[usize] {
        &self.required_bands
    }

    /// Good observations required per required band.
    pub fn min_obs_per_band(&self) -> usize {
        self.min_obs_per_band
    }

    /// Whether the standardized magnitudes of the photometric exposures are current.
    pub fn mag_std_computed(&self) -> bool {
        self.mag_std_computed
    }

    /// Whether the standardized magnitudes of all exposures are current.
    pub fn all_mag_std_computed(&self) -> bool {
        self.all_mag_std_computed
    }

    /// Objects with a clean flag; with `include_reserve` the reserved bit is ignored.
    pub fn good_star_index(&self, include_reserve: bool) -> Vec<usize> {
        let mask = if include_reserve {
            !ObjFlag::RESERVED
        } else {
            u8::MAX
        };
        self.obj_flag
            .indexed_iter()
            .filter(|(_, flag)| *flag & mask == 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Minimum over the required bands of the good-observation count of `obj`.
    pub(crate) fn min_required_obs(&self, obj: usize) -> usize {
        self.required_bands
            .iter()
            .map(|&b| self.obj_n_good_obs[(obj, b)])
            .min()
            .unwrap_or(0)
    }

    /// Recount the unflagged observations on unflagged exposures per object and band.
    pub fn count_good_observations(&mut self, exp_flag: ArrayView1<u8>) -> Result<(), FgcmError> {
        self.obj_n_good_obs.fill(0);
        for i in 0..self.n_obs() {
            let exp = self.obs.exp_index[i];
            if exp >= exp_flag.len() {
                return Err(FgcmError::InvalidConfig(format!(
                    "exposure index {exp} out of range (< {})",
                    exp_flag.len()
                )));
            }
            if self.obs.flag[i] == 0 && exp_flag[exp] == 0 {
                self.obj_n_good_obs[(self.obs.obj_index[i], self.obs.band_index[i])] += 1;
            }
        }
        Ok(())
    }

    /// Flag objects without enough good observations in every required band, and unflag the others.
    ///
    /// Returns the number of flagged objects.
    pub fn select_stars_min_obs(&mut self) -> usize {
        let mut n_bad = 0;
        for obj in 0..self.n_stars() {
            if self.min_required_obs(obj) < self.min_obs_per_band {
                self.obj_flag[obj] |= ObjFlag::TOO_FEW_OBS;
                n_bad += 1;
            } else {
                self.obj_flag[obj] &= !ObjFlag::TOO_FEW_OBS;
            }
        }
        log::info!(
            "{} of {} stars lack {} observations in the required bands",
            n_bad,
            self.n_stars(),
            self.min_obs_per_band
        );
        n_bad
    }

    /// Recompute the SED slopes of `objs` from their current mean magnitudes.
    ///
    /// Slopes are finite differences of the mean magnitude with respect to the band wavelength,
    /// converted to the fractional flux-density slope. Inner bands use the average of their
    /// neighboring differences. Objects missing a valid mean in any band keep their slope.
    pub fn compute_object_sed_slopes(&mut self, objs: &[usize]) {
        let n_bands = self.n_bands();
        if n_bands < 2 {
            return;
        }
        let mag_const = 2.5 / std::f64::consts::LN_10;
        let mut diffs = vec![0.0; n_bands - 1];
        for &obj in objs {
            let mags = self.obj_mag_std_mean.row(obj);
            if mags.iter().any(|&m| m >= MAG_VALID_MAX) {
                continue;
            }
            for (i, d) in diffs.iter_mut().enumerate() {
                *d = -(mags[i + 1] - mags[i])
                    / (self.band_lambda[i + 1] - self.band_lambda[i])
                    / mag_const;
            }
            let mut slope = self.obj_sed_slope.row_mut(obj);
            slope[0] = diffs[0];
            for b in 1..n_bands - 1 {
                slope[b] = 0.5 * (diffs[b - 1] + diffs[b]);
            }
            slope[n_bands - 1] = diffs[n_bands - 2];
        }
    }

    /// Reset the mean magnitudes and their errors to the sentinel.
    pub(crate) fn reset_means(&mut self) {
        self.obj_mag_std_mean.fill(MAG_SENTINEL);
        self.obj_mag_std_mean_no_chrom.fill(MAG_SENTINEL);
        self.obj_mag_std_mean_err.fill(MAG_SENTINEL);
    }
}
