//! The parameter container: fit parameters, their layout in the flat fit vector,
//! and the per-exposure quantities derived from them.

use std::ops::Range;

use ndarray::{s, Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::config::ParUnits;
use crate::error::FgcmError;

/// Smallest aerosol optical depth allowed when it is derived from external measurements.
pub(crate) const MIN_TAU: f64 = 1e-5;

/// A named, contiguous group of fit parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParFamily {
    /// Nightly ozone.
    O3,
    /// Nightly aerosol power-law index.
    Alpha,
    /// Nightly intercept of the log aerosol optical depth.
    LnTauIntercept,
    /// Nightly slope of the log aerosol optical depth with time.
    LnTauSlope,
    /// Nightly water vapor intercept.
    PwvIntercept,
    /// Nightly fractional water vapor change with time.
    PwvPerSlope,
    /// Nightly offset to the external water vapor measurement.
    ExternalPwvOffset,
    /// Global scale of the external water vapor measurement.
    ExternalPwvScale,
    /// Global scale of the retrieved water vapor.
    RetrievedPwvScale,
    /// Global offset of the retrieved water vapor.
    RetrievedPwvOffset,
    /// Nightly offset of the retrieved water vapor.
    RetrievedPwvNightlyOffset,
    /// Nightly offset to the external aerosol optical depth.
    ExternalTauOffset,
    /// Global scale of the external aerosol optical depth.
    ExternalTauScale,
    /// Throughput intercept per wash interval.
    QeSysIntercept,
    /// Throughput slope with time per wash interval.
    QeSysSlope,
}

impl ParFamily {
    /// All families in the order they appear in the fit vector.
    pub const ALL: [ParFamily; 15] = [
        ParFamily::O3,
        ParFamily::Alpha,
        ParFamily::LnTauIntercept,
        ParFamily::LnTauSlope,
        ParFamily::PwvIntercept,
        ParFamily::PwvPerSlope,
        ParFamily::ExternalPwvOffset,
        ParFamily::ExternalPwvScale,
        ParFamily::RetrievedPwvScale,
        ParFamily::RetrievedPwvOffset,
        ParFamily::RetrievedPwvNightlyOffset,
        ParFamily::ExternalTauOffset,
        ParFamily::ExternalTauScale,
        ParFamily::QeSysIntercept,
        ParFamily::QeSysSlope,
    ];

    fn len(self, n_nights: usize, n_wash: usize) -> usize {
        match self {
            ParFamily::ExternalPwvScale
            | ParFamily::RetrievedPwvScale
            | ParFamily::RetrievedPwvOffset
            | ParFamily::ExternalTauScale => 1,
            ParFamily::QeSysIntercept | ParFamily::QeSysSlope => n_wash,
            _ => n_nights,
        }
    }
}

/// Location of every parameter family inside the flat fit vector.
///
/// The families are laid out back to back in the order of [`ParFamily::ALL`].
#[derive(Clone, Debug, PartialEq)]
pub struct ParLayout {
    offsets: [usize; 15],
    lengths: [usize; 15],
}

impl ParLayout {
    /// Layout for `n_nights` nights and `n_wash` wash intervals.
    pub fn new(n_nights: usize, n_wash: usize) -> Self {
        let mut offsets = [0; 15];
        let mut lengths = [0; 15];
        let mut loc = 0;
        for (i, family) in ParFamily::ALL.into_iter().enumerate() {
            offsets[i] = loc;
            lengths[i] = family.len(n_nights, n_wash);
            loc += lengths[i];
        }
        Self { offsets, lengths }
    }

    /// Total number of fit parameters.
    pub fn n_fit_pars(&self) -> usize {
        self.offsets[14] + self.lengths[14]
    }

    /// Offset of the first parameter of `family`.
    pub fn loc(&self, family: ParFamily) -> usize {
        self.offsets[family as usize]
    }

    /// Range of `family` in the fit vector.
    pub fn range(&self, family: ParFamily) -> Range<usize> {
        let i = family as usize;
        self.offsets[i]..self.offsets[i] + self.lengths[i]
    }

    /// Family owning the parameter at `index`.
    pub fn family_of(&self, index: usize) -> Option<ParFamily> {
        ParFamily::ALL
            .into_iter()
            .find(|family| self.range(*family).contains(&index))
    }

    /// Unit of every single parameter in the fit vector.
    pub(crate) fn unit_per_par(&self, units: &ParUnits) -> Array1<f64> {
        let mut out = Array1::ones(self.n_fit_pars());
        for family in ParFamily::ALL {
            out.slice_mut(s![self.range(family)])
                .fill(units.unit(family));
        }
        out
    }
}

/// How the precipitable water vapor of an exposure is modeled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PwvMode {
    /// Nightly intercept and fractional slope for every exposure.
    Nightly,
    /// Scaled external measurement plus nightly offset where available, nightly fit elsewhere.
    External,
    /// Scaled retrieved value plus a global or nightly offset where available, nightly fit elsewhere.
    Retrieved {
        /// Fit a nightly offset instead of a global one.
        nightly_offset: bool,
    },
}

/// How the aerosol optical depth of an exposure is modeled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TauMode {
    /// Nightly intercept and slope of `ln(tau)`.
    Nightly,
    /// Scaled external measurement plus nightly offset where available, nightly fit elsewhere.
    External,
}

/// Atmosphere correction modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtmosphereModes {
    /// Water vapor model.
    pub pwv: PwvMode,
    /// Aerosol model.
    pub tau: TauMode,
}

impl Default for AtmosphereModes {
    fn default() -> Self {
        Self {
            pwv: PwvMode::Nightly,
            tau: TauMode::Nightly,
        }
    }
}

/// Model actually used for the water vapor of one exposure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PwvSource {
    Nightly,
    External,
    Retrieved { nightly_offset: bool },
}

/// Model actually used for the aerosol depth of one exposure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TauSource {
    Nightly,
    External,
}

/// Static per-exposure information.
#[derive(Clone, Debug, PartialEq)]
pub struct ExposureTable {
    /// Night of every exposure.
    pub night_index: Array1<usize>,
    /// Wash interval of every exposure.
    pub wash_index: Array1<usize>,
    /// Band of every exposure.
    pub band_index: Array1<usize>,
    /// Modified Julian date of the exposure midpoint.
    pub mjd: Array1<f64>,
    /// Time since the middle of the night.
    pub delta_ut: Array1<f64>,
    /// Barometric pressure.
    pub pmb: Array1<f64>,
    /// Airmass of the telescope pointing.
    pub sec_zenith: Array1<f64>,
    /// Nonzero flags mark non-photometric or otherwise bad exposures.
    pub flag: Array1<u8>,
    /// External water vapor measurement.
    pub external_pwv: Array1<f64>,
    /// Whether `external_pwv` is available.
    pub external_pwv_flag: Array1<bool>,
    /// External aerosol optical depth measurement.
    pub external_tau: Array1<f64>,
    /// Whether `external_tau` is available.
    pub external_tau_flag: Array1<bool>,
    /// Water vapor retrieved from the star colors.
    pub retrieved_pwv: Array1<f64>,
    /// Whether `retrieved_pwv` is available.
    pub retrieved_pwv_flag: Array1<bool>,
}

impl ExposureTable {
    /// Create a table of good exposures at zenith without external measurements.
    pub fn new(
        night_index: Vec<usize>,
        wash_index: Vec<usize>,
        band_index: Vec<usize>,
        mjd: Vec<f64>,
    ) -> Self {
        let n = mjd.len();
        Self {
            night_index: Array1::from(night_index),
            wash_index: Array1::from(wash_index),
            band_index: Array1::from(band_index),
            mjd: Array1::from(mjd),
            delta_ut: Array1::zeros(n),
            pmb: Array1::from_elem(n, 778.0),
            sec_zenith: Array1::ones(n),
            flag: Array1::zeros(n),
            external_pwv: Array1::zeros(n),
            external_pwv_flag: Array1::from_elem(n, false),
            external_tau: Array1::zeros(n),
            external_tau_flag: Array1::from_elem(n, false),
            retrieved_pwv: Array1::zeros(n),
            retrieved_pwv_flag: Array1::from_elem(n, false),
        }
    }

    /// Set the hours from local midnight.
    pub fn with_delta_ut(mut self, delta_ut: Vec<f64>) -> Self {
        self.delta_ut = Array1::from(delta_ut);
        self
    }

    /// Set the barometric pressure.
    pub fn with_pmb(mut self, pmb: Vec<f64>) -> Self {
        self.pmb = Array1::from(pmb);
        self
    }

    /// Set the airmass.
    pub fn with_sec_zenith(mut self, sec_zenith: Vec<f64>) -> Self {
        self.sec_zenith = Array1::from(sec_zenith);
        self
    }

    /// Set the exposure flags.
    pub fn with_flag(mut self, flag: Vec<u8>) -> Self {
        self.flag = Array1::from(flag);
        self
    }

    /// Set external water vapor measurements; `None` marks exposures without one.
    pub fn with_external_pwv(mut self, pwv: Vec<Option<f64>>) -> Self {
        self.external_pwv_flag = pwv.iter().map(Option::is_some).collect();
        self.external_pwv = pwv.into_iter().map(|v| v.unwrap_or(0.0)).collect();
        self
    }

    /// Set external aerosol optical depths; `None` marks exposures without one.
    pub fn with_external_tau(mut self, tau: Vec<Option<f64>>) -> Self {
        self.external_tau_flag = tau.iter().map(Option::is_some).collect();
        self.external_tau = tau.into_iter().map(|v| v.unwrap_or(0.0)).collect();
        self
    }

    /// Set retrieved water vapor values; `None` marks exposures without a retrieval.
    pub fn with_retrieved_pwv(mut self, pwv: Vec<Option<f64>>) -> Self {
        self.retrieved_pwv_flag = pwv.iter().map(Option::is_some).collect();
        self.retrieved_pwv = pwv.into_iter().map(|v| v.unwrap_or(0.0)).collect();
        self
    }

    /// Number of exposures.
    pub fn len(&self) -> usize {
        self.mjd.len()
    }

    /// Whether there are no exposures.
    pub fn is_empty(&self) -> bool {
        self.mjd.is_empty()
    }

    fn validate(&self, n_nights: usize, n_wash: usize, n_bands: usize) -> Result<(), FgcmError> {
        let n = self.len();
        FgcmError::check_len("night_index", n, self.night_index.len())?;
        FgcmError::check_len("wash_index", n, self.wash_index.len())?;
        FgcmError::check_len("band_index", n, self.band_index.len())?;
        FgcmError::check_len("delta_ut", n, self.delta_ut.len())?;
        FgcmError::check_len("pmb", n, self.pmb.len())?;
        FgcmError::check_len("sec_zenith", n, self.sec_zenith.len())?;
        FgcmError::check_len("flag", n, self.flag.len())?;
        FgcmError::check_len("external_pwv", n, self.external_pwv.len())?;
        FgcmError::check_len("external_tau", n, self.external_tau.len())?;
        FgcmError::check_len("retrieved_pwv", n, self.retrieved_pwv.len())?;
        let out_of_range = |name: &str, idx: &Array1<usize>, max: usize| {
            match idx.iter().find(|&&i| i >= max) {
                Some(i) => Err(FgcmError::InvalidConfig(format!(
                    "{name} {i} out of range (< {max})"
                ))),
                None => Ok(()),
            }
        };
        out_of_range("night index", &self.night_index, n_nights)?;
        out_of_range("wash index", &self.wash_index, n_wash)?;
        out_of_range("band index", &self.band_index, n_bands)
    }
}

/// Parameter container.
///
/// Owns the physical values of all fit parameters, the per-exposure atmosphere and throughput
/// derived from them, and the calibration products written back by the gray and repeatability engines.
#[derive(Clone, Debug)]
pub struct FgcmParameters {
    pub(crate) layout: ParLayout,
    pub(crate) modes: AtmosphereModes,
    pub(crate) units: ParUnits,
    pub(crate) n_nights: usize,
    pub(crate) n_ccd: usize,
    pub(crate) bands: Vec<String>,
    pub(crate) fit_band_index: Vec<usize>,
    pub(crate) wash_mjds: Array1<f64>,
    /// Physical parameter values, laid out as the fit vector.
    pub(crate) pars: Array1<f64>,
    pub(crate) exposures: ExposureTable,

    pub(crate) exp_pwv: Array1<f64>,
    pub(crate) exp_o3: Array1<f64>,
    pub(crate) exp_ln_tau: Array1<f64>,
    pub(crate) exp_alpha: Array1<f64>,
    pub(crate) exp_qe_sys: Array1<f64>,

    pub(crate) comp_exp_gray: Array1<f64>,
    pub(crate) comp_var_gray: Array1<f64>,
    pub(crate) comp_n_good_star_per_exp: Array1<usize>,
    pub(crate) comp_sig_fgcm: Array1<f64>,
}

impl FgcmParameters {
    /// Create a parameter container with default starting values.
    ///
    /// # Arguments
    /// - `bands`: Band names; band indices refer to this list.
    /// - `fit_bands`: Indices of the bands used in the chi-squared.
    /// - `n_nights`, `n_ccd`: Number of campaign nights and CCDs.
    /// - `wash_mjds`: Start MJD of every wash interval.
    pub fn new(
        exposures: ExposureTable,
        bands: Vec<String>,
        fit_bands: Vec<usize>,
        n_nights: usize,
        n_ccd: usize,
        wash_mjds: Vec<f64>,
        modes: AtmosphereModes,
        units: ParUnits,
    ) -> Result<Self, FgcmError> {
        let n_wash = wash_mjds.len();
        units.validate()?;
        exposures.validate(n_nights, n_wash, bands.len())?;
        if let Some(b) = fit_bands.iter().find(|&&b| b >= bands.len()) {
            return Err(FgcmError::InvalidConfig(format!(
                "fit band {b} out of range"
            )));
        }

        let layout = ParLayout::new(n_nights, n_wash);
        let n_exp = exposures.len();
        let n_bands = bands.len();
        let mut out = Self {
            pars: Array1::zeros(layout.n_fit_pars()),
            layout,
            modes,
            units,
            n_nights,
            n_ccd,
            bands,
            fit_band_index: fit_bands,
            wash_mjds: Array1::from(wash_mjds),
            exposures,
            exp_pwv: Array1::zeros(n_exp),
            exp_o3: Array1::zeros(n_exp),
            exp_ln_tau: Array1::zeros(n_exp),
            exp_alpha: Array1::zeros(n_exp),
            exp_qe_sys: Array1::zeros(n_exp),
            comp_exp_gray: Array1::zeros(n_exp),
            comp_var_gray: Array1::zeros(n_exp),
            comp_n_good_star_per_exp: Array1::zeros(n_exp),
            comp_sig_fgcm: Array1::zeros(n_bands),
        };
        out.fill_par(ParFamily::O3, 263.0);
        out.fill_par(ParFamily::Alpha, 1.0);
        out.fill_par(ParFamily::LnTauIntercept, 0.03f64.ln());
        out.fill_par(ParFamily::PwvIntercept, 3.0);
        out.fill_par(ParFamily::ExternalPwvScale, 1.0);
        out.fill_par(ParFamily::RetrievedPwvScale, 1.0);
        out.fill_par(ParFamily::ExternalTauScale, 1.0);
        out.pars_to_exposures();
        Ok(out)
    }

    /// Layout of the parameter vector.
    pub fn layout(&self) -> &ParLayout {
        &self.layout
    }

    /// Atmosphere models.
    pub fn modes(&self) -> AtmosphereModes {
        self.modes
    }

    /// Length of the parameter vector.
    pub fn n_fit_pars(&self) -> usize {
        self.layout.n_fit_pars()
    }

    /// Number of exposures.
    pub fn n_exp(&self) -> usize {
        self.exposures.len()
    }

    /// Number of bands.
    pub fn n_bands(&self) -> usize {
        self.bands.len()
    }

    /// Number of CCDs.
    pub fn n_ccd(&self) -> usize {
        self.n_ccd
    }

    /// Band names.
    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    /// Bands entering the chi-squared.
    pub fn fit_band_index(&self) -> &[usize] {
        &self.fit_band_index
    }

    /// Exposure table.
    pub fn exposures(&self) -> &ExposureTable {
        &self.exposures
    }

    /// Mutable access to the static exposure information, e.g. to flag exposures.
    pub fn exposures_mut(&mut self) -> &mut ExposureTable {
        &mut self.exposures
    }

    /// Physical values of one parameter family.
    pub fn par(&self, family: ParFamily) -> ArrayView1<'_, f64> {
        self.pars.slice(s![self.layout.range(family)])
    }

    /// Set every parameter of `family` to `value` and update the exposures.
    pub fn fill_par(&mut self, family: ParFamily, value: f64) {
        let range = self.layout.range(family);
        self.pars.slice_mut(s![range]).fill(value);
        self.pars_to_exposures();
    }

    /// Set the physical values of one parameter family and update the exposures.
    pub fn set_par(&mut self, family: ParFamily, values: &[f64]) -> Result<(), FgcmError> {
        let range = self.layout.range(family);
        FgcmError::check_len("parameter family", range.len(), values.len())?;
        self.pars
            .slice_mut(s![range])
            .assign(&ArrayView1::from(values));
        self.pars_to_exposures();
        Ok(())
    }

    /// Unit scales for a fit vector in fitter or physical units.
    pub fn unit_dict(&self, fitter_units: bool) -> ParUnits {
        if fitter_units {
            self.units.clone()
        } else {
            ParUnits::physical()
        }
    }

    /// Load the parameters from a flat fit vector.
    pub fn reload_par_array(
        &mut self,
        par_array: ArrayView1<f64>,
        fitter_units: bool,
    ) -> Result<(), FgcmError> {
        FgcmError::check_len("parameter vector", self.n_fit_pars(), par_array.len())?;
        let units = self.layout.unit_per_par(&self.unit_dict(fitter_units));
        self.pars = &par_array / &units;
        Ok(())
    }

    /// The flat fit vector of the current parameters.
    pub fn par_array(&self, fitter_units: bool) -> Array1<f64> {
        let units = self.layout.unit_per_par(&self.unit_dict(fitter_units));
        &self.pars * &units
    }

    pub(crate) fn pwv_source(&self, exp: usize) -> PwvSource {
        match self.modes.pwv {
            PwvMode::External if self.exposures.external_pwv_flag[exp] => PwvSource::External,
            PwvMode::Retrieved { nightly_offset } if self.exposures.retrieved_pwv_flag[exp] => {
                PwvSource::Retrieved { nightly_offset }
            }
            _ => PwvSource::Nightly,
        }
    }

    pub(crate) fn tau_source(&self, exp: usize) -> TauSource {
        match self.modes.tau {
            TauMode::External if self.exposures.external_tau_flag[exp] => TauSource::External,
            _ => TauSource::Nightly,
        }
    }

    /// Aerosol optical depth of an exposure with an external measurement, before the log.
    pub(crate) fn external_tau(&self, exp: usize) -> f64 {
        let night = self.exposures.night_index[exp];
        let tau = self.par(ParFamily::ExternalTauOffset)[night]
            + self.par(ParFamily::ExternalTauScale)[0] * self.exposures.external_tau[exp];
        tau.max(MIN_TAU)
    }

    /// Time since the start of the wash interval of an exposure.
    pub(crate) fn wash_delta_mjd(&self, exp: usize) -> f64 {
        self.exposures.mjd[exp] - self.wash_mjds[self.exposures.wash_index[exp]]
    }

    /// Propagate the nightly and global parameters onto every exposure.
    pub fn pars_to_exposures(&mut self) {
        for exp in 0..self.n_exp() {
            let night = self.exposures.night_index[exp];
            let wash = self.exposures.wash_index[exp];
            let delta_ut = self.exposures.delta_ut[exp];

            self.exp_o3[exp] = self.par(ParFamily::O3)[night];
            self.exp_alpha[exp] = self.par(ParFamily::Alpha)[night];

            self.exp_ln_tau[exp] = match self.tau_source(exp) {
                TauSource::External => self.external_tau(exp).ln(),
                TauSource::Nightly => {
                    self.par(ParFamily::LnTauIntercept)[night]
                        + self.par(ParFamily::LnTauSlope)[night] * delta_ut
                }
            };

            self.exp_pwv[exp] = match self.pwv_source(exp) {
                PwvSource::Nightly => {
                    let intercept = self.par(ParFamily::PwvIntercept)[night];
                    intercept * (1.0 + self.par(ParFamily::PwvPerSlope)[night] * delta_ut)
                }
                PwvSource::External => {
                    self.par(ParFamily::ExternalPwvOffset)[night]
                        + self.par(ParFamily::ExternalPwvScale)[0]
                            * self.exposures.external_pwv[exp]
                }
                PwvSource::Retrieved { nightly_offset } => {
                    let offset = if nightly_offset {
                        self.par(ParFamily::RetrievedPwvNightlyOffset)[night]
                    } else {
                        self.par(ParFamily::RetrievedPwvOffset)[0]
                    };
                    self.par(ParFamily::RetrievedPwvScale)[0] * self.exposures.retrieved_pwv[exp]
                        + offset
                }
            };

            self.exp_qe_sys[exp] = self.par(ParFamily::QeSysIntercept)[wash]
                + self.par(ParFamily::QeSysSlope)[wash] * self.wash_delta_mjd(exp);
        }
    }

    /// Water vapor per exposure.
    pub fn exp_pwv(&self) -> ArrayView1<'_, f64> {
        self.exp_pwv.view()
    }

    /// Ozone per exposure.
    pub fn exp_o3(&self) -> ArrayView1<'_, f64> {
        self.exp_o3.view()
    }

    /// Log aerosol optical depth per exposure.
    pub fn exp_ln_tau(&self) -> ArrayView1<'_, f64> {
        self.exp_ln_tau.view()
    }

    /// Angstrom exponent per exposure.
    pub fn exp_alpha(&self) -> ArrayView1<'_, f64> {
        self.exp_alpha.view()
    }

    /// System throughput offset per exposure, in magnitudes.
    pub fn exp_qe_sys(&self) -> ArrayView1<'_, f64> {
        self.exp_qe_sys.view()
    }

    /// Exposure gray computed by [`FgcmGray`](crate::FgcmGray).
    pub fn comp_exp_gray(&self) -> ArrayView1<'_, f64> {
        self.comp_exp_gray.view()
    }

    /// Exposure gray variance computed by [`FgcmGray`](crate::FgcmGray).
    pub fn comp_var_gray(&self) -> ArrayView1<'_, f64> {
        self.comp_var_gray.view()
    }

    /// Number of stars entering the exposure gray.
    pub fn comp_n_good_star_per_exp(&self) -> ArrayView1<'_, usize> {
        self.comp_n_good_star_per_exp.view()
    }

    /// Intrinsic scatter per band computed by [`FgcmSigFgcm`](crate::FgcmSigFgcm).
    pub fn comp_sig_fgcm(&self) -> ArrayView1<'_, f64> {
        self.comp_sig_fgcm.view()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    fn exposures() -> ExposureTable {
        ExposureTable::new(
            vec![0, 0, 1, 1],
            vec![0, 0, 0, 1],
            vec![0, 1, 0, 1],
            vec![100.0, 100.1, 101.0, 101.1],
        )
        .with_delta_ut(vec![-0.1, 0.1, -0.2, 0.2])
    }

    fn pars(modes: AtmosphereModes, exposures: ExposureTable) -> FgcmParameters {
        FgcmParameters::new(
            exposures,
            vec!["g".into(), "r".into()],
            vec![0, 1],
            2,
            4,
            vec![99.0, 101.05],
            modes,
            ParUnits::default(),
        )
        .unwrap()
    }

    #[test]
    fn layout_partitions_vector() {
        let layout = ParLayout::new(3, 2);
        let mut next = 0;
        for family in ParFamily::ALL {
            let range = layout.range(family);
            assert_eq!(range.start, next);
            next = range.end;
        }
        assert_eq!(next, layout.n_fit_pars());
        assert_eq!(layout.n_fit_pars(), 9 * 3 + 4 + 2 * 2);
        assert_eq!(layout.family_of(0), Some(ParFamily::O3));
        assert_eq!(
            layout.family_of(layout.n_fit_pars() - 1),
            Some(ParFamily::QeSysSlope)
        );
        assert_eq!(layout.family_of(layout.n_fit_pars()), None);
    }

    #[test]
    fn reload_fitter_units() {
        let mut p = pars(AtmosphereModes::default(), exposures());
        p.units.o3 = 0.01;
        let mut vec = p.par_array(true);
        let o3 = p.layout.range(ParFamily::O3);
        assert_abs_diff_eq!(vec[o3.start], 2.63, epsilon = 1e-12);

        vec[o3.start] = 3.0;
        p.reload_par_array(vec.view(), true).unwrap();
        assert_abs_diff_eq!(p.par(ParFamily::O3)[0], 300.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p.par_array(false)[o3.start], 300.0, epsilon = 1e-9);

        let short = Array1::zeros(3);
        assert!(matches!(
            p.reload_par_array(short.view(), false),
            Err(FgcmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn nightly_exposures() {
        let mut p = pars(AtmosphereModes::default(), exposures());
        p.set_par(ParFamily::PwvIntercept, &[2.0, 4.0]).unwrap();
        p.set_par(ParFamily::PwvPerSlope, &[0.5, 0.0]).unwrap();
        p.set_par(ParFamily::LnTauSlope, &[1.0, 0.0]).unwrap();
        p.set_par(ParFamily::QeSysIntercept, &[0.01, 0.02]).unwrap();
        p.set_par(ParFamily::QeSysSlope, &[0.001, 0.0]).unwrap();

        assert_abs_diff_eq!(p.exp_pwv, array![1.9, 2.1, 4.0, 4.0], epsilon = 1e-12);
        let ln_tau0 = 0.03f64.ln();
        assert_abs_diff_eq!(
            p.exp_ln_tau,
            array![ln_tau0 - 0.1, ln_tau0 + 0.1, ln_tau0, ln_tau0],
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            p.exp_qe_sys,
            array![0.011, 0.0111, 0.012, 0.02],
            epsilon = 1e-9
        );
    }

    #[test]
    fn external_and_retrieved_sources() {
        let ext = exposures()
            .with_external_pwv(vec![Some(5.0), None, Some(1.0), None])
            .with_external_tau(vec![None, Some(0.05), None, None]);
        let modes = AtmosphereModes {
            pwv: PwvMode::External,
            tau: TauMode::External,
        };
        let mut p = pars(modes, ext);
        p.set_par(ParFamily::ExternalPwvOffset, &[0.5, -0.5]).unwrap();
        p.fill_par(ParFamily::ExternalPwvScale, 2.0);
        assert_eq!(p.pwv_source(0), PwvSource::External);
        assert_eq!(p.pwv_source(1), PwvSource::Nightly);
        assert_abs_diff_eq!(p.exp_pwv[0], 10.5, epsilon = 1e-12);
        assert_abs_diff_eq!(p.exp_pwv[1], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.exp_pwv[2], 1.5, epsilon = 1e-12);
        assert_eq!(p.tau_source(1), TauSource::External);
        assert_abs_diff_eq!(p.exp_ln_tau[1], 0.05f64.ln(), epsilon = 1e-12);

        let ret = exposures().with_retrieved_pwv(vec![Some(2.0), Some(3.0), None, None]);
        let modes = AtmosphereModes {
            pwv: PwvMode::Retrieved {
                nightly_offset: false,
            },
            tau: TauMode::Nightly,
        };
        let mut p = pars(modes, ret);
        p.fill_par(ParFamily::RetrievedPwvOffset, 0.25);
        assert_abs_diff_eq!(p.exp_pwv, array![2.25, 3.25, 3.0, 3.0], epsilon = 1e-12);
    }

    #[test]
    fn index_out_of_range() {
        let bad = ExposureTable::new(vec![0, 2], vec![0, 0], vec![0, 0], vec![1.0, 2.0]);
        let res = FgcmParameters::new(
            bad,
            vec!["g".into()],
            vec![0],
            2,
            1,
            vec![0.0],
            AtmosphereModes::default(),
            ParUnits::default(),
        );
        assert!(matches!(res, Err(FgcmError::InvalidConfig(_))));
    }
}
