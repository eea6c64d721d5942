//! Synthetic surveys with an analytic throughput model, for tests and benchmarks.

use ndarray::Array1;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::{Distribution, Normal};

use crate::config::FgcmConfig;
use crate::error::FgcmError;
use crate::lut::{LutDerivatives, LutQuery, ThroughputLut};
use crate::parameters::{AtmosphereModes, ExposureTable, FgcmParameters, ParFamily};
use crate::stars::{FgcmStars, ObservationTable};

const MAG_CONST: f64 = 2.5 / std::f64::consts::LN_10;
const LAMBDA_REF: f64 = 5500.0;
const PMB_STD: f64 = 778.0;

/// Analytic throughput with exponential extinction by water vapor, ozone, aerosols and Rayleigh scattering.
///
/// `I0 = t_ccd exp(-X (k_pwv pwv + k_o3 o3 + tau (lambda / 5500)^-alpha + k_ray pmb / 778))`
/// and `I10 = i10_base + i10_pwv pwv X`.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalyticLut {
    pub lambda: Vec<f64>,
    pub k_pwv: Vec<f64>,
    pub k_o3: Vec<f64>,
    pub k_ray: Vec<f64>,
    pub i10_base: Vec<f64>,
    pub i10_pwv: Vec<f64>,
}

impl AnalyticLut {
    /// Coefficients for filters with the given effective wavelengths.
    pub fn new(lambda: Vec<f64>) -> Self {
        let r = lambda.iter().map(|l| l / LAMBDA_REF).collect::<Vec<_>>();
        Self {
            k_pwv: r.iter().map(|r| 0.008 * r * r).collect(),
            k_o3: r.iter().map(|r| 2e-4 * (-(r - 1.1).powi(2) / 0.05).exp()).collect(),
            k_ray: r.iter().map(|r| 0.1 * r.powi(-4)).collect(),
            i10_base: r.iter().map(|r| 20.0 * r).collect(),
            i10_pwv: r.iter().map(|r| 2.0 * r * r).collect(),
            lambda,
        }
    }

    /// `I10` at 3 mm of water vapor at zenith.
    pub fn i10_std(&self) -> Vec<f64> {
        self.i10_base
            .iter()
            .zip(&self.i10_pwv)
            .map(|(base, pwv)| base + 3.0 * pwv)
            .collect()
    }

    fn tau_term(&self, q: &LutQuery) -> f64 {
        q.ln_tau.exp() * (self.lambda[q.filter] / LAMBDA_REF).powf(-q.alpha)
    }
}

impl ThroughputLut for AnalyticLut {
    type Indices = LutQuery;

    fn indices(&self, query: &LutQuery) -> LutQuery {
        *query
    }

    fn i0(&self, q: &LutQuery, _indices: &LutQuery) -> f64 {
        let f = q.filter;
        let optical_depth = self.k_pwv[f] * q.pwv
            + self.k_o3[f] * q.o3
            + self.tau_term(q)
            + self.k_ray[f] * q.pmb / PMB_STD;
        (1.0 + 0.01 * q.ccd as f64) * (-q.sec_zenith * optical_depth).exp()
    }

    fn i1(&self, q: &LutQuery, indices: &LutQuery) -> f64 {
        let i10 = self.i10_base[q.filter] + self.i10_pwv[q.filter] * q.pwv * q.sec_zenith;
        self.i0(q, indices) * i10
    }

    fn log_derivatives(&self, q: &LutQuery, _i0: f64) -> LutDerivatives {
        let f = q.filter;
        let x = q.sec_zenith;
        let tau_term = self.tau_term(q);
        LutDerivatives {
            pwv: -MAG_CONST * x * self.k_pwv[f],
            o3: -MAG_CONST * x * self.k_o3[f],
            tau: -MAG_CONST * x * tau_term,
            alpha: MAG_CONST * x * tau_term * (self.lambda[f] / LAMBDA_REF).ln(),
        }
    }

    fn log_derivatives_i1(
        &self,
        q: &LutQuery,
        _i0: f64,
        i10: f64,
        sed_slope: f64,
    ) -> LutDerivatives {
        LutDerivatives {
            pwv: MAG_CONST * sed_slope * self.i10_pwv[q.filter] * q.sec_zenith
                / (1.0 + sed_slope * i10),
            ..LutDerivatives::default()
        }
    }

    fn has_i1_derivatives(&self) -> bool {
        true
    }
}

/// A survey generated from known parameters.
pub struct SyntheticSurvey {
    pub pars: FgcmParameters,
    pub stars: FgcmStars,
    pub lut: AnalyticLut,
    pub config: FgcmConfig,
    /// Parameter vector the observations were generated with, in physical units.
    pub truth: Array1<f64>,
}

pub const N_NIGHTS: usize = 3;
pub const N_CCD: usize = 4;
/// Exposures per band and night.
pub const EXP_PER_BAND: usize = 2;

/// Generate a survey of `n_stars` stars in the bands g, r and i.
///
/// Every night takes two exposures per band; each star lands on a random CCD of an exposure
/// with a probability of 70 %. The first two bands are required.
pub fn survey(n_stars: usize, seed: u64) -> Result<SyntheticSurvey, FgcmError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let bands = ["g", "r", "i"];
    let lambda = vec![4800.0, 6400.0, 7800.0];
    let n_bands = bands.len();
    let exp_per_night = n_bands * EXP_PER_BAND;
    let n_exp = N_NIGHTS * exp_per_night;
    let wash_mjds = vec![59990.0, 60001.0];

    let mut night_index = Vec::with_capacity(n_exp);
    let mut band_index = Vec::with_capacity(n_exp);
    let mut delta_ut = Vec::with_capacity(n_exp);
    let mut mjd = Vec::with_capacity(n_exp);
    let mut sec_zenith = Vec::with_capacity(n_exp);
    for e in 0..n_exp {
        let night = e / exp_per_night;
        let k = e % exp_per_night;
        night_index.push(night);
        band_index.push(k / EXP_PER_BAND);
        let dut = -0.15 + 0.3 * k as f64 / (exp_per_night - 1) as f64;
        delta_ut.push(dut);
        mjd.push(60000.5 + night as f64 + dut / 24.0);
        sec_zenith.push(1.0 + 0.12 * k as f64 + 0.05 * night as f64);
    }
    let wash_index = mjd
        .iter()
        .map(|m| wash_mjds.iter().filter(|w| *w <= m).count().saturating_sub(1))
        .collect();

    let exposures = ExposureTable::new(night_index, wash_index, band_index, mjd)
        .with_delta_ut(delta_ut)
        .with_sec_zenith(sec_zenith);
    let mut pars = FgcmParameters::new(
        exposures,
        bands.iter().map(|b| b.to_string()).collect(),
        (0..n_bands).collect(),
        N_NIGHTS,
        N_CCD,
        wash_mjds,
        AtmosphereModes::default(),
        Default::default(),
    )?;
    pars.set_par(ParFamily::O3, &[250.0, 270.0, 290.0])?;
    pars.set_par(ParFamily::Alpha, &[0.9, 1.1, 1.3])?;
    pars.set_par(ParFamily::LnTauIntercept, &[0.04f64.ln(), 0.06f64.ln(), 0.03f64.ln()])?;
    pars.set_par(ParFamily::LnTauSlope, &[0.2, -0.1, 0.0])?;
    pars.set_par(ParFamily::PwvIntercept, &[2.0, 3.0, 4.5])?;
    pars.set_par(ParFamily::PwvPerSlope, &[0.1, -0.05, 0.0])?;
    pars.set_par(ParFamily::QeSysIntercept, &[0.0, -0.02])?;
    pars.set_par(ParFamily::QeSysSlope, &[0.0, 0.004])?;

    let lut = AnalyticLut::new(lambda.clone());

    let mut obs_obj = Vec::new();
    let mut obs_exp = Vec::new();
    let mut obs_ccd = Vec::new();
    let mut obs_band = Vec::new();
    let mut obs_mag = Vec::new();
    let mut obs_err = Vec::new();
    let mut obs_sec_zenith = Vec::new();
    let unit_normal = Normal::new(0.0, 1.0).map_err(|e| FgcmError::InvalidConfig(e.to_string()))?;
    for obj in 0..n_stars {
        let r = rng.gen_range(15.0..19.0);
        let g_r = rng.gen_range(0.3..1.3);
        let r_i = 0.35 * g_r + 0.02 * unit_normal.sample(&mut rng);
        let true_mags = [r + g_r, r, r - r_i];
        for e in 0..n_exp {
            if !rng.gen_bool(0.7) {
                continue;
            }
            let band = pars.exposures.band_index[e];
            let ccd = rng.gen_range(0..N_CCD);
            let query = LutQuery {
                filter: band,
                pwv: pars.exp_pwv[e],
                o3: pars.exp_o3[e],
                ln_tau: pars.exp_ln_tau[e],
                alpha: pars.exp_alpha[e],
                sec_zenith: pars.exposures.sec_zenith[e],
                ccd,
                pmb: pars.exposures.pmb[e],
            };
            let i0 = lut.i0(&query, &query);
            let mag = true_mags[band];
            let err = 0.003 + 0.002 * 10f64.powf(0.4 * (mag - 17.0));
            obs_obj.push(obj);
            obs_exp.push(e);
            obs_ccd.push(ccd);
            obs_band.push(band);
            obs_mag.push(
                mag - 2.5 * i0.log10() - pars.exp_qe_sys[e] + err * unit_normal.sample(&mut rng),
            );
            obs_err.push(err);
            obs_sec_zenith.push(query.sec_zenith);
        }
    }

    let obs = ObservationTable::new(obs_obj, obs_exp, obs_ccd, obs_band, obs_mag, obs_err)
        .with_sec_zenith(obs_sec_zenith);
    let mut stars = FgcmStars::new(obs, n_stars, lambda, vec![0, 1], 2)?;
    stars.count_good_observations(pars.exposures.flag.view())?;
    stars.select_stars_min_obs();

    let config = FgcmConfig::default()
        .with_i10_std_band(lut.i10_std())
        .with_n_core(2)
        .with_n_star_per_run(n_stars.div_ceil(4).max(1))
        .with_min_star_per_exp(20)
        .with_color_split_indices([0, 2]);

    Ok(SyntheticSurvey {
        truth: pars.par_array(false),
        pars,
        stars,
        lut,
        config,
    })
}
