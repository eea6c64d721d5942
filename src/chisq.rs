//! The chi-squared and gradient engine.

use std::time::Instant;

use itertools::Itertools;
use log::{debug, info};
use ndarray::{Array1, ArrayView1, ArrayView2};

use crate::config::FgcmConfig;
use crate::error::FgcmError;
use crate::lut::{LutQuery, ThroughputLut};
use crate::ndarray_utils::{array_split, presorted_match};
use crate::parameters::FgcmParameters;
use crate::partials::parameter_partials;
use crate::stars::FgcmStars;

/// Options of a single [`FgcmChisq::evaluate`] call.
///
/// All options are off by default; use the `with_*` functions to set them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChisqOptions {
    /// The parameter vector is in fitter units.
    pub fitter_units: bool,
    /// Compute the gradient.
    pub compute_derivatives: bool,
    /// Recompute the SED slopes of the good stars before the chromatic correction.
    pub compute_sed_slopes: bool,
    /// Reuse the star-observation match of a previous call with the same selection.
    pub use_match_cache: bool,
    /// Run every partition in the calling thread.
    pub debug: bool,
    /// Compute standardized magnitudes of all exposures, including flagged ones, and nothing else.
    pub all_exposures: bool,
    /// Include reserved stars.
    pub include_reserve: bool,
}

impl ChisqOptions {
    /// Interpret the parameter vector in fitter units.
    pub fn with_fitter_units(mut self, fitter_units: bool) -> Self {
        self.fitter_units = fitter_units;
        self
    }

    /// Compute the gradient.
    pub fn with_compute_derivatives(mut self, compute_derivatives: bool) -> Self {
        self.compute_derivatives = compute_derivatives;
        self
    }

    /// Recompute the SED slopes.
    pub fn with_compute_sed_slopes(mut self, compute_sed_slopes: bool) -> Self {
        self.compute_sed_slopes = compute_sed_slopes;
        self
    }

    /// Reuse the cached star-observation match.
    pub fn with_use_match_cache(mut self, use_match_cache: bool) -> Self {
        self.use_match_cache = use_match_cache;
        self
    }

    /// Run without the thread pool.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Standardize the observations of all exposures.
    pub fn with_all_exposures(mut self, all_exposures: bool) -> Self {
        self.all_exposures = all_exposures;
        self
    }

    /// Include reserved stars.
    pub fn with_include_reserve(mut self, include_reserve: bool) -> Self {
        self.include_reserve = include_reserve;
        self
    }

    fn validate(&self) -> Result<(), FgcmError> {
        if self.all_exposures && (self.compute_derivatives || self.compute_sed_slopes) {
            return Err(FgcmError::IncompatibleOptions(
                "all_exposures cannot be combined with compute_derivatives or compute_sed_slopes",
            ));
        }
        Ok(())
    }
}

/// Result of [`FgcmChisq::evaluate`].
#[derive(Clone, Debug, PartialEq)]
pub struct ChisqResult {
    /// Chi-squared per degree of freedom.
    pub chisq: f64,
    /// Gradient of `chisq` with respect to the parameter vector, in the units of the vector.
    pub gradient: Option<Array1<f64>>,
}

#[derive(Clone, Debug)]
struct MatchCache {
    include_reserve: bool,
    all_exposures: bool,
    good_stars: Vec<usize>,
    good_obs: Vec<usize>,
}

/// Chi-squared engine.
///
/// Evaluates the chi-squared of the observed standardized magnitudes around the per-object
/// means for a parameter vector, and optionally its analytic gradient. As a side effect the
/// standardized magnitudes and means of the star store are updated.
///
/// The good stars are split into partitions of at most `n_star_per_run` stars which are
/// processed independently, on a thread pool of `n_core` threads with the `parallel` feature.
pub struct FgcmChisq<L: ThroughputLut> {
    config: FgcmConfig,
    lut: L,
    fit_chisqs: Vec<f64>,
    n_active_pars: Option<usize>,
    match_cache: Option<MatchCache>,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl<L: ThroughputLut> FgcmChisq<L> {
    /// Create an engine, validating the configuration.
    pub fn new(config: FgcmConfig, lut: L) -> Result<Self, FgcmError> {
        #[cfg(feature = "parallel")]
        let pool = if config.n_core > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.n_core)
                    .build()
                    .map_err(|e| FgcmError::InvalidConfig(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(Self {
            config,
            lut,
            fit_chisqs: Vec::new(),
            n_active_pars: None,
            match_cache: None,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &FgcmConfig {
        &self.config
    }

    /// The throughput lookup table.
    pub fn lut(&self) -> &L {
        &self.lut
    }

    /// Chi-squared per degree of freedom of every evaluation since the last reset.
    pub fn fit_chisqs(&self) -> &[f64] {
        &self.fit_chisqs
    }

    /// Clear the chi-squared history.
    pub fn reset_fit_chisq_list(&mut self) {
        self.fit_chisqs.clear();
    }

    /// Drop the cached star-observation match; needed whenever star or exposure flags change.
    pub fn clear_match_cache(&mut self) {
        self.match_cache = None;
    }

    /// Number of parameters counted against the degrees of freedom.
    ///
    /// Set by every evaluation with derivatives; before the first one it is the number of fit parameters.
    pub fn n_active_pars(&self) -> Option<usize> {
        self.n_active_pars
    }

    /// Evaluate the chi-squared per degree of freedom at `fit_params`.
    ///
    /// # Arguments
    /// - `pars`: Parameter container, reloaded from `fit_params`.
    /// - `stars`: Star store; standardized magnitudes and means are overwritten.
    /// - `fit_params`: Flat parameter vector.
    /// - `options`: Evaluation options.
    /// - `ccd_gray`: Optional `(exposure, CCD)` gray added to the observations where it is legal.
    ///
    /// # Errors
    /// - [`FgcmError::IncompatibleOptions`] for `all_exposures` with derivatives or SED slopes.
    /// - [`FgcmError::NoGoodStars`] if no star passes the flag selection.
    /// - [`FgcmError::NonPositiveDof`] if there are not more fit observations than active parameters.
    pub fn evaluate(
        &mut self,
        pars: &mut FgcmParameters,
        stars: &mut FgcmStars,
        fit_params: ArrayView1<f64>,
        options: &ChisqOptions,
        ccd_gray: Option<ArrayView2<f64>>,
    ) -> Result<ChisqResult, FgcmError> {
        options.validate()?;
        self.config.validate(stars.n_bands())?;
        FgcmError::check_len("parameter bands", stars.n_bands(), pars.n_bands())?;
        if let Some(gray) = &ccd_gray {
            FgcmError::check_len("ccd gray exposures", pars.n_exp(), gray.nrows())?;
            FgcmError::check_len("ccd gray CCDs", pars.n_ccd(), gray.ncols())?;
        }
        debug!("FgcmChisq options: {:?}", options);
        let start = Instant::now();

        pars.reload_par_array(fit_params, options.fitter_units)?;
        pars.pars_to_exposures();

        let (good_stars, good_obs) = self.good_observations(pars, stars, options)?;
        if !options.all_exposures {
            stars.reset_means();
        }
        let partitions = partition(stars, &good_stars, &good_obs, self.config.n_star_per_run);
        info!(
            "Running chisq on {} stars with {} observations in {} partitions",
            good_stars.len(),
            good_obs.len(),
            partitions.len()
        );

        if options.compute_sed_slopes {
            let outputs = {
                let ctx = EvalContext::new(self, pars, stars, options, ccd_gray, Pass::Means);
                self.run(&ctx, &partitions)
            };
            for output in &outputs {
                merge_means(stars, output);
            }
            stars.compute_object_sed_slopes(&good_stars);
        }

        let outputs = {
            let ctx = EvalContext::new(self, pars, stars, options, ccd_gray, Pass::Main);
            self.run(&ctx, &partitions)
        };

        let n_fit_pars = pars.n_fit_pars();
        let mut chisq = 0.0;
        let mut n_obs = 0;
        let mut gradient = Array1::<f64>::zeros(n_fit_pars);
        let mut touched = Array1::<usize>::zeros(n_fit_pars);
        for (part, output) in partitions.iter().zip(&outputs) {
            for (&i, &mag_std) in part.iter().zip(&output.mag_std) {
                stars.obs_mag_std[i] = mag_std;
            }
            if options.all_exposures {
                continue;
            }
            merge_means(stars, output);
            chisq += output.chisq;
            n_obs += output.n_obs;
            if options.compute_derivatives {
                gradient += &output.gradient;
                touched += &output.touched;
            }
        }

        stars.mag_std_computed = true;
        if options.all_exposures {
            stars.all_mag_std_computed = true;
            info!("Computed standardized magnitudes of all exposures");
            return Ok(ChisqResult {
                chisq: self.fit_chisqs.last().copied().unwrap_or(0.0),
                gradient: None,
            });
        }

        let n_active = if options.compute_derivatives {
            let n = touched.iter().filter(|&&t| t > 0).count();
            self.n_active_pars = Some(n);
            n
        } else {
            self.n_active_pars.unwrap_or(n_fit_pars)
        };
        if n_obs <= n_active {
            return Err(FgcmError::NonPositiveDof {
                n_obs,
                n_pars: n_active,
            });
        }
        let dof = (n_obs - n_active) as f64;

        let fit_chisq = chisq / dof;
        self.fit_chisqs.push(fit_chisq);
        info!(
            "Chisq/dof = {:.6} (iteration {}, {} observations, {} active parameters) in {:.2?}",
            fit_chisq,
            self.fit_chisqs.len(),
            n_obs,
            n_active,
            start.elapsed()
        );

        let gradient = options.compute_derivatives.then(|| {
            let units = pars.layout.unit_per_par(&pars.unit_dict(options.fitter_units));
            gradient * 2.0 / units / dof
        });
        Ok(ChisqResult {
            chisq: fit_chisq,
            gradient,
        })
    }

    /// Good stars and the good observations of those stars, sorted by star.
    fn good_observations(
        &mut self,
        pars: &FgcmParameters,
        stars: &FgcmStars,
        options: &ChisqOptions,
    ) -> Result<(Vec<usize>, Vec<usize>), FgcmError> {
        if options.use_match_cache {
            if let Some(cache) = &self.match_cache {
                if cache.include_reserve == options.include_reserve
                    && cache.all_exposures == options.all_exposures
                {
                    return Ok((cache.good_stars.clone(), cache.good_obs.clone()));
                }
            }
        }

        let good_stars = stars.good_star_index(options.include_reserve);
        if good_stars.is_empty() {
            return Err(FgcmError::NoGoodStars);
        }
        let obs = &stars.obs;
        let (_, matched) = presorted_match(&good_stars, obs.obj_index.view())?;
        let n_exp = pars.n_exp();
        let ccd_range = self.config.ccd_start_index..self.config.ccd_start_index + pars.n_ccd();
        if let Some(&i) = matched
            .iter()
            .find(|&&i| obs.exp_index[i] >= n_exp || !ccd_range.contains(&obs.ccd_index[i]))
        {
            return Err(FgcmError::InvalidConfig(format!(
                "observation {i} has exposure {} and CCD {} out of range",
                obs.exp_index[i], obs.ccd_index[i]
            )));
        }
        if let Some(&i) = matched.iter().find(|&&i| {
            let err = obs.mag_adu_model_err[i];
            !(err.is_finite() && err > 0.0)
        }) {
            return Err(FgcmError::InvalidConfig(format!(
                "observation {i} has magnitude error {}, must be finite and positive",
                obs.mag_adu_model_err[i]
            )));
        }
        let good_obs = matched
            .into_iter()
            .filter(|&i| {
                obs.flag[i] == 0
                    && (options.all_exposures || pars.exposures.flag[obs.exp_index[i]] == 0)
            })
            .collect_vec();

        if options.use_match_cache {
            self.match_cache = Some(MatchCache {
                include_reserve: options.include_reserve,
                all_exposures: options.all_exposures,
                good_stars: good_stars.clone(),
                good_obs: good_obs.clone(),
            });
        }
        Ok((good_stars, good_obs))
    }

    fn run(&self, ctx: &EvalContext<'_, '_, L>, partitions: &[&[usize]]) -> Vec<WorkerOutput> {
        #[cfg(feature = "parallel")]
        if !ctx.options.debug && partitions.len() > 1 {
            if let Some(pool) = &self.pool {
                return parallel::run_partitions(pool, ctx, partitions);
            }
        }
        partitions
            .iter()
            .map(|part| process_partition(ctx, part))
            .collect()
    }
}

/// Split the good observations into partitions of whole stars, largest first.
///
/// `good_obs` must be sorted by star, as returned by the presorted match.
fn partition<'a>(
    stars: &FgcmStars,
    good_stars: &[usize],
    good_obs: &'a [usize],
    n_star_per_run: usize,
) -> Vec<&'a [usize]> {
    let n_sections = good_stars.len() / n_star_per_run.max(1) + 1;
    let obj_index = &stars.obs.obj_index;
    let mut bounds = array_split(good_stars.len(), n_sections)
        .into_iter()
        .skip(1)
        .filter(|range| !range.is_empty())
        .map(|range| good_obs.partition_point(|&i| obj_index[i] < good_stars[range.start]))
        .collect_vec();
    bounds.insert(0, 0);
    bounds.push(good_obs.len());

    bounds
        .iter()
        .tuple_windows()
        .map(|(&lo, &hi)| &good_obs[lo..hi])
        .sorted_by_key(|part| std::cmp::Reverse(part.len()))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pass {
    /// Means without chromatic correction, for the SED slopes.
    Means,
    Main,
}

/// Everything a worker reads.
struct EvalContext<'a, 'g, L: ThroughputLut> {
    lut: &'a L,
    config: &'a FgcmConfig,
    pars: &'a FgcmParameters,
    stars: &'a FgcmStars,
    options: &'a ChisqOptions,
    ccd_gray: Option<ArrayView2<'g, f64>>,
    fit_band: Vec<bool>,
    pass: Pass,
}

impl<'a, 'g, L: ThroughputLut> EvalContext<'a, 'g, L> {
    fn new(
        chisq: &'a FgcmChisq<L>,
        pars: &'a FgcmParameters,
        stars: &'a FgcmStars,
        options: &'a ChisqOptions,
        ccd_gray: Option<ArrayView2<'g, f64>>,
        pass: Pass,
    ) -> Self {
        let mut fit_band = vec![false; stars.n_bands()];
        for &b in pars.fit_band_index() {
            fit_band[b] = true;
        }
        Self {
            lut: &chisq.lut,
            config: &chisq.config,
            pars,
            stars,
            options,
            ccd_gray,
            fit_band,
            pass,
        }
    }

    fn chromatic(&self) -> bool {
        self.pass == Pass::Main && !self.config.no_chromatic_corrections
    }

    fn derivatives(&self) -> bool {
        self.pass == Pass::Main && self.options.compute_derivatives
    }
}

/// Weighted mean of one object in one band.
#[derive(Clone, Copy, Debug, PartialEq)]
struct ObjBandMean {
    obj: usize,
    band: usize,
    mean: f64,
    mean_no_chrom: f64,
    err: f64,
}

/// Everything a worker produces.
#[derive(Debug, Default)]
struct WorkerOutput {
    /// Standardized magnitude of every observation of the partition, in partition order.
    mag_std: Vec<f64>,
    means: Vec<ObjBandMean>,
    chisq: f64,
    n_obs: usize,
    gradient: Array1<f64>,
    touched: Array1<usize>,
}

fn merge_means(stars: &mut FgcmStars, output: &WorkerOutput) {
    for m in &output.means {
        stars.obj_mag_std_mean[(m.obj, m.band)] = m.mean;
        stars.obj_mag_std_mean_no_chrom[(m.obj, m.band)] = m.mean_no_chrom;
        stars.obj_mag_std_mean_err[(m.obj, m.band)] = m.err;
    }
}

/// Standardize the observations of one partition and accumulate its chi-squared and gradient.
fn process_partition<L: ThroughputLut>(ctx: &EvalContext<'_, '_, L>, obs_index: &[usize]) -> WorkerOutput {
    let stars = ctx.stars;
    let obs = &stars.obs;
    let pars = ctx.pars;
    let n_bands = stars.n_bands();
    let chromatic = ctx.chromatic();
    let derivatives = ctx.derivatives();
    let with_i1 = derivatives && chromatic && ctx.lut.has_i1_derivatives();
    let n_fit_pars = if derivatives { pars.n_fit_pars() } else { 0 };
    let n = obs_index.len();

    let mut out = WorkerOutput {
        mag_std: Vec::with_capacity(n),
        gradient: Array1::zeros(n_fit_pars),
        touched: Array1::zeros(n_fit_pars),
        ..Default::default()
    };
    let mut mag_no_chrom = Vec::with_capacity(n);
    let mut err2 = Vec::with_capacity(n);
    let mut lut_derivatives = Vec::with_capacity(if derivatives { n } else { 0 });

    for &i in obs_index {
        let exp = obs.exp_index[i];
        let band = obs.band_index[i];
        let ccd = obs.ccd_index[i] - ctx.config.ccd_start_index;
        let query = LutQuery {
            filter: obs.lut_filter_index[i],
            pwv: pars.exp_pwv[exp],
            o3: pars.exp_o3[exp],
            ln_tau: pars.exp_ln_tau[exp],
            alpha: pars.exp_alpha[exp],
            sec_zenith: obs.sec_zenith[i],
            ccd,
            pmb: pars.exposures.pmb[exp],
        };
        let indices = ctx.lut.indices(&query);
        let i0 = ctx.lut.i0(&query, &indices);
        let i10 = ctx.lut.i1(&query, &indices) / i0;

        let mut mag = obs.mag_adu[i] + 2.5 * i0.log10() + pars.exp_qe_sys[exp];
        if let Some(gray) = ctx.ccd_gray {
            let g = gray[(exp, ccd)];
            if g > ctx.config.illegal_value {
                mag += g;
            }
        }
        let sed_slope = stars.obj_sed_slope[(obs.obj_index[i], band)];
        let delta = if chromatic {
            2.5 * ((1.0 + sed_slope * i10) / (1.0 + sed_slope * ctx.config.i10_std_band[band]))
                .log10()
        } else {
            0.0
        };
        out.mag_std.push(mag + delta);
        mag_no_chrom.push(mag);
        err2.push(obs.mag_adu_model_err[i].powi(2));

        if derivatives {
            let mut d = ctx.lut.log_derivatives(&indices, i0);
            if with_i1 {
                d += ctx.lut.log_derivatives_i1(&indices, i0, i10, sed_slope);
            }
            lut_derivatives.push(d);
        }
    }
    if ctx.options.all_exposures {
        return out;
    }

    let mut wt_sum = vec![0.0; n_bands];
    let mut mag_sum = vec![0.0; n_bands];
    let mut mag_no_chrom_sum = vec![0.0; n_bands];
    let mut mean = vec![0.0; n_bands];
    let mut resid_sum = vec![0.0; n_bands];
    let mut partials = Vec::new();

    let mut start = 0;
    while start < n {
        let obj = obs.obj_index[obs_index[start]];
        let end = start
            + obs_index[start..]
                .iter()
                .take_while(|&&i| obs.obj_index[i] == obj)
                .count();

        wt_sum.fill(0.0);
        mag_sum.fill(0.0);
        mag_no_chrom_sum.fill(0.0);
        for k in start..end {
            let band = obs.band_index[obs_index[k]];
            let w = 1.0 / err2[k];
            wt_sum[band] += w;
            mag_sum[band] += w * out.mag_std[k];
            mag_no_chrom_sum[band] += w * mag_no_chrom[k];
        }
        for band in 0..n_bands {
            if wt_sum[band] > 0.0 {
                mean[band] = mag_sum[band] / wt_sum[band];
                out.means.push(ObjBandMean {
                    obj,
                    band,
                    mean: mean[band],
                    mean_no_chrom: mag_no_chrom_sum[band] / wt_sum[band],
                    err: (1.0 / wt_sum[band]).sqrt(),
                });
            }
        }

        if ctx.pass == Pass::Main {
            resid_sum.fill(0.0);
            for k in start..end {
                let band = obs.band_index[obs_index[k]];
                if !ctx.fit_band[band] {
                    continue;
                }
                let delta = out.mag_std[k] - mean[band];
                out.chisq += delta * delta / err2[k];
                out.n_obs += 1;
                resid_sum[band] += delta / err2[k];
            }

            if derivatives {
                for k in start..end {
                    let i = obs_index[k];
                    let band = obs.band_index[i];
                    if !ctx.fit_band[band] {
                        continue;
                    }
                    // the mean moves with every observation of the object in the band
                    let weighted = (out.mag_std[k] - mean[band] - resid_sum[band] / wt_sum[band])
                        / err2[k];
                    parameter_partials(pars, obs.exp_index[i], &lut_derivatives[k], &mut partials);
                    for &(p, d) in &partials {
                        out.gradient[p] += weighted * d;
                        out.touched[p] += 1;
                    }
                }
            }
        }
        start = end;
    }
    out
}

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::*;

    pub(super) fn run_partitions<L: ThroughputLut>(
        pool: &rayon::ThreadPool,
        ctx: &EvalContext<'_, '_, L>,
        partitions: &[&[usize]],
    ) -> Vec<WorkerOutput> {
        pool.install(|| {
            partitions
                .par_iter()
                .map(|part| process_partition(ctx, part))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    use super::*;
    use crate::parameters::ParFamily;
    use crate::stars::{ObjFlag, ObservationTable};
    use crate::synthetic::{survey, AnalyticLut, SyntheticSurvey};

    fn init_logger() {
        let _ = simplelog::TestLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
    }

    fn engine(survey: &SyntheticSurvey) -> FgcmChisq<AnalyticLut> {
        FgcmChisq::new(survey.config.clone(), survey.lut.clone()).unwrap()
    }

    /// A parameter vector slightly off the truth.
    fn perturbed(survey: &SyntheticSurvey) -> Array1<f64> {
        let mut p = survey.truth.clone();
        let layout = survey.pars.layout();
        for family in [ParFamily::O3, ParFamily::PwvIntercept, ParFamily::LnTauIntercept] {
            for (k, i) in layout.range(family).enumerate() {
                p[i] *= 1.0 + 0.05 * (k as f64 + 1.0);
            }
        }
        p[layout.loc(ParFamily::QeSysIntercept)] += 0.02;
        p
    }

    #[test]
    fn truth_is_a_good_fit() {
        init_logger();
        let mut s = survey(400, 1).unwrap();
        let mut chisq = engine(&s);
        let truth = s.truth.clone();
        let options = ChisqOptions::default();
        let at_truth = chisq
            .evaluate(&mut s.pars, &mut s.stars, truth.view(), &options, None)
            .unwrap();
        // one mean per star and band is absorbed from the observations
        assert!(at_truth.chisq > 0.6 && at_truth.chisq < 0.95, "{}", at_truth.chisq);

        let off = perturbed(&s);
        let perturbed = chisq
            .evaluate(&mut s.pars, &mut s.stars, off.view(), &options, None)
            .unwrap();
        assert!(perturbed.chisq > 2.0 * at_truth.chisq);
        assert_eq!(chisq.fit_chisqs().len(), 2);
        assert!(s.stars.mag_std_computed());
        assert!(!s.stars.all_mag_std_computed());

        chisq.reset_fit_chisq_list();
        assert!(chisq.fit_chisqs().is_empty());
    }

    #[test]
    fn idempotent() {
        let mut s = survey(300, 2).unwrap();
        let mut chisq = engine(&s);
        let p = perturbed(&s);
        let options = ChisqOptions::default().with_use_match_cache(true);
        let first = chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &options, None)
            .unwrap();
        let means = s.stars.obj_mag_std_mean().to_owned();
        let second = chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &options, None)
            .unwrap();
        assert_eq!(first.chisq, second.chisq);
        assert_eq!(means, s.stars.obj_mag_std_mean());
    }

    #[test]
    fn include_reserve_without_reserved_stars() {
        let mut s = survey(300, 3).unwrap();
        assert!(s.stars.obj_flag().iter().all(|f| f & ObjFlag::RESERVED == 0));
        let mut chisq = engine(&s);
        let p = perturbed(&s);
        let options = ChisqOptions::default().with_compute_derivatives(true);
        let without = chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &options, None)
            .unwrap();
        let with = chisq
            .evaluate(
                &mut s.pars,
                &mut s.stars,
                p.view(),
                &options.with_include_reserve(true),
                None,
            )
            .unwrap();
        assert_eq!(without, with);
    }

    #[test]
    fn reserved_stars_excluded() {
        let mut s = survey(300, 4).unwrap();
        let mut chisq = engine(&s);
        let p = s.truth.clone();
        let options = ChisqOptions::default();
        chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &options, None)
            .unwrap();
        let reserved = s.stars.good_star_index(false)[0];
        s.stars.obj_flag_mut()[reserved] |= ObjFlag::RESERVED;
        chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &options, None)
            .unwrap();
        assert_eq!(s.stars.obj_mag_std_mean()[(reserved, 0)], 99.0);
        chisq
            .evaluate(
                &mut s.pars,
                &mut s.stars,
                p.view(),
                &options.with_include_reserve(true),
                None,
            )
            .unwrap();
        assert!(s.stars.obj_mag_std_mean()[(reserved, 0)] < 90.0);
    }

    #[test]
    fn partition_invariance() {
        let s = survey(500, 5).unwrap();
        let p = perturbed(&s);
        let options = ChisqOptions::default().with_compute_derivatives(true);

        let mut results = Vec::new();
        for (n_star_per_run, debug) in [(1000, true), (100, true), (37, false), (7, false)] {
            let mut s = survey(500, 5).unwrap();
            let config = s.config.clone().with_n_star_per_run(n_star_per_run);
            let mut chisq = FgcmChisq::new(config, s.lut.clone()).unwrap();
            let res = chisq
                .evaluate(
                    &mut s.pars,
                    &mut s.stars,
                    p.view(),
                    &options.with_debug(debug),
                    None,
                )
                .unwrap();
            results.push((res, s.stars.obs_mag_std().to_owned()));
        }
        let (reference, mag_std) = &results[0];
        for (res, other_mag_std) in &results[1..] {
            assert_abs_diff_eq!(res.chisq, reference.chisq, epsilon = 1e-9 * reference.chisq);
            assert_abs_diff_eq!(
                res.gradient.as_ref().unwrap(),
                reference.gradient.as_ref().unwrap(),
                epsilon = 1e-8
            );
            assert_eq!(mag_std, other_mag_std);
        }
    }

    #[test]
    fn partitions_split_whole_stars() {
        let s = survey(50, 6).unwrap();
        let good_stars = s.stars.good_star_index(false);
        let (_, good_obs) = presorted_match(&good_stars, s.stars.obs.obj_index.view()).unwrap();
        let parts = partition(&s.stars, &good_stars, &good_obs, 8);
        assert_eq!(parts.len(), good_stars.len() / 8 + 1);
        assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), good_obs.len());
        assert!(parts.windows(2).all(|w| w[0].len() >= w[1].len()));

        // no star is split between partitions
        let obj = |i: usize| s.stars.obs.obj_index[i];
        let ranges = parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| (obj(p[0]), obj(p[p.len() - 1])))
            .sorted()
            .collect_vec();
        assert!(ranges.windows(2).all(|w| w[0].1 < w[1].0));
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut s = survey(200, 7).unwrap();
        let units = crate::config::ParUnits {
            o3: 0.01,
            qe_sys: 10.0,
            ..Default::default()
        };
        s.pars.units = units;
        let mut chisq = engine(&s);
        let options = ChisqOptions::default().with_fitter_units(true);
        let mut p = perturbed(&s);
        s.pars.reload_par_array(p.view(), false).unwrap();
        p = s.pars.par_array(true);

        // set SED slopes, then keep them fixed
        chisq
            .evaluate(
                &mut s.pars,
                &mut s.stars,
                p.view(),
                &options.with_compute_sed_slopes(true),
                None,
            )
            .unwrap();
        assert!(s.stars.obj_sed_slope().iter().any(|&x| x != 0.0));

        let res = chisq
            .evaluate(
                &mut s.pars,
                &mut s.stars,
                p.view(),
                &options.with_compute_derivatives(true),
                None,
            )
            .unwrap();
        let gradient = res.gradient.unwrap();
        let active = chisq.n_active_pars().unwrap();
        assert!(active > 0 && active < s.pars.n_fit_pars());

        let h = 1e-5;
        for i in 0..p.len() {
            let mut up = p.clone();
            up[i] += h;
            let f_up = chisq
                .evaluate(&mut s.pars, &mut s.stars, up.view(), &options, None)
                .unwrap()
                .chisq;
            let mut down = p.clone();
            down[i] -= h;
            let f_down = chisq
                .evaluate(&mut s.pars, &mut s.stars, down.view(), &options, None)
                .unwrap()
                .chisq;
            let numeric = (f_up - f_down) / (2.0 * h);
            assert_abs_diff_eq!(
                gradient[i],
                numeric,
                epsilon = 1e-4 * (1.0 + numeric.abs())
            );
        }
    }

    #[test]
    fn all_exposures() {
        let mut s = survey(200, 8).unwrap();
        s.pars.exposures_mut().flag[0] = 1;
        let mut chisq = engine(&s);
        let p = s.truth.clone();

        let res = chisq
            .evaluate(
                &mut s.pars,
                &mut s.stars,
                p.view(),
                &ChisqOptions::default().with_all_exposures(true),
                None,
            )
            .unwrap();
        assert_eq!(res.chisq, 0.0);
        assert!(s.stars.all_mag_std_computed());

        let obs = s.stars.observations();
        let first_exp0 = (0..s.stars.n_obs())
            .find(|&i| obs.exp_index[i] == 0 && s.stars.obj_flag()[obs.obj_index[i]] == 0)
            .unwrap();
        assert_ne!(s.stars.obs_mag_std()[first_exp0], s.stars.observations().mag_adu[first_exp0]);

        let fit = chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &ChisqOptions::default(), None)
            .unwrap();
        let again = chisq
            .evaluate(
                &mut s.pars,
                &mut s.stars,
                p.view(),
                &ChisqOptions::default().with_all_exposures(true),
                None,
            )
            .unwrap();
        assert_eq!(again.chisq, fit.chisq);
        assert_eq!(chisq.fit_chisqs().len(), 1);
    }

    #[test]
    fn incompatible_options() {
        let mut s = survey(50, 9).unwrap();
        let mut chisq = engine(&s);
        let p = s.truth.clone();
        for options in [
            ChisqOptions::default()
                .with_all_exposures(true)
                .with_compute_derivatives(true),
            ChisqOptions::default()
                .with_all_exposures(true)
                .with_compute_sed_slopes(true),
        ] {
            assert!(matches!(
                chisq.evaluate(&mut s.pars, &mut s.stars, p.view(), &options, None),
                Err(FgcmError::IncompatibleOptions(_))
            ));
        }
    }

    #[test]
    fn no_good_stars() {
        let mut s = survey(50, 10).unwrap();
        let mut chisq = engine(&s);
        let p = s.truth.clone();
        chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &ChisqOptions::default(), None)
            .unwrap();
        let means = s.stars.obj_mag_std_mean().to_owned();

        s.stars.obj_flag_mut().fill(ObjFlag::VARIABLE);
        assert_eq!(
            chisq.evaluate(&mut s.pars, &mut s.stars, p.view(), &ChisqOptions::default(), None),
            Err(FgcmError::NoGoodStars)
        );
        // a failed selection keeps the previous means
        assert_eq!(s.stars.obj_mag_std_mean(), means);
    }

    #[test]
    fn zero_magnitude_error() {
        let mut s = survey(200, 1).unwrap();
        let i = (0..s.stars.n_obs())
            .find(|&i| s.stars.obs.flag[i] == 0 && s.stars.obj_flag()[s.stars.obs.obj_index[i]] == 0)
            .unwrap();
        s.stars.obs.mag_adu_model_err[i] = 0.0;
        let mut chisq = engine(&s);
        let p = s.truth.clone();
        let options = ChisqOptions::default().with_compute_derivatives(true);
        assert!(matches!(
            chisq.evaluate(&mut s.pars, &mut s.stars, p.view(), &options, None),
            Err(FgcmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn single_star() {
        let s = survey(1, 11).unwrap();
        let SyntheticSurvey {
            mut pars, lut, config, truth, ..
        } = s;
        let n_exp = pars.n_exp();
        let exps = (0..n_exp).collect_vec();
        let obs = ObservationTable::new(
            vec![0; n_exp],
            exps.clone(),
            vec![0; n_exp],
            exps.iter().map(|&e| pars.exposures().band_index[e]).collect(),
            vec![17.0; n_exp],
            vec![0.01; n_exp],
        );
        let mut stars = FgcmStars::new(obs, 1, vec![4800.0, 6400.0, 7800.0], vec![0, 1], 1).unwrap();
        let mut chisq = FgcmChisq::new(config, lut).unwrap();

        // all fit parameters count against the observations before any derivative pass
        let res = chisq.evaluate(&mut pars, &mut stars, truth.view(), &ChisqOptions::default(), None);
        assert_eq!(
            res,
            Err(FgcmError::NonPositiveDof {
                n_obs: n_exp,
                n_pars: pars.n_fit_pars()
            })
        );
    }

    #[test]
    fn ccd_gray_crunch() {
        let mut s = survey(200, 12).unwrap();
        let mut chisq = engine(&s);
        let p = s.truth.clone();
        let options = ChisqOptions::default();
        chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &options, None)
            .unwrap();
        let before = s.stars.obs_mag_std().to_owned();

        let mut gray = Array2::from_elem((s.pars.n_exp(), s.pars.n_ccd()), 0.0);
        gray[(0, 1)] = 0.05;
        gray[(1, 1)] = s.config.illegal_value;
        chisq
            .evaluate(&mut s.pars, &mut s.stars, p.view(), &options, Some(gray.view()))
            .unwrap();
        let obs = s.stars.observations();
        for i in 0..s.stars.n_obs() {
            let expected = if obs.exp_index[i] == 0 && obs.ccd_index[i] == 1 {
                before[i] + 0.05
            } else {
                before[i]
            };
            if obs.flag[i] == 0 && s.stars.obj_flag()[obs.obj_index[i]] == 0 {
                assert_abs_diff_eq!(s.stars.obs_mag_std()[i], expected, epsilon = 1e-12);
            }
        }

        let wrong = Array2::zeros((2, 2));
        assert!(matches!(
            chisq.evaluate(&mut s.pars, &mut s.stars, p.view(), &options, Some(wrong.view())),
            Err(FgcmError::ShapeMismatch { .. })
        ));
    }
}
