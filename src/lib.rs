#![warn(missing_docs)]

//! Rust implementation of the chi-squared and gray-residual engines of the
//! [Forward Global Calibration Method (FGCM)](https://github.com/erykoff/fgcm). \
//! Survey-wide photometric calibration fits a physical model of the atmosphere (water vapor, ozone,
//! aerosols) and the instrument (per-wash-interval throughput trends) to the repeated observations of
//! stars. This crate calculates the objective of that fit and the residual statistics that steer it;
//! the optimizer, the atmosphere lookup table and the survey I/O are left to the caller.
//!
//! ## Interface
//! The data live in two containers:
//! - [`FgcmParameters`] holds the fit parameter vector and the per-exposure atmosphere derived from it.
//! - [`FgcmStars`] holds the observations and the per-object mean magnitudes.
//!
//! Three engines work on them:
//! - [`FgcmChisq`] evaluates the chi-squared (and optionally its gradient) of a parameter vector,
//!     updating the standardized magnitudes and object means as a side effect.
//! - [`FgcmGray`] aggregates the residuals to per-CCD and per-exposure gray terms.
//! - [`FgcmSigFgcm`] estimates the intrinsic photometric scatter per band.
//!
//! The atmosphere model is supplied through the [`ThroughputLut`] trait.
//! Engines are configured by [`FgcmConfig`], with additional parameters set via `with_*()` functions.
//!
//! Example:
//! ```rust,ignore
//! let config = FgcmConfig::default()
//!     .with_i10_std_band(i10_std)
//!     .with_n_core(8);
//! let mut chisq = FgcmChisq::new(config.clone(), lut)?;
//! let result = chisq.evaluate(
//!     &mut pars,
//!     &mut stars,
//!     fit_params.view(),
//!     &ChisqOptions::default().with_compute_derivatives(true),
//!     None,
//! )?;
//!
//! let mut gray = FgcmGray::new(config, &pars);
//! gray.compute_exp_gray_for_initial_selection(&pars, &stars)?;
//! ```
//!
//! The evaluation over stars is split into partitions of `n_star_per_run` objects.
//! With the `parallel` feature (on by default) the partitions are processed on a thread pool of `n_core` threads.
//!
//! ## Parameters
//! - `n_star_per_run`: Number of objects per partition.
//!     The chi-squared does not depend on the partitioning.
//! - `illegal_value`: Sentinel of gray cells without sufficient data.
//! - `min_star_per_ccd`, `max_ccd_gray_err`: Requirements on a CCD to enter the exposure gray.
//! - `sig_fgcm_max_egray`, `sig_fgcm_max_err`: Cuts on the residuals entering the scatter estimate.

pub(crate) mod binner;
pub(crate) mod chisq;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod gray;
pub(crate) mod histogram;
pub(crate) mod lut;
pub(crate) mod ndarray_utils;
pub(crate) mod parameters;
pub(crate) mod partials;
pub(crate) mod sig_fgcm;
pub(crate) mod stars;
#[cfg(any(test, feature = "synthetic"))]
#[doc(hidden)]
pub mod synthetic;

pub use binner::{data_binner, Bin};
pub use chisq::{ChisqOptions, ChisqResult, FgcmChisq};
pub use config::{FgcmConfig, ParUnits};
pub use error::FgcmError;
pub use gray::{FgcmGray, N_COLOR_BINS};
pub use histogram::{histo_gauss, GaussFit};
pub use lut::{LutDerivatives, LutQuery, ThroughputLut};
pub use parameters::{
    AtmosphereModes, ExposureTable, FgcmParameters, ParFamily, ParLayout, PwvMode, TauMode,
};
pub use sig_fgcm::{FgcmSigFgcm, COLOR_CUT_NAMES, SIG_FGCM_ERROR_DOMINATED, SIG_FGCM_FIT_FAILED};
pub use stars::{FgcmStars, ObjFlag, ObservationTable, MAG_SENTINEL};

/// A generic float trait such that the array statistics are generic over `f32`/`f64`.
///
/// This trait is automatically implemented for all types implementing the supertraits.
/// Particularly, this includes `f32` and `f64`.
pub trait Float: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}

impl<F> Float for F where F: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}
