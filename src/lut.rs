//! Interface of the atmosphere and instrument throughput lookup table.

use std::ops::AddAssign;

/// Atmospheric state and observing geometry of one observation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LutQuery {
    /// LUT filter index.
    pub filter: usize,
    /// Precipitable water vapor.
    pub pwv: f64,
    /// Ozone in Dobson units.
    pub o3: f64,
    /// Log of the aerosol optical depth.
    pub ln_tau: f64,
    /// Aerosol power-law index.
    pub alpha: f64,
    /// Airmass.
    pub sec_zenith: f64,
    /// CCD index, starting at 0.
    pub ccd: usize,
    /// Barometric pressure.
    pub pmb: f64,
}

/// Partial derivatives of a magnitude correction with respect to the atmospheric state.
///
/// `tau` is the derivative with respect to `ln(tau)`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LutDerivatives {
    /// Derivative with respect to the water vapor.
    pub pwv: f64,
    /// Derivative with respect to the ozone.
    pub o3: f64,
    /// Derivative with respect to `ln(tau)`.
    pub tau: f64,
    /// Derivative with respect to the Angstrom exponent.
    pub alpha: f64,
}

impl AddAssign for LutDerivatives {
    fn add_assign(&mut self, rhs: Self) {
        self.pwv += rhs.pwv;
        self.o3 += rhs.o3;
        self.tau += rhs.tau;
        self.alpha += rhs.alpha;
    }
}

/// Throughput lookup table.
///
/// `I0` is the band-integrated throughput and `I1` its first moment in wavelength;
/// `I10 = I1 / I0` is the normalized color term.
/// Implementations are shared between the worker threads.
pub trait ThroughputLut: Send + Sync {
    /// Interpolation indices of a query.
    type Indices: Send;

    /// Look up the interpolation indices of a query.
    fn indices(&self, query: &LutQuery) -> Self::Indices;

    /// Band-integrated throughput `I0`.
    fn i0(&self, query: &LutQuery, indices: &Self::Indices) -> f64;

    /// First wavelength moment `I1` of the throughput.
    fn i1(&self, query: &LutQuery, indices: &Self::Indices) -> f64;

    /// Derivatives of `2.5 log10(I0)`.
    fn log_derivatives(&self, indices: &Self::Indices, i0: f64) -> LutDerivatives;

    /// Derivatives of the chromatic correction `2.5 log10(1 + sed_slope * I10)`.
    fn log_derivatives_i1(
        &self,
        _indices: &Self::Indices,
        _i0: f64,
        _i10: f64,
        _sed_slope: f64,
    ) -> LutDerivatives {
        LutDerivatives::default()
    }

    /// Whether [`ThroughputLut::log_derivatives_i1`] is implemented.
    fn has_i1_derivatives(&self) -> bool {
        false
    }
}
