//! Chain rule from the atmospheric state of an exposure to the fit parameters.

use crate::lut::LutDerivatives;
use crate::parameters::{FgcmParameters, ParFamily, PwvSource, TauSource, MIN_TAU};

/// Partial derivatives of an observation magnitude with respect to the fit parameters.
///
/// Given the derivatives `lut` of the magnitude with respect to the atmospheric state of
/// exposure `exp`, pushes `(parameter index, derivative)` for every parameter, in physical
/// units, that the exposure depends on. `out` is cleared first.
pub(crate) fn parameter_partials(
    pars: &FgcmParameters,
    exp: usize,
    lut: &LutDerivatives,
    out: &mut Vec<(usize, f64)>,
) {
    out.clear();
    let layout = &pars.layout;
    let exposures = &pars.exposures;
    let night = exposures.night_index[exp];
    let wash = exposures.wash_index[exp];
    let delta_ut = exposures.delta_ut[exp];

    out.push((layout.loc(ParFamily::O3) + night, lut.o3));
    out.push((layout.loc(ParFamily::Alpha) + night, lut.alpha));

    match pars.tau_source(exp) {
        TauSource::Nightly => {
            out.push((layout.loc(ParFamily::LnTauIntercept) + night, lut.tau));
            out.push((layout.loc(ParFamily::LnTauSlope) + night, lut.tau * delta_ut));
        }
        TauSource::External => {
            let tau = pars.external_tau(exp);
            if tau > MIN_TAU {
                out.push((layout.loc(ParFamily::ExternalTauOffset) + night, lut.tau / tau));
                out.push((
                    layout.loc(ParFamily::ExternalTauScale),
                    lut.tau * exposures.external_tau[exp] / tau,
                ));
            }
        }
    }

    match pars.pwv_source(exp) {
        PwvSource::Nightly => {
            let intercept = pars.par(ParFamily::PwvIntercept)[night];
            let per_slope = pars.par(ParFamily::PwvPerSlope)[night];
            out.push((
                layout.loc(ParFamily::PwvIntercept) + night,
                lut.pwv * (1.0 + per_slope * delta_ut),
            ));
            out.push((
                layout.loc(ParFamily::PwvPerSlope) + night,
                lut.pwv * intercept * delta_ut,
            ));
        }
        PwvSource::External => {
            out.push((layout.loc(ParFamily::ExternalPwvOffset) + night, lut.pwv));
            out.push((
                layout.loc(ParFamily::ExternalPwvScale),
                lut.pwv * exposures.external_pwv[exp],
            ));
        }
        PwvSource::Retrieved { nightly_offset } => {
            out.push((
                layout.loc(ParFamily::RetrievedPwvScale),
                lut.pwv * exposures.retrieved_pwv[exp],
            ));
            let offset = if nightly_offset {
                layout.loc(ParFamily::RetrievedPwvNightlyOffset) + night
            } else {
                layout.loc(ParFamily::RetrievedPwvOffset)
            };
            out.push((offset, lut.pwv));
        }
    }

    out.push((layout.loc(ParFamily::QeSysIntercept) + wash, 1.0));
    out.push((
        layout.loc(ParFamily::QeSysSlope) + wash,
        pars.wash_delta_mjd(exp),
    ));
}
